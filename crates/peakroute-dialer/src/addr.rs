use crate::error::DialError;

/// Split `host:port`, accepting bracketed IPv6 literals (`[::1]:443`).
pub fn split_host_port(address: &str) -> Result<(&str, u16), DialError> {
    let invalid = || DialError::InvalidAddress(address.to_string());

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = tail.strip_prefix(':').ok_or_else(invalid)?;
        (host, port)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };

    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

/// Inverse of [`split_host_port`]; brackets IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
