use base64::{engine::general_purpose::STANDARD, Engine};

/// `Basic <base64(username:password)>` header value
pub fn basic_auth(username: &str, password: &str) -> String {
    let encoded = STANDARD.encode(format!("{}:{}", username, password));
    format!("Basic {}", encoded)
}
