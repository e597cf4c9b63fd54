use peakroute_dialer::{DialError, Interrupted};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid API endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("connection to API failed: {0}")]
    Dial(#[from] DialError),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("API responded with error message: {0}")]
    Api(String),

    #[error("bad HTTP status: {0}")]
    HttpStatus(u16),

    #[error("API response carried no data")]
    MissingData,

    #[error("API call timed out")]
    Timeout,

    #[error("API call cancelled")]
    Cancelled,
}

impl From<Interrupted> for ApiError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Cancelled => ApiError::Cancelled,
            Interrupted::DeadlineExceeded => ApiError::Timeout,
        }
    }
}
