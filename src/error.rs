use http::StatusCode;
use thiserror::Error;

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum GateError {
    // Descriptor errors
    #[error("Invalid upstream descriptor '{line}': {reason}")]
    Parse { line: String, reason: String },

    // Upstream errors
    #[error("Failed to build upstream {address}: {cause}")]
    Build { address: String, cause: String },

    #[error("Health probe failed for {address}: {cause}")]
    Probe { address: String, cause: String },

    #[error("No upstream available")]
    NoUpstreamAvailable,

    #[error("Upstream connection failed: {0}")]
    ConnectFailed(String),

    // Source errors
    #[error("Descriptor source unreachable: {0}")]
    SourceUnreachable(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GateError>;

impl GateError {
    /// Get the HTTP status code surfaced to a client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            GateError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway
            GateError::ConnectFailed(_)
            | GateError::Build { .. }
            | GateError::Probe { .. }
            | GateError::Http(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            GateError::NoUpstreamAvailable => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            GateError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            GateError::Parse { .. }
            | GateError::SourceUnreachable(_)
            | GateError::ConfigValidation(_)
            | GateError::Io(_)
            | GateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error must stop the process at startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, GateError::ConfigValidation(_))
    }
}

// Convert from hyper errors
impl From<hyper::Error> for GateError {
    fn from(err: hyper::Error) -> Self {
        GateError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for GateError {
    fn from(err: url::ParseError) -> Self {
        GateError::InvalidRequest(err.to_string())
    }
}

impl From<reqwest::Error> for GateError {
    fn from(err: reqwest::Error) -> Self {
        GateError::SourceUnreachable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            GateError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GateError::ConnectFailed("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GateError::NoUpstreamAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(GateError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_only_config_validation_is_fatal() {
        assert!(GateError::ConfigValidation("port".to_string()).is_fatal());
        assert!(!GateError::NoUpstreamAvailable.is_fatal());
        assert!(!GateError::SourceUnreachable("down".to_string()).is_fatal());
        assert!(!GateError::Parse {
            line: "x".to_string(),
            reason: "y".to_string()
        }
        .is_fatal());
    }
}
