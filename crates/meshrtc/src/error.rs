//! Error types for the peer mesh

/// Result type alias using mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mesh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling protocol error (malformed or missing field, rejected call)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Signaling service answered with a non-success status
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Response body, if any
        body: String,
    },

    /// Bearer token acquisition or refresh failed
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Peer transport error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// The mesh is shutting down and refuses new work
    #[error("Mesh is shutting down")]
    ShuttingDown,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::WebRtcError(err.to_string())
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::HttpError(_)
                | Error::OperationTimeout(_)
                | Error::IoError(_)
        ) || matches!(self, Error::HttpStatus { status, .. } if *status >= 500)
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error aborts a negotiation cycle at the signaling boundary
    pub fn is_signaling_error(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::HttpStatus { .. }
                | Error::HttpError(_)
                | Error::AuthError(_)
        )
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerConnectionError(_)
                | Error::SdpError(_)
                | Error::DataChannelError(_)
                | Error::WebRtcError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");

        let err = Error::HttpStatus {
            status: 401,
            body: "expired".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 401: expired");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SignalingError("test".to_string()).is_retryable());
        assert!(Error::OperationTimeout("test".to_string()).is_retryable());
        assert!(Error::HttpStatus {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::HttpStatus {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_config_error() {
        assert!(Error::InvalidConfig("test".to_string()).is_config_error());
        assert!(!Error::SignalingError("test".to_string()).is_config_error());
    }

    #[test]
    fn test_auth_errors_abort_like_signaling_errors() {
        assert!(Error::AuthError("no exp claim".to_string()).is_signaling_error());
        assert!(Error::HttpStatus {
            status: 500,
            body: String::new()
        }
        .is_signaling_error());
        assert!(!Error::SdpError("bad".to_string()).is_signaling_error());
    }

    #[test]
    fn test_error_is_peer_error() {
        assert!(Error::SdpError("test".to_string()).is_peer_error());
        assert!(Error::DataChannelError("test".to_string()).is_peer_error());
        assert!(!Error::ShuttingDown.is_peer_error());
    }

    #[test]
    fn test_serde_json_conversion() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::SerializationError(_)));
    }
}
