//! Failure taxonomy shared by fetchers, the retry loop and partition outcomes

use serde::Serialize;

/// Why a page fetch did not produce a usable page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// HTTP 429 from the server
    Throttled,
    /// HTTP 5xx (502/503/504 and friends)
    TransientServerError,
    /// Request did not complete within the per-request timeout
    Timeout,
    /// Connection/transport problem, or an unexpected non-2xx status
    TransportError,
    /// 2xx body that is not JSON or whose `status` is not "success"
    InvalidResponseSchema,
    InvalidConfiguration,
    Unexpected,
}

impl FailureKind {
    /// Operational failures are retried locally before being recorded.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Throttled | Self::TransientServerError | Self::Timeout | Self::TransportError
        )
    }

    /// Classify a non-2xx HTTP status. Returns `None` for 2xx.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(Self::Throttled),
            500..=599 => Some(Self::TransientServerError),
            _ => Some(Self::TransportError),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::TransientServerError => "transient_server_error",
            Self::Timeout => "timeout",
            Self::TransportError => "transport_error",
            Self::InvalidResponseSchema => "invalid_response_schema",
            Self::InvalidConfiguration => "invalid_configuration",
            Self::Unexpected => "unexpected",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single network call before any HTTP status was received.
#[derive(Debug)]
pub enum FetchError {
    Timeout(String),
    Transport(String),
    /// Anything the fetcher cannot attribute to the network; never retried
    Unexpected(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Transport(_) => FailureKind::TransportError,
            Self::Unexpected(_) => FailureKind::Unexpected,
        }
    }

    /// Map a reqwest error, keeping timeouts distinguishable from other transport failures.
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_builder() {
            Self::Unexpected(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Unexpected(msg) => write!(f, "unexpected: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Errors returned to whoever builds and drives the engine.
#[derive(Debug)]
pub enum SweepError {
    InvalidConfiguration(String),
    Io(std::io::Error),
}

impl SweepError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}

impl std::fmt::Display for SweepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Io(e) => write!(f, "IO: {e}"),
        }
    }
}

impl std::error::Error for SweepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidConfiguration(_) => None,
        }
    }
}

impl From<std::io::Error> for SweepError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_throttled() {
        assert_eq!(FailureKind::from_status(429), Some(FailureKind::Throttled));
    }

    #[test]
    fn gateway_errors_are_transient() {
        for status in [502, 503, 504] {
            assert_eq!(
                FailureKind::from_status(status),
                Some(FailureKind::TransientServerError)
            );
        }
    }

    #[test]
    fn success_range_has_no_kind() {
        assert_eq!(FailureKind::from_status(200), None);
        assert_eq!(FailureKind::from_status(204), None);
    }

    #[test]
    fn other_client_errors_are_transport() {
        assert_eq!(
            FailureKind::from_status(404),
            Some(FailureKind::TransportError)
        );
    }

    #[test]
    fn retryable_split() {
        assert!(FailureKind::Throttled.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::InvalidResponseSchema.is_retryable());
        assert!(!FailureKind::InvalidConfiguration.is_retryable());
        assert!(!FailureKind::Unexpected.is_retryable());
    }

    #[test]
    fn fetch_error_kinds() {
        assert_eq!(
            FetchError::Timeout("t".into()).kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            FetchError::Transport("reset".into()).kind(),
            FailureKind::TransportError
        );
        assert_eq!(
            FetchError::Unexpected("bug".into()).kind(),
            FailureKind::Unexpected
        );
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::TransientServerError).unwrap();
        assert_eq!(json, "\"transient_server_error\"");
        assert_eq!(
            FailureKind::TransientServerError.to_string(),
            "transient_server_error"
        );
    }

    #[test]
    fn sweep_error_display() {
        let err = SweepError::config("page_size must be > 0");
        assert_eq!(
            format!("{err}"),
            "invalid configuration: page_size must be > 0"
        );
        let err = SweepError::from(std::io::Error::other("disk"));
        assert!(format!("{err}").starts_with("IO:"));
    }
}
