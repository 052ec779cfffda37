use std::fmt::{Display, Formatter};
use std::time::Duration;

/// A failure that happened on the producing party while it computed a payload. It travels over the
///  wire as a regular envelope payload and is surfaced as [ProxyError::Remote] by the consumer's
///  `get_data` call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RemoteError {
    pub src_party: String,
    pub cause: String,
}

impl RemoteError {
    pub fn new(src_party: impl Into<String>, cause: impl Into<String>) -> RemoteError {
        RemoteError {
            src_party: src_party.into(),
            cause: cause.into(),
        }
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote error from party {}: {}", self.src_party, self.cause)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid proxy setup: {0}")]
    Construction(String),

    #[error("invalid proxy config: {0}")]
    Config(String),

    #[error("party {0:?} is not part of the topology")]
    UnknownParty(String),

    #[error("proxy is not ready: {0}")]
    NotReady(String),

    #[error("no data for {downstream_seq_id} from {upstream_seq_id} of party {party} within {timeout:?}")]
    Timeout {
        party: String,
        upstream_seq_id: String,
        downstream_seq_id: String,
        timeout: Duration,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("transport error: {0:#}")]
    Transport(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout { .. })
    }

    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            ProxyError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_keeps_identity() {
        let remote = RemoteError::new("alice", "division by zero");
        let err: ProxyError = remote.clone().into();

        assert_eq!(err.remote_error(), Some(&remote));
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "remote error from party alice: division by zero");
    }

    #[test]
    fn test_timeout_is_distinct() {
        let err = ProxyError::Timeout {
            party: "bob".to_string(),
            upstream_seq_id: "1".to_string(),
            downstream_seq_id: "2".to_string(),
            timeout: Duration::from_millis(10),
        };
        assert!(err.is_timeout());
        assert!(err.remote_error().is_none());
    }
}
