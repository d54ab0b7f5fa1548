use thiserror::Error;

/// Errors surfaced by session join/leave and outbound sends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("session closed")]
    Closed,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("session request timed out")]
    Timeout,
}
