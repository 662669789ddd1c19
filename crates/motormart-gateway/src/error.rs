use std::time::Duration;

use thiserror::Error;

/// Why a send was not accepted. Anything returned from `MessageRouter::route`
/// means the message was not persisted, so the client may safely retry.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("cannot send a message to yourself")]
    SelfMessage,

    #[error("message body is empty")]
    EmptyMessage,

    #[error("message body exceeds {0} characters")]
    TooLong(usize),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ChatError {
    /// Input errors the client can fix, as opposed to server-side failures.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::SelfMessage | Self::EmptyMessage | Self::TooLong(_))
    }
}

/// Outcome of a failed live write. Always recoverable: the router falls back to push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,

    #[error("write did not complete within the deadline")]
    TimedOut,
}
