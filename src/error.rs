use thiserror::Error;

/// Failure talking to a shared store (idempotency markers, DLQ list).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backing store could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored entry could not be encoded or decoded.
    #[error("store serialization failed: {0}")]
    Serialization(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Failure signal returned by an event bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The bus accepted the call but refused the message.
    #[error("publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },

    /// The bus could not be reached.
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// Failure while reading or writing device twins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TwinError {
    #[error("twin store failed: {0}")]
    Store(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for TwinError {
    fn from(err: tokio_postgres::Error) -> Self {
        TwinError::Store(err.to_string())
    }
}

/// Reasons a single sub-event could not be handled.
///
/// These never abort a batch; the offending item is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Twin(#[from] TwinError),

    #[error("publish failed ({publish}); twin update failed ({twin})")]
    PublishAndTwin { publish: PublishError, twin: TwinError },

    #[error("malformed sub-event: {0}")]
    Malformed(String),
}

/// Why a signature check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("signature missing")]
    MissingSignature,

    #[error("signature is not valid for the configured encoding")]
    Encoding,

    #[error("signature mismatch")]
    Mismatch,
}
