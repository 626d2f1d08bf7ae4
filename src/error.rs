//! Main Crate Error

use crate::common::DecodeError;

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to (de)serialize snapshot: {0}")]
    /// Errors related to reading or writing persisted state.
    Snapshot(#[from] serde_json::Error),

    #[error("Invalid Id: {0}")]
    /// Id is not valid hex or does not have the configured length.
    InvalidId(String),

    #[error("Invalid Id length: {0} bytes, expected 1 to {max}", max = crate::common::MAX_ID_LENGTH)]
    /// Configured Id length is zero or too long for distances to fit a `u16`.
    InvalidIdLength(usize),

    /// Ids of different lengths can't be compared.
    #[error("Id length mismatch: expected {expected} bytes, got {got}")]
    IdLengthMismatch { expected: usize, got: usize },

    /// Stored values travel inside the pipe-delimited wire grammar, so they must be
    /// non-empty ASCII without `|`.
    #[error("Invalid value: {0:?}")]
    InvalidValue(String),

    #[error(transparent)]
    /// Failed to decode a wire message.
    Decode(#[from] DecodeError),

    /// The node's actor thread is gone, either shut down or crashed.
    #[error("Dht actor is shutdown")]
    ActorShutdown,
}
