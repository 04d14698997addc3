use thiserror::Error;

use crate::types::SequenceNumber;

/// Errors surfaced by the log store core.
///
/// Async paths deliver these through completion callbacks; sync paths
/// return them directly. Nothing is swallowed silently except the
/// documented "already truncated" no-op inside `do_truncate`.
#[derive(Error, Debug, Clone)]
pub enum LogStoreError {
    #[error("sequence number {0} is out of range (truncated or never created)")]
    OutOfRange(SequenceNumber),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("record at sequence number {0} already exists")]
    AlreadyExists(SequenceNumber),

    #[error("journal reported an error: {0}")]
    Journal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("log store {0} not found")]
    NotFound(u32),
}

pub type Result<T> = std::result::Result<T, LogStoreError>;
