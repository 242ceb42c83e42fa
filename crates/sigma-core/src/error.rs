use thiserror::Error;

use crate::types::FileId;

pub type SigmaResult<T> = Result<T, SigmaError>;

#[derive(Debug, Error)]
pub enum SigmaError {
    /// A required user secret was absent or empty.
    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    /// The freshly collected device fingerprint does not match the bound one.
    #[error("device binding mismatch: fingerprint does not match the bound device")]
    DeviceBinding,

    /// Neither the memory-hard KDF nor its fallback could run.
    #[error("key derivation unavailable: {0}")]
    KdfUnavailable(String),

    /// Storage failure while writing shards.
    #[error("scatter failed for file {file_id}: {reason}")]
    Scatter { file_id: FileId, reason: String },

    /// Storage failure while reading shards.
    #[error("gather failed for file {file_id}: {reason}")]
    Gather { file_id: FileId, reason: String },

    /// More shards were lost or corrupted than the redundancy can absorb.
    #[error("integrity failure for file {file_id}: {lost} shard(s) lost, {tolerated} tolerated")]
    Integrity {
        file_id: FileId,
        lost: usize,
        tolerated: usize,
    },

    /// The memory ceiling would be exceeded.
    #[error("allocation of {requested} bytes refused: {in_use} in use, ceiling {ceiling}")]
    Allocation {
        requested: usize,
        in_use: usize,
        ceiling: usize,
    },

    /// Arithmetic bounds exceeded. Indicates a programming or config error.
    #[error("arithmetic overflow: {0}")]
    Overflow(String),

    /// Malformed persisted record.
    #[error("format error: {0}")]
    Format(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SigmaError {
    /// Whether the caller may retry the operation unchanged (possibly after
    /// backing off). Integrity, secret, and binding failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SigmaError::Scatter { .. } | SigmaError::Gather { .. } | SigmaError::Allocation { .. }
        )
    }

    /// The file this error concerns, if any.
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            SigmaError::Scatter { file_id, .. }
            | SigmaError::Gather { file_id, .. }
            | SigmaError::Integrity { file_id, .. } => Some(*file_id),
            _ => None,
        }
    }

    pub fn scatter(file_id: FileId, reason: impl std::fmt::Display) -> Self {
        SigmaError::Scatter {
            file_id,
            reason: reason.to_string(),
        }
    }

    pub fn gather(file_id: FileId, reason: impl std::fmt::Display) -> Self {
        SigmaError::Gather {
            file_id,
            reason: reason.to_string(),
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        SigmaError::Format(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SigmaError::Config(msg.into())
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        SigmaError::Overflow(msg.into())
    }
}
