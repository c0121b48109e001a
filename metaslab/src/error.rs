use crate::base_types::DeviceId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaslabError {
    /// No device in the domain could satisfy the request.
    #[error("out of space")]
    OutOfSpace,

    /// The extent is not allocatable (claim) or not allocated (free).
    #[error("extent {vdev}:{offset:#x}+{size:#x} not found")]
    NotFound { vdev: DeviceId, offset: u64, size: u64 },

    #[error("device {0} is not part of this allocation domain")]
    DeviceUnavailable(DeviceId),

    /// In-core or persisted allocation state contradicts itself, e.g. a
    /// double free found while replaying a log.
    #[error("corrupt extent index state: {0}")]
    CorruptIndexState(String),

    /// The persistence layer failed.
    #[error("space map store: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl MetaslabError {
    /// Whether retrying the whole allocation with relaxed placement could
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetaslabError::OutOfSpace)
    }
}

pub type Result<T> = std::result::Result<T, MetaslabError>;
