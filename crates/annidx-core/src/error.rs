use thiserror::Error;

use crate::uid::Uid;

/// Unified error type for every annidx crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("index is read-only")]
    ReadOnly,

    #[error("input set is empty")]
    EmptyInput,

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("uid not found: {0:?}")]
    UidNotFound(Uid),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("persisted parameter blob does not match current configuration")]
    ConfigurationMismatch,

    #[error("persistence failure: {0}")]
    PersistError(String),

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("engine failure: {0}")]
    EngineFailure(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// First-offender naming helper for batched uid validation (see `UidNotFound`).
    pub fn uid_not_found(uid: Uid) -> Self {
        Error::UidNotFound(uid)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
