use serde::{Deserialize, Serialize};

use annidx_core::{Error, Result};

/// The persisted parameter blob: everything the Index Controller needs to
/// validate that an on-disk engine blob was produced by, and is safe to
/// reload into, the current configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBlob {
    pub factory_string: String,
    pub dimension: u32,
    pub is_trained: bool,
    pub next_index: u64,
}

impl ParamBlob {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Error::Serialization)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Error::Serialization)
    }
}
