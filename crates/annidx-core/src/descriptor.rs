use serde::{Deserialize, Serialize};

use crate::uid::Uid;

/// A single descriptor: an opaque identifier paired with its vector.
///
/// Vectors are never mutated in place once stored; an update to an existing
/// uid is a whole-record replacement, handled above this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    pub uid: Uid,
    pub vector: Vec<f32>,
}

impl DescriptorRecord {
    pub fn new(uid: impl Into<Uid>, vector: Vec<f32>) -> Self {
        Self {
            uid: uid.into(),
            vector,
        }
    }

    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}
