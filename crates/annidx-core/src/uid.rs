use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque, application-chosen descriptor identifier.
///
/// Kept as a small closed enum over the two shapes real callers use (integer
/// keys and string keys) rather than a type-erased `Box<dyn ...>`, so it stays
/// `Hash + Eq + Clone` without extra indirection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Uid {
    Int(u64),
    Str(String),
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uid::Int(n) => write!(f, "{n}"),
            Uid::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for Uid {
    fn from(v: u64) -> Self {
        Uid::Int(v)
    }
}

impl From<i32> for Uid {
    fn from(v: i32) -> Self {
        Uid::Int(v as u64)
    }
}

impl From<&str> for Uid {
    fn from(v: &str) -> Self {
        Uid::Str(v.to_string())
    }
}

impl From<String> for Uid {
    fn from(v: String) -> Self {
        Uid::Str(v)
    }
}
