use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use annidx_core::{Error, Result};

/// A single opaque byte-addressable slot, as used by the persistence layer
/// for both the engine blob and the parameter blob.
///
/// Two implementations are provided: an in-memory slot for tests and
/// ephemeral indices, and a file-backed slot that writes through a temp file
/// plus rename so a crash never leaves a half-written blob observable --
/// the same durability discipline this corpus's write-ahead log applies at
/// the entry level, applied here at the whole-blob level since a parameter
/// or engine blob is replaced wholesale on every persist.
pub trait ByteStore: Send + Sync {
    fn read(&self) -> Result<Option<Vec<u8>>>;
    fn write(&self, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryByteStore {
    slot: RwLock<Option<Vec<u8>>>,
}

impl InMemoryByteStore {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }
}

impl ByteStore for InMemoryByteStore {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.slot.read().clone())
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        *self.slot.write() = Some(bytes.to_vec());
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileByteStore {
    path: PathBuf,
}

impl FileByteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ByteStore for FileByteStore {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::PersistError(e.to_string())),
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("annidx-blob")
        ));

        let mut tmp = fs::File::create(&tmp_path).map_err(|e| Error::PersistError(e.to_string()))?;
        tmp.write_all(bytes)
            .map_err(|e| Error::PersistError(e.to_string()))?;
        tmp.sync_all().map_err(|e| Error::PersistError(e.to_string()))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| Error::PersistError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryByteStore::new();
        assert!(store.read().unwrap().is_none());
        store.write(b"hello").unwrap();
        assert_eq!(store.read().unwrap().unwrap(), b"hello");
    }

    #[test]
    fn file_store_round_trips_and_survives_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileByteStore::new(dir.path().join("blob.bin"));
        assert!(store.read().unwrap().is_none());
        store.write(b"v1").unwrap();
        assert_eq!(store.read().unwrap().unwrap(), b"v1");
        store.write(b"v2-longer").unwrap();
        assert_eq!(store.read().unwrap().unwrap(), b"v2-longer");
    }
}
