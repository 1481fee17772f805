use dashmap::DashMap;

use annidx_core::{DescriptorRecord, Error, Result, Uid};

/// Keyed container mapping opaque uid -> descriptor record.
///
/// Backed by a `DashMap` the way the engine-adapter crate this project is
/// grounded on keeps its forward uid -> metadata map, since readers (`get`,
/// `iter`) and the single writer's batched mutations need to interleave
/// without a single global lock serializing every lookup.
#[derive(Debug, Default)]
pub struct DescriptorStore {
    records: DashMap<Uid, DescriptorRecord>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn has(&self, uid: &Uid) -> bool {
        self.records.contains_key(uid)
    }

    pub fn get(&self, uid: &Uid) -> Result<DescriptorRecord> {
        self.records
            .get(uid)
            .map(|r| r.clone())
            .ok_or_else(|| Error::uid_not_found(uid.clone()))
    }

    /// Inserts or replaces every record in `records`. Atomic with respect to
    /// the batch only in the sense that no partial-batch failure is
    /// possible: inserting into a `DashMap` cannot fail.
    pub fn put_many(&self, records: impl IntoIterator<Item = DescriptorRecord>) {
        for record in records {
            self.records.insert(record.uid.clone(), record);
        }
    }

    /// Removes every uid in `uids`. Fails on the first uid not present,
    /// before removing anything, matching the Index Controller's
    /// all-or-nothing mutator contract.
    pub fn remove_many(&self, uids: &[Uid]) -> Result<()> {
        for uid in uids {
            if !self.has(uid) {
                return Err(Error::uid_not_found(uid.clone()));
            }
        }
        for uid in uids {
            self.records.remove(uid);
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = DescriptorRecord> + '_ {
        self.records.iter().map(|e| e.value().clone())
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(uid: u64, v: Vec<f32>) -> DescriptorRecord {
        DescriptorRecord::new(uid, v)
    }

    #[test]
    fn put_then_get_round_trips() {
        let ds = DescriptorStore::new();
        ds.put_many([rec(1, vec![1.0, 2.0])]);
        let got = ds.get(&Uid::from(1u64)).unwrap();
        assert_eq!(got.vector, vec![1.0, 2.0]);
    }

    #[test]
    fn remove_many_fails_before_mutating_on_missing_uid() {
        let ds = DescriptorStore::new();
        ds.put_many([rec(1, vec![0.0])]);
        let err = ds.remove_many(&[Uid::from(1u64), Uid::from(2u64)]).unwrap_err();
        assert!(matches!(err, Error::UidNotFound(_)));
        // nothing was removed since uid 2 never existed
        assert!(ds.has(&Uid::from(1u64)));
    }

    #[test]
    fn put_many_replaces_existing_uid() {
        let ds = DescriptorStore::new();
        ds.put_many([rec(1, vec![1.0])]);
        ds.put_many([rec(1, vec![2.0])]);
        assert_eq!(ds.get(&Uid::from(1u64)).unwrap().vector, vec![2.0]);
        assert_eq!(ds.len(), 1);
    }
}
