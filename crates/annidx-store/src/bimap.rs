use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use annidx_core::{Error, Result, Uid};

/// Bidirectional uid <-> dense internal index map with a monotonic
/// `next_index` counter that never reuses a freed index.
///
/// Shaped after this corpus's `HnswMappings` id-translation table (itself an
/// `id_to_idx`/`idx_to_id`/`next_idx` triple), generalized from `u32` engine
/// ids to `u64` and from numeric-only ids to the full `Uid` space.
#[derive(Debug, Default)]
pub struct Bimap {
    inner: RwLock<BimapInner>,
    next_index: AtomicU64,
}

#[derive(Debug, Default)]
struct BimapInner {
    uid_to_idx: HashMap<Uid, u64>,
    idx_to_uid: HashMap<u64, Uid>,
}

impl Bimap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BimapInner::default()),
            next_index: AtomicU64::new(0),
        }
    }

    /// Rebuilds a bimap from a persisted `next_index` with no entries yet
    /// registered; used when loading parameter state before descriptor data.
    pub fn with_next_index(next_index: u64) -> Self {
        Self {
            inner: RwLock::new(BimapInner::default()),
            next_index: AtomicU64::new(next_index),
        }
    }

    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::Acquire)
    }

    /// Assigns fresh internal indices to `uids`, in order, advancing
    /// `next_index` by `uids.len()`.
    pub fn alloc(&self, uids: &[Uid]) -> Vec<u64> {
        let mut guard = self.inner.write();
        let mut out = Vec::with_capacity(uids.len());
        for uid in uids {
            let idx = self.next_index.fetch_add(1, Ordering::AcqRel);
            guard.uid_to_idx.insert(uid.clone(), idx);
            guard.idx_to_uid.insert(idx, uid.clone());
            out.push(idx);
        }
        out
    }

    pub fn lookup_idx(&self, uid: &Uid) -> Result<u64> {
        self.inner
            .read()
            .uid_to_idx
            .get(uid)
            .copied()
            .ok_or_else(|| Error::uid_not_found(uid.clone()))
    }

    pub fn lookup_uid(&self, idx: u64) -> Option<Uid> {
        self.inner.read().idx_to_uid.get(&idx).cloned()
    }

    pub fn contains_uid(&self, uid: &Uid) -> bool {
        self.inner.read().uid_to_idx.contains_key(uid)
    }

    /// Removes `uids` and returns their freed internal indices, in input
    /// order. Does not decrement `next_index` -- freed indices are never
    /// reused.
    pub fn remove_by_uid(&self, uids: &[Uid]) -> Result<Vec<u64>> {
        let mut guard = self.inner.write();
        for uid in uids {
            if !guard.uid_to_idx.contains_key(uid) {
                return Err(Error::uid_not_found(uid.clone()));
            }
        }
        let mut removed = Vec::with_capacity(uids.len());
        for uid in uids {
            let idx = guard.uid_to_idx.remove(uid).expect("checked above");
            guard.idx_to_uid.remove(&idx);
            removed.push(idx);
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().uid_to_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut guard = self.inner.write();
        guard.uid_to_idx.clear();
        guard.idx_to_uid.clear();
        self.next_index.store(0, Ordering::Release);
    }

    /// Serializes the uid -> idx table and `next_index` counter; the reverse
    /// map is reconstructible from the forward one and isn't carried.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let guard = self.inner.read();
        let entries: Vec<(Uid, u64)> = guard
            .uid_to_idx
            .iter()
            .map(|(u, i)| (u.clone(), *i))
            .collect();
        bincode::serialize(&(entries, self.next_index())).map_err(Error::Serialization)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (entries, next_index): (Vec<(Uid, u64)>, u64) =
            bincode::deserialize(bytes).map_err(Error::Serialization)?;
        let mut inner = BimapInner::default();
        for (uid, idx) in entries {
            inner.uid_to_idx.insert(uid.clone(), idx);
            inner.idx_to_uid.insert(idx, uid);
        }
        Ok(Self {
            inner: RwLock::new(inner),
            next_index: AtomicU64::new(next_index),
        })
    }

    /// Replaces this bimap's contents in place from a serialized blob, via
    /// the same interior-mutability locks every other method uses -- no
    /// `&mut self` required, so a controller can reload persisted state
    /// through a shared reference.
    pub fn load_from_bytes(&self, bytes: &[u8]) -> Result<()> {
        let loaded = Self::from_bytes(bytes)?;
        let mut guard = self.inner.write();
        *guard = loaded.inner.into_inner();
        self.next_index.store(loaded.next_index(), Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_advances_next_index_monotonically() {
        let bm = Bimap::new();
        let idxs = bm.alloc(&[Uid::from(1u64), Uid::from(2u64)]);
        assert_eq!(idxs, vec![0, 1]);
        assert_eq!(bm.next_index(), 2);
    }

    #[test]
    fn remove_does_not_reuse_indices() {
        let bm = Bimap::new();
        let uids: Vec<Uid> = (0..100u64).map(Uid::from).collect();
        bm.alloc(&uids);
        bm.remove_by_uid(&uids[10..11]).unwrap();
        bm.remove_by_uid(&uids[98..99]).unwrap();
        let more: Vec<Uid> = (100..110u64).map(Uid::from).collect();
        bm.alloc(&more);
        assert_eq!(bm.next_index(), 110);
        assert_eq!(bm.len(), 98);
    }

    #[test]
    fn lookup_roundtrips_uid_and_idx() {
        let bm = Bimap::new();
        bm.alloc(&[Uid::from("a"), Uid::from("b")]);
        let idx = bm.lookup_idx(&Uid::from("a")).unwrap();
        assert_eq!(bm.lookup_uid(idx), Some(Uid::from("a")));
    }

    proptest::proptest! {
        /// For any initial batch, any prefix of it removed, and any further
        /// batch allocated afterward: `next_index` lands exactly on the
        /// total ever allocated, and no newly issued index falls within the
        /// range freed by the removal.
        #[test]
        fn alloc_remove_alloc_never_reuses_an_index(
            n in 1usize..50,
            remove_count in 0usize..50,
            m in 0usize..20,
        ) {
            let remove_count = remove_count.min(n);
            let bm = Bimap::new();
            let uids: Vec<Uid> = (0..n as u64).map(Uid::from).collect();
            bm.alloc(&uids);

            if remove_count > 0 {
                bm.remove_by_uid(&uids[..remove_count]).unwrap();
            }

            let more: Vec<Uid> = (n as u64..(n + m) as u64).map(Uid::from).collect();
            let second_idxs = bm.alloc(&more);

            proptest::prop_assert_eq!(bm.next_index(), (n + m) as u64);
            for idx in second_idxs {
                proptest::prop_assert!(idx >= n as u64);
            }
            proptest::prop_assert_eq!(bm.len(), n - remove_count + m);
        }
    }
}
