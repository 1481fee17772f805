use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use parking_lot::RwLock;

use annidx_core::{Config, ConfigSnapshot, DescriptorRecord, Error, Result, Uid};
use annidx_engine::{parse_factory_string, Engine, PipelineEngine};
use annidx_store::{Bimap, ByteStore, DescriptorStore};

use crate::param_blob::ParamBlob;

/// Process-wide registry of accelerator ids currently pinned to a live
/// `Index`. Mirrors this corpus's use of a single process-wide guard for a
/// scarce shared resource rather than a per-instance check, since GPU
/// contention is a property of the whole process, not of any one index.
fn pinned_gpu_ids() -> &'static Mutex<HashSet<u32>> {
    static PINNED: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();
    PINNED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// A single nearest-neighbor match: the matched record and its distance to
/// the query, ascending order within a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub record: DescriptorRecord,
    pub distance: f64,
}

/// Coordinates the Descriptor Store, Bimap, ANN Engine Adapter, and
/// Persistence Layer into the single mutable, persistable index described by
/// this crate. Every mutator (`build`, `update`, `remove`, `reset`) takes the
/// controller's single writer lock; `nn` and `count` take it as a reader, the
/// way this corpus's index guards structural changes against concurrent
/// lookups with a readers-writer lock rather than a single global mutex.
pub struct Index {
    config: Config,
    ds: DescriptorStore,
    bm: Bimap,
    engine: RwLock<Option<Box<dyn Engine>>>,
    dim: AtomicUsize,
    ds_store: Box<dyn ByteStore>,
    bm_store: Box<dyn ByteStore>,
    engine_store: Box<dyn ByteStore>,
    param_store: Box<dyn ByteStore>,
    state_lock: RwLock<()>,
    /// Latched by a partial in-place `add_with_ids` failure during `update`;
    /// the next mutator must rebuild the engine from the Descriptor Store
    /// (the authoritative source of truth) before doing anything else.
    needs_rebuild: AtomicBool,
    /// Set when this index reserved an accelerator id at open time, so
    /// `Drop` can release it for the next index to pin.
    pinned_gpu_id: Option<u32>,
}

/// 0 is never a valid dimension for a populated index; used as the "no
/// engine yet" sentinel for the atomic `dim` field.
const DIM_UNSET: usize = 0;

impl Index {
    /// Opens an index against the given backing byte stores, config
    /// snapshot, and descriptor records as of open time. If the param blob
    /// store already holds a persisted parameter blob, validates it against
    /// `snapshot` (`Error::ConfigurationMismatch` on mismatch) and
    /// reconstructs the Descriptor Store, Bimap, and engine from the other
    /// three blobs; otherwise starts as an empty index.
    pub fn open(
        snapshot: ConfigSnapshot,
        ds_store: Box<dyn ByteStore>,
        bm_store: Box<dyn ByteStore>,
        engine_store: Box<dyn ByteStore>,
        param_store: Box<dyn ByteStore>,
    ) -> Result<Self> {
        let config = Config::from_snapshot(snapshot)?;

        let pinned_gpu_id = if config.use_gpu {
            if let Some(gpu_id) = config.gpu_id {
                let mut pinned = pinned_gpu_ids()
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if !pinned.insert(gpu_id) {
                    return Err(Error::ResourceBusy(format!(
                        "accelerator {gpu_id} is already pinned by another index in this process"
                    )));
                }
                Some(gpu_id)
            } else {
                None
            }
        } else {
            None
        };

        let index = Self {
            config,
            ds: DescriptorStore::new(),
            bm: Bimap::new(),
            engine: RwLock::new(None),
            dim: AtomicUsize::new(DIM_UNSET),
            ds_store,
            bm_store,
            engine_store,
            param_store,
            state_lock: RwLock::new(()),
            needs_rebuild: AtomicBool::new(false),
            pinned_gpu_id,
        };

        if let Err(e) = index.load_persisted() {
            index.release_pinned_gpu_id();
            return Err(e);
        }
        Ok(index)
    }

    fn release_pinned_gpu_id(&self) {
        if let Some(gpu_id) = self.pinned_gpu_id {
            pinned_gpu_ids()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&gpu_id);
        }
    }

    /// Opens an index with purely in-memory backing stores -- no
    /// persistence across process restarts, useful for tests and ephemeral
    /// indices.
    pub fn ephemeral(snapshot: ConfigSnapshot) -> Result<Self> {
        Self::open(
            snapshot,
            Box::new(annidx_store::InMemoryByteStore::new()),
            Box::new(annidx_store::InMemoryByteStore::new()),
            Box::new(annidx_store::InMemoryByteStore::new()),
            Box::new(annidx_store::InMemoryByteStore::new()),
        )
    }

    fn load_persisted(&self) -> Result<()> {
        let Some(param_bytes) = self.param_store.read()? else {
            return Ok(());
        };
        let param = ParamBlob::from_bytes(&param_bytes)?;

        if param.factory_string != self.config.factory_string {
            return Err(Error::ConfigurationMismatch);
        }

        if param.dimension == 0 {
            // A persisted empty index: nothing further to load.
            return Ok(());
        }

        let ds_bytes = self.ds_store.read()?.unwrap_or_default();
        let records: Vec<DescriptorRecord> = if ds_bytes.is_empty() {
            Vec::new()
        } else {
            bincode::deserialize(&ds_bytes).map_err(Error::Serialization)?
        };
        for record in &records {
            if record.dim() != param.dimension as usize {
                return Err(Error::ConfigurationMismatch);
            }
        }
        self.ds.put_many(records);

        if let Some(bm_bytes) = self.bm_store.read()? {
            self.bm.load_from_bytes(&bm_bytes)?;
        }

        if let Some(engine_bytes) = self.engine_store.read()? {
            if !engine_bytes.is_empty() {
                let engine = PipelineEngine::deserialize(&engine_bytes)?;
                *self.engine.write() = Some(Box::new(engine));
            }
        }

        self.dim.store(param.dimension as usize, Ordering::Release);
        Ok(())
    }

    pub fn get_config(&self) -> ConfigSnapshot {
        self.config.to_snapshot()
    }

    pub fn set_ivf_nprobe(&self, val: usize) -> Result<()> {
        self.config.set_ivf_nprobe(val)?;
        if let Some(engine) = self.engine.read().as_ref() {
            if let Some(pipeline) = engine.as_any().downcast_ref::<PipelineEngine>() {
                pipeline.set_ivf_nprobe(val)?;
            }
        }
        Ok(())
    }

    pub fn set_read_only(&self, val: bool) {
        self.config.set_read_only(val);
    }

    pub fn count(&self) -> u64 {
        self.ds.len()
    }

    /// Next internal index `build`/`update` would allocate. Monotonic across
    /// removals: a freed index is never handed out again.
    pub fn next_index(&self) -> u64 {
        self.bm.next_index()
    }

    /// Builds the index from scratch, discarding any existing content.
    /// Empty-input and read-only guards apply; on any engine failure the
    /// prior in-memory state (if any) is left untouched, since all fallible
    /// work runs against freshly-constructed state before anything in
    /// `self` is mutated.
    #[tracing::instrument(skip(self, descriptors), fields(count = descriptors.len()))]
    pub fn build(&self, descriptors: Vec<DescriptorRecord>) -> Result<()> {
        if self.config.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if descriptors.is_empty() {
            return Err(Error::EmptyInput);
        }

        let _guard = self.state_lock.write();
        self.build_locked(descriptors)
    }

    fn build_locked(&self, descriptors: Vec<DescriptorRecord>) -> Result<()> {
        let dim = descriptors[0].dim();
        for d in &descriptors {
            if d.dim() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: d.dim(),
                });
            }
        }

        let spec = parse_factory_string(&self.config.factory_string)?;
        let engine = PipelineEngine::build(&spec, dim, self.config.random_seed)?;
        engine.set_ivf_nprobe(self.config.get_ivf_nprobe())?;
        let vectors: Vec<Vec<f32>> = descriptors.iter().map(|d| d.vector.clone()).collect();
        let uids: Vec<Uid> = descriptors.iter().map(|d| d.uid.clone()).collect();

        let staging = Bimap::new();
        let idxs = staging.alloc(&uids);

        if spec.requires_training() {
            engine.train(&vectors)?;
        }
        engine.add_with_ids(&vectors, &idxs)?;

        // Every fallible step above succeeded against freshly-built state;
        // commit for real now that nothing can fail.
        self.ds.clear();
        self.ds.put_many(descriptors);
        self.bm.clear();
        self.bm.alloc(&uids);
        *self.engine.write() = Some(Box::new(engine));
        self.dim.store(dim, Ordering::Release);
        self.needs_rebuild.store(false, Ordering::Release);
        self.config.bump_generation();

        tracing::info!(target: "annidx::controller", count = self.ds.len(), dim, "build");
        self.persist_locked()
    }

    /// Adds descriptors whose uids are not already known; known uids are a
    /// silent no-op. Empty-input and read-only guards apply, as does a
    /// dimension check once the index has been built at least once.
    #[tracing::instrument(skip(self, descriptors), fields(count = descriptors.len()))]
    pub fn update(&self, descriptors: Vec<DescriptorRecord>) -> Result<()> {
        if self.config.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if descriptors.is_empty() {
            return Err(Error::EmptyInput);
        }

        let _guard = self.state_lock.write();

        let dim = self.dim.load(Ordering::Acquire);
        if dim == DIM_UNSET {
            return self.build_locked(descriptors);
        }
        for d in &descriptors {
            if d.dim() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: d.dim(),
                });
            }
        }

        let fresh: Vec<DescriptorRecord> = descriptors
            .into_iter()
            .filter(|d| !self.bm.contains_uid(&d.uid))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        if self.needs_rebuild.swap(false, Ordering::AcqRel) {
            self.rebuild_engine_locked()?;
        }

        let uids: Vec<Uid> = fresh.iter().map(|d| d.uid.clone()).collect();
        let vectors: Vec<Vec<f32>> = fresh.iter().map(|d| d.vector.clone()).collect();
        let idxs = self.bm.alloc(&uids);
        self.ds.put_many(fresh);
        self.config.bump_generation();

        let add_result = {
            let engine_guard = self.engine.read();
            let engine = engine_guard
                .as_ref()
                .expect("dim set implies engine initialized");
            engine.add_with_ids(&vectors, &idxs)
        };

        if let Err(e) = add_result {
            self.needs_rebuild.store(true, Ordering::Release);
            tracing::warn!(
                target: "annidx::controller",
                error = %e,
                "partial add failed; engine rebuild deferred to next mutator"
            );
            return Err(e);
        }

        tracing::info!(target: "annidx::controller", added = uids.len(), count = self.ds.len(), "update");
        self.persist_locked()
    }

    /// Removes the given uids. Validates every uid exists before removing
    /// any (all-or-nothing; the first missing uid is named in the error).
    /// If the engine's pipeline cannot remove in place (HNSW), rebuilds it
    /// from the surviving Descriptor Store contents.
    #[tracing::instrument(skip(self, uids), fields(count = uids.len()))]
    pub fn remove(&self, uids: &[Uid]) -> Result<()> {
        if self.config.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if uids.is_empty() {
            return Ok(());
        }

        let _guard = self.state_lock.write();

        for uid in uids {
            if !self.bm.contains_uid(uid) {
                return Err(Error::uid_not_found(uid.clone()));
            }
        }

        let idxs = self.bm.remove_by_uid(uids)?;
        self.ds.remove_many(uids)?;
        self.config.bump_generation();

        let supports_remove = self
            .engine
            .read()
            .as_ref()
            .map(|e| e.supports_remove())
            .unwrap_or(true);

        if supports_remove {
            if let Some(engine) = self.engine.read().as_ref() {
                engine.remove(&idxs)?;
            }
        } else {
            self.rebuild_engine_locked()?;
        }

        tracing::info!(target: "annidx::controller", removed = uids.len(), count = self.ds.len(), "remove");
        self.persist_locked()
    }

    fn rebuild_engine_locked(&self) -> Result<()> {
        let dim = self.dim.load(Ordering::Acquire);
        if dim == DIM_UNSET {
            *self.engine.write() = None;
            self.needs_rebuild.store(false, Ordering::Release);
            return Ok(());
        }

        let spec = parse_factory_string(&self.config.factory_string)?;
        let engine = PipelineEngine::build(&spec, dim, self.config.random_seed)?;
        engine.set_ivf_nprobe(self.config.get_ivf_nprobe())?;

        let records: Vec<DescriptorRecord> = self.ds.iter().collect();
        let vectors: Vec<Vec<f32>> = records.iter().map(|r| r.vector.clone()).collect();
        let idxs: Vec<u64> = records
            .iter()
            .map(|r| self.bm.lookup_idx(&r.uid))
            .collect::<Result<_>>()?;

        if !vectors.is_empty() {
            if spec.requires_training() {
                engine.train(&vectors)?;
            }
            engine.add_with_ids(&vectors, &idxs)?;
        }

        *self.engine.write() = Some(Box::new(engine));
        self.needs_rebuild.store(false, Ordering::Release);
        tracing::info!(target: "annidx::controller", count = vectors.len(), "engine rebuilt from descriptor store");
        Ok(())
    }

    /// Runs k-NN search for a single query vector. An empty index returns an
    /// empty result rather than an error. `None` sentinels from the engine
    /// (fewer than `k` candidates available) are silently dropped.
    #[tracing::instrument(skip(self, query), fields(k))]
    pub fn nn(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let _guard = self.state_lock.read();

        let dim = self.dim.load(Ordering::Acquire);
        if dim == DIM_UNSET {
            return Ok(Vec::new());
        }
        if query.len() != dim {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }

        let engine_guard = self.engine.read();
        let engine = engine_guard
            .as_ref()
            .ok_or_else(|| Error::EngineFailure("engine not initialized".to_string()))?;
        let rows = engine.search(std::slice::from_ref(&query.to_vec()), k)?;
        let (ids, dists) = &rows[0];

        let mut out = Vec::with_capacity(ids.len());
        for (maybe_idx, &distance) in ids.iter().zip(dists.iter()) {
            let Some(idx) = maybe_idx else {
                continue;
            };
            let Some(uid) = self.bm.lookup_uid(*idx) else {
                continue;
            };
            let record = self.ds.get(&uid)?;
            out.push(Neighbor { record, distance });
        }
        Ok(out)
    }

    /// Discards all content, overwriting the persistence slots with the
    /// empty state rather than clearing them, so a crash mid-reset never
    /// leaves stale descriptor data reachable from a missing blob.
    pub fn reset(&self) -> Result<()> {
        if self.config.is_read_only() {
            return Err(Error::ReadOnly);
        }

        let _guard = self.state_lock.write();
        self.ds.clear();
        self.bm.clear();
        *self.engine.write() = None;
        self.dim.store(DIM_UNSET, Ordering::Release);
        self.needs_rebuild.store(false, Ordering::Release);
        self.config.bump_generation();

        tracing::info!(target: "annidx::controller", "reset");
        self.persist_locked()
    }

    fn persist_locked(&self) -> Result<()> {
        let dim = self.dim.load(Ordering::Acquire);

        let (engine_bytes, is_trained) = {
            let engine_guard = self.engine.read();
            match engine_guard.as_ref() {
                Some(engine) => (engine.serialize()?, engine.is_trained()),
                None => (Vec::new(), false),
            }
        };

        let param = ParamBlob {
            factory_string: self.config.factory_string.clone(),
            dimension: dim as u32,
            is_trained,
            next_index: self.bm.next_index(),
        };

        let ds_bytes = bincode::serialize(&self.ds.iter().collect::<Vec<_>>())
            .map_err(Error::Serialization)?;
        let bm_bytes = self.bm.to_bytes()?;

        self.ds_store.write(&ds_bytes)?;
        self.bm_store.write(&bm_bytes)?;
        self.engine_store.write(&engine_bytes)?;
        self.param_store.write(&param.to_bytes()?)?;
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        self.release_pinned_gpu_id();
    }
}
