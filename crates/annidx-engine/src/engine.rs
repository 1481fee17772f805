use annidx_core::Result;

/// An ANN engine's view of a search result slot: `None` is the sentinel the
/// spec calls out for "the probed cells held fewer than k items" -- callers
/// drop these rather than surfacing a hole.
pub type SearchRow = (Vec<Option<u64>>, Vec<f64>);

/// Abstraction over a native vector-search engine configured by a factory
/// string. The Index Controller drives one instance of this per open index;
/// `idx` values passed in are Bimap-issued dense internal ids, never the
/// application's uid.
pub trait Engine: Send + Sync {
    /// Trains the engine (and any preprocessing stages) on the given
    /// vectors. A no-op for engines whose pipeline requires no training.
    /// Idempotent after the first successful call.
    fn train(&self, vectors: &[Vec<f32>]) -> Result<()>;

    fn is_trained(&self) -> bool;

    /// Adds vectors under the given (already allocated) internal ids.
    /// Precondition: `is_trained()`, `vectors.len() == idxs.len()`, and
    /// `idxs` disjoint from ids already added.
    fn add_with_ids(&self, vectors: &[Vec<f32>], idxs: &[u64]) -> Result<()>;

    /// Runs `k`-NN search for every row of `queries`. Returns, per query, the
    /// internal ids (or `None` sentinels for short results) and matching
    /// distances in ascending order.
    fn search(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<SearchRow>>;

    /// True if this pipeline can remove ids in place (e.g. `Flat`, `IVF`).
    /// False for append-only pipelines (`HNSW`), which the Index Controller
    /// handles by rebuilding from the Descriptor Store instead.
    fn supports_remove(&self) -> bool;

    /// Removes the given internal ids. Only called when `supports_remove()`
    /// is true. Returns the count actually removed.
    fn remove(&self, idxs: &[u64]) -> Result<usize>;

    /// Serializes the engine's full internal state to an opaque byte blob,
    /// for the engine half of the persistence layer's two blob slots.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Live item count as tracked by the engine itself (used for
    /// cross-checking against the Bimap/Descriptor Store counts).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Escape hatch for the rare operation that is genuinely engine-specific
    /// (currently: retuning `ivf_nprobe` on an `IvfEngine`) instead of
    /// widening this trait with a method every other engine would stub out.
    fn as_any(&self) -> &dyn std::any::Any;
}
