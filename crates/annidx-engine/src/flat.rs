use parking_lot::RwLock;

use annidx_core::{Error, Result};

use crate::distances::squared_l2;
use crate::engine::{Engine, SearchRow};

/// Brute-force exact search. Requires no training; supports in-place
/// removal. The baseline every other engine in this crate is checked
/// against for recall.
#[derive(Debug, Default)]
pub struct FlatEngine {
    dim: usize,
    entries: RwLock<Vec<(u64, Vec<f32>)>>,
}

impl FlatEngine {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: RwLock::new(Vec::new()),
        }
    }

    fn check_dims(&self, vectors: &[Vec<f32>]) -> Result<()> {
        for v in vectors {
            if v.len() != self.dim {
                return Err(Error::DimensionMismatch {
                    expected: self.dim,
                    actual: v.len(),
                });
            }
        }
        Ok(())
    }
}

impl Engine for FlatEngine {
    fn train(&self, _vectors: &[Vec<f32>]) -> Result<()> {
        Ok(())
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn add_with_ids(&self, vectors: &[Vec<f32>], idxs: &[u64]) -> Result<()> {
        self.check_dims(vectors)?;
        let mut entries = self.entries.write();
        for (v, &idx) in vectors.iter().zip(idxs) {
            entries.push((idx, v.clone()));
        }
        Ok(())
    }

    fn search(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<SearchRow>> {
        self.check_dims(queries)?;
        let entries = self.entries.read();
        let mut rows = Vec::with_capacity(queries.len());
        for q in queries {
            let mut scored: Vec<(u64, f64)> = entries
                .iter()
                .map(|(idx, v)| (*idx, squared_l2(q, v)))
                .collect();
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(k);
            let ids = scored.iter().map(|(id, _)| Some(*id)).collect();
            let dists = scored.iter().map(|(_, d)| *d).collect();
            rows.push((ids, dists));
        }
        Ok(rows)
    }

    fn supports_remove(&self) -> bool {
        true
    }

    fn remove(&self, idxs: &[u64]) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(idx, _)| !idxs.contains(idx));
        Ok(before - entries.len())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let entries = self.entries.read();
        bincode::serialize(&(self.dim, &*entries)).map_err(Error::Serialization)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl FlatEngine {
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (dim, entries): (usize, Vec<(u64, Vec<f32>)>) =
            bincode::deserialize(bytes).map_err(Error::Serialization)?;
        Ok(Self {
            dim,
            entries: RwLock::new(entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_nearest_neighbor_has_zero_distance() {
        let engine = FlatEngine::new(2);
        let vectors = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]];
        engine.add_with_ids(&vectors, &[0, 1, 2]).unwrap();
        let rows = engine.search(&[vec![1.0, 1.0]], 1).unwrap();
        assert_eq!(rows[0].0[0], Some(1));
        assert_eq!(rows[0].1[0], 0.0);
    }

    #[test]
    fn remove_excludes_from_future_search() {
        let engine = FlatEngine::new(1);
        engine
            .add_with_ids(&[vec![0.0], vec![1.0]], &[0, 1])
            .unwrap();
        assert_eq!(engine.remove(&[0]).unwrap(), 1);
        let rows = engine.search(&[vec![0.0]], 2).unwrap();
        assert_eq!(rows[0].0, vec![Some(1)]);
    }

    #[test]
    fn serialize_round_trip_preserves_entries() {
        let engine = FlatEngine::new(2);
        engine
            .add_with_ids(&[vec![1.0, 2.0]], &[7])
            .unwrap();
        let bytes = engine.serialize().unwrap();
        let restored = FlatEngine::deserialize(&bytes).unwrap();
        assert_eq!(restored.len(), 1);
        let rows = restored.search(&[vec![1.0, 2.0]], 1).unwrap();
        assert_eq!(rows[0].0, vec![Some(7)]);
    }
}
