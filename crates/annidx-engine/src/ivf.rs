use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use annidx_core::{Error, Result};

use crate::distances::squared_l2;
use crate::engine::{Engine, SearchRow};

const LLOYD_ITERATIONS: usize = 8;

/// Inverted-file coarse quantizer over a flat base index. Vectors are
/// assigned to their nearest of `nlists` centroids at train time; search
/// probes the `nprobe` nearest cells and does brute force within them.
///
/// `nprobe` is exposed as an atomic so the Index Controller can retune
/// recall/latency live without taking a write lock, the same pattern this
/// corpus's `GlobalConfig` uses for `ef_search`.
#[derive(Debug)]
pub struct IvfEngine {
    dim: usize,
    nlists: usize,
    nprobe: AtomicUsize,
    seed: u64,
    trained: AtomicBool,
    centroids: RwLock<Vec<Vec<f32>>>,
    cells: RwLock<Vec<Vec<(u64, Vec<f32>)>>>,
}

impl IvfEngine {
    pub fn new(dim: usize, nlists: usize, seed: Option<u64>) -> Self {
        Self {
            dim,
            nlists: nlists.max(1),
            nprobe: AtomicUsize::new(1),
            seed: seed.unwrap_or(0),
            trained: AtomicBool::new(false),
            centroids: RwLock::new(Vec::new()),
            cells: RwLock::new(Vec::new()),
        }
    }

    pub fn set_nprobe(&self, val: usize) -> Result<()> {
        if val < 1 {
            return Err(Error::InvalidConfig(
                "ivf_nprobe must be >= 1.".to_string(),
            ));
        }
        self.nprobe.store(val, Ordering::Relaxed);
        Ok(())
    }

    pub fn nprobe(&self) -> usize {
        self.nprobe.load(Ordering::Relaxed)
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

    fn nearest_centroid(centroids: &[Vec<f32>], v: &[f32]) -> usize {
        centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, squared_l2(v, c)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

impl Engine for IvfEngine {
    fn train(&self, vectors: &[Vec<f32>]) -> Result<()> {
        self.check_dims(vectors)?;
        if vectors.is_empty() {
            return Err(Error::EmptyInput);
        }
        let k = self.nlists.min(vectors.len());
        let mut rng = StdRng::seed_from_u64(self.seed);

        // Lightweight Lloyd's-algorithm k-means: random seed points, then a
        // fixed small number of assign/average iterations. Good enough for
        // the coarse quantizer's job of bucketing nearby vectors together --
        // exact cluster quality only affects recall under low `nprobe`, not
        // correctness.
        let mut idxs: Vec<usize> = (0..vectors.len()).collect();
        for i in (1..idxs.len()).rev() {
            let j = rng.gen_range(0..=i);
            idxs.swap(i, j);
        }
        let mut centroids: Vec<Vec<f32>> = idxs[..k].iter().map(|&i| vectors[i].clone()).collect();

        for _ in 0..LLOYD_ITERATIONS {
            let mut sums = vec![vec![0.0f64; self.dim]; k];
            let mut counts = vec![0usize; k];
            for v in vectors {
                let c = Self::nearest_centroid(&centroids, v);
                counts[c] += 1;
                for (s, &x) in sums[c].iter_mut().zip(v.iter()) {
                    *s += f64::from(x);
                }
            }
            for c in 0..k {
                if counts[c] == 0 {
                    continue;
                }
                for (centroid_val, sum) in centroids[c].iter_mut().zip(sums[c].iter()) {
                    *centroid_val = (*sum / counts[c] as f64) as f32;
                }
            }
        }

        *self.centroids.write() = centroids;
        *self.cells.write() = vec![Vec::new(); k];
        self.trained.store(true, Ordering::Release);
        Ok(())
    }

    fn is_trained(&self) -> bool {
        self.trained.load(Ordering::Acquire)
    }

    fn add_with_ids(&self, vectors: &[Vec<f32>], idxs: &[u64]) -> Result<()> {
        self.check_dims(vectors)?;
        let centroids = self.centroids.read();
        let mut cells = self.cells.write();
        for (v, &idx) in vectors.iter().zip(idxs) {
            let c = Self::nearest_centroid(&centroids, v);
            cells[c].push((idx, v.clone()));
        }
        Ok(())
    }

    fn search(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<SearchRow>> {
        self.check_dims(queries)?;
        let centroids = self.centroids.read();
        let cells = self.cells.read();
        let nprobe = self.nprobe().min(centroids.len().max(1));

        let mut rows = Vec::with_capacity(queries.len());
        for q in queries {
            let mut ranked_cells: Vec<(usize, f64)> = centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, squared_l2(q, c)))
                .collect();
            ranked_cells
                .sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            let mut scored: Vec<(u64, f64)> = Vec::new();
            for &(cell_idx, _) in ranked_cells.iter().take(nprobe) {
                for (idx, v) in &cells[cell_idx] {
                    scored.push((*idx, squared_l2(q, v)));
                }
            }
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
        let mut cells = self.cells.write();
        let mut removed = 0;
        for cell in cells.iter_mut() {
            let before = cell.len();
            cell.retain(|(idx, _)| !idxs.contains(idx));
            removed += before - cell.len();
        }
        Ok(removed)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let centroids = self.centroids.read();
        let cells = self.cells.read();
        bincode::serialize(&(
            self.dim,
            self.nlists,
            self.nprobe(),
            self.seed,
            self.is_trained(),
            &*centroids,
            &*cells,
        ))
        .map_err(Error::Serialization)
    }

    fn len(&self) -> usize {
        self.cells.read().iter().map(Vec::len).sum()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl IvfEngine {
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (dim, nlists, nprobe, seed, trained, centroids, cells): (
            usize,
            usize,
            usize,
            u64,
            bool,
            Vec<Vec<f32>>,
            Vec<Vec<(u64, Vec<f32>)>>,
        ) = bincode::deserialize(bytes).map_err(Error::Serialization)?;
        Ok(Self {
            dim,
            nlists,
            nprobe: AtomicUsize::new(nprobe),
            seed,
            trained: AtomicBool::new(trained),
            centroids: RwLock::new(centroids),
            cells: RwLock::new(cells),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_vectors(n: usize) -> Vec<Vec<f32>> {
        (0..n).map(|j| vec![j as f32, (2 * j) as f32]).collect()
    }

    #[test]
    fn low_nprobe_can_return_fewer_than_k() {
        let n = 512;
        let engine = IvfEngine::new(2, 256, Some(1));
        let vectors = line_vectors(n);
        engine.train(&vectors).unwrap();
        let idxs: Vec<u64> = (0..n as u64).collect();
        engine.add_with_ids(&vectors, &idxs).unwrap();

        engine.set_nprobe(1).unwrap();
        let k = 256 / 4;
        let rows = engine.search(&[vec![0.0, 0.0]], k).unwrap();
        assert!(rows[0].0.len() <= k);
    }

    #[test]
    fn higher_nprobe_recovers_full_k() {
        let n = 512;
        let engine = IvfEngine::new(2, 256, Some(1));
        let vectors = line_vectors(n);
        engine.train(&vectors).unwrap();
        let idxs: Vec<u64> = (0..n as u64).collect();
        engine.add_with_ids(&vectors, &idxs).unwrap();

        engine.set_nprobe(256).unwrap();
        let k = 256 / 4;
        let rows = engine.search(&[vec![0.0, 0.0]], k).unwrap();
        assert_eq!(rows[0].0.len(), k);
    }

    #[test]
    fn nprobe_rejects_zero() {
        let engine = IvfEngine::new(2, 4, None);
        assert!(engine.set_nprobe(0).is_err());
    }
}
