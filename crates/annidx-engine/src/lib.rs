pub mod distances;
pub mod engine;
pub mod factory;
pub mod flat;
pub mod hnsw;
pub mod ivf;
pub mod pcar;

pub use engine::{Engine, SearchRow};
pub use factory::{parse as parse_factory_string, FactorySpec, IndexKind};

use annidx_core::{Error, Result};
use flat::FlatEngine;
use hnsw::HnswEngine;
use ivf::IvfEngine;
use pcar::PcarTransform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
enum BaseEngineTag {
    Flat,
    Ivf,
    Hnsw,
}

/// Composes an optional `PCAR` preprocessor with a terminal index engine, the
/// way a parsed factory string pipeline does: every vector handed to `train`
/// or `add_with_ids`, and every query handed to `search`, is projected
/// through the preprocessor first (if one is configured) before reaching the
/// base engine.
pub struct PipelineEngine {
    pcar: Option<PcarTransform>,
    base: Box<dyn Engine>,
    base_tag: BaseEngineTag,
}

impl PipelineEngine {
    /// Builds the engine pipeline named by a parsed factory spec for a given
    /// input dimension.
    pub fn build(spec: &FactorySpec, dim: usize, seed: Option<u64>) -> Result<Self> {
        let (pcar, base_dim) = match spec.pcar_dim {
            Some(out_dim) => (Some(PcarTransform::new(dim, out_dim, seed)), out_dim),
            None => (None, dim),
        };

        let (base, base_tag): (Box<dyn Engine>, BaseEngineTag) = match &spec.index {
            IndexKind::Flat => (Box::new(FlatEngine::new(base_dim)), BaseEngineTag::Flat),
            IndexKind::Ivf { nlists } => (
                Box::new(IvfEngine::new(base_dim, *nlists, seed)),
                BaseEngineTag::Ivf,
            ),
            IndexKind::Hnsw { m } => (
                Box::new(HnswEngine::new(base_dim, *m, seed)),
                BaseEngineTag::Hnsw,
            ),
        };

        Ok(Self { pcar, base, base_tag })
    }

    fn transform_many(&self, vectors: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        match &self.pcar {
            Some(pcar) => pcar.apply_many(vectors),
            None => Ok(vectors.to_vec()),
        }
    }

    /// Applies `ivf_nprobe` to the IVF stage if this pipeline has one;
    /// otherwise a silent no-op, per the factory-string contract.
    pub fn set_ivf_nprobe(&self, val: usize) -> Result<()> {
        match self.base.as_any().downcast_ref::<IvfEngine>() {
            Some(ivf) => ivf.set_nprobe(val),
            None => Ok(()),
        }
    }
}

impl Engine for PipelineEngine {
    fn train(&self, vectors: &[Vec<f32>]) -> Result<()> {
        if let Some(pcar) = &self.pcar {
            pcar.train(vectors)?;
        }
        let transformed = self.transform_many(vectors)?;
        self.base.train(&transformed)
    }

    fn is_trained(&self) -> bool {
        let pcar_ready = self.pcar.as_ref().map_or(true, PcarTransform::is_trained);
        pcar_ready && self.base.is_trained()
    }

    fn add_with_ids(&self, vectors: &[Vec<f32>], idxs: &[u64]) -> Result<()> {
        let transformed = self.transform_many(vectors)?;
        self.base.add_with_ids(&transformed, idxs)
    }

    fn search(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<SearchRow>> {
        let transformed = self.transform_many(queries)?;
        self.base.search(&transformed, k)
    }

    fn supports_remove(&self) -> bool {
        self.base.supports_remove()
    }

    fn remove(&self, idxs: &[u64]) -> Result<usize> {
        self.base.remove(idxs)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let pcar_bytes = match &self.pcar {
            Some(pcar) => Some(pcar.serialize()?),
            None => None,
        };
        let base_bytes = self.base.serialize()?;
        bincode::serialize(&(self.base_tag, pcar_bytes, base_bytes)).map_err(Error::Serialization)
    }

    fn len(&self) -> usize {
        self.base.len()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl PipelineEngine {
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (base_tag, pcar_bytes, base_bytes): (BaseEngineTag, Option<Vec<u8>>, Vec<u8>) =
            bincode::deserialize(bytes).map_err(Error::Serialization)?;

        let pcar = match pcar_bytes {
            Some(b) => Some(PcarTransform::deserialize(&b)?),
            None => None,
        };
        let base: Box<dyn Engine> = match base_tag {
            BaseEngineTag::Flat => Box::new(FlatEngine::deserialize(&base_bytes)?),
            BaseEngineTag::Ivf => Box::new(IvfEngine::deserialize(&base_bytes)?),
            BaseEngineTag::Hnsw => Box::new(HnswEngine::deserialize(&base_bytes)?),
        };
        Ok(Self { pcar, base, base_tag })
    }
}
