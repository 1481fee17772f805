use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Plain, serializable snapshot of an index's configuration.
///
/// This is the value `get_config`/`from_config` round-trip on: two snapshots
/// built from the same fields must compare equal regardless of how many
/// times they pass through `Config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub factory_string: String,
    pub ivf_nprobe: usize,
    pub read_only: bool,
    pub use_gpu: bool,
    pub gpu_id: Option<u32>,
    pub random_seed: Option<u64>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            factory_string: "IDMap,Flat".to_string(),
            ivf_nprobe: 1,
            read_only: false,
            use_gpu: false,
            gpu_id: None,
            random_seed: None,
        }
    }
}

impl ConfigSnapshot {
    pub fn validate(&self) -> Result<()> {
        if self.ivf_nprobe < 1 {
            return Err(Error::InvalidConfig(
                "ivf_nprobe must be >= 1.".to_string(),
            ));
        }
        if self.factory_string.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "factory_string must not be empty.".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads a snapshot layered from environment variables (prefix
    /// `ANNIDX_`) over an optional TOML file, falling back to defaults for
    /// anything unset. Mirrors the figment-based layered config loading used
    /// elsewhere in this corpus rather than hand-rolling an env parser.
    pub fn from_env(toml_path: Option<&str>) -> Result<Self> {
        use figment::providers::{Env, Format, Serialized, Toml};
        use figment::Figment;

        let mut figment = Figment::from(Serialized::defaults(ConfigSnapshot::default()));
        if let Some(path) = toml_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("ANNIDX_"));

        let snapshot: ConfigSnapshot = figment
            .extract()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Runtime configuration: the parts of `ConfigSnapshot` that may change while
/// an index is open, held as atomics so a reader thread never blocks behind
/// a writer updating a hot parameter such as `ivf_nprobe`.
#[derive(Debug)]
pub struct Config {
    pub factory_string: String,
    ivf_nprobe: AtomicUsize,
    read_only: std::sync::atomic::AtomicBool,
    pub use_gpu: bool,
    pub gpu_id: Option<u32>,
    pub random_seed: Option<u64>,
    /// advisory counter: mutators bump this so a concurrently-running
    /// rebuild can detect whether it is still racing a fresher mutation
    generation: AtomicU64,
}

impl Config {
    pub fn from_snapshot(snapshot: ConfigSnapshot) -> Result<Self> {
        snapshot.validate()?;
        Ok(Self {
            factory_string: snapshot.factory_string,
            ivf_nprobe: AtomicUsize::new(snapshot.ivf_nprobe),
            read_only: std::sync::atomic::AtomicBool::new(snapshot.read_only),
            use_gpu: snapshot.use_gpu,
            gpu_id: snapshot.gpu_id,
            random_seed: snapshot.random_seed,
            generation: AtomicU64::new(0),
        })
    }

    pub fn to_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            factory_string: self.factory_string.clone(),
            ivf_nprobe: self.get_ivf_nprobe(),
            read_only: self.is_read_only(),
            use_gpu: self.use_gpu,
            gpu_id: self.gpu_id,
            random_seed: self.random_seed,
        }
    }

    pub fn get_ivf_nprobe(&self) -> usize {
        self.ivf_nprobe.load(Ordering::Relaxed)
    }

    pub fn set_ivf_nprobe(&self, val: usize) -> Result<()> {
        if val < 1 {
            return Err(Error::InvalidConfig(
                "ivf_nprobe must be >= 1.".to_string(),
            ));
        }
        self.ivf_nprobe.store(val, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub fn set_read_only(&self, val: bool) {
        self.read_only.store(val, Ordering::Relaxed);
    }

    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_snapshot(ConfigSnapshot::default()).expect("default snapshot is always valid")
    }
}
