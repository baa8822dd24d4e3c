use crate::error::{HxError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Records per committed transaction.
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HxConfig {
    pub storage: StorageConfig,
    pub import: ImportConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub root: PathBuf,
    /// zlib level, 0-9.
    pub compression_level: u32,
}

/// What a multi-file run does after one file fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    Continue,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub batch_size: usize,
    /// Skip fsync while a file is being imported.
    pub relax_durability: bool,
    pub max_concurrent_jobs: usize,
    pub on_error: ErrorPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hx")
            .join("store");
        Self {
            backend: StorageBackend::Filesystem,
            root,
            compression_level: 6,
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            relax_durability: true,
            max_concurrent_jobs: 4,
            on_error: ErrorPolicy::Continue,
        }
    }
}

impl HxConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HxError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.import.batch_size == 0 {
            return Err(HxError::Config("import.batch_size must be > 0".into()));
        }
        if self.import.max_concurrent_jobs == 0 {
            return Err(HxError::Config("import.max_concurrent_jobs must be > 0".into()));
        }
        if self.storage.compression_level > 9 {
            return Err(HxError::Config("storage.compression_level must be in 0..=9".into()));
        }
        Ok(())
    }
}
