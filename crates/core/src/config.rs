use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::classify::ClassifierThresholds;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SweepConfig {
    pub thresholds: ClassifierThresholds,
    pub cleanup: CleanupSettings,
    pub extra_protected_names: Vec<String>,
    pub excludes: Vec<String>,
    pub inventory_manifests: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupSettings {
    pub use_recoverable_delete: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            use_recoverable_delete: true,
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl CleanupSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl SweepConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: SweepConfig = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate().map_err(|err| anyhow!(err))?;
        if self.cleanup.max_attempts == 0 {
            return Err(anyhow!("cleanup.max_attempts must be greater than zero"));
        }
        Ok(())
    }
}
