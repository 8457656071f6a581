use std::path::Path;
use std::time::Duration;

use arbor_document::{BlockSizes, DEFAULT_MAX_BLOCK_SIZE, DEFAULT_MIN_BLOCK_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Repository-wide settings.
///
/// Every field has a default, so a TOML file only needs the values it
/// overrides:
///
/// ```toml
/// name = "content"
///
/// [children]
/// max_block_size = 500
/// min_block_size = 100
///
/// [locking]
/// max_attempts = 20
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Source name; its hash prefixes every node key.
    pub name: String,
    pub default_workspace: String,
    pub children: ChildrenBlockConfig,
    pub locking: LockConfig,
    /// Buffer size of each change-set subscription.
    pub event_channel_capacity: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: "arbor".into(),
            default_workspace: "default".into(),
            children: ChildrenBlockConfig::default(),
            locking: LockConfig::default(),
            event_channel_capacity: 1024,
        }
    }
}

impl RepositoryConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> CacheResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| CacheError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> CacheResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CacheError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> CacheResult<String> {
        toml::to_string_pretty(self).map_err(|e| CacheError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.name.is_empty() {
            return Err(CacheError::InvalidConfig("name must not be empty".into()));
        }
        if self.default_workspace.is_empty() {
            return Err(CacheError::InvalidConfig(
                "default_workspace must not be empty".into(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "event_channel_capacity must be positive".into(),
            ));
        }
        self.children.block_sizes()?;
        self.locking.validate()
    }
}

/// Child-list block limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildrenBlockConfig {
    pub max_block_size: usize,
    pub min_block_size: usize,
    /// Run an optimization pass during save when a block crosses a limit.
    pub optimize_on_save: bool,
}

impl Default for ChildrenBlockConfig {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
            optimize_on_save: true,
        }
    }
}

impl ChildrenBlockConfig {
    pub fn block_sizes(&self) -> CacheResult<BlockSizes> {
        BlockSizes::new(self.max_block_size, self.min_block_size)
            .map_err(|e| CacheError::InvalidConfig(e.to_string()))
    }
}

/// Retry budget for acquiring a save's batch lock.
///
/// Attempt `n` (1-based) that fails waits `min(base_delay * n, max_delay)`
/// plus up to `base_delay` of random jitter before the next attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 10,
            max_delay_ms: 500,
        }
    }
}

impl LockConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> CacheResult<()> {
        if self.max_attempts == 0 {
            return Err(CacheError::InvalidConfig(
                "locking.max_attempts must be positive".into(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(CacheError::InvalidConfig(
                "locking.max_delay_ms must be at least base_delay_ms".into(),
            ));
        }
        Ok(())
    }
}
