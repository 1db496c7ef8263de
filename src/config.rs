//! Engine configuration
//!
//! Settings cover the fixed shared-state dimensions: worker count, page
//! pool size, tree depth bound, and the split fillfactor. They can be
//! loaded from a TOML file with an `ARBORDB_`-prefixed environment
//! overlay, or built directly for tests.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::path::Path;

use crate::btree::page_state::INVALID_PROCNO;
use crate::error::{Error, Result};

/// Engine settings, fixed at init time
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of worker slots (one semaphore + waiter slot each)
    pub max_workers: usize,

    /// Number of 8 KiB pages in the in-memory pool
    pub pool_pages: usize,

    /// Maximum B+tree depth; bounds the in-progress-split stack
    pub max_tree_depth: usize,

    /// Split fillfactor in percent, used for ordered-insert splits
    pub fillfactor: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: 32,
            pool_pages: 1024,
            max_tree_depth: 32,
            fillfactor: 90,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, then overlay `ARBORDB_*` environment
    /// variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ARBORDB_"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the environment only.
    pub fn from_env() -> Result<Self> {
        let settings: Settings = Figment::new()
            .merge(Env::prefixed("ARBORDB_"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be positive".into()));
        }
        if self.max_workers >= INVALID_PROCNO as usize {
            return Err(Error::Config(format!(
                "max_workers must be below {} to fit the state word",
                INVALID_PROCNO
            )));
        }
        if self.pool_pages == 0 {
            return Err(Error::Config("pool_pages must be positive".into()));
        }
        if self.max_tree_depth == 0 {
            return Err(Error::Config("max_tree_depth must be positive".into()));
        }
        if !(10..=100).contains(&self.fillfactor) {
            return Err(Error::Config("fillfactor must be in 10..=100".into()));
        }
        Ok(())
    }
}
