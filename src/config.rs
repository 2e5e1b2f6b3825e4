//! Dataset and variable options, and the optional host configuration file
//!
//! Host-level defaults (memory caps) can be set in a `cfarray.toml` found in
//! the working directory or its parent; explicit [DatasetOptions] always win
//! over the file.

use std::{env, fs::read_to_string, path::PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    file_manager,
    format::OpenOptions,
    types::AttrValue,
};

/// Options recognized when opening or creating a dataset
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct DatasetOptions {
    /// Global cap on in-memory open-file bytes
    pub memory_limit: Option<usize>,
    /// Keep files in memory without backing objects
    pub diskless: bool,
    /// Persist diskless files on close after all
    pub persist: bool,
    /// Replace an existing master on create
    pub clobber: bool,
    /// Let the provider hold weak references to cached handles
    pub keep_weak_ref: bool,
}

impl DatasetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the in-memory byte cap.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Keeps files in memory without backing objects.
    pub fn with_diskless(mut self, diskless: bool) -> Self {
        self.diskless = diskless;
        self
    }

    /// Persists diskless files on close.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Replaces an existing master on create.
    pub fn with_clobber(mut self, clobber: bool) -> Self {
        self.clobber = clobber;
        self
    }

    pub fn with_keep_weak_ref(mut self, keep: bool) -> Self {
        self.keep_weak_ref = keep;
        self
    }

    /// The subset passed through to the structured-file provider.
    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            diskless: self.diskless,
            persist: self.persist,
            clobber: self.clobber,
            keep_weak_ref: self.keep_weak_ref,
        }
    }

    /// The effective memory cap: explicit option, then the host config,
    /// then a fraction of physical memory.
    pub fn effective_memory_limit(&self, host: &HostConfig) -> usize {
        self.memory_limit
            .or_else(|| host.resolved_memory_limit())
            .unwrap_or_else(file_manager::default_memory_limit)
    }
}

/// Options recognized when creating a variable
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct VariableSpec {
    /// Explicit tile shape; honored exactly
    pub subarray_shape: Option<Vec<usize>>,
    /// Upper bound on per-subarray bytes; 0 disables partitioning
    pub max_subarray_size: u64,
    /// Fill value for never-written regions
    pub fill_value: Option<AttrValue>,
}

impl VariableSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an explicit tile shape.
    pub fn with_subarray_shape(mut self, shape: Vec<usize>) -> Self {
        self.subarray_shape = Some(shape);
        self
    }

    /// Sets a byte bound on each subarray.
    pub fn with_max_subarray_size(mut self, bytes: u64) -> Self {
        self.max_subarray_size = bytes;
        self
    }

    /// Sets the fill value.
    pub fn with_fill_value(mut self, fill: impl Into<AttrValue>) -> Self {
        self.fill_value = Some(fill.into());
        self
    }

    /// A variable is partitioned iff a tile shape or byte bound was given.
    pub fn is_partitioned(&self) -> bool {
        self.subarray_shape.is_some() || self.max_subarray_size > 0
    }
}

/// Deserialized contents of a `cfarray.toml` host configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct HostConfig {
    /// Absolute cap on in-memory open-file bytes
    #[serde(default)]
    pub memory_limit: Option<u64>,
    /// Cap as a fraction of physical memory, used when no absolute cap is set
    #[serde(default)]
    pub memory_fraction: Option<f64>,
}

impl HostConfig {
    /// Gets the path of the configuration file.
    pub fn config_path() -> Result<PathBuf> {
        let cwd = env::current_dir().map_err(|e| Error::transport("cwd", e))?;
        let local = cwd.join("cfarray.toml");
        if local.exists() {
            return Ok(local);
        }
        if let Some(parent) = cwd.parent() {
            let workspace = parent.join("cfarray.toml");
            if workspace.exists() {
                return Ok(workspace);
            }
        }
        Ok(local)
    }

    /// Load the host configuration, defaulting when no file exists.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let config = if let Ok(data) = read_to_string(&path) {
            toml::from_str(&data)
                .map_err(|e| Error::corrupt(path.display().to_string(), e.to_string()))?
        } else {
            Self::default()
        };
        debug!("host config: {:?}", config);
        Ok(config)
    }

    /// The configured cap, resolving a fraction against physical memory.
    pub fn resolved_memory_limit(&self) -> Option<usize> {
        if let Some(limit) = self.memory_limit {
            return Some(limit as usize);
        }
        self.memory_fraction.map(|fraction| {
            let base = file_manager::default_memory_limit() * 8;
            (base as f64 * fraction.clamp(0.0, 1.0)) as usize
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn variable_spec_decides_partitioning() {
        assert!(!VariableSpec::new().is_partitioned());
        assert!(VariableSpec::new()
            .with_subarray_shape(vec![2, 2])
            .is_partitioned());
        assert!(VariableSpec::new()
            .with_max_subarray_size(1 << 20)
            .is_partitioned());
    }

    #[test]
    fn explicit_memory_limit_wins() {
        let host = HostConfig {
            memory_limit: Some(123),
            memory_fraction: None,
        };
        let opts = DatasetOptions::new().with_memory_limit(42);
        assert_eq!(opts.effective_memory_limit(&host), 42);
        assert_eq!(DatasetOptions::new().effective_memory_limit(&host), 123);
    }

    #[test]
    fn host_config_parses_toml() {
        let config: HostConfig = toml::from_str("memory_limit = 4096\n").unwrap();
        assert_eq!(config.memory_limit, Some(4096));
        assert_eq!(config.resolved_memory_limit(), Some(4096));

        let config: HostConfig = toml::from_str("memory_fraction = 0.25\n").unwrap();
        assert!(config.resolved_memory_limit().is_some());
    }
}
