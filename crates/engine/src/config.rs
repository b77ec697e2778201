//! Engine configuration via `livedoc.toml`
//!
//! A missing file means defaults. To change settings, edit the file and
//! restart the service.

use livedoc_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed next to the service's data.
pub const CONFIG_FILE_NAME: &str = "livedoc.toml";

/// Engine configuration loaded from `livedoc.toml`.
///
/// # Example
///
/// ```toml
/// # Notification worker threads; 0 delivers on the writing thread
/// dispatch_workers = 2
/// dispatch_idle_timeout_ms = 5000
/// provenance = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Long-lived worker threads delivering invalidations. `0` delivers inline.
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    /// Milliseconds an extra worker, started while every worker was busy,
    /// waits for more work before exiting.
    #[serde(default = "default_dispatch_idle_timeout_ms")]
    pub dispatch_idle_timeout_ms: u64,
    /// Annotate writes with per-field `_meta` provenance.
    #[serde(default = "default_provenance")]
    pub provenance: bool,
}

fn default_dispatch_workers() -> usize {
    2
}

fn default_dispatch_idle_timeout_ms() -> u64 {
    5000
}

fn default_provenance() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: default_dispatch_workers(),
            dispatch_idle_timeout_ms: default_dispatch_idle_timeout_ms(),
            provenance: default_provenance(),
        }
    }
}

impl EngineConfig {
    /// Configuration delivering every invalidation on the writing thread.
    pub fn inline() -> Self {
        Self {
            dispatch_workers: 0,
            ..Self::default()
        }
    }

    /// Idle lifetime of extra dispatch workers.
    pub fn dispatch_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_idle_timeout_ms)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# livedoc engine configuration
#
# Worker threads delivering invalidations to observers (default: 2).
# 0 delivers on the writing thread; observers are still isolated.
dispatch_workers = 2

# When every worker is busy, for example inside an observer that blocks,
# an extra worker is started for the next delivery. Extra workers exit
# after this many idle milliseconds (default: 5000).
dispatch_idle_timeout_ms = 5000

# Record which client last touched each top-level field in `_meta`.
provenance = true
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
