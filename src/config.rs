//! Store configuration.
//!
//! Settings are layered with figment, later layers winning:
//!
//! 1. Built-in defaults ([`StoreConfig::default`])
//! 2. `config.toml` in the platform config directory, or an explicit file
//! 3. `TAGSTORE_*` environment variables (`__` separates nested keys)
//!
//! # Example
//!
//! ```no_run
//! use tagstore::config::StoreConfig;
//!
//! let config = StoreConfig::load(None).unwrap();
//! println!("thumbnails are {}px", config.thumbnail_size);
//! ```

use anyhow::{Context, Result};
use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::similarity::PerceptualAlgorithm;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TAGSTORE_";

/// Tunables of a library handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bounding box of thumbnails, in pixels.
    pub thumbnail_size: u32,
    /// JPEG quality of thumbnails (1-100).
    pub thumbnail_quality: u8,
    /// JPEG quality of previews (1-100).
    pub preview_quality: u8,
    /// Longest side of previews when none is requested.
    pub default_preview_dim: u32,
    /// Size of the fingerprinting/clustering worker pool.
    pub worker_threads: usize,
    /// Consecutive index failures before a rebuild is offered.
    pub index_failure_threshold: u32,
    /// Rebuild a missing or unreadable index when the library is opened.
    pub auto_rebuild: bool,
    pub default_algorithm: PerceptualAlgorithm,
    /// Clustering threshold; `None` uses the algorithm default.
    pub default_threshold: Option<u32>,
    /// Simplified progress output for screen readers.
    pub accessible_progress: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: 150,
            thumbnail_quality: 85,
            preview_quality: 90,
            default_preview_dim: 1024,
            worker_threads: 4,
            index_failure_threshold: 3,
            auto_rebuild: true,
            default_algorithm: PerceptualAlgorithm::Phash,
            default_threshold: None,
            accessible_progress: false,
        }
    }
}

impl StoreConfig {
    /// Load the layered configuration.
    ///
    /// `explicit` replaces the platform config file when given; it must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let file = match explicit {
            Some(path) => {
                if !path.is_file() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Some(path.to_path_buf())
            }
            None => Self::default_path().filter(|p| p.is_file()),
        };

        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(ref path) = file {
            log::debug!("Loading config from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().context("Invalid configuration")?;
        config.validated()
    }

    /// Clamp out-of-range values, warning about each one.
    pub fn validated(mut self) -> Result<Self> {
        if self.thumbnail_size == 0 {
            anyhow::bail!("thumbnail_size must be greater than zero");
        }
        if self.default_preview_dim == 0 {
            anyhow::bail!("default_preview_dim must be greater than zero");
        }
        for (name, q) in [
            ("thumbnail_quality", &mut self.thumbnail_quality),
            ("preview_quality", &mut self.preview_quality),
        ] {
            if !(1..=100).contains(&*q) {
                let clamped = (*q).clamp(1, 100);
                log::warn!("{} {} out of range, using {}", name, q, clamped);
                *q = clamped;
            }
        }
        if self.worker_threads == 0 {
            log::warn!("worker_threads must be at least 1, using 1");
            self.worker_threads = 1;
        }
        if self.index_failure_threshold == 0 {
            self.index_failure_threshold = 1;
        }
        Ok(self)
    }

    /// Effective clustering threshold.
    #[must_use]
    pub fn threshold_for(&self, algorithm: PerceptualAlgorithm) -> u32 {
        self.default_threshold
            .unwrap_or_else(|| algorithm.default_threshold())
    }

    /// Write this configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Platform-specific default config file path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "tagstore", "tagstore")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
