//! Persistent monitor configuration
//!
//! Stores the source kind, acquisition settings, and pipeline options in a
//! JSON file at `<data_dir>/cdms-monitor/config.json`.

use cdms_core::{PipelineOptions, SourceConfig, SourceKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent monitor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Source started by default
    #[serde(default)]
    pub source: SourceKind,
    /// Acquisition settings
    #[serde(default)]
    pub acquisition: SourceConfig,
    /// Queueing, timing, and analyzer options
    #[serde(default)]
    pub pipeline: PipelineOptions,
}

impl MonitorConfig {
    /// Config file path: `<data_dir>/cdms-monitor/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cdms-monitor")
            .join("config.json")
    }

    /// Load from the default path, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save to `path`, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }
}
