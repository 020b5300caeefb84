use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::mirror::ExtensionSet;

/// Upper bound for the automatic worker count
pub const MAX_AUTO_WORKERS: usize = 16;

const DEFAULT_FILE_TYPES: &str = "mp3,vtx,bsp,nav,mdl,phy,vmt,vtf,dx80.vtx,dx90.vtx,sw.vtx,wav";

/// One game server whose content is mirrored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ServerEntry {
    pub name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppConfig {
    /// Seconds between cycles in continuous mode
    pub check_interval: u64,

    /// Comma-separated extension list
    pub file_types: String,

    /// Processed-file list location
    pub processed_files_path: PathBuf,

    /// Keep running on an interval instead of exiting after one cycle
    #[serde(rename = "Run24x7")]
    pub run_24x7: bool,

    pub debug_logs: bool,

    /// Servers, processed in this order
    pub servers: Vec<ServerEntry>,

    /// Files compressed per batch
    pub batch_size: usize,

    /// Save the processed list after this many batches
    pub checkpoint_every_batches: usize,

    /// Maximum number of workers (0 = auto based on CPU)
    pub max_workers: usize,

    /// Kill an external compressor after this many seconds
    pub compression_timeout_secs: u64,

    /// Size sampling window used to detect files still being written
    pub growth_sample_millis: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            check_interval: 120,
            file_types: DEFAULT_FILE_TYPES.to_string(),
            processed_files_path: PathBuf::from("processed_files.txt"),
            run_24x7: true,
            debug_logs: false,
            servers: Vec::new(),
            batch_size: 20,
            checkpoint_every_batches: 5,
            max_workers: 0, // Auto-detect
            compression_timeout_secs: 300,
            growth_sample_millis: 500,
        }
    }
}

impl AppConfig {
    /// Load config from the JSON file, then apply environment overrides.
    ///
    /// Never fails: a missing file is created with defaults and a malformed
    /// one is replaced by defaults in memory.
    pub fn load(path: &Path) -> Self {
        let mut config = Self::load_file(path);
        config.apply_overrides(|key| std::env::var(key).ok());
        config.sanitize();
        config
    }

    fn load_file(path: &Path) -> Self {
        if !path.exists() {
            warn!("Config file not found: {}", path.display());
            info!("Creating default config at {}", path.display());
            let config = Self::default();
            if let Err(e) = config.save(path) {
                warn!("{:#}", e);
            }
            return config;
        }

        match Self::read(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{:#}; using defaults", e);
                Self::default()
            }
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Override fields from `FASTDL_*` variables supplied by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "FASTDL_CHECK_INTERVAL", &mut self.check_interval);
        override_from(&lookup, "FASTDL_MAX_WORKERS", &mut self.max_workers);
        override_from(&lookup, "FASTDL_BATCH_SIZE", &mut self.batch_size);
        override_from(&lookup, "FASTDL_DEBUG", &mut self.debug_logs);

        if let Some(path) = lookup("FASTDL_PROCESSED_FILES") {
            self.processed_files_path = PathBuf::from(path);
        }
        if let Some(types) = lookup("FASTDL_FILE_TYPES") {
            self.file_types = types;
        }
    }

    /// Replace values that would stall the loop or the batch planner.
    fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.check_interval == 0 {
            warn!("CheckInterval must be positive, using {}", defaults.check_interval);
            self.check_interval = defaults.check_interval;
        }
        if self.batch_size == 0 {
            warn!("BatchSize must be positive, using {}", defaults.batch_size);
            self.batch_size = defaults.batch_size;
        }
        if self.checkpoint_every_batches == 0 {
            self.checkpoint_every_batches = defaults.checkpoint_every_batches;
        }
        if self.compression_timeout_secs == 0 {
            self.compression_timeout_secs = defaults.compression_timeout_secs;
        }
    }

    pub fn extensions(&self) -> ExtensionSet {
        ExtensionSet::parse(&self.file_types)
    }

    pub fn worker_count(&self) -> usize {
        if self.max_workers == 0 {
            num_cpus::get().clamp(1, MAX_AUTO_WORKERS)
        } else {
            self.max_workers
        }
    }
}

fn override_from<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring {}={:?}: not a valid value", key, raw),
        }
    }
}
