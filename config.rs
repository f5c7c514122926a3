//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating vaultfs
//! settings from JSON files and environment variables.
//!
//! ## Environment Variables
//!
//! - `VAULTFS_DRIVE_DIR`: Override drive directory path
//! - `VAULTFS_SEQUENCER`: Override sequence file path
//! - `VAULTFS_THREADS`: Override worker thread count
//! - `VAULTFS_CONFIG`: Override config file path

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::cache::{CacheOptions, DEFAULT_BACK_OFFSET, DEFAULT_CACHE_BUFFERS, DEFAULT_CACHE_BUFFER_SIZE};
use crate::cipher::ProviderType;
use crate::drive::DriveOptions;
use crate::integrity::{validate_chunk_size, DEFAULT_CHUNK_SIZE};
use crate::key_manager::DEFAULT_ITERATIONS;

/// Environment variable names for configuration overrides
pub const ENV_DRIVE_DIR: &str = "VAULTFS_DRIVE_DIR";
pub const ENV_SEQUENCER: &str = "VAULTFS_SEQUENCER";
pub const ENV_THREADS: &str = "VAULTFS_THREADS";
pub const ENV_CONFIG_PATH: &str = "VAULTFS_CONFIG";

/// Iteration counts below this draw a warning
const LOW_ITERATIONS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub drive_dir: String,
    pub sequencer_path: String,
    pub threads: usize,
    pub chunk_size: u32,
    pub integrity: bool,
    pub iterations: u32,
    pub provider: ProviderType,
    pub cache_buffers: usize,
    pub cache_buffer_size: usize,
    pub back_offset: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drive_dir: "./vault".to_string(),
            sequencer_path: "./vaultfs.seq".to_string(),
            threads: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            integrity: true,
            iterations: DEFAULT_ITERATIONS,
            provider: ProviderType::default(),
            cache_buffers: DEFAULT_CACHE_BUFFERS,
            cache_buffer_size: DEFAULT_CACHE_BUFFER_SIZE,
            back_offset: DEFAULT_BACK_OFFSET,
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to config
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(drive_dir) = env::var(ENV_DRIVE_DIR) {
            debug!(drive_dir = %drive_dir, "overriding drive_dir from environment");
            self.drive_dir = drive_dir;
        }

        if let Ok(sequencer_path) = env::var(ENV_SEQUENCER) {
            debug!(sequencer_path = %sequencer_path, "overriding sequencer_path from environment");
            self.sequencer_path = sequencer_path;
        }

        if let Ok(threads) = env::var(ENV_THREADS) {
            self.threads = threads
                .trim()
                .parse()
                .with_context(|| format!("{ENV_THREADS} must be a number, got {threads:?}"))?;
            debug!(threads = self.threads, "overriding threads from environment");
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.drive_dir.trim().is_empty() {
            anyhow::bail!("drive_dir cannot be empty");
        }

        if self.sequencer_path.trim().is_empty() {
            anyhow::bail!("sequencer_path cannot be empty");
        }

        if self.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }

        if self.iterations == 0 {
            anyhow::bail!("iterations must be at least 1");
        }

        validate_chunk_size(self.chunk_size).context("invalid chunk_size")?;

        if self.cache_buffers == 0 || self.cache_buffer_size == 0 {
            anyhow::bail!("cache needs at least one non-empty buffer");
        }

        if self.iterations < LOW_ITERATIONS {
            warn!(
                iterations = self.iterations,
                "low PBKDF2 iteration count makes the password easier to brute force"
            );
        }

        // The sequence file must not travel with the drive: a copied drive
        // would carry the same nonce state to a second device.
        let drive = Path::new(&self.drive_dir);
        if Path::new(&self.sequencer_path).starts_with(drive) {
            warn!(
                path = %self.sequencer_path,
                "sequence file is stored inside the drive directory"
            );
        }

        if self.integrity && self.chunk_size == 0 {
            debug!("integrity enabled with chunk size 0, the default chunk size applies");
        }

        Ok(())
    }

    /// Create a new config with explicit paths and default settings
    pub fn new(drive_dir: impl Into<String>, sequencer_path: impl Into<String>) -> Self {
        Self {
            drive_dir: drive_dir.into(),
            sequencer_path: sequencer_path.into(),
            ..Self::default()
        }
    }

    pub fn drive_options(&self) -> DriveOptions {
        DriveOptions {
            iterations: self.iterations,
            provider: self.provider,
            integrity: self.integrity,
            chunk_size: self.chunk_size,
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            buffers: self.cache_buffers,
            buffer_size: self.cache_buffer_size,
            back_offset: self.back_offset,
        }
    }
}
