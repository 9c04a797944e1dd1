//! Configuration handling for the stream management service.
//!
//! Settings come from the shared YAML config file, then environment
//! variables, then command line flags (applied in `main`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sm_session::SmConfig;
use sm_storage::StorageMode;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Stream management service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Account identity that owns the stream
    pub owner: String,
    /// Unacked units before an ack request is sent
    pub window_size: u32,
    /// Request resumable sessions
    pub allow_resume: bool,
    /// Snapshot file; in-memory storage when absent
    pub state_path: Option<PathBuf>,
    /// Fsync snapshot writes
    pub fsync: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            owner: "user@localhost/sm".to_string(),
            window_size: 1,
            allow_resume: true,
            state_path: None,
            fsync: true,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    sm: Option<ServiceSection>,
}

#[derive(Debug, Deserialize)]
struct ServiceSection {
    config: Option<HashMap<String, String>>,
}

impl ServiceConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides(|key| std::env::var(key).ok());

        info!(
            "Final stream management configuration: owner={}, window_size={}, allow_resume={}, state={:?}",
            config.owner, config.window_size, config.allow_resume, config.state_path
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        let Some(values) = root_config
            .services
            .and_then(|services| services.sm)
            .and_then(|section| section.config)
        else {
            return;
        };

        for (key, value) in values {
            match key.as_str() {
                "services.sm.owner" => self.owner = value,
                "services.sm.window_size" => match value.parse::<u32>() {
                    Ok(size) if size > 0 => self.window_size = size,
                    _ => warn!("Ignoring invalid window size {:?}", value),
                },
                "services.sm.allow_resume" => {
                    self.allow_resume = value.to_lowercase() == "true";
                }
                "services.sm.state_path" => {
                    self.state_path = (!value.is_empty()).then(|| PathBuf::from(value));
                }
                "services.sm.fsync" => {
                    self.fsync = value.to_lowercase() == "true";
                }
                _ => {
                    // Ignore unknown configuration keys
                }
            }
        }
    }

    /// Apply environment variable overrides, reading variables through `var`
    fn apply_environment_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(owner) = var("SM_OWNER") {
            self.owner = owner;
            info!("Owner overridden by environment: {}", self.owner);
        }

        if let Some(window) = var("SM_WINDOW_SIZE") {
            match window.parse::<u32>() {
                Ok(size) if size > 0 => {
                    self.window_size = size;
                    info!("Window size overridden by environment: {}", size);
                }
                _ => warn!("Ignoring invalid SM_WINDOW_SIZE {:?}", window),
            }
        }

        if let Some(allow) = var("SM_ALLOW_RESUME") {
            self.allow_resume = allow.to_lowercase() == "true";
            info!("Resume overridden by environment: {}", self.allow_resume);
        }

        if let Some(path) = var("SM_STATE_PATH") {
            self.state_path = Some(PathBuf::from(path));
            info!("State path overridden by environment: {:?}", self.state_path);
        }
    }

    /// Session configuration
    pub fn sm_config(&self) -> SmConfig {
        SmConfig {
            owner: self.owner.clone(),
            window_size: self.window_size,
            allow_resume: self.allow_resume,
            ..SmConfig::default()
        }
    }

    /// Snapshot backend
    pub fn storage_mode(&self) -> StorageMode {
        match &self.state_path {
            Some(path) => StorageMode::File {
                path: path.clone(),
                fsync: self.fsync,
            },
            None => StorageMode::InMemory,
        }
    }
}
