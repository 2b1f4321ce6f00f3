//! Bootstrap configuration.
//!
//! A TOML file lists the mounts to perform at startup plus a few host
//! settings:
//!
//! ```toml
//! log_filter = "strata_kernel=debug"
//!
//! [[mounts]]
//! paths = ["/photos"]
//! read_only = true
//! storage_params = { type = "local", path = "/srv/photos", cache_ttl_ms = 2000 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::control::MountRequest;

fn default_control_capacity() -> usize {
    32
}

/// Host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Mounts performed before the control channel opens.
    #[serde(default)]
    pub mounts: Vec<MountRequest>,

    /// Queue depth of the control channel.
    #[serde(default = "default_control_capacity")]
    pub control_capacity: usize,

    /// `tracing` filter directive, used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_filter: Option<String>,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            mounts: Vec::new(),
            control_capacity: default_control_capacity(),
            log_filter: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StrataConfig {
    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Load from a file. A missing file yields the default (empty) config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, starting empty");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validate the correctness of the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut main_paths = HashSet::new();

        if self.control_capacity == 0 {
            errors.push("control_capacity must be at least 1.".to_string());
        }

        for (i, mount) in self.mounts.iter().enumerate() {
            let Some(main) = mount.paths.first() else {
                errors.push(format!("mounts[{i}] has no paths."));
                continue;
            };
            for path in &mount.paths {
                if !path.starts_with('/') {
                    errors.push(format!("mounts[{i}] path '{path}' is not absolute."));
                }
            }
            if !main_paths.insert(main.trim_end_matches('/')) && !mount.remount {
                errors.push(format!(
                    "mounts[{i}] main path '{main}' is mounted twice without remount."
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
