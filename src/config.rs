//! Server configuration.
#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{RegistryError, Result};

/// Configuration for the registry server binary.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: String,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Registry id used when bootstrapping a fresh store.
    pub registry_id: String,
    /// Absolute URL prefix emitted in responses.
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "127.0.0.1:8080".to_string(),
            db_path: PathBuf::from("veridex.db"),
            registry_id: "veridex".to_string(),
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<ServerConfig> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::bad_request(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| RegistryError::bad_request(format!("invalid config {}: {e}", path.display())))
    }
}
