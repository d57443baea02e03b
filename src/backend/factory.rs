//! Backend factory for creating backend instances from configuration.

use anyhow::{anyhow, Result};
use log::warn;
use std::time::Duration;

use super::{memory::InMemoryBackend, rest::RestBackend, Backend};
use crate::config::RemoteConfig;
use crate::constants::LOG_MEMORY_BACKEND;

/// Create a backend instance from the `[remote]` configuration section.
///
/// # Errors
/// Returns error if:
/// - Backend type is unknown
/// - `base_url` is missing for the REST backend
/// - The API key environment variable is not set
pub fn create_backend(config: &RemoteConfig) -> Result<Box<dyn Backend>> {
    match config.backend_type.as_str() {
        "rest" => {
            let base_url = config
                .base_url
                .as_deref()
                .ok_or_else(|| anyhow!("Missing 'base_url' in [remote] configuration"))?;
            let api_key = std::env::var(&config.api_key_env)
                .map_err(|_| anyhow!("Environment variable {} is not set", config.api_key_env))?;
            let backend = RestBackend::new(base_url, api_key, Duration::from_secs(config.timeout_secs))?
                .with_tables(&config.tasks_table, &config.groups_table);
            Ok(Box::new(backend))
        }
        "memory" => {
            warn!("{LOG_MEMORY_BACKEND}");
            Ok(Box::new(InMemoryBackend::new()))
        }
        _ => Err(anyhow!("Unknown backend type: {}", config.backend_type)),
    }
}
