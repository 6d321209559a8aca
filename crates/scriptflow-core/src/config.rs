//! Engine configuration loading.
//!
//! Reads `EngineConfig` from a TOML file. A missing or unreadable file is not
//! an error for `load_engine_config`: the engine falls back to defaults and
//! says so in the trace.

use std::path::Path;

use scriptflow_types::config::EngineConfig;

/// Errors from strict configuration parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid engine config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Parse an engine configuration from TOML text.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, ConfigError> {
    Ok(toml::from_str::<EngineConfig>(content)?)
}

/// Read and parse an engine configuration, surfacing every failure.
pub async fn try_load_engine_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    parse_engine_config(&content)
}

/// Load the engine configuration from `path`, falling back to defaults when
/// the file is missing or malformed.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    match try_load_engine_config(path).await {
        Ok(config) => config,
        Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No engine config found at {}, using defaults", path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    }
}
