//! Configuration resolution for loom-ai
//!
//! Provider API key resolves with environment → TOML priority.

use loom_common::config::TomlConfig;
use tracing::{info, warn};

/// Environment variable holding the model provider API key
pub const PROVIDER_API_KEY_ENV: &str = "LOOM_PROVIDER_API_KEY";

/// Module name used for config file and root folder resolution
pub const MODULE_NAME: &str = "loom-ai";

/// Resolve the provider API key, or None when no source has a usable key
pub fn resolve_provider_api_key(toml_config: &TomlConfig) -> Option<String> {
    let env_key = std::env::var(PROVIDER_API_KEY_ENV)
        .ok()
        .filter(|k| is_valid_key(k));
    let toml_key = toml_config
        .provider
        .api_key
        .clone()
        .filter(|k| is_valid_key(k));

    if env_key.is_some() && toml_key.is_some() {
        warn!("Provider API key found in both environment and TOML. Using environment (highest priority).");
    }

    if let Some(key) = env_key {
        info!("Provider API key loaded from environment variable");
        return Some(key);
    }
    if let Some(key) = toml_key {
        info!("Provider API key loaded from TOML config");
        return Some(key);
    }

    warn!(
        "Provider API key not configured; generation requests will fail until one is set via {} \
         or [provider] api_key in the TOML config",
        PROVIDER_API_KEY_ENV
    );
    None
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}
