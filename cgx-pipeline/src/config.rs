//! Configuration resolution for cgx-pipeline
//!
//! Provider credentials resolve ENV → TOML; pipeline defaults come from the
//! `[pipeline]` table and are overridden per request.

use cgx_common::config::TomlConfig;
use cgx_common::{Error, Result};
use tracing::{info, warn};

use crate::models::PipelineOptions;

/// Primary environment variable for the provider API key
pub const API_KEY_ENV: &str = "CGX_OPENAI_API_KEY";

/// Fallback environment variable, shared with other OpenAI tooling
pub const API_KEY_FALLBACK_ENV: &str = "OPENAI_API_KEY";

/// Resolve the provider API key
///
/// **Priority:** `CGX_OPENAI_API_KEY` → `OPENAI_API_KEY` → TOML `[provider] api_key`
pub fn resolve_api_key(toml_config: &TomlConfig) -> Result<String> {
    let candidates = [
        ("environment", read_env(API_KEY_ENV)),
        ("environment (fallback)", read_env(API_KEY_FALLBACK_ENV)),
        ("TOML", toml_config.provider.api_key.clone().filter(|k| is_valid_key(k))),
    ];

    let sources: Vec<&str> = candidates
        .iter()
        .filter(|(_, key)| key.is_some())
        .map(|(source, _)| *source)
        .collect();

    if sources.len() > 1 {
        warn!(
            "Provider API key found in multiple sources: {}. Using {}.",
            sources.join(", "),
            sources[0]
        );
    }

    for (source, key) in candidates {
        if let Some(key) = key {
            info!("Provider API key loaded from {}", source);
            return Ok(key);
        }
    }

    Err(Error::Config(format!(
        "Provider API key not configured. Set {} (or {}), or add api_key under [provider] in the TOML config",
        API_KEY_ENV, API_KEY_FALLBACK_ENV
    )))
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| is_valid_key(k))
}

/// Pipeline defaults from the `[pipeline]` table
///
/// Missing keys take compiled defaults; a missing table yields
/// `PipelineOptions::default()`.
pub fn pipeline_options_from_toml(toml_config: &TomlConfig) -> Result<PipelineOptions> {
    let options = match &toml_config.pipeline {
        Some(table) => table
            .clone()
            .try_into::<PipelineOptions>()
            .map_err(|e| Error::Config(format!("Invalid [pipeline] table: {}", e)))?,
        None => PipelineOptions::default(),
    };

    options.validate().map_err(Error::Config)?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn toml_with(text: &str) -> TomlConfig {
        toml::from_str(text).unwrap()
    }

    fn clear_env() {
        std::env::remove_var(API_KEY_ENV);
        std::env::remove_var(API_KEY_FALLBACK_ENV);
    }

    #[test]
    #[serial]
    fn test_primary_env_wins() {
        clear_env();
        std::env::set_var(API_KEY_ENV, "sk-primary");
        std::env::set_var(API_KEY_FALLBACK_ENV, "sk-fallback");
        let config = toml_with("[provider]\napi_key = \"sk-toml\"\n");

        assert_eq!(resolve_api_key(&config).unwrap(), "sk-primary");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_fallback_env_then_toml() {
        clear_env();
        let config = toml_with("[provider]\napi_key = \"sk-toml\"\n");
        assert_eq!(resolve_api_key(&config).unwrap(), "sk-toml");

        std::env::set_var(API_KEY_FALLBACK_ENV, "sk-fallback");
        assert_eq!(resolve_api_key(&config).unwrap(), "sk-fallback");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_blank_key_is_missing() {
        clear_env();
        std::env::set_var(API_KEY_ENV, "   ");
        let config = toml_with("[provider]\napi_key = \"\"\n");

        assert!(matches!(resolve_api_key(&config), Err(Error::Config(_))));
        clear_env();
    }

    #[test]
    fn test_pipeline_table_overrides_defaults() {
        let config = toml_with("[pipeline]\nmax_parallel_requests = 4\nrandom_seed = 42\n");
        let options = pipeline_options_from_toml(&config).unwrap();

        assert_eq!(options.max_parallel_requests, 4);
        assert_eq!(options.random_seed, Some(42));
        assert_eq!(options.max_chars_per_context, 4000);
    }

    #[test]
    fn test_invalid_pipeline_table_is_config_error() {
        let config = toml_with("[pipeline]\nmax_parallel_requests = 0\n");
        assert!(matches!(pipeline_options_from_toml(&config), Err(Error::Config(_))));

        let missing = toml_with("");
        assert_eq!(pipeline_options_from_toml(&missing).unwrap(), PipelineOptions::default());
    }
}
