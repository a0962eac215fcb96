//! Global configuration types for Flowline.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! continuation pacing, store retry limits, the AI-step handler endpoint
//! and the internal HTTP surface.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Flowline engine.
///
/// Loaded from `~/.flowline/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Delay before each scheduled continuation runs, in milliseconds.
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,

    /// How many times an optimistic context update is re-applied after a
    /// version conflict before giving up.
    #[serde(default = "default_max_store_retries")]
    pub max_store_retries: u32,

    /// How many times the continuation worker delivers one continuation
    /// before dropping it.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    /// Base backoff between redeliveries, doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub ai_handler: AiHandlerConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

fn default_pacing_delay_ms() -> u64 {
    1_000
}

fn default_max_store_retries() -> u32 {
    5
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pacing_delay_ms: default_pacing_delay_ms(),
            max_store_retries: default_max_store_retries(),
            max_delivery_attempts: default_max_delivery_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            ai_handler: AiHandlerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Where AI steps are delegated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiHandlerConfig {
    /// Endpoint of the node-type handler service. When unset, AI steps fail
    /// with a handler error and traversal continues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,

    /// Name of the environment variable holding the handler API key.
    #[serde(default = "default_ai_api_key_env")]
    pub api_key_env: String,
}

fn default_ai_timeout_secs() -> u64 {
    60
}

fn default_ai_api_key_env() -> String {
    "FLOWLINE_AI_HANDLER_KEY".to_string()
}

impl Default for AiHandlerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_ai_timeout_secs(),
            api_key_env: default_ai_api_key_env(),
        }
    }
}

/// Bind address of the internal trigger surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.pacing_delay_ms, 1_000);
        assert_eq!(config.max_store_retries, 5);
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.retry_backoff_ms, 500);
        assert!(config.ai_handler.endpoint.is_none());
        assert_eq!(config.ai_handler.timeout_secs, 60);
        assert_eq!(config.server.port, 8420);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
pacing_delay_ms = 250
max_store_retries = 3

[ai_handler]
endpoint = "http://localhost:9000/invoke"
timeout_secs = 30
api_key_env = "HANDLER_KEY"

[server]
host = "0.0.0.0"
port = 9100
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pacing_delay_ms, 250);
        assert_eq!(config.max_store_retries, 3);
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(
            config.ai_handler.endpoint.as_deref(),
            Some("http://localhost:9000/invoke")
        );
        assert_eq!(config.ai_handler.timeout_secs, 30);
        assert_eq!(config.ai_handler.api_key_env, "HANDLER_KEY");
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9100);
    }
}
