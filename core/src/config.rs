//! Process-level configuration, assembled from the environment at startup.
//! Invalid configuration is a startup failure (non-zero exit), never a
//! runtime surprise.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use relay_protocol::ModelInfo;
use serde::Deserialize;
use thiserror::Error;

use crate::model_provider_info::ModelProviderInfo;
use crate::model_provider_info::built_in_model_providers;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("`{0}` is required")]
    MissingVar(&'static str),

    #[error("`{var}` is invalid: {reason}")]
    BadVar { var: &'static str, reason: String },
}

/// One exposed model: the id clients send, the display name, and which
/// provider serves it.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub model_id: String,
    pub model_name: String,
    pub provider: String,
}

impl ModelEntry {
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            model_id: self.model_id.clone(),
            model_name: self.model_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,

    /// Raw configured credential; a literal token or an `arn:` reference.
    pub api_key: String,

    /// Explicit CORS allow-list. Empty denies all cross-origin requests;
    /// wildcard entries are rejected at startup.
    pub allowed_origins: Vec<String>,

    /// Request body ceiling in bytes. Inline images push this well past
    /// typical JSON sizes.
    pub body_limit: usize,

    pub idle_horizon: Duration,

    /// Root under which per-user MCP scratch directories are created.
    pub scratch_root: PathBuf,

    /// SQLite file backing the user-config store.
    pub store_path: PathBuf,

    pub models: Vec<ModelEntry>,
    pub providers: HashMap<String, ModelProviderInfo>,

    pub use_https: bool,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,

    pub log_dir: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key =
            std::env::var("API_KEY").map_err(|_| ConfigError::MissingVar("API_KEY"))?;

        let host =
            std::env::var("MCP_SERVICE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = match std::env::var("MCP_SERVICE_PORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|e| ConfigError::BadVar {
                var: "MCP_SERVICE_PORT",
                reason: e.to_string(),
            })?,
            Err(_) => 8765,
        };

        let allowed_origins: Vec<String> = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if allowed_origins.iter().any(|origin| origin == "*") {
            return Err(ConfigError::BadVar {
                var: "ALLOWED_ORIGINS",
                reason: "wildcard origins are not accepted".to_string(),
            });
        }

        let body_limit = match std::env::var("MAX_BODY_BYTES") {
            Ok(raw) => raw.parse::<usize>().map_err(|e| ConfigError::BadVar {
                var: "MAX_BODY_BYTES",
                reason: e.to_string(),
            })?,
            Err(_) => 32 * 1024 * 1024,
        };

        let data_dir = std::env::var("RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("relay"));

        let use_https = matches!(
            std::env::var("USE_HTTPS").as_deref(),
            Ok("1") | Ok("true") | Ok("TRUE")
        );
        let tls_cert_path = std::env::var("TLS_CERT_PATH").ok().map(PathBuf::from);
        let tls_key_path = std::env::var("TLS_KEY_PATH").ok().map(PathBuf::from);
        if use_https && (tls_cert_path.is_none() || tls_key_path.is_none()) {
            return Err(ConfigError::BadVar {
                var: "USE_HTTPS",
                reason: "TLS_CERT_PATH and TLS_KEY_PATH are required".to_string(),
            });
        }

        let models = match std::env::var("MODELS") {
            Ok(raw) => serde_json::from_str::<Vec<ModelEntry>>(&raw).map_err(|e| {
                ConfigError::BadVar {
                    var: "MODELS",
                    reason: e.to_string(),
                }
            })?,
            Err(_) => default_models(),
        };

        Ok(Self {
            host,
            port,
            api_key,
            allowed_origins,
            body_limit,
            idle_horizon: *crate::flags::RELAY_SESSION_IDLE_TIMEOUT_MS,
            scratch_root: data_dir.join("scratch"),
            store_path: data_dir.join("servers.sqlite"),
            models,
            providers: built_in_model_providers(),
            use_https,
            tls_cert_path,
            tls_key_path,
            log_dir: std::env::var("LOG_DIR").ok().map(PathBuf::from),
        })
    }

    pub fn model(&self, model_id: &str) -> Option<(&ModelEntry, &ModelProviderInfo)> {
        let entry = self.models.iter().find(|m| m.model_id == model_id)?;
        let provider = self.providers.get(&entry.provider)?;
        Some((entry, provider))
    }
}

fn default_models() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            model_id: "claude-sonnet-4-20250514".to_string(),
            model_name: "Claude Sonnet 4".to_string(),
            provider: "anthropic".to_string(),
        },
        ModelEntry {
            model_id: "gpt-4.1".to_string(),
            model_name: "GPT-4.1".to_string(),
            provider: "openai".to_string(),
        },
        ModelEntry {
            model_id: "deepseek-chat".to_string(),
            model_name: "DeepSeek V3".to_string(),
            provider: "deepseek".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn model_lookup_joins_entry_and_provider() {
        let config = GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 8765,
            api_key: "k".to_string(),
            allowed_origins: vec![],
            body_limit: 1024,
            idle_horizon: Duration::from_secs(60),
            scratch_root: PathBuf::from("/tmp/relay/scratch"),
            store_path: PathBuf::from("/tmp/relay/servers.sqlite"),
            models: default_models(),
            providers: built_in_model_providers(),
            use_https: false,
            tls_cert_path: None,
            tls_key_path: None,
            log_dir: None,
        };

        let (entry, provider) = config.model("gpt-4.1").expect("known model");
        assert_eq!(entry.provider, "openai");
        assert_eq!(provider.name, "OpenAI");
        assert!(config.model("nope").is_none());
    }
}
