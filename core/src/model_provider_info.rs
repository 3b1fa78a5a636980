//! Registry of upstream model providers.
//!
//! Providers come in two wire dialects: the block-structured streaming
//! `messages` API and the incremental-delta `chat` completions API. The
//! built-in table covers the providers the gateway ships with; deployments
//! override base URLs and credentials through the environment.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RelayErr;
use crate::error::Result;

/// Which streaming dialect the provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireApi {
    /// Discrete content-block start/delta/stop frames with structured
    /// tool-use blocks.
    Messages,

    /// OpenAI-style chat completions: incremental JSON fragments under
    /// `choices[0].delta`.
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProviderInfo {
    /// Friendly display name.
    pub name: String,
    /// Base URL of the provider API.
    pub base_url: String,
    /// Environment variable holding the credential for this provider.
    pub env_key: String,
    pub wire_api: WireApi,
}

impl ModelProviderInfo {
    /// Returns the provider credential, surfacing a configuration error
    /// naming the missing variable rather than an opaque 401 later.
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.env_key).map_err(|_| RelayErr::MissingProviderKey {
            provider: self.name.clone(),
            var: self.env_key.clone(),
        })
    }
}

/// Built-in default provider table.
pub fn built_in_model_providers() -> HashMap<String, ModelProviderInfo> {
    use ModelProviderInfo as P;

    [
        (
            "anthropic",
            P {
                name: "Anthropic".into(),
                base_url: "https://api.anthropic.com".into(),
                env_key: "ANTHROPIC_API_KEY".into(),
                wire_api: WireApi::Messages,
            },
        ),
        (
            "openai",
            P {
                name: "OpenAI".into(),
                base_url: "https://api.openai.com/v1".into(),
                env_key: "OPENAI_API_KEY".into(),
                wire_api: WireApi::Chat,
            },
        ),
        (
            "openrouter",
            P {
                name: "OpenRouter".into(),
                base_url: "https://openrouter.ai/api/v1".into(),
                env_key: "OPENROUTER_API_KEY".into(),
                wire_api: WireApi::Chat,
            },
        ),
        (
            "deepseek",
            P {
                name: "DeepSeek".into(),
                base_url: "https://api.deepseek.com".into(),
                env_key: "DEEPSEEK_API_KEY".into(),
                wire_api: WireApi::Chat,
            },
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
