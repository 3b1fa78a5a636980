//! Resolution of the gateway's own API credential.
//!
//! The configured value is either a literal token or a reference into an
//! external secret store (an `arn:`-prefixed string). References are
//! resolved at most once per process; the `OnceCell` gives single-flight
//! semantics for free and a failed resolution is never cached, so the next
//! caller retries.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

/// Prefix marking a secret-store reference rather than a literal credential.
pub const SECRET_REFERENCE_PREFIX: &str = "arn:";

#[derive(Error, Debug, Clone)]
pub enum SecretError {
    #[error("secret resolution failed: {0}")]
    Resolution(String),

    #[error("no API key configured")]
    Missing,
}

/// Seam to whatever secret store the deployment uses. The gateway core only
/// needs "turn this reference into a string, once".
#[async_trait]
pub trait SecretFetcher: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<String, SecretError>;
}

/// Fetcher for deployments where an init process has already materialized
/// the secret into the environment under a companion variable.
pub struct EnvSecretFetcher {
    pub var: String,
}

impl Default for EnvSecretFetcher {
    fn default() -> Self {
        Self {
            var: "RESOLVED_API_KEY".to_string(),
        }
    }
}

#[async_trait]
impl SecretFetcher for EnvSecretFetcher {
    async fn fetch(&self, reference: &str) -> Result<String, SecretError> {
        std::env::var(&self.var).map_err(|_| {
            SecretError::Resolution(format!(
                "reference `{reference}` requires `{}` to be set",
                self.var
            ))
        })
    }
}

pub struct ApiKeyResolver {
    configured: String,
    fetcher: Arc<dyn SecretFetcher>,
    cache: OnceCell<String>,
}

impl ApiKeyResolver {
    pub fn new(configured: String, fetcher: Arc<dyn SecretFetcher>) -> Self {
        Self {
            configured,
            fetcher,
            cache: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Result<String, SecretError> {
        if self.configured.is_empty() {
            return Err(SecretError::Missing);
        }
        if !self.configured.starts_with(SECRET_REFERENCE_PREFIX) {
            return Ok(self.configured.clone());
        }
        let key = self
            .cache
            .get_or_try_init(|| async {
                info!("resolving API key from secret store reference");
                self.fetcher.fetch(&self.configured).await
            })
            .await?;
        Ok(key.clone())
    }
}
