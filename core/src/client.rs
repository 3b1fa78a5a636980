use std::time::Duration;

use reqwest::StatusCode;
use tracing::warn;

use crate::chat_completions::stream_chat_completions;
use crate::client_common::ModelStream;
use crate::client_common::Prompt;
use crate::error::RelayErr;
use crate::error::Result;
use crate::flags::RELAY_REQUEST_MAX_RETRIES;
use crate::messages_api::stream_messages;
use crate::model_provider_info::ModelProviderInfo;
use crate::model_provider_info::WireApi;
use crate::util::backoff;

/// Upstream model calls get a generous overall deadline, distinct from (and
/// longer than) the per-tool-call deadline.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ModelClient {
    model: String,
    provider: ModelProviderInfo,
    client: reqwest::Client,
}

impl ModelClient {
    pub fn new(model: impl ToString, provider: ModelProviderInfo) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            model: model.to_string(),
            provider,
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Open one streaming turn against the provider. Transient connect
    /// failures and 429/5xx responses are retried with jittered backoff;
    /// anything else surfaces immediately.
    pub async fn stream(&self, prompt: &Prompt) -> Result<ModelStream> {
        let api_key = self.provider.api_key()?;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let res = match self.provider.wire_api {
                WireApi::Messages => {
                    stream_messages(
                        prompt,
                        &self.model,
                        &self.client,
                        &self.provider.base_url,
                        &api_key,
                    )
                    .await
                }
                WireApi::Chat => {
                    stream_chat_completions(
                        prompt,
                        &self.model,
                        &self.client,
                        &self.provider.base_url,
                        &api_key,
                    )
                    .await
                }
            };

            match res {
                Ok(stream) => return Ok(stream),
                Err(RelayErr::UnexpectedStatus(status, body)) => {
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        return Err(RelayErr::UnexpectedStatus(status, body));
                    }
                    if attempt > *RELAY_REQUEST_MAX_RETRIES {
                        return Err(RelayErr::RetryLimit(status));
                    }
                    let delay = backoff(attempt);
                    warn!(%status, ?delay, attempt, "provider busy, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(RelayErr::Reqwest(e)) => {
                    if attempt > *RELAY_REQUEST_MAX_RETRIES {
                        return Err(RelayErr::Reqwest(e));
                    }
                    let delay = backoff(attempt);
                    warn!(?delay, attempt, "provider connect failed: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}
