use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use shared::models::llm::{LlmRequest, LlmResponse, TokenUsage, UsageStats};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Backend, LlmConfig};
use crate::error::NodeError;

pub mod anthropic;
mod openai_compat;
pub mod openai;
pub mod seedance;

pub use anthropic::AnthropicAdapter;
pub use openai_compat::ChatCompletionsAdapter;

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// One upstream LLM backend behind the normalized request/response shape.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn supported_models(&self) -> &[&'static str];

    /// Probes the backend with `api_key`. Any non-200 answer or transport
    /// failure counts as an invalid key.
    async fn validate_api_key(&self, api_key: &str) -> bool;

    /// Forwards one request. Usage counters only move when this succeeds.
    async fn forward_request(&self, request: &LlmRequest) -> Result<LlmResponse, NodeError>;

    fn usage(&self) -> UsageStats;
}

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub base_url: Option<String>,
    pub price_per_1k_tokens: f64,
    /// Extra attempts after a transport error or 5xx answer.
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            price_per_1k_tokens: 0.0,
            max_retries: 0,
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

impl From<&LlmConfig> for AdapterOptions {
    fn from(config: &LlmConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            price_per_1k_tokens: config.price_per_1k_tokens,
            max_retries: config.max_retries,
            ..Default::default()
        }
    }
}

pub fn create_adapter(config: &LlmConfig) -> Result<Arc<dyn LlmAdapter>, NodeError> {
    let options = AdapterOptions::from(config);
    let adapter: Arc<dyn LlmAdapter> = match config.backend {
        Backend::Anthropic => Arc::new(AnthropicAdapter::new(&config.api_key, options)?),
        Backend::OpenAi => Arc::new(openai::adapter(&config.api_key, options)?),
        Backend::Seedance => Arc::new(seedance::adapter(&config.api_key, options)?),
    };
    Ok(adapter)
}

pub(crate) fn build_client(backend: &str, timeout: Duration) -> Result<reqwest::Client, NodeError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| NodeError::upstream(backend, format!("failed to build http client: {e}")))
}

pub(crate) fn trim_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Adapter-local usage counters.
#[derive(Debug, Default)]
pub(crate) struct UsageCounter {
    stats: Mutex<UsageStats>,
    price_per_1k_tokens: f64,
}

impl UsageCounter {
    pub(crate) fn new(price_per_1k_tokens: f64) -> Self {
        Self {
            stats: Mutex::new(UsageStats::default()),
            price_per_1k_tokens,
        }
    }

    pub(crate) fn record(&self, usage: &TokenUsage) {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        stats.record(usage, self.price_per_1k_tokens);
    }

    pub(crate) fn snapshot(&self) -> UsageStats {
        match self.stats.lock() {
            Ok(stats) => *stats,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Sends the request built by `build`, retrying up to `max_retries` times on
/// transport errors and 5xx answers. Other statuses are returned as-is.
pub(crate) async fn send_with_retries<F>(
    backend: &str,
    max_retries: u32,
    build: F,
) -> Result<reqwest::Response, NodeError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;
    loop {
        let retryable = match build().send().await {
            Ok(response) if response.status().is_server_error() && attempt < max_retries => {
                format!("status {}", response.status())
            }
            Ok(response) => return Ok(response),
            Err(e) if attempt < max_retries && !e.is_builder() => e.to_string(),
            Err(e) => return Err(NodeError::upstream(backend, e.to_string())),
        };

        attempt += 1;
        warn!("{backend} request failed ({retryable}), retry {attempt}/{max_retries}");
        tokio::time::sleep(RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1)).await;
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Turns a non-success answer into an upstream error, preferring the
/// backend's own `{"error": {"message": ..}}` text.
pub(crate) async fn upstream_error(backend: &str, response: reqwest::Response) -> NodeError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => envelope.error.message,
        Err(_) if body.is_empty() => "empty response body".to_string(),
        Err(_) => body.chars().take(200).collect(),
    };
    NodeError::upstream(backend, format!("status {status}: {message}"))
}

pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    backend: &str,
    response: reqwest::Response,
) -> Result<T, NodeError> {
    response
        .json::<T>()
        .await
        .map_err(|e| NodeError::upstream(backend, format!("invalid response body: {e}")))
}
