use async_trait::async_trait;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use shared::models::llm::{FinishReason, LlmRequest, LlmResponse, Role, TokenUsage, UsageStats};

use super::{
    build_client, decode_json, send_with_retries, trim_base_url, upstream_error, AdapterOptions,
    LlmAdapter, UsageCounter,
};
use crate::error::NodeError;

pub const NAME: &str = "anthropic";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const PROBE_MODEL: &str = "claude-3-haiku-20240307";

const SUPPORTED_MODELS: &[&str] = &[
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
    "claude-2.1",
    "claude-2.0",
    "claude-instant-20240307",
];

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

fn finish_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Unset,
    }
}

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    max_retries: u32,
    usage: UsageCounter,
}

impl AnthropicAdapter {
    pub fn new(api_key: &str, options: AdapterOptions) -> Result<Self, NodeError> {
        Ok(Self {
            client: build_client(NAME, options.timeout)?,
            api_key: api_key.to_string(),
            base_url: trim_base_url(options.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
            max_retries: options.max_retries,
            usage: UsageCounter::new(options.price_per_1k_tokens),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    // The messages API takes system prompts as a top-level field.
    fn to_wire<'a>(request: &'a LlmRequest) -> MessagesRequest<'a> {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| WireMessage {
                role: m.role,
                content: &m.content,
            })
            .collect();

        MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            temperature: request.temperature,
            stream: false,
        }
    }
}

#[async_trait]
impl LlmAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_models(&self) -> &[&'static str] {
        SUPPORTED_MODELS
    }

    async fn validate_api_key(&self, api_key: &str) -> bool {
        let probe = MessagesRequest {
            model: PROBE_MODEL,
            max_tokens: 1,
            messages: vec![WireMessage {
                role: Role::User,
                content: "test",
            }],
            system: None,
            temperature: None,
            stream: false,
        };
        let result = self
            .client
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&probe)
            .send()
            .await;

        match result {
            Ok(response) => {
                debug!("Anthropic key probe answered {}", response.status());
                response.status() == reqwest::StatusCode::OK
            }
            Err(e) => {
                error!("Failed to validate Anthropic API key: {e}");
                false
            }
        }
    }

    async fn forward_request(&self, request: &LlmRequest) -> Result<LlmResponse, NodeError> {
        let body = Self::to_wire(request);
        let url = self.messages_url();

        let response = send_with_retries(NAME, self.max_retries, || {
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
        })
        .await?;

        if !response.status().is_success() {
            let err = upstream_error(NAME, response).await;
            error!("Anthropic API request failed: {err}");
            return Err(err);
        }

        let data: MessagesResponse = decode_json(NAME, response).await?;
        let usage = TokenUsage::new(data.usage.input_tokens, data.usage.output_tokens);
        self.usage.record(&usage);

        let content = data
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            id: data.id,
            model: data.model,
            content,
            usage,
            finish_reason: finish_reason(data.stop_reason.as_deref()),
        })
    }

    fn usage(&self) -> UsageStats {
        self.usage.snapshot()
    }
}
