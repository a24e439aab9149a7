use async_trait::async_trait;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use shared::models::llm::{FinishReason, LlmRequest, LlmResponse, Role, TokenUsage, UsageStats};

use super::{
    build_client, decode_json, send_with_retries, trim_base_url, upstream_error, AdapterOptions,
    LlmAdapter, UsageCounter,
};
use crate::error::NodeError;

/// Static description of a backend speaking the `/chat/completions` dialect.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Flavor {
    pub(crate) name: &'static str,
    pub(crate) default_base_url: &'static str,
    pub(crate) supported_models: &'static [&'static str],
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    id: String,
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Unset,
    }
}

pub struct ChatCompletionsAdapter {
    flavor: Flavor,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    max_retries: u32,
    usage: UsageCounter,
}

impl ChatCompletionsAdapter {
    pub(crate) fn new(
        flavor: Flavor,
        api_key: &str,
        options: AdapterOptions,
    ) -> Result<Self, NodeError> {
        Ok(Self {
            flavor,
            client: build_client(flavor.name, options.timeout)?,
            api_key: api_key.to_string(),
            base_url: trim_base_url(
                options
                    .base_url
                    .as_deref()
                    .unwrap_or(flavor.default_base_url),
            ),
            max_retries: options.max_retries,
            usage: UsageCounter::new(options.price_per_1k_tokens),
        })
    }
}

#[async_trait]
impl LlmAdapter for ChatCompletionsAdapter {
    fn name(&self) -> &str {
        self.flavor.name
    }

    fn supported_models(&self) -> &[&'static str] {
        self.flavor.supported_models
    }

    async fn validate_api_key(&self, api_key: &str) -> bool {
        let result = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(api_key)
            .send()
            .await;

        match result {
            Ok(response) => {
                debug!("{} key probe answered {}", self.flavor.name, response.status());
                response.status() == reqwest::StatusCode::OK
            }
            Err(e) => {
                error!("Failed to validate {} API key: {e}", self.flavor.name);
                false
            }
        }
    }

    async fn forward_request(&self, request: &LlmRequest) -> Result<LlmResponse, NodeError> {
        let name = self.flavor.name;
        let body = CompletionRequest {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let response = send_with_retries(name, self.max_retries, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;

        if !response.status().is_success() {
            let err = upstream_error(name, response).await;
            error!("{name} API request failed: {err}");
            return Err(err);
        }

        let data: CompletionResponse = decode_json(name, response).await?;
        let wire_usage = data.usage.unwrap_or_default();
        let usage = TokenUsage {
            input_tokens: wire_usage.prompt_tokens,
            output_tokens: wire_usage.completion_tokens,
            total_tokens: if wire_usage.total_tokens > 0 {
                wire_usage.total_tokens
            } else {
                wire_usage.prompt_tokens + wire_usage.completion_tokens
            },
        };
        self.usage.record(&usage);

        let choice = data.choices.into_iter().next();
        let (content, reason) = match choice {
            Some(choice) => (
                choice.message.and_then(|m| m.content).unwrap_or_default(),
                finish_reason(choice.finish_reason.as_deref()),
            ),
            None => (String::new(), FinishReason::Unset),
        };

        Ok(LlmResponse {
            id: data.id,
            model: data.model,
            content,
            usage,
            finish_reason: reason,
        })
    }

    fn usage(&self) -> UsageStats {
        self.usage.snapshot()
    }
}
