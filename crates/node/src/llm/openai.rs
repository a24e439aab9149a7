use super::openai_compat::{ChatCompletionsAdapter, Flavor};
use super::AdapterOptions;
use crate::error::NodeError;

pub const NAME: &str = "openai";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const FLAVOR: Flavor = Flavor {
    name: NAME,
    default_base_url: DEFAULT_BASE_URL,
    supported_models: &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"],
};

pub fn adapter(api_key: &str, options: AdapterOptions) -> Result<ChatCompletionsAdapter, NodeError> {
    ChatCompletionsAdapter::new(FLAVOR, api_key, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmAdapter;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use shared::models::llm::{ChatMessage, FinishReason, LlmRequest, Role};

    #[tokio::test]
    async fn forwards_chat_completion() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-openai-test")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "ping"}],
                "max_tokens": 16
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": "chatcmpl-1",
                    "model": "gpt-4o-mini",
                    "choices": [{"message": {"role": "assistant", "content": "pong"}, "finish_reason": "length"}],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 16, "total_tokens": 21}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = adapter(
            "sk-openai-test",
            AdapterOptions {
                base_url: Some(server.url()),
                ..Default::default()
            },
        )
        .unwrap();
        let response = adapter
            .forward_request(&LlmRequest {
                model: "gpt-4o-mini".to_string(),
                messages: vec![ChatMessage::new(Role::User, "ping")],
                temperature: None,
                max_tokens: Some(16),
                stream: false,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "pong");
        assert_eq!(response.usage.total_tokens, 21);
        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(adapter.usage().total_input_tokens, 5);
    }
}
