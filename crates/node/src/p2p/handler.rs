use async_trait::async_trait;
use log::debug;
use p2p::{InferencePayload, PeerId, PeerTokenUsage, RequestMessage, ResponseMessage, ResponsePayload};
use shared::models::llm::{ChatMessage, Role};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::InboundRequestHandler;
use crate::error::NodeError;
use crate::proxy::{InferenceRequest, RequestHandler, UsageTracker};

/// Serves peer requests through the same handler and metering as the gateway.
pub struct PeerRequestHandler {
    handler: Arc<RequestHandler>,
    tracker: Arc<UsageTracker>,
    timeout: Duration,
}

impl PeerRequestHandler {
    pub fn new(handler: Arc<RequestHandler>, tracker: Arc<UsageTracker>, timeout: Duration) -> Self {
        Self {
            handler,
            tracker,
            timeout,
        }
    }
}

fn to_inference_request(payload: &InferencePayload) -> Result<InferenceRequest, NodeError> {
    let messages = payload
        .messages
        .iter()
        .map(|m| {
            m.role
                .parse::<Role>()
                .map(|role| ChatMessage::new(role, m.content.clone()))
                .map_err(|e| NodeError::Validation(format!("{e:#}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(InferenceRequest {
        backend: Some(payload.backend.clone()),
        model: Some(payload.model.clone()),
        messages: Some(messages),
        temperature: payload.temperature,
        max_tokens: payload.max_tokens,
    })
}

#[async_trait]
impl InboundRequestHandler for PeerRequestHandler {
    async fn handle_request(&self, peer: PeerId, request: RequestMessage) -> ResponseMessage {
        let response_id = Uuid::new_v4().to_string();
        let span = match self.tracker.begin(&request.id) {
            Ok(span) => span,
            Err(e) => return ResponseMessage::error(response_id, request.id, e.to_string()),
        };

        let inference = match to_inference_request(&request.payload) {
            Ok(inference) => inference,
            Err(e) => {
                span.fail(&request.payload.backend, &request.payload.model, &e);
                return ResponseMessage::error(response_id, request.id, e.to_string());
            }
        };

        debug!("Serving peer request {} from {peer}", request.id);
        match self
            .handler
            .handle_metered(span, &inference, self.timeout)
            .await
        {
            Ok(response) => ResponseMessage::llm_response(
                response_id,
                request.id,
                ResponsePayload {
                    content: response.content,
                    usage: PeerTokenUsage {
                        input_tokens: response.usage.input_tokens,
                        output_tokens: response.usage.output_tokens,
                    },
                },
            ),
            Err(e) => ResponseMessage::error(response_id, request.id, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::handler::tests::MockAdapter;
    use p2p::ChatMessage as WireMessage;
    use shared::models::usage::RequestStatus;

    fn payload(backend: &str, role: &str) -> InferencePayload {
        InferencePayload {
            backend: backend.to_string(),
            model: "mock-small".to_string(),
            messages: vec![WireMessage {
                role: role.to_string(),
                content: "from a peer".to_string(),
            }],
            temperature: Some(0.1),
            max_tokens: Some(16),
        }
    }

    fn handler() -> (PeerRequestHandler, Arc<UsageTracker>) {
        let requests = Arc::new(RequestHandler::new());
        requests.register_adapter("mock", Arc::new(MockAdapter::ok(8)));
        let tracker = Arc::new(UsageTracker::new());
        (
            PeerRequestHandler::new(requests, tracker.clone(), Duration::from_secs(5)),
            tracker,
        )
    }

    #[tokio::test]
    async fn answers_with_llm_response() {
        let (handler, tracker) = handler();
        let response = handler
            .handle_request(
                PeerId::random(),
                RequestMessage::new("p-1", payload("mock", "user")),
            )
            .await;

        assert!(!response.is_error());
        assert_eq!(response.request_id, "p-1");
        let payload = response.payload.unwrap();
        assert_eq!(payload.content, "from a peer");
        assert_eq!(payload.usage.input_tokens + payload.usage.output_tokens, 8);
        assert_eq!(tracker.get_history()[0].status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn failures_become_error_messages() {
        let (handler, tracker) = handler();

        let unknown = handler
            .handle_request(
                PeerId::random(),
                RequestMessage::new("p-1", payload("unknown-x", "user")),
            )
            .await;
        assert!(unknown.is_error());
        assert_eq!(unknown.error.as_deref(), Some("Unknown backend: unknown-x"));

        let bad_role = handler
            .handle_request(
                PeerId::random(),
                RequestMessage::new("p-2", payload("mock", "narrator")),
            )
            .await;
        assert!(bad_role.is_error());

        let history = tracker.get_history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|u| u.status == RequestStatus::Error));
    }
}
