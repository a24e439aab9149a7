use libp2p::PeerId;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct IncomingMessage {
    pub peer: PeerId,
    pub message: libp2p::request_response::Message<Request, Response>,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum OutgoingMessage {
    Request((PeerId, Request)),
    Response(
        (
            libp2p::request_response::ResponseChannel<Response>,
            Response,
        ),
    ),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Inference(RequestMessage),
}

impl Request {
    pub fn into_outgoing_message(self, peer: PeerId) -> OutgoingMessage {
        OutgoingMessage::Request((peer, self))
    }
}

impl From<RequestMessage> for Request {
    fn from(request: RequestMessage) -> Self {
        Request::Inference(request)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Inference(ResponseMessage),
}

impl Response {
    pub fn into_outgoing_message(
        self,
        channel: libp2p::request_response::ResponseChannel<Response>,
    ) -> OutgoingMessage {
        OutgoingMessage::Response((channel, self))
    }
}

impl From<ResponseMessage> for Response {
    fn from(response: ResponseMessage) -> Self {
        Response::Inference(response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    #[serde(rename = "llm_request")]
    LlmRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    #[serde(rename = "llm_response")]
    LlmResponse,
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferencePayload {
    pub backend: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Inference request sent by a peer that wants this node to serve a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub payload: InferencePayload,
}

impl RequestMessage {
    pub fn new(id: impl Into<String>, payload: InferencePayload) -> Self {
        Self {
            id: id.into(),
            kind: RequestKind::LlmRequest,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerTokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub content: String,
    pub usage: PeerTokenUsage,
}

/// Reply to a [`RequestMessage`], correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ResponsePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseMessage {
    pub fn llm_response(
        id: impl Into<String>,
        request_id: impl Into<String>,
        payload: ResponsePayload,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::LlmResponse,
            request_id: request_id.into(),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(
        id: impl Into<String>,
        request_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::Error,
            request_id: request_id.into(),
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_message_uses_wire_field_names() {
        let request = RequestMessage::new(
            "req-1",
            InferencePayload {
                backend: "anthropic".to_string(),
                model: "claude-3-haiku-20240307".to_string(),
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                }],
                temperature: None,
                max_tokens: Some(64),
            },
        );

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "llm_request");
        assert_eq!(value["payload"]["maxTokens"], 64);
        assert!(value["payload"].get("temperature").is_none());
    }

    #[test]
    fn error_response_carries_request_id() {
        let response = ResponseMessage::error("resp-1", "req-1", "unknown backend: x");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["error"], "unknown backend: x");
        assert!(value.get("payload").is_none());
        assert!(response.is_error());
    }
}
