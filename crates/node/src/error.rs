use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),
    #[error("Failed to initialize network: {0}")]
    NetworkInit(String),
    #[error("Port {0} is already in use")]
    AddressInUse(u16),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
    #[error("{backend} request failed: {message}")]
    Upstream { backend: String, message: String },
    #[error("Request {0} is already in flight")]
    DuplicateRequest(String),
    #[error("Token quota of {quota} exhausted")]
    QuotaExceeded { quota: u64 },
    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Blockchain error: {0}")]
    Blockchain(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl NodeError {
    pub(crate) fn upstream(backend: &str, message: impl Into<String>) -> Self {
        NodeError::Upstream {
            backend: backend.to_string(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl ResponseError for NodeError {
    fn status_code(&self) -> StatusCode {
        match self {
            NodeError::Validation(_) | NodeError::DuplicateRequest(_) => StatusCode::BAD_REQUEST,
            NodeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_faults_map_to_bad_request() {
        assert_eq!(
            NodeError::Validation("missing model".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NodeError::DuplicateRequest("r1".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NodeError::UnknownBackend("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            NodeError::Timeout(Duration::from_secs(3)).to_string(),
            "Request timed out after 3s"
        );
    }
}
