use log::{info, warn};
use serde::{Deserialize, Serialize};
use shared::models::llm::{ChatMessage, LlmRequest, LlmResponse, UsageStats};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::usage::{UsageData, UsageSpan};
use crate::error::NodeError;
use crate::llm::LlmAdapter;

/// Inbound inference request as received from the gateway or a peer.
/// Every field is optional here so missing ones surface as validation errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    #[serde(default, alias = "provider")]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl InferenceRequest {
    fn backend_name(&self) -> &str {
        self.backend.as_deref().unwrap_or_default()
    }

    fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or_default()
    }
}

/// Limits applied before a request reaches its adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestPolicy {
    /// Empty allows any model.
    pub allowed_models: Vec<String>,
    /// Cumulative token budget per adapter. `None` disables the check.
    pub max_quota: Option<u64>,
}

pub struct RequestHandler {
    adapters: RwLock<HashMap<String, Arc<dyn LlmAdapter>>>,
    policy: RwLock<RequestPolicy>,
}

impl Default for RequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHandler {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            policy: RwLock::new(RequestPolicy::default()),
        }
    }

    /// Registers `adapter` under `backend`, replacing any previous one.
    pub fn register_adapter(&self, backend: &str, adapter: Arc<dyn LlmAdapter>) {
        let mut adapters = match self.adapters.write() {
            Ok(adapters) => adapters,
            Err(poisoned) => poisoned.into_inner(),
        };
        if adapters.insert(backend.to_string(), adapter).is_some() {
            info!("Replaced LLM adapter for {backend}");
        } else {
            info!("Registered LLM adapter for {backend}");
        }
    }

    /// Swaps the whole adapter set for a single backend under one write lock,
    /// so concurrent requests see either the old set or the new one.
    pub fn replace_adapters(&self, backend: &str, adapter: Arc<dyn LlmAdapter>) {
        let mut adapters = match self.adapters.write() {
            Ok(adapters) => adapters,
            Err(poisoned) => poisoned.into_inner(),
        };
        *adapters = HashMap::from([(backend.to_string(), adapter)]);
        info!("Installed LLM adapter for {backend}");
    }

    pub fn clear_adapters(&self) {
        match self.adapters.write() {
            Ok(mut adapters) => adapters.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    pub fn set_policy(&self, policy: RequestPolicy) {
        match self.policy.write() {
            Ok(mut current) => *current = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
    }

    fn policy(&self) -> RequestPolicy {
        match self.policy.read() {
            Ok(policy) => policy.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn adapter(&self, backend: &str) -> Option<Arc<dyn LlmAdapter>> {
        let adapters = match self.adapters.read() {
            Ok(adapters) => adapters,
            Err(poisoned) => poisoned.into_inner(),
        };
        adapters.get(backend).cloned()
    }

    pub fn backends(&self) -> Vec<String> {
        let adapters = match self.adapters.read() {
            Ok(adapters) => adapters,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut backends: Vec<String> = adapters.keys().cloned().collect();
        backends.sort();
        backends
    }

    /// Usage counters of every registered adapter, keyed by backend.
    pub fn adapter_usage(&self) -> BTreeMap<String, UsageStats> {
        let adapters = match self.adapters.read() {
            Ok(adapters) => adapters,
            Err(poisoned) => poisoned.into_inner(),
        };
        adapters
            .iter()
            .map(|(name, adapter)| (name.clone(), adapter.usage()))
            .collect()
    }

    pub async fn handle(&self, request: &InferenceRequest) -> Result<LlmResponse, NodeError> {
        let backend = request
            .backend
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| NodeError::Validation("missing required field: backend".into()))?;
        let model = request
            .model
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| NodeError::Validation("missing required field: model".into()))?;
        let messages = request
            .messages
            .as_ref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| NodeError::Validation("missing required field: messages".into()))?;

        let adapter = self
            .adapter(backend)
            .ok_or_else(|| NodeError::UnknownBackend(backend.to_string()))?;

        let policy = self.policy();
        if !policy.allowed_models.is_empty() && !policy.allowed_models.iter().any(|m| m == model) {
            return Err(NodeError::Validation(format!(
                "model {model} is not offered by this node"
            )));
        }
        if let Some(quota) = policy.max_quota {
            if adapter.usage().total_tokens >= quota {
                warn!("Rejecting request for {backend}: token quota of {quota} reached");
                return Err(NodeError::QuotaExceeded { quota });
            }
        }

        info!("Forwarding LLM request to {backend} ({model})");
        let llm_request = LlmRequest {
            model: model.to_string(),
            messages: messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };
        adapter.forward_request(&llm_request).await
    }

    /// Runs [`RequestHandler::handle`] under `timeout` and closes `span` with
    /// the outcome.
    pub async fn handle_metered(
        &self,
        span: UsageSpan,
        request: &InferenceRequest,
        timeout: Duration,
    ) -> Result<LlmResponse, NodeError> {
        let backend = request.backend_name();
        let outcome = match tokio::time::timeout(timeout, self.handle(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(NodeError::Timeout(timeout)),
        };

        match outcome {
            Ok(response) => {
                span.complete(UsageData::from_response(backend, &response));
                Ok(response)
            }
            Err(e) => {
                warn!("Request {} failed: {e}", span.request_id());
                span.fail(backend, request.model_name(), &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proxy::usage::UsageTracker;
    use async_trait::async_trait;
    use shared::models::llm::{FinishReason, Role, TokenUsage};
    use shared::models::usage::RequestStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Adapter double that counts calls and answers from a script.
    pub(crate) struct MockAdapter {
        pub(crate) calls: AtomicUsize,
        pub(crate) fail: bool,
        pub(crate) delay: Duration,
        pub(crate) tokens: u64,
        usage: Mutex<UsageStats>,
    }

    impl MockAdapter {
        pub(crate) fn ok(tokens: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
                tokens,
                usage: Mutex::new(UsageStats::default()),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok(0)
            }
        }

        pub(crate) fn slow(delay: Duration, tokens: u64) -> Self {
            Self {
                delay,
                ..Self::ok(tokens)
            }
        }
    }

    #[async_trait]
    impl LlmAdapter for MockAdapter {
        fn name(&self) -> &str {
            "mock"
        }

        fn supported_models(&self) -> &[&'static str] {
            &["mock-small"]
        }

        async fn validate_api_key(&self, _api_key: &str) -> bool {
            true
        }

        async fn forward_request(&self, request: &LlmRequest) -> Result<LlmResponse, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(NodeError::upstream("mock", "forced failure"));
            }
            let usage = TokenUsage::new(self.tokens / 2, self.tokens - self.tokens / 2);
            self.usage.lock().unwrap().record(&usage, 0.0);
            Ok(LlmResponse {
                id: format!("mock-{}", self.calls.load(Ordering::SeqCst)),
                model: request.model.clone(),
                content: request
                    .messages
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default(),
                usage,
                finish_reason: FinishReason::Stop,
            })
        }

        fn usage(&self) -> UsageStats {
            *self.usage.lock().unwrap()
        }
    }

    pub(crate) fn sample_request(backend: &str) -> InferenceRequest {
        InferenceRequest {
            backend: Some(backend.to_string()),
            model: Some("mock-small".to_string()),
            messages: Some(vec![ChatMessage::new(Role::User, "echo me")]),
            temperature: None,
            max_tokens: Some(32),
        }
    }

    #[tokio::test]
    async fn missing_model_is_rejected_before_dispatch() {
        let handler = RequestHandler::new();
        let adapter = Arc::new(MockAdapter::ok(10));
        handler.register_adapter("mock", adapter.clone());

        let request = InferenceRequest {
            model: None,
            ..sample_request("mock")
        };
        let err = handler.handle(&request).await.unwrap_err();

        assert!(matches!(err, NodeError::Validation(_)));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_messages_are_rejected() {
        let handler = RequestHandler::new();
        handler.register_adapter("mock", Arc::new(MockAdapter::ok(10)));

        let request = InferenceRequest {
            messages: Some(vec![]),
            ..sample_request("mock")
        };
        assert!(matches!(
            handler.handle(&request).await,
            Err(NodeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let handler = RequestHandler::new();
        let err = handler
            .handle(&sample_request("unknown-x"))
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::UnknownBackend("unknown-x".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replacing_adapters_never_exposes_an_empty_set() {
        let handler = Arc::new(RequestHandler::new());
        handler.register_adapter("mock", Arc::new(MockAdapter::ok(2)));
        handler.register_adapter("stale", Arc::new(MockAdapter::ok(2)));

        let reader = {
            let handler = handler.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    if let Err(e) = handler.handle(&sample_request("mock")).await {
                        panic!("request failed during adapter swap: {e}");
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        for _ in 0..500 {
            handler.replace_adapters("mock", Arc::new(MockAdapter::ok(2)));
            tokio::task::yield_now().await;
        }
        reader.await.unwrap();

        assert_eq!(handler.backends(), vec!["mock".to_string()]);
    }

    #[tokio::test]
    async fn dispatches_to_registered_adapter() {
        let handler = RequestHandler::new();
        let adapter = Arc::new(MockAdapter::ok(10));
        handler.register_adapter("mock", adapter.clone());

        let response = handler.handle(&sample_request("mock")).await.unwrap();

        assert_eq!(response.content, "echo me");
        assert_eq!(response.usage.total_tokens, 10);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enforces_model_allowlist_and_quota() {
        let handler = RequestHandler::new();
        let adapter = Arc::new(MockAdapter::ok(10));
        handler.register_adapter("mock", adapter.clone());
        handler.set_policy(RequestPolicy {
            allowed_models: vec!["mock-large".to_string()],
            max_quota: None,
        });
        assert!(matches!(
            handler.handle(&sample_request("mock")).await,
            Err(NodeError::Validation(_))
        ));

        handler.set_policy(RequestPolicy {
            allowed_models: vec![],
            max_quota: Some(10),
        });
        handler.handle(&sample_request("mock")).await.unwrap();
        assert_eq!(
            handler.handle(&sample_request("mock")).await,
            Err(NodeError::QuotaExceeded { quota: 10 })
        );
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn adapter_failure_propagates_unchanged() {
        let handler = RequestHandler::new();
        handler.register_adapter("mock", Arc::new(MockAdapter::failing()));

        let err = handler.handle(&sample_request("mock")).await.unwrap_err();
        assert_eq!(err, NodeError::upstream("mock", "forced failure"));
    }

    #[tokio::test]
    async fn metered_timeout_is_recorded_as_error() {
        let handler = RequestHandler::new();
        handler.register_adapter(
            "mock",
            Arc::new(MockAdapter::slow(Duration::from_secs(5), 10)),
        );
        let tracker = Arc::new(UsageTracker::new());

        let span = tracker.begin("slow-1").unwrap();
        let err = handler
            .handle_metered(span, &sample_request("mock"), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, NodeError::Timeout(_)));
        let history = tracker.get_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RequestStatus::Error);
        assert_eq!(history[0].backend, "mock");
    }

    #[tokio::test]
    async fn concurrent_requests_keep_separate_records() {
        let handler = Arc::new(RequestHandler::new());
        handler.register_adapter(
            "slow",
            Arc::new(MockAdapter::slow(Duration::from_millis(150), 10)),
        );
        handler.register_adapter("fast", Arc::new(MockAdapter::ok(16)));
        let tracker = Arc::new(UsageTracker::new());

        let slow = {
            let handler = handler.clone();
            let span = tracker.begin("req-slow").unwrap();
            tokio::spawn(async move {
                handler
                    .handle_metered(span, &sample_request("slow"), Duration::from_secs(5))
                    .await
            })
        };
        let fast = {
            let handler = handler.clone();
            let span = tracker.begin("req-fast").unwrap();
            tokio::spawn(async move {
                handler
                    .handle_metered(span, &sample_request("fast"), Duration::from_secs(5))
                    .await
            })
        };

        fast.await.unwrap().unwrap();
        slow.await.unwrap().unwrap();

        let history = tracker.get_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].request_id, "req-fast");
        assert_eq!(history[0].total_tokens, 16);
        assert_eq!(history[1].request_id, "req-slow");
        assert_eq!(history[1].total_tokens, 10);
        assert_eq!(tracker.get_total_usage().total_tokens, 26);
    }
}
