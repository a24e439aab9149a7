use chrono::Utc;
use log::{debug, info, warn};
use shared::models::llm::LlmResponse;
use shared::models::usage::{RequestStatus, RequestUsage, TotalUsage};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::NodeError;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Terminal data recorded when a request leaves the active set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub backend: String,
    pub model: String,
    pub error: Option<String>,
}

impl UsageData {
    pub fn from_response(backend: &str, response: &LlmResponse) -> Self {
        Self {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            total_tokens: response.usage.total_tokens,
            backend: backend.to_string(),
            model: response.model.clone(),
            error: None,
        }
    }

    pub fn failed(backend: &str, model: &str, error: impl Into<String>) -> Self {
        Self {
            backend: backend.to_string(),
            model: model.to_string(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    active: HashMap<String, RequestUsage>,
    completed: VecDeque<RequestUsage>,
    // survives eviction and clear_history
    lifetime: TotalUsage,
}

/// In-memory metering of in-flight and recently completed requests.
///
/// Records move from the active map into a bounded history exactly once.
/// When the history is full the oldest record is evicted.
#[derive(Debug)]
pub struct UsageTracker {
    ledger: Mutex<Ledger>,
    capacity: usize,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                active: HashMap::new(),
                completed: VecDeque::with_capacity(capacity),
                lifetime: TotalUsage::default(),
            }),
            capacity,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(ledger) => ledger,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens a pending record. Returns `false` and keeps the existing record
    /// if `request_id` is already active.
    pub fn start_tracking(&self, request_id: &str) -> bool {
        let mut ledger = self.ledger();
        if ledger.active.contains_key(request_id) {
            warn!("Request {request_id} is already being tracked");
            return false;
        }
        ledger
            .active
            .insert(request_id.to_string(), RequestUsage::pending(request_id));
        debug!("Started tracking request {request_id}");
        true
    }

    pub fn stop_tracking(&self, request_id: &str, data: Option<UsageData>) {
        let mut ledger = self.ledger();
        let Some(mut usage) = ledger.active.remove(request_id) else {
            warn!("No active request found for {request_id}");
            return;
        };

        let end_time = Utc::now();
        let duration_ms = (end_time - usage.start_time).num_milliseconds().max(0) as u64;
        usage.end_time = Some(end_time);
        usage.duration_ms = Some(duration_ms);
        usage.status = RequestStatus::Completed;

        if let Some(data) = data {
            usage.input_tokens = data.input_tokens;
            usage.output_tokens = data.output_tokens;
            usage.total_tokens = data.total_tokens;
            usage.backend = data.backend;
            usage.model = data.model;
            if data.error.is_some() {
                usage.status = RequestStatus::Error;
            }
            usage.error = data.error;
        }

        ledger.lifetime.total_requests += 1;
        ledger.lifetime.total_tokens += usage.total_tokens;
        ledger.lifetime.total_input_tokens += usage.input_tokens;
        ledger.lifetime.total_output_tokens += usage.output_tokens;
        ledger.lifetime.total_duration_ms += duration_ms;

        if self.capacity == 0 {
            return;
        }
        if ledger.completed.len() >= self.capacity {
            ledger.completed.pop_front();
        }
        ledger.completed.push_back(usage);
        debug!("Stopped tracking request {request_id} after {duration_ms}ms");
    }

    /// Copy of the active set.
    pub fn get_usage(&self) -> HashMap<String, RequestUsage> {
        self.ledger().active.clone()
    }

    /// Copy of the completed history, oldest first.
    pub fn get_history(&self) -> Vec<RequestUsage> {
        self.ledger().completed.iter().cloned().collect()
    }

    pub fn get_total_usage(&self) -> TotalUsage {
        self.ledger()
            .completed
            .iter()
            .fold(TotalUsage::default(), |mut total, usage| {
                total.total_requests += 1;
                total.total_tokens += usage.total_tokens;
                total.total_input_tokens += usage.input_tokens;
                total.total_output_tokens += usage.output_tokens;
                total.total_duration_ms += usage.duration_ms.unwrap_or_default();
                total
            })
    }

    /// Totals over every request ever stopped, including records already
    /// evicted from or cleared out of the history.
    pub fn lifetime_usage(&self) -> TotalUsage {
        self.ledger().lifetime
    }

    pub fn active_count(&self) -> usize {
        self.ledger().active.len()
    }

    pub fn clear_history(&self) {
        self.ledger().completed.clear();
        info!("Usage history cleared");
    }

    /// Starts tracking `request_id` and returns a guard that stops it exactly once.
    pub fn begin(self: &Arc<Self>, request_id: &str) -> Result<UsageSpan, NodeError> {
        if !self.start_tracking(request_id) {
            return Err(NodeError::DuplicateRequest(request_id.to_string()));
        }
        Ok(UsageSpan {
            tracker: Arc::clone(self),
            request_id: request_id.to_string(),
            finished: false,
        })
    }
}

/// Scoped tracking of one request. Dropping it unfinished records the
/// request as cancelled.
#[derive(Debug)]
pub struct UsageSpan {
    tracker: Arc<UsageTracker>,
    request_id: String,
    finished: bool,
}

impl UsageSpan {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn complete(mut self, data: UsageData) {
        self.finish(data);
    }

    pub fn fail(mut self, backend: &str, model: &str, error: &NodeError) {
        self.finish(UsageData::failed(backend, model, error.to_string()));
    }

    fn finish(&mut self, data: UsageData) {
        if !self.finished {
            self.finished = true;
            self.tracker.stop_tracking(&self.request_id, Some(data));
        }
    }
}

impl Drop for UsageSpan {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(UsageData {
                error: Some("request cancelled".to_string()),
                ..Default::default()
            });
        }
    }
}
