use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Stopped => write!(f, "stopped"),
            NodeState::Starting => write!(f, "starting"),
            NodeState::Running => write!(f, "running"),
            NodeState::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time view of the node handed to status observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub status: NodeState,
    pub uptime_seconds: u64,
    pub peer_count: usize,
    pub requests_processed: u64,
    pub total_tokens: u64,
    pub earnings: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            status: NodeState::Stopped,
            uptime_seconds: 0,
            peer_count: 0,
            requests_processed: 0,
            total_tokens: 0,
            earnings: "0".to_string(),
            last_error: None,
            started_at: None,
        }
    }
}

impl NodeStatus {
    pub fn is_running(&self) -> bool {
        self.status == NodeState::Running
    }
}

pub fn calculate_uptime(started_at: DateTime<Utc>) -> u64 {
    (Utc::now() - started_at).num_seconds().max(0) as u64
}

/// Self-advertisement published to the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub node_id: String,
    pub node_name: String,
    pub addresses: Vec<String>,
    pub capabilities: Vec<String>,
    pub backend: String,
    pub models: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn initial_status_is_stopped_with_zero_earnings() {
        let status = NodeStatus::default();
        assert_eq!(status.status, NodeState::Stopped);
        assert_eq!(status.earnings, "0");
        assert!(status.started_at.is_none());

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "stopped");
        assert_eq!(value["uptimeSeconds"], 0);
        assert!(value.get("lastError").is_none());
    }

    #[test]
    fn uptime_is_derived_from_start_time() {
        let started_at = Utc::now() - Duration::seconds(42);
        let uptime = calculate_uptime(started_at);
        assert!((42..=43).contains(&uptime));

        assert_eq!(calculate_uptime(Utc::now() + Duration::seconds(5)), 0);
    }
}
