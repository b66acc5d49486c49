//! Protocol message types for active checks.

use serde::{Deserialize, Serialize};

/// One check assigned to this agent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCheck {
    /// Metric key to evaluate
    pub key: String,

    /// Seconds between evaluations of this key
    pub delay: u64,
}

/// One evaluated value pushed to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentValue {
    /// Reporting host name
    pub host: String,

    /// Metric key
    pub key: String,

    /// Value text (or the unsupported sentinel)
    pub value: String,

    /// Unix timestamp of the evaluation
    pub clock: i64,
}

/// Requests sent from the agent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request")]
pub enum AgentRequest {
    /// Ask for the list of active checks for `host`
    #[serde(rename = "active checks")]
    ActiveChecks { host: String },

    /// Push a batch of evaluated values
    #[serde(rename = "agent data")]
    AgentData {
        data: Vec<AgentValue>,
        /// Unix timestamp of the push
        clock: i64,
    },
}

impl AgentRequest {
    /// Creates an active check list request.
    pub fn active_checks(host: impl Into<String>) -> Self {
        Self::ActiveChecks { host: host.into() }
    }

    /// Creates a value push.
    pub fn agent_data(data: Vec<AgentValue>, clock: i64) -> Self {
        Self::AgentData { data, clock }
    }
}

/// Outcome reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// Responses sent from the server to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    /// Whether the request was accepted
    pub response: ResponseStatus,

    /// Active check list (only for `active checks` requests)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<ActiveCheck>,

    /// Free-form detail (processing summary or failure reason)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl ServerResponse {
    /// Creates a successful check list response.
    pub fn checks(data: Vec<ActiveCheck>) -> Self {
        Self {
            response: ResponseStatus::Success,
            data,
            info: None,
        }
    }

    /// Creates a successful acknowledgement.
    pub fn ack(info: &str) -> Self {
        Self {
            response: ResponseStatus::Success,
            data: Vec::new(),
            info: Some(info.to_string()),
        }
    }

    /// Creates a failure response.
    pub fn failed(info: &str) -> Self {
        Self {
            response: ResponseStatus::Failed,
            data: Vec::new(),
            info: Some(info.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.response == ResponseStatus::Success
    }
}
