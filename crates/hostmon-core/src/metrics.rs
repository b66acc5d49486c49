//! Metric evaluation: textual key in, textual value (or "unsupported") out.
//!
//! [`MetricRegistry`] is the seam between the serving engine and whatever
//! computes values. [`AgentMetrics`] is the built-in registry: user
//! parameters from the configuration first, then the native keys below.
//!
//! | Key | Value |
//! |---|---|
//! | `agent.ping` | `1` |
//! | `agent.version` | crate version |
//! | `agent.hostname` | configured `Hostname` |
//! | `system.uptime` | seconds since boot |
//! | `system.hostname` | OS host name |
//! | `system.localtime` | unix timestamp |
//! | `system.cpu.num` | logical CPU count |
//! | `system.cpu.load[<all>,<avg1\|avg5\|avg15>]` | load average |
//! | `vm.memory.size[<total\|free\|used\|available>]` | bytes |
//! | `proc.num` | process count |

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use sysinfo::System;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::key::MetricKey;

/// Reply text for keys the agent cannot evaluate
pub const NOT_SUPPORTED: &str = "ZBX_NOTSUPPORTED";

/// Result of evaluating one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricValue {
    Value(String),
    Unsupported,
}

impl MetricValue {
    /// Returns the text sent back to the requester.
    pub fn as_reply(&self) -> &str {
        match self {
            MetricValue::Value(v) => v,
            MetricValue::Unsupported => NOT_SUPPORTED,
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, MetricValue::Value(_))
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Value(value)
    }
}

/// Maps a metric key to its current value.
///
/// Implementations are shared read-only between workers and must not
/// rely on mutable state shared across calls.
#[async_trait]
pub trait MetricRegistry: Send + Sync {
    async fn evaluate(&self, key: &str) -> MetricValue;
}

/// Built-in registry backed by `sysinfo` and user parameters.
#[derive(Debug, Clone)]
pub struct AgentMetrics {
    hostname: String,
    user_parameters: BTreeMap<String, String>,
}

impl AgentMetrics {
    pub fn new(hostname: impl Into<String>, user_parameters: BTreeMap<String, String>) -> Self {
        Self {
            hostname: hostname.into(),
            user_parameters,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.hostname.clone(), config.user_parameters.clone())
    }

    /// Runs a user parameter command and returns its trimmed stdout.
    async fn run_user_parameter(&self, key: &str, command: &str) -> MetricValue {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout);
                MetricValue::Value(text.trim_end().to_string())
            }
            Ok(out) => {
                debug!(key = %key, status = %out.status, "User parameter exited with failure");
                MetricValue::Unsupported
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to run user parameter");
                MetricValue::Unsupported
            }
        }
    }

    async fn builtin(&self, key: &MetricKey<'_>) -> Option<String> {
        match key.name() {
            "agent.ping" => Some("1".to_string()),
            "agent.version" => Some(env!("CARGO_PKG_VERSION").to_string()),
            "agent.hostname" => Some(self.hostname.clone()),
            "system.uptime" => Some(System::uptime().to_string()),
            "system.hostname" => System::host_name(),
            "system.localtime" => Some(chrono::Utc::now().timestamp().to_string()),
            "system.cpu.num" => {
                sample(|sys| {
                    sys.refresh_all();
                    Some(sys.cpus().len().to_string())
                })
                .await
            }
            "system.cpu.load" => cpu_load(key.param(0), key.param(1)),
            "vm.memory.size" => {
                let mode = key.param(0).unwrap_or("total").to_string();
                sample(move |sys| {
                    sys.refresh_memory();
                    let bytes = match mode.as_str() {
                        "total" => sys.total_memory(),
                        "free" => sys.free_memory(),
                        "used" => sys.used_memory(),
                        "available" => sys.available_memory(),
                        _ => return None,
                    };
                    Some(bytes.to_string())
                })
                .await
            }
            "proc.num" => {
                sample(|sys| {
                    sys.refresh_all();
                    Some(sys.processes().len().to_string())
                })
                .await
            }
            _ => None,
        }
    }
}

#[async_trait]
impl MetricRegistry for AgentMetrics {
    async fn evaluate(&self, key: &str) -> MetricValue {
        if let Some(command) = self.user_parameters.get(key) {
            return self.run_user_parameter(key, command).await;
        }

        let Some(parsed) = MetricKey::parse(key) else {
            debug!(key = %key, "Malformed metric key");
            return MetricValue::Unsupported;
        };

        match self.builtin(&parsed).await {
            Some(value) => MetricValue::Value(value),
            None => {
                debug!(key = %key, "Unsupported metric key");
                MetricValue::Unsupported
            }
        }
    }
}

/// Runs a sysinfo query on the blocking pool with a fresh `System`.
async fn sample<F>(query: F) -> Option<String>
where
    F: FnOnce(&mut System) -> Option<String> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut sys = System::new();
        query(&mut sys)
    })
    .await
    .ok()
    .flatten()
}

fn cpu_load(cpu: Option<&str>, mode: Option<&str>) -> Option<String> {
    if !matches!(cpu, None | Some("all")) {
        return None;
    }
    let load = System::load_average();
    let value = match mode.unwrap_or("avg1") {
        "avg1" => load.one,
        "avg5" => load.five,
        "avg15" => load.fifteen,
        _ => return None,
    };
    Some(format!("{value:.6}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentMetrics {
        let mut params = BTreeMap::new();
        params.insert("custom.echo".to_string(), "echo hello".to_string());
        params.insert("custom.fail".to_string(), "exit 3".to_string());
        params.insert("agent.ping".to_string(), "echo overridden".to_string());
        AgentMetrics::new("test-host", params)
    }

    #[test]
    fn test_reply_text() {
        assert_eq!(MetricValue::Value("42".into()).as_reply(), "42");
        assert_eq!(MetricValue::Unsupported.as_reply(), NOT_SUPPORTED);
        assert!(!MetricValue::Unsupported.is_supported());
    }

    #[tokio::test]
    async fn test_builtin_keys() {
        let metrics = AgentMetrics::new("test-host", BTreeMap::new());
        assert_eq!(metrics.evaluate("agent.ping").await, MetricValue::Value("1".into()));
        assert_eq!(
            metrics.evaluate("agent.hostname").await,
            MetricValue::Value("test-host".into())
        );
        assert_eq!(
            metrics.evaluate("agent.version").await.as_reply(),
            env!("CARGO_PKG_VERSION")
        );

        let uptime = metrics.evaluate("system.uptime").await;
        assert!(uptime.as_reply().parse::<u64>().is_ok());

        let total = metrics.evaluate("vm.memory.size[total]").await;
        assert!(total.as_reply().parse::<u64>().is_ok());
        let default_mode = metrics.evaluate("vm.memory.size").await;
        assert!(default_mode.is_supported());
    }

    #[tokio::test]
    async fn test_unsupported_keys() {
        let metrics = AgentMetrics::new("test-host", BTreeMap::new());
        for key in ["bogus.key", "vm.memory.size[shared-ish]", "system.cpu.load[0]", "bad key["] {
            assert_eq!(metrics.evaluate(key).await, MetricValue::Unsupported, "{key}");
        }
    }

    #[tokio::test]
    async fn test_user_parameters() {
        let metrics = registry();
        assert_eq!(
            metrics.evaluate("custom.echo").await,
            MetricValue::Value("hello".into())
        );
        assert_eq!(metrics.evaluate("custom.fail").await, MetricValue::Unsupported);
        assert_eq!(
            metrics.evaluate("agent.ping").await,
            MetricValue::Value("overridden".into())
        );
    }

    #[test]
    fn test_cpu_load_modes() {
        assert!(cpu_load(None, None).is_some());
        assert!(cpu_load(Some("all"), Some("avg15")).is_some());
        assert!(cpu_load(None, Some("avg2")).is_none());
    }
}
