//! Active checks: fetch the check list from the server, evaluate, push.
//!
//! The session is a state machine running on its own timer, independent
//! of the passive workers:
//!
//! ```text
//! Idle ─▶ Refreshing ─▶ Executing ─▶ Pushing ─▶ Sleep ─┐
//!              ▲    │ (network error)      │ (error)   │
//!              │    └──────────────────────┴─────▶ Sleep
//!              └─────────────────────────────────────────┘
//! ```
//!
//! Network failures never leave this module: they are logged, the cycle is
//! skipped and the session sleeps until the next deadline. A failed refresh
//! is retried after the full refresh interval, forever. Only an internal
//! fault (a request that cannot be serialized) ends the session with an
//! error, which the supervisor treats like any other worker death.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostmon_core::{AgentConfig, MetricRegistry, MetricValue};
use hostmon_protocol::{
    decode_line, encode_line, ActiveCheck, AgentRequest, AgentValue, ProtocolError,
    ServerResponse, MAX_MESSAGE_SIZE,
};

/// Shortest per-key delay honoured, so a zero delay cannot spin the loop
const MIN_CHECK_DELAY: Duration = Duration::from_secs(1);

/// Longest per-key delay honoured; larger server values are capped
const MAX_CHECK_DELAY: Duration = Duration::from_secs(86_400);

/// Settings for the active session, derived from [`AgentConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSessionConfig {
    /// Server host name or address
    pub server: String,

    /// Server port
    pub port: u16,

    /// Host name sent with every request
    pub hostname: String,

    /// Time between check list refreshes (and between retries)
    pub refresh_interval: Duration,

    /// Bound on connect, on the request write and on the response read
    pub io_timeout: Duration,
}

impl ActiveSessionConfig {
    /// Derives the session settings; `None` if no server is configured.
    pub fn from_agent(config: &AgentConfig) -> Option<Self> {
        Some(Self {
            server: config.active_server()?.to_string(),
            port: config.server_port,
            hostname: config.hostname.clone(),
            refresh_interval: config.refresh_interval,
            io_timeout: config.timeout,
        })
    }
}

/// Position in the refresh/execute/push cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Refreshing,
    Executing,
    Pushing,
    Sleep,
}

/// Counters reported when the session stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub refreshes: u64,
    pub failed_refreshes: u64,
    pub pushes: u64,
    pub failed_pushes: u64,
    pub values_sent: u64,
}

/// A check from the current list with its own schedule.
#[derive(Debug, Clone)]
struct ScheduledCheck {
    key: String,
    delay: Duration,
    next_due: Instant,
}

/// Long-lived active check session.
pub struct ActiveSession {
    config: ActiveSessionConfig,
    registry: Arc<dyn MetricRegistry>,
    cancel_token: CancellationToken,
    state: SessionState,
    checks: Vec<ScheduledCheck>,
    next_refresh: Instant,
    pending: Vec<AgentValue>,
    stats: SessionStats,
}

impl ActiveSession {
    pub fn new(
        config: ActiveSessionConfig,
        registry: Arc<dyn MetricRegistry>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            cancel_token,
            state: SessionState::Idle,
            checks: Vec::new(),
            next_refresh: Instant::now(),
            pending: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the cycle until cancelled.
    ///
    /// Returns the counters on cancellation, or an error for an internal
    /// fault.
    pub async fn run(mut self) -> Result<SessionStats, ActiveError> {
        info!(
            server = %self.config.server,
            port = self.config.port,
            refresh_secs = self.config.refresh_interval.as_secs(),
            "Active session started"
        );

        while !self.cancel_token.is_cancelled() {
            let next = match self.state {
                SessionState::Idle => SessionState::Refreshing,
                SessionState::Refreshing => self.refresh().await?,
                SessionState::Executing => self.execute().await,
                SessionState::Pushing => self.push().await?,
                SessionState::Sleep => {
                    if !self.sleep().await {
                        break;
                    }
                    SessionState::Refreshing
                }
            };
            self.state = next;
        }

        debug!(stats = ?self.stats, "Active session stopped");
        Ok(self.stats)
    }

    /// Fetches a new check list if the refresh deadline has passed.
    async fn refresh(&mut self) -> Result<SessionState, ActiveError> {
        let now = Instant::now();
        if now < self.next_refresh {
            return Ok(SessionState::Executing);
        }
        self.next_refresh = now + self.config.refresh_interval;

        let request = AgentRequest::active_checks(self.config.hostname.clone());
        match self.exchange(&request).await {
            Ok(response) => {
                self.replace_checks(response.data, now);
                self.stats.refreshes += 1;
                info!(checks = self.checks.len(), "Active check list refreshed");
                Ok(SessionState::Executing)
            }
            Err(e) if e.is_recoverable() => {
                self.stats.failed_refreshes += 1;
                warn!(
                    server = %self.config.server,
                    error = %e,
                    retry_in_secs = self.config.refresh_interval.as_secs(),
                    "Active check refresh failed"
                );
                Ok(SessionState::Sleep)
            }
            Err(e) => Err(e),
        }
    }

    /// Replaces the check list wholesale; every new check is due now.
    ///
    /// Delays are clamped to `MIN_CHECK_DELAY..=MAX_CHECK_DELAY`.
    fn replace_checks(&mut self, checks: Vec<ActiveCheck>, now: Instant) {
        self.checks = checks
            .into_iter()
            .map(|check| ScheduledCheck {
                key: check.key,
                delay: Duration::from_secs(check.delay).clamp(MIN_CHECK_DELAY, MAX_CHECK_DELAY),
                next_due: now,
            })
            .collect();
    }

    /// Evaluates every due check into the pending batch.
    ///
    /// Each evaluation is bounded by `io_timeout`; a check that overruns is
    /// reported as unsupported.
    async fn execute(&mut self) -> SessionState {
        let now = Instant::now();
        let clock = chrono::Utc::now().timestamp();
        let eval_timeout = self.config.io_timeout;

        for check in self.checks.iter_mut().filter(|c| c.next_due <= now) {
            let value = match timeout(eval_timeout, self.registry.evaluate(&check.key)).await {
                Ok(value) => value,
                Err(_) => {
                    warn!(key = %check.key, "Timeout while evaluating active check");
                    MetricValue::Unsupported
                }
            };
            check.next_due = now + check.delay;
            self.pending.push(AgentValue {
                host: self.config.hostname.clone(),
                key: check.key.clone(),
                value: value.as_reply().to_string(),
                clock,
            });
        }

        SessionState::Pushing
    }

    /// Sends the pending batch; a failed push drops it.
    async fn push(&mut self) -> Result<SessionState, ActiveError> {
        if self.pending.is_empty() {
            return Ok(SessionState::Sleep);
        }

        let batch = std::mem::take(&mut self.pending);
        let count = batch.len() as u64;
        let request = AgentRequest::agent_data(batch, chrono::Utc::now().timestamp());

        match self.exchange(&request).await {
            Ok(response) => {
                self.stats.pushes += 1;
                self.stats.values_sent += count;
                debug!(values = count, info = ?response.info, "Active values pushed");
                Ok(SessionState::Sleep)
            }
            Err(e) if e.is_recoverable() => {
                self.stats.failed_pushes += 1;
                warn!(
                    server = %self.config.server,
                    values = count,
                    error = %e,
                    "Active value push failed, batch dropped"
                );
                Ok(SessionState::Sleep)
            }
            Err(e) => Err(e),
        }
    }

    /// Waits for the next refresh or check deadline.
    ///
    /// Returns false when cancelled.
    async fn sleep(&self) -> bool {
        let wake_at = self
            .checks
            .iter()
            .map(|c| c.next_due)
            .fold(self.next_refresh, Instant::min);

        tokio::select! {
            _ = self.cancel_token.cancelled() => false,
            _ = sleep_until(wake_at) => true,
        }
    }

    /// One request/response round trip on a fresh connection.
    async fn exchange(&self, request: &AgentRequest) -> Result<ServerResponse, ActiveError> {
        let line = encode_line(request).map_err(|e| match e {
            ProtocolError::MessageTooLarge { size, max } => ActiveError::Oversized { size, max },
            other => ActiveError::Encode(other.to_string()),
        })?;
        let io_timeout = self.config.io_timeout;

        let target = (self.config.server.as_str(), self.config.port);
        let stream = timeout(io_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| ActiveError::Timeout { stage: "connect" })?
            .map_err(|e| ActiveError::Connect {
                server: format!("{}:{}", self.config.server, self.config.port),
                error: e.to_string(),
            })?;

        let (reader, mut writer) = stream.into_split();

        timeout(io_timeout, async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| ActiveError::Timeout { stage: "write" })?
        .map_err(|e| ActiveError::Io(e.to_string()))?;

        let mut reader = BufReader::new(reader.take(MAX_MESSAGE_SIZE as u64 + 1));
        let mut response = String::new();
        let bytes_read = timeout(io_timeout, reader.read_line(&mut response))
            .await
            .map_err(|_| ActiveError::Timeout { stage: "read" })?
            .map_err(|e| ActiveError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ActiveError::InvalidResponse(
                "connection closed before response".to_string(),
            ));
        }

        let response: ServerResponse =
            decode_line(&response).map_err(|e| ActiveError::InvalidResponse(e.to_string()))?;

        if !response.is_success() {
            return Err(ActiveError::Rejected(
                response.info.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        Ok(response)
    }
}

/// Errors that can occur during an active session cycle.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ActiveError {
    #[error("Cannot connect to {server}: {error}")]
    Connect { server: String, error: String },

    #[error("Timed out during {stage}")]
    Timeout { stage: &'static str },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Request too large: {size} bytes (max: {max})")]
    Oversized { size: usize, max: usize },

    #[error("Cannot encode request: {0}")]
    Encode(String),
}

impl ActiveError {
    /// Returns true for failures that only skip the current cycle.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ActiveError::Encode(_))
    }
}
