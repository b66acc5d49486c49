//! Worker supervision.
//!
//! The supervisor owns the pid-file, the shared listener and a fixed set of
//! worker tasks: `StartAgents - 1` passive workers and one active session.
//! It runs until a termination signal arrives or any worker ends on its
//! own, then stops everything. There is no degraded mode: the agent runs
//! with its full worker set or not at all, and restarting is left to the
//! service manager.
//!
//! # Shutdown sequence
//!
//! 1. Cancel the shared token
//! 2. Give workers [`SHUTDOWN_GRACE`] to return
//! 3. Abort whatever is still running and wait for it
//! 4. Remove the pid-file

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{self, AbortHandle, JoinError, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hostmon_core::{AgentConfig, ConfigError, MetricRegistry, SecurityPolicy};

use crate::active::{ActiveSession, ActiveSessionConfig};
use crate::cli::exit_code;
use crate::pidfile::{PidFile, PidFileError};
use crate::server::{bind_listener, PassiveWorker, ServerError};
use crate::signals::TerminationSignals;

/// Time workers get to return on their own after cancellation
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Value a worker task yields when it ends.
type WorkerResult = Result<(), String>;

/// What a worker slot runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Passive,
    Active,
}

/// One supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSlot {
    pub index: usize,
    pub role: WorkerRole,
    pub task_id: task::Id,
}

impl fmt::Display for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            WorkerRole::Passive => "passive",
            WorkerRole::Active => "active",
        };
        write!(f, "#{} ({role})", self.index)
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Returned without being asked to
    Returned,
    /// Returned an error
    Failed(String),
    Panicked,
    /// Aborted from outside the supervisor
    Aborted,
}

/// Why the agent stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shutdown {
    /// A termination request (signal or token)
    Terminated,
    /// A worker ended while no shutdown was requested
    WorkerExited { slot: WorkerSlot, exit: WorkerExit },
}

impl Shutdown {
    pub fn exit_code(&self) -> i32 {
        match self {
            Shutdown::Terminated => exit_code::TERMINATED,
            Shutdown::WorkerExited { .. } => exit_code::SOFTWARE,
        }
    }
}

/// Prepares the agent; nothing is opened until [`Supervisor::start`].
pub struct Supervisor {
    config: AgentConfig,
    policy: Arc<SecurityPolicy>,
    registry: Arc<dyn MetricRegistry>,
    cancel_token: CancellationToken,
}

impl Supervisor {
    /// Builds the admission policy; an unusable host list is a config error.
    pub fn new(
        config: AgentConfig,
        registry: Arc<dyn MetricRegistry>,
    ) -> Result<Self, SupervisorError> {
        let policy = SecurityPolicy::new(&config.allowed_hosts).map_err(ConfigError::from)?;
        Ok(Self {
            config,
            policy: Arc::new(policy),
            registry,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Token that stops the agent when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Cancels the agent on SIGTERM, SIGINT or SIGQUIT.
    pub fn install_signal_handlers(&self) -> Result<(), SupervisorError> {
        let mut signals =
            TerminationSignals::register().map_err(|e| SupervisorError::Signals(e.to_string()))?;
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = signals.recv() => token.cancel(),
            }
        });
        Ok(())
    }

    /// Writes the pid-file, binds the listener and spawns every worker.
    ///
    /// On error nothing is left behind: the pid-file is removed and no
    /// worker has been spawned.
    pub async fn start(self) -> Result<RunningAgent, SupervisorError> {
        let active_config = ActiveSessionConfig::from_agent(&self.config)
            .ok_or(ConfigError::MissingMandatory { key: "Server" })?;

        let pid_file = PidFile::create(&self.config.pid_file)?;
        let listener = Arc::new(bind_listener(self.config.listen_addr())?);
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::SocketSetup {
                addr: self.config.listen_addr(),
                error: e.to_string(),
            })?;

        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut slots = Vec::with_capacity(self.config.worker_count);
        let mut handles = Vec::with_capacity(self.config.worker_count);

        for index in 0..self.config.passive_workers() {
            let worker = PassiveWorker::new(
                index,
                Arc::clone(&listener),
                Arc::clone(&self.policy),
                Arc::clone(&self.registry),
                &self.config,
                self.cancel_token.clone(),
            );
            let handle = workers.spawn(async move {
                worker.run().await;
                Ok(())
            });
            slots.push(slot(index, WorkerRole::Passive, &handle));
            handles.push(handle);
        }

        let session = ActiveSession::new(
            active_config,
            Arc::clone(&self.registry),
            self.cancel_token.clone(),
        );
        let handle = workers.spawn(async move {
            let stats = session.run().await.map_err(|e| e.to_string())?;
            debug!(?stats, "Active session finished");
            Ok(())
        });
        slots.push(slot(slots.len(), WorkerRole::Active, &handle));
        handles.push(handle);

        info!(
            addr = %local_addr,
            passive = self.config.passive_workers(),
            pid_file = %pid_file.path().display(),
            "Agent started"
        );

        Ok(RunningAgent {
            local_addr,
            slots,
            handles,
            workers,
            pid_file,
            cancel_token: self.cancel_token,
        })
    }
}

fn slot(index: usize, role: WorkerRole, handle: &AbortHandle) -> WorkerSlot {
    WorkerSlot {
        index,
        role,
        task_id: handle.id(),
    }
}

/// A started agent.
pub struct RunningAgent {
    local_addr: SocketAddr,
    slots: Vec<WorkerSlot>,
    handles: Vec<AbortHandle>,
    workers: JoinSet<WorkerResult>,
    pid_file: PidFile,
    cancel_token: CancellationToken,
}

impl RunningAgent {
    /// Address the passive listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.pid_file.path().to_path_buf()
    }

    /// Aborts one worker as if it had died.
    ///
    /// Returns false if no slot has this index.
    pub fn kill_worker(&self, index: usize) -> bool {
        match self.handles.get(index) {
            Some(handle) => {
                warn!(slot = index, "Killing worker");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Runs until a fatal condition, then stops every worker and removes
    /// the pid-file.
    pub async fn wait(mut self) -> Shutdown {
        let by_task: HashMap<task::Id, WorkerSlot> =
            self.slots.iter().map(|s| (s.task_id, *s)).collect();

        let shutdown = loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => break Shutdown::Terminated,

                Some(joined) = self.workers.join_next_with_id() => {
                    let (id, exit) = classify(joined);
                    match by_task.get(&id) {
                        Some(slot) => break Shutdown::WorkerExited { slot: *slot, exit },
                        None => warn!(task = %id, "Untracked task ended"),
                    }
                }
            }
        };

        match &shutdown {
            Shutdown::Terminated => info!("Shutdown requested, stopping workers"),
            Shutdown::WorkerExited { slot, exit } => {
                error!(slot = %slot, exit = ?exit, "Worker ended unexpectedly, stopping agent")
            }
        }

        self.stop().await;
        shutdown
    }

    async fn stop(mut self) {
        self.cancel_token.cancel();

        let drained = timeout(SHUTDOWN_GRACE, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.workers.len(), "Aborting workers still running");
        }
        self.workers.shutdown().await;

        self.pid_file.remove();
        info!("Agent stopped");
    }
}

fn classify(joined: Result<(task::Id, WorkerResult), JoinError>) -> (task::Id, WorkerExit) {
    match joined {
        Ok((id, Ok(()))) => (id, WorkerExit::Returned),
        Ok((id, Err(e))) => (id, WorkerExit::Failed(e)),
        Err(e) if e.is_panic() => (e.id(), WorkerExit::Panicked),
        Err(e) => (e.id(), WorkerExit::Aborted),
    }
}

/// Errors that prevent the agent from starting.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] ServerError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error("Cannot install signal handlers: {0}")]
    Signals(String),
}

impl SupervisorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Config(_) => exit_code::CONFIG,
            SupervisorError::Bind(_) | SupervisorError::Signals(_) => exit_code::OS_ERROR,
            SupervisorError::PidFile(_) => exit_code::CANT_CREATE,
        }
    }
}
