//! hostmon daemon - supervised passive workers and active check session
//!
//! This crate provides the runtime of the `hostmond` agent:
//! - `supervisor` - Worker pool, pid-file and shutdown policy
//! - `server` - Shared TCP listener, passive workers and the request exchange
//! - `active` - Active check session (fetch, evaluate, push, sleep)
//! - `cli` / `logging` / `signals` / `pidfile` - Process plumbing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Supervisor                           │
//! │          (pid-file, CancellationToken, JoinSet)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────┐  │
//! │  │ PassiveWorker 0 │  │ PassiveWorker N │  │ActiveSession│  │
//! │  └────────┬────────┘  └────────┬────────┘  └──────┬──────┘  │
//! │           │ accept()           │                  │ TCP     │
//! │           ▼                    ▼                  ▼         │
//! │  ┌──────────────────────────────────┐   ┌────────────────┐  │
//! │  │  Arc<TcpListener> (ListenPort)   │   │ Server (JSON)  │  │
//! │  └──────────────────────────────────┘   └────────────────┘  │
//! │                                                             │
//! │              all workers ──▶ Arc<dyn MetricRegistry>        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - A worker that panics anyway is caught by the supervisor, which stops
//!   the whole agent

pub mod active;
pub mod cli;
pub mod logging;
pub mod pidfile;
pub mod server;
pub mod signals;
pub mod supervisor;

pub use active::{ActiveError, ActiveSession, ActiveSessionConfig, SessionState, SessionStats};
pub use cli::{exit_code, failure_code, parse_args, Invocation};
pub use pidfile::{PidFile, PidFileError};
pub use server::{bind_listener, serve_request, ConnectionError, PassiveWorker, ServerError};
pub use supervisor::{
    RunningAgent, Shutdown, Supervisor, SupervisorError, WorkerExit, WorkerRole, WorkerSlot,
};
