//! Passive check serving: shared TCP listener and the worker accept loop.
//!
//! Every [`PassiveWorker`] accepts on the same listener; the kernel decides
//! which worker receives each incoming connection. A worker serves its
//! connection to completion before accepting the next one.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────────────────┐
//!              │ Arc<TcpListener> (shared)│
//!              └────────────┬─────────────┘
//!          accept()         │          accept()
//!        ┌──────────────────┼──────────────────┐
//!        ▼                  ▼                  ▼
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │PassiveWorker0│  │PassiveWorker1│  │PassiveWorkerN│
//! └──────┬───────┘  └──────────────┘  └──────────────┘
//!        │ SecurityPolicy::evaluate → deny: drop
//!        ▼
//! ┌──────────────┐     ┌────────────────┐
//! │serve_request │────▶│ MetricRegistry │
//! └──────────────┘     └────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept and connection errors are logged and the loop continues

mod connection;

pub use connection::{read_request, serve_request, ConnectionError, Exchange, MAX_REQUEST_LEN};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hostmon_core::{AgentConfig, MetricRegistry, SecurityPolicy};

/// Listen backlog for the shared socket
const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed accept (e.g. descriptor exhaustion)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Binds the shared passive listener.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let setup = |error: std::io::Error| ServerError::SocketSetup {
        addr,
        error: error.to_string(),
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(setup)?;

    socket.set_reuseaddr(true).map_err(setup)?;
    socket.bind(addr).map_err(setup)?;
    let listener = socket.listen(LISTEN_BACKLOG).map_err(setup)?;

    info!(addr = %addr, "Passive listener bound");
    Ok(listener)
}

/// Accept loop serving passive checks on the shared listener.
pub struct PassiveWorker {
    /// Worker slot index (for logs)
    index: usize,

    /// Listener shared with the sibling workers
    listener: Arc<TcpListener>,

    /// Admission policy
    policy: Arc<SecurityPolicy>,

    /// Metric evaluation
    registry: Arc<dyn MetricRegistry>,

    /// Per-request deadline
    timeout: Duration,

    /// Close accepted sockets without TIME_WAIT
    no_linger: bool,

    /// Cancellation token for shutdown
    cancel_token: CancellationToken,

    /// Requests served by this worker only
    requests: AtomicU64,
}

impl PassiveWorker {
    /// Creates a worker bound to the shared listener.
    pub fn new(
        index: usize,
        listener: Arc<TcpListener>,
        policy: Arc<SecurityPolicy>,
        registry: Arc<dyn MetricRegistry>,
        config: &AgentConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            index,
            listener,
            policy,
            registry,
            timeout: config.timeout,
            no_linger: config.no_linger,
            cancel_token,
            requests: AtomicU64::new(0),
        }
    }

    /// Returns the number of requests this worker has answered.
    pub fn requests_served(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Runs the accept loop until the cancellation token fires.
    pub async fn run(&self) {
        info!(worker = self.index, "Passive worker started");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!(worker = self.index, "Passive worker shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer).await,
                        Err(e) => {
                            error!(worker = self.index, error = %e, "Failed to accept connection");
                            sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    /// Admits or drops one connection, then serves it.
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if !self.policy.evaluate(peer.ip()).is_allowed() {
            // Dropped unread; the peer sees EOF with no data
            return;
        }

        if self.no_linger {
            if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
                warn!(worker = self.index, error = %e, "Cannot set SO_LINGER");
            }
        }

        match serve_request(stream, self.registry.as_ref(), self.timeout).await {
            Ok(exchange) => {
                let served = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    worker = self.index,
                    peer = %peer,
                    key = %exchange.key,
                    supported = exchange.supported,
                    bytes = exchange.reply_len,
                    requests = served,
                    "Request answered"
                );
            }
            Err(ConnectionError::Timeout) => {
                warn!(worker = self.index, peer = %peer, "Timeout while answering request");
            }
            Err(e) => {
                debug!(worker = self.index, peer = %peer, error = %e, "Connection closed without reply");
            }
        }
    }
}

/// Errors that can occur while setting up the passive listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Cannot bind to {addr}: {error}. Another agent already running?")]
    SocketSetup { addr: SocketAddr, error: String },
}
