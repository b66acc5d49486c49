//! hostmond - host monitoring agent
//!
//! Answers passive metric queries on `ListenPort` and pushes active check
//! values to the first `Server` entry.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration (/etc/hostmon/hostmond.conf)
//! hostmond
//!
//! # Run with a custom configuration file
//! hostmond -c ./hostmond.conf
//!
//! # Override the configured DebugLevel
//! RUST_LOG=hostmond=debug hostmond -c ./hostmond.conf
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT/SIGQUIT: stop all workers, remove the pid-file, exit 1
//!
//! The agent runs in the foreground; daemonizing and restarting are left
//! to the service manager.

use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use hostmon_core::{AgentConfig, AgentMetrics};
use hostmond::logging;
use hostmond::{failure_code, parse_args, Invocation, Shutdown, Supervisor};

fn main() {
    let code = match parse_args(std::env::args_os()) {
        Invocation::Exit { message, code } => {
            if code == 0 {
                print!("{message}");
            } else {
                eprint!("{message}");
            }
            code
        }
        Invocation::Run { config } => match run(&config) {
            Ok(shutdown) => shutdown.exit_code(),
            Err(e) => {
                eprintln!("hostmond: {e:#}");
                failure_code(&e)
            }
        },
    };

    process::exit(code);
}

/// Loads the configuration and sets up logging before any runtime starts.
fn run(config_path: &Path) -> Result<Shutdown> {
    let config = AgentConfig::load(config_path)
        .with_context(|| format!("Cannot load configuration {}", config_path.display()))?;
    logging::init(&config).context("Cannot set up logging")?;
    run_agent(config)
}

/// Runs the agent (async entry point).
#[tokio::main]
async fn run_agent(config: AgentConfig) -> Result<Shutdown> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        hostname = %config.hostname,
        "hostmon agent starting"
    );

    let registry = Arc::new(AgentMetrics::from_config(&config));
    let supervisor = Supervisor::new(config, registry)?;
    supervisor.install_signal_handlers()?;

    let agent = supervisor.start().await?;
    let shutdown = agent.wait().await;

    info!(exit_code = shutdown.exit_code(), "hostmon agent stopped");
    Ok(shutdown)
}
