//! Command-line parsing and process exit codes.
//!
//! `hostmond [-c <path>] [-h]`. Help and usage errors both exit with
//! [`exit_code::USAGE`]; only `--version` exits successfully.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{ArgAction, CommandFactory, Parser};

use hostmon_core::{ConfigError, DEFAULT_CONFIG_PATH};

use crate::logging::LoggingError;
use crate::supervisor::SupervisorError;

/// Process exit codes (sysexits.h values where one fits).
pub mod exit_code {
    /// Orderly shutdown after a termination signal
    pub const TERMINATED: i32 = 1;
    /// Bad command line, or `-h`
    pub const USAGE: i32 = 64;
    /// A worker terminated unexpectedly
    pub const SOFTWARE: i32 = 70;
    /// Socket setup failed
    pub const OS_ERROR: i32 = 71;
    /// The pid-file could not be created
    pub const CANT_CREATE: i32 = 73;
    /// The configuration could not be loaded
    pub const CONFIG: i32 = 78;
}

/// hostmon agent - answers passive metric queries and pushes active checks
#[derive(Parser, Debug)]
#[command(name = "hostmond", version, about, disable_help_flag = true)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', value_name = "path", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print usage and exit
    #[arg(short = 'h', long = "help", action = ArgAction::SetTrue)]
    usage: bool,
}

/// What the process should do after argument parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Start the agent with this configuration file
    Run { config: PathBuf },

    /// Print `message` and exit with `code`
    Exit { message: String, code: i32 },
}

/// Parses a full argument vector (including the program name).
pub fn parse_args<I, T>(args: I) -> Invocation
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Args::try_parse_from(args) {
        Ok(args) if args.usage => Invocation::Exit {
            message: usage(),
            code: exit_code::USAGE,
        },
        Ok(args) => Invocation::Run {
            config: args.config,
        },
        Err(e) if e.kind() == ErrorKind::DisplayVersion => Invocation::Exit {
            message: e.to_string(),
            code: 0,
        },
        Err(e) => Invocation::Exit {
            message: e.to_string(),
            code: exit_code::USAGE,
        },
    }
}

/// Renders the full usage text.
pub fn usage() -> String {
    Args::command().render_help().to_string()
}

/// Maps a startup failure to its exit code.
///
/// The first typed error found in the context chain decides; anything
/// unrecognised is [`exit_code::SOFTWARE`].
pub fn failure_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<SupervisorError>() {
            return e.exit_code();
        }
        if cause.is::<ConfigError>() {
            return exit_code::CONFIG;
        }
        if cause.is::<LoggingError>() {
            return exit_code::CANT_CREATE;
        }
    }
    exit_code::SOFTWARE
}
