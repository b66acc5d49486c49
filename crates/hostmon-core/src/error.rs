//! Error types for configuration loading and admission policy construction.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating the agent configuration.
///
/// Every variant is fatal at startup: the agent refuses to open a socket
/// or spawn a worker when any of these is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    /// A non-comment line is not of the form `Key=Value`
    #[error("Line {line}: expected Key=Value, got '{content}'")]
    Syntax { line: usize, content: String },

    /// The key is not a recognized parameter
    #[error("Line {line}: unrecognized parameter '{key}'")]
    UnknownKey { line: usize, key: String },

    /// An integer parameter holds something else
    #[error("Line {line}: {key} must be an integer, got '{value}'")]
    NotAnInteger {
        line: usize,
        key: &'static str,
        value: String,
    },

    /// An integer parameter is outside its declared bounds
    #[error("Line {line}: {key}={value} is out of range ({min}-{max})")]
    OutOfRange {
        line: usize,
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A string parameter was given an empty value
    #[error("Line {line}: {key} must not be empty")]
    EmptyValue { line: usize, key: &'static str },

    /// A mandatory parameter never appeared in the file
    #[error("Missing mandatory parameter {key}")]
    MissingMandatory { key: &'static str },

    /// `UserParameter` is not a `key,command` pair
    #[error("Line {line}: UserParameter must be 'key,command', got '{value}'")]
    InvalidUserParameter { line: usize, value: String },

    /// `ListenIP` is not a literal IP address
    #[error("Line {line}: ListenIP '{value}' is not an IP address")]
    InvalidListenIp { line: usize, value: String },

    /// The `Server` list could not be turned into an admission policy
    #[error("Invalid Server list: {0}")]
    Policy(#[from] PolicyError),
}

/// Errors raised while building a [`SecurityPolicy`](crate::SecurityPolicy).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// An entry is neither an address form nor a valid hostname
    #[error("Invalid host pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Nothing usable remained after parsing and resolution
    #[error("No usable host pattern in allowed hosts list")]
    Empty,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
