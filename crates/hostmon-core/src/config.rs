//! Agent configuration and the key-value configuration file loader.
//!
//! The file format is one `Key=Value` pair per line. Blank lines and lines
//! starting with `#` are ignored. Scalar keys may repeat (the last one
//! wins); `UserParameter` accumulates.
//!
//! ```text
//! Server=10.0.0.5,192.168.1.*
//! Hostname=web-01
//! Timeout=5
//! UserParameter=mysql.ping,mysqladmin ping | grep -c alive
//! ```
//!
//! Validation is exhaustive: out-of-range integers and missing mandatory
//! keys are rejected, never clamped.

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostmon/hostmond.conf";

/// Default passive listen port
pub const DEFAULT_LISTEN_PORT: u16 = 10050;

/// Default server port for active checks
pub const DEFAULT_SERVER_PORT: u16 = 10051;

/// Default per-request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 3;

/// Default number of workers (one of them is the active session)
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Default active check list refresh interval in seconds
pub const DEFAULT_REFRESH_SECS: u64 = 120;

/// Default debug level (warning)
pub const DEFAULT_DEBUG_LEVEL: u8 = 3;

const PID_FILE_NAME: &str = "hostmond.pid";

/// Bounds for an integer parameter.
struct IntParam {
    key: &'static str,
    min: i64,
    max: i64,
}

const TIMEOUT: IntParam = IntParam { key: "Timeout", min: 1, max: 30 };
const NO_TIME_WAIT: IntParam = IntParam { key: "NoTimeWait", min: 0, max: 1 };
const LISTEN_PORT: IntParam = IntParam { key: "ListenPort", min: 1024, max: 32767 };
const SERVER_PORT: IntParam = IntParam { key: "ServerPort", min: 1024, max: 32767 };
const DEBUG_LEVEL: IntParam = IntParam { key: "DebugLevel", min: 0, max: 4 };
const START_AGENTS: IntParam = IntParam { key: "StartAgents", min: 1, max: 16 };
const REFRESH_ACTIVE_CHECKS: IntParam = IntParam {
    key: "RefreshActiveChecks",
    min: 60,
    max: 3600,
};

/// Validated, immutable agent configuration.
///
/// Constructed once at startup and shared by reference with every
/// component. Nothing mutates it after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Host patterns allowed to query the agent; the first entry is also
    /// the server contacted for active checks
    pub allowed_hosts: Vec<String>,

    /// Name this agent reports itself as
    pub hostname: String,

    /// Address to bind the listener to (`None` = any IPv4 address)
    pub listen_ip: Option<IpAddr>,

    /// Passive listen port
    pub listen_port: u16,

    /// Server port for active checks
    pub server_port: u16,

    /// Deadline for one passive exchange and for each active I/O step
    pub timeout: Duration,

    /// Close accepted sockets with `SO_LINGER` = 0
    pub no_linger: bool,

    /// Total worker count, including the active session slot
    pub worker_count: usize,

    /// Active check list refresh interval
    pub refresh_interval: Duration,

    /// Log verbosity (0 = off .. 4 = debug)
    pub debug_level: u8,

    /// User-defined check keys mapped to shell commands
    pub user_parameters: BTreeMap<String, String>,

    /// Pid-file location
    pub pid_file: PathBuf,

    /// Log file location (`None` = stderr)
    pub log_file: Option<PathBuf>,
}

impl AgentConfig {
    /// Creates a configuration with every optional parameter at its default.
    pub fn new(allowed_hosts: Vec<String>, hostname: impl Into<String>) -> Self {
        Self {
            allowed_hosts,
            hostname: hostname.into(),
            listen_ip: None,
            listen_port: DEFAULT_LISTEN_PORT,
            server_port: DEFAULT_SERVER_PORT,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            no_linger: false,
            worker_count: DEFAULT_WORKER_COUNT,
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
            debug_level: DEFAULT_DEBUG_LEVEL,
            user_parameters: BTreeMap::new(),
            pid_file: default_pid_file(),
            log_file: None,
        }
    }

    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&contents)
    }

    /// Parses and validates configuration file contents.
    pub fn parse(contents: &str) -> ConfigResult<Self> {
        let mut builder = Builder::default();

        for (index, raw) in contents.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (key, value) = trimmed.split_once('=').ok_or_else(|| ConfigError::Syntax {
                line,
                content: trimmed.to_string(),
            })?;
            builder.apply(line, key.trim(), value.trim())?;
        }

        builder.finish()
    }

    /// Returns the socket address the passive listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self.listen_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.listen_port)
    }

    /// Returns how many passive workers the supervisor spawns.
    pub fn passive_workers(&self) -> usize {
        self.worker_count.saturating_sub(1)
    }

    /// Returns the server contacted for active checks.
    pub fn active_server(&self) -> Option<&str> {
        self.allowed_hosts.first().map(String::as_str)
    }
}

/// Returns the default pid-file path inside the platform temp directory.
pub fn default_pid_file() -> PathBuf {
    std::env::temp_dir().join(PID_FILE_NAME)
}

/// Accumulates parameters line by line before final validation.
#[derive(Default)]
struct Builder {
    allowed_hosts: Option<Vec<String>>,
    hostname: Option<String>,
    pid_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    timeout: Option<u64>,
    no_linger: Option<bool>,
    listen_port: Option<u16>,
    server_port: Option<u16>,
    listen_ip: Option<IpAddr>,
    debug_level: Option<u8>,
    worker_count: Option<usize>,
    refresh_interval: Option<u64>,
    user_parameters: BTreeMap<String, String>,
}

impl Builder {
    fn apply(&mut self, line: usize, key: &str, value: &str) -> ConfigResult<()> {
        match key {
            "Server" => {
                let hosts: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(String::from)
                    .collect();
                if hosts.is_empty() {
                    return Err(ConfigError::EmptyValue { line, key: "Server" });
                }
                self.allowed_hosts = Some(hosts);
            }
            "Hostname" => self.hostname = Some(non_empty(line, "Hostname", value)?),
            "PidFile" => self.pid_file = Some(PathBuf::from(non_empty(line, "PidFile", value)?)),
            "LogFile" => self.log_file = Some(PathBuf::from(non_empty(line, "LogFile", value)?)),
            "Timeout" => self.timeout = Some(parse_int(line, &TIMEOUT, value)?),
            "NoTimeWait" => self.no_linger = Some(parse_int::<u8>(line, &NO_TIME_WAIT, value)? == 1),
            "ListenPort" => self.listen_port = Some(parse_int(line, &LISTEN_PORT, value)?),
            "ServerPort" => self.server_port = Some(parse_int(line, &SERVER_PORT, value)?),
            "ListenIP" => {
                let ip = value.parse().map_err(|_| ConfigError::InvalidListenIp {
                    line,
                    value: value.to_string(),
                })?;
                self.listen_ip = Some(ip);
            }
            "DebugLevel" => self.debug_level = Some(parse_int(line, &DEBUG_LEVEL, value)?),
            "StartAgents" => self.worker_count = Some(parse_int(line, &START_AGENTS, value)?),
            "RefreshActiveChecks" => {
                self.refresh_interval = Some(parse_int(line, &REFRESH_ACTIVE_CHECKS, value)?)
            }
            "UserParameter" => {
                let (check, command) = value
                    .split_once(',')
                    .map(|(k, c)| (k.trim(), c.trim()))
                    .filter(|(k, c)| !k.is_empty() && !c.is_empty())
                    .ok_or_else(|| ConfigError::InvalidUserParameter {
                        line,
                        value: value.to_string(),
                    })?;
                self.user_parameters
                    .insert(check.to_string(), command.to_string());
            }
            other => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: other.to_string(),
                })
            }
        }
        Ok(())
    }

    fn finish(self) -> ConfigResult<AgentConfig> {
        let allowed_hosts = self
            .allowed_hosts
            .ok_or(ConfigError::MissingMandatory { key: "Server" })?;
        let hostname = self
            .hostname
            .ok_or(ConfigError::MissingMandatory { key: "Hostname" })?;

        let mut config = AgentConfig::new(allowed_hosts, hostname);
        config.listen_ip = self.listen_ip;
        config.user_parameters = self.user_parameters;
        config.log_file = self.log_file;
        if let Some(pid_file) = self.pid_file {
            config.pid_file = pid_file;
        }
        if let Some(secs) = self.timeout {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(no_linger) = self.no_linger {
            config.no_linger = no_linger;
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(port) = self.server_port {
            config.server_port = port;
        }
        if let Some(level) = self.debug_level {
            config.debug_level = level;
        }
        if let Some(count) = self.worker_count {
            config.worker_count = count;
        }
        if let Some(secs) = self.refresh_interval {
            config.refresh_interval = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn non_empty(line: usize, key: &'static str, value: &str) -> ConfigResult<String> {
    if value.is_empty() {
        return Err(ConfigError::EmptyValue { line, key });
    }
    Ok(value.to_string())
}

fn parse_int<T: TryFrom<i64>>(line: usize, param: &IntParam, value: &str) -> ConfigResult<T> {
    let parsed: i64 = value.parse().map_err(|_| ConfigError::NotAnInteger {
        line,
        key: param.key,
        value: value.to_string(),
    })?;

    let out_of_range = || ConfigError::OutOfRange {
        line,
        key: param.key,
        value: parsed,
        min: param.min,
        max: param.max,
    };

    if parsed < param.min || parsed > param.max {
        return Err(out_of_range());
    }
    T::try_from(parsed).map_err(|_| out_of_range())
}
