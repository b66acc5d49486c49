//! Log sink setup.
//!
//! `DebugLevel` picks the default filter; `RUST_LOG` overrides it. With
//! `LogFile` set, output is appended to that file without ANSI colours.
//! Otherwise each event goes to the local syslog socket as one datagram,
//! falling back to stderr when no syslog daemon is listening.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{warn, Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use hostmon_core::AgentConfig;

/// Local syslog socket
const SYSLOG_SOCKET: &str = "/dev/log";

/// `LOG_DAEMON` facility code
const FACILITY_DAEMON: u8 = 3;

/// Program name used as the syslog tag
const SYSLOG_IDENT: &str = "hostmond";

/// Maps a `DebugLevel` value to a filter directive.
pub fn level_filter(debug_level: u8) -> &'static str {
    match debug_level {
        0 => "off",
        1 | 2 => "error",
        3 => "warn",
        _ => "debug",
    }
}

/// Installs the global subscriber.
pub fn init(config: &AgentConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(config.debug_level)));

    let result = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| LoggingError::Open {
                    path: path.clone(),
                    error: e.to_string(),
                })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => match SyslogWriter::connect(Path::new(SYSLOG_SOCKET)) {
            Ok(syslog) => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .without_time()
                .with_level(false)
                .with_writer(syslog)
                .try_init(),
            Err(e) => {
                let result = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(io::stderr)
                    .try_init();
                warn!(socket = SYSLOG_SOCKET, error = %e, "Syslog unavailable, logging to stderr");
                result
            }
        },
    };

    result.map_err(|e| LoggingError::Init(e.to_string()))
}

/// Writer sending each formatted event to syslog as one datagram.
///
/// Messages use the local `<PRI>tag[pid]: text` form; the daemon adds the
/// timestamp and host.
#[derive(Debug)]
pub struct SyslogWriter {
    socket: UnixDatagram,
    pid: u32,
}

impl SyslogWriter {
    /// Connects to the syslog socket at `path`.
    pub fn connect(path: &Path) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(Self::from_socket(socket))
    }

    fn from_socket(socket: UnixDatagram) -> Self {
        Self {
            socket,
            pid: std::process::id(),
        }
    }
}

/// Maps a tracing level to a syslog severity.
fn severity(level: &Level) -> u8 {
    match *level {
        Level::ERROR => 3,
        Level::WARN => 4,
        Level::INFO => 6,
        Level::DEBUG | Level::TRACE => 7,
    }
}

impl<'a> MakeWriter<'a> for SyslogWriter {
    type Writer = SyslogMessage<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogMessage {
            sink: self,
            severity: severity(&Level::INFO),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogMessage {
            sink: self,
            severity: severity(meta.level()),
        }
    }
}

/// One event on its way to syslog.
pub struct SyslogMessage<'a> {
    sink: &'a SyslogWriter,
    severity: u8,
}

impl Write for SyslogMessage<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let packet = format!(
            "<{}>{}[{}]: {}",
            FACILITY_DAEMON * 8 + self.severity,
            SYSLOG_IDENT,
            self.sink.pid,
            text.trim_end()
        );
        self.sink.socket.send(packet.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Errors that can occur while installing the log sink.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Cannot open log file {}: {error}", path.display())]
    Open { path: PathBuf, error: String },

    #[error("Cannot install log subscriber: {0}")]
    Init(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_filter(0), "off");
        assert_eq!(level_filter(1), "error");
        assert_eq!(level_filter(2), "error");
        assert_eq!(level_filter(3), "warn");
        assert_eq!(level_filter(4), "debug");
    }

    #[test]
    fn test_directives_parse() {
        for level in 0..=4 {
            assert!(level_filter(level).parse::<tracing_subscriber::filter::LevelFilter>().is_ok());
        }
    }

    #[test]
    fn test_syslog_severity() {
        assert_eq!(severity(&Level::ERROR), 3);
        assert_eq!(severity(&Level::WARN), 4);
        assert_eq!(severity(&Level::INFO), 6);
        assert_eq!(severity(&Level::TRACE), 7);
    }

    #[test]
    fn test_syslog_datagram_format() {
        let (agent_end, daemon_end) = UnixDatagram::pair().unwrap();
        let writer = SyslogWriter::from_socket(agent_end);

        writer
            .make_writer()
            .write_all(b"Passive listener bound addr=0.0.0.0:10050\n")
            .unwrap();

        let mut buf = [0u8; 256];
        let len = daemon_end.recv(&mut buf).unwrap();
        let packet = std::str::from_utf8(&buf[..len]).unwrap();
        assert_eq!(
            packet,
            format!(
                "<30>hostmond[{}]: Passive listener bound addr=0.0.0.0:10050",
                std::process::id()
            )
        );
    }

    #[test]
    fn test_missing_syslog_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(SyslogWriter::connect(&dir.path().join("log")).is_err());
    }

    #[test]
    fn test_unopenable_log_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = AgentConfig::new(vec!["127.0.0.1".into()], "test");
        config.log_file = Some(dir.path().join("missing").join("agent.log"));

        let err = init(&config).unwrap_err();
        assert!(matches!(err, LoggingError::Open { .. }));
    }
}
