//! One passive exchange: read a key line, answer with the raw value, close.
//!
//! The whole exchange runs under a single absolute deadline. The reply is
//! written only once it is fully computed, so a deadline that expires
//! while reading or evaluating leaves the peer with zero bytes.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are returned to the worker, logged, and the
//!   connection is dropped

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use hostmon_core::MetricRegistry;

/// Maximum request length in bytes, excluding the line terminator.
///
/// Longer requests are rejected (closed without a reply), never truncated.
pub const MAX_REQUEST_LEN: usize = 1024;

/// Summary of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// The requested key
    pub key: String,

    /// Whether the registry knew the key
    pub supported: bool,

    /// Number of reply bytes written
    pub reply_len: usize,
}

/// Serves exactly one request on `stream` within `timeout`.
///
/// On any error nothing (or, for a write failure, an incomplete reply)
/// has been written; the caller drops the stream either way.
pub async fn serve_request<S>(
    stream: S,
    registry: &dyn MetricRegistry,
    timeout: Duration,
) -> Result<Exchange, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + timeout;
    match timeout_at(deadline, exchange(stream, registry)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout),
    }
}

async fn exchange<S>(stream: S, registry: &dyn MetricRegistry) -> Result<Exchange, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);

    let key = read_request(reader).await?;
    debug!(key = %key, "Received request");

    let value = registry.evaluate(&key).await;
    let reply = value.as_reply().as_bytes();

    writer
        .write_all(reply)
        .await
        .map_err(|e| ConnectionError::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| ConnectionError::Io(e.to_string()))?;
    // Half-close so the peer sees EOF right after the value
    writer
        .shutdown()
        .await
        .map_err(|e| ConnectionError::Io(e.to_string()))?;

    Ok(Exchange {
        key,
        supported: value.is_supported(),
        reply_len: reply.len(),
    })
}

/// Reads one request line and strips its terminator.
///
/// A line ends at `\n` (a preceding `\r` is stripped too) or at EOF.
pub async fn read_request<R>(reader: R) -> Result<String, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let limit = MAX_REQUEST_LEN as u64 + 1;
    let mut reader = BufReader::new(reader.take(limit));
    let mut line = Vec::with_capacity(64);

    let bytes_read = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| ConnectionError::Io(e.to_string()))?;

    if bytes_read == 0 {
        return Err(ConnectionError::Eof);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if line.len() > MAX_REQUEST_LEN {
        return Err(ConnectionError::RequestTooLarge {
            max: MAX_REQUEST_LEN,
        });
    }

    String::from_utf8(line).map_err(|_| ConnectionError::InvalidEncoding)
}

/// Errors that can occur during a passive exchange.
///
/// None of them is fatal: the worker logs it and accepts the next
/// connection.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed before a request was received")]
    Eof,

    #[error("Request timed out")]
    Timeout,

    #[error("Request too large (max: {max} bytes)")]
    RequestTooLarge { max: usize },

    #[error("Request is not valid UTF-8")]
    InvalidEncoding,
}
