//! Newline-delimited JSON framing.
//!
//! Every message is one JSON document on one line. Lines longer than
//! [`MAX_MESSAGE_SIZE`] are rejected before parsing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Errors that can occur while framing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Serializes a message into one `\n`-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    line.push('\n');
    Ok(line)
}

/// Parses one line (with or without its terminator).
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    serde_json::from_str(line).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AgentRequest, ServerResponse};

    #[test]
    fn test_encode_appends_newline() {
        let line = encode_line(&AgentRequest::active_checks("h")).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_decode_accepts_crlf() {
        let parsed: ServerResponse =
            decode_line("{\"response\":\"success\",\"info\":\"ok\"}\r\n").unwrap();
        assert!(parsed.is_success());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_line::<ServerResponse>("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_message_size_error() {
        let err = ProtocolError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }
}
