//! hostmon protocol - wire format for active checks
//!
//! This crate provides the message types and line framing used between
//! the agent's active session and the monitoring server. Passive checks
//! need no types: they are a bare key line in and raw bytes out.

pub mod codec;
pub mod message;

pub use codec::{decode_line, encode_line, ProtocolError, MAX_MESSAGE_SIZE};
pub use message::{ActiveCheck, AgentRequest, AgentValue, ResponseStatus, ServerResponse};
