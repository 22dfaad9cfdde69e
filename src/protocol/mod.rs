//! RESP Protocol Implementation
//!
//! This module provides a complete implementation of the Redis Serialization
//! Protocol (RESP), the wire format spoken on every socket this server owns:
//! client connections, replica links, and the replica's connection to its
//! primary.
//!
//! ## Modules
//!
//! - `types`: the `RespValue` enum, serialization, and the command-frame
//!   encoder/length pair used for replication accounting
//! - `parser`: incremental parser for incoming RESP data
//!
//! ## Example
//!
//! ```ignore
//! use voltkv::protocol::{RespValue, parse_message};
//! use bytes::Bytes;
//!
//! // Parsing incoming data
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (value, consumed) = parse_message(data).unwrap().unwrap();
//!
//! // Creating responses
//! let response = RespValue::bulk_string(Bytes::from("mika"));
//! let bytes = response.serialize();
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{command_args, parse_message, ParseError, ParseResult, RespParser};
pub use types::{encode_command, frame_len, RespValue};
