//! Incremental RESP Protocol Parser
//!
//! TCP delivers byte soup, so parsing is resumable: callers accumulate
//! reads into a buffer and ask for one frame at a time. A call yields
//! `Ok(Some((value, consumed)))` for a complete frame (the caller then
//! advances its buffer by `consumed`), `Ok(None)` when the frame is still
//! arriving, or `Err(ParseError)` for bytes that can never become a valid
//! frame, which disconnects the peer.
//!
//! Every RESP frame is either a CRLF-terminated line (`+`, `-`, `:`), a
//! length-prefixed line followed by a payload (`$`), or a length-prefixed
//! line followed by nested frames (`*`), so the parser is built from two
//! small pieces: a line reader and a length reader. The same parser drives
//! three consumers: client connections reading commands, the replica
//! ingesting the primary's command stream, and the primary reading
//! `REPLCONF ACK` frames off a replica link. The `consumed` count doubles
//! as the frame length for replication accounting on the inbound side.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Ways incoming bytes can fail to be a RESP frame. All of these close
/// the offending connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// First byte of a frame is not a known type marker
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// A `:`, `$`, or `*` line that is not a decimal integer
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Line frames must be UTF-8
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Negative bulk string length other than the -1 null marker
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Negative array length other than the -1 null marker
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Structurally broken framing (missing CRLF, excessive nesting)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Declared payload length over the bulk size cap
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Largest accepted bulk string payload (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Deepest accepted array nesting; recursion is bounded by this
pub const MAX_NESTING_DEPTH: usize = 32;

/// An incremental RESP frame parser.
///
/// The struct only carries the nesting depth of the array currently being
/// decoded; all buffer state stays with the caller, so one parser can be
/// reused across frames.
///
/// ```ignore
/// let mut parser = RespParser::new();
/// if let Some((frame, consumed)) = parser.parse(&buffer)? {
///     buffer.advance(consumed);
///     // handle frame
/// }
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    depth: usize,
}

impl RespParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to decode one complete frame from the front of `buf`.
    /// See the module docs for the three-way return contract.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER => parse_line_value(buf),
            prefix::BULK_STRING => parse_bulk_string(buf),
            prefix::ARRAY => self.parse_array(buf),
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Parses an array: `*<count>\r\n<elements...>`
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some((count, mut consumed)) = parse_length_line(buf)? else {
            return Ok(None);
        };

        // *-1\r\n is the null array
        if count == -1 {
            return Ok(Some((RespValue::Null, consumed)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        let mut elements = Vec::with_capacity(count as usize);
        self.depth += 1;

        for _ in 0..count {
            let Some((value, element_consumed)) = self.parse_value(&buf[consumed..])? else {
                return Ok(None); // Incomplete
            };
            elements.push(value);
            consumed += element_consumed;
        }

        self.depth -= 1;
        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// Parses the line-shaped frames: `+<s>\r\n`, `-<e>\r\n`, `:<i>\r\n`.
fn parse_line_value(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, consumed)) = parse_line(buf)? else {
        return Ok(None);
    };

    let value = match buf[0] {
        prefix::SIMPLE_STRING => RespValue::SimpleString(line.to_string()),
        prefix::ERROR => RespValue::Error(line.to_string()),
        _ => {
            let n = line
                .parse()
                .map_err(|_| ParseError::InvalidInteger(line.to_string()))?;
            RespValue::Integer(n)
        }
    };
    Ok(Some((value, consumed)))
}

/// Parses a bulk string: `$<length>\r\n<data>\r\n` (`$-1\r\n` is null).
fn parse_bulk_string(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((length, header_len)) = parse_length_line(buf)? else {
        return Ok(None);
    };

    if length == -1 {
        return Ok(Some((RespValue::Null, header_len)));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }

    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total = header_len + length + 2;
    if buf.len() < total {
        return Ok(None); // Incomplete
    }
    if &buf[header_len + length..total] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[header_len..header_len + length]);
    Ok(Some((RespValue::BulkString(data), total)))
}

/// Reads the CRLF-terminated UTF-8 line following a one-byte prefix.
/// Returns the line content and the total bytes consumed including the
/// prefix and terminator, or `None` if the terminator has not arrived yet.
fn parse_line(buf: &[u8]) -> ParseResult<Option<(&str, usize)>> {
    let Some(end) = buf[1..].windows(2).position(|w| w == CRLF) else {
        return Ok(None);
    };

    let line = std::str::from_utf8(&buf[1..1 + end])
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    Ok(Some((line, 1 + end + 2)))
}

/// Reads a `<prefix><signed decimal>\r\n` header, the shape shared by bulk
/// string and array frames.
fn parse_length_line(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    let Some((line, consumed)) = parse_line(buf)? else {
        return Ok(None);
    };

    let n = line
        .parse()
        .map_err(|_| ParseError::InvalidInteger(line.to_string()))?;
    Ok(Some((n, consumed)))
}

/// One-shot convenience wrapper around [`RespParser::parse`].
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

/// Flattens a parsed frame into command arguments.
///
/// Commands arrive as arrays of bulk strings; null bulk strings decode to
/// empty elements. Returns `None` for any other shape, which callers treat
/// as a protocol error.
pub fn command_args(value: RespValue) -> Option<Vec<Bytes>> {
    let elements = value.into_array()?;
    let mut args = Vec::with_capacity(elements.len());
    for element in elements {
        match element {
            RespValue::BulkString(b) => args.push(b),
            RespValue::SimpleString(s) => args.push(Bytes::from(s)),
            RespValue::Null => args.push(Bytes::new()),
            _ => return None,
        }
    }
    Some(args)
}
