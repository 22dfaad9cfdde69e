//! Replica Role: Handshake and Ingestion
//!
//! A server started with `--replicaof` connects out to its primary, runs
//! the 4-step handshake as the client, consumes the bulk-framed snapshot,
//! and then ingests the primary's command stream for the rest of its life.
//!
//! ## Handshake
//!
//! ```text
//! replica                          primary
//!   │ ── PING ──────────────────────> │
//!   │ <───────────────────── +PONG ── │
//!   │ ── REPLCONF listening-port p ─> │
//!   │ <─────────────────────── +OK ── │
//!   │ ── REPLCONF capa psync2 ──────> │
//!   │ <─────────────────────── +OK ── │
//!   │ ── PSYNC ? -1 ────────────────> │
//!   │ <── +FULLRESYNC <id> <off> ──── │
//!   │ <── $<len>\r\n<snapshot> ────── │
//!   └── ingest command stream ─────── ┘
//! ```
//!
//! Any step that does not answer as expected is fatal: the operator
//! restarts the process.
//!
//! ## Offset discipline
//!
//! The local offset counts the byte length of *every* frame consumed after
//! the snapshot, whether or not the command is known, so it stays aligned
//! with the primary's accounting. The one wrinkle is `REPLCONF GETACK`:
//! the ACK reply must carry the offset from *before* the GETACK frame's own
//! bytes are added. That ordering is what WAIT on the primary observes.

use crate::protocol::{command_args, encode_command, frame_len, ParseError, RespParser};
use crate::server::Server;
use crate::storage::IdSpec;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Errors that take the replica down.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// I/O failure talking to the primary
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A handshake step answered with something unexpected
    #[error("handshake failed: expected {expected:?}, got {got:?}")]
    Handshake { expected: String, got: String },

    /// The primary sent bytes that do not parse as RESP
    #[error("protocol error from primary: {0}")]
    Protocol(#[from] ParseError),

    /// The primary closed the connection
    #[error("connection to primary lost")]
    PrimaryClosed,
}

/// Connects to the configured primary, completes the handshake, and
/// ingests the command stream until the connection dies.
pub async fn run_replica(server: Arc<Server>) -> Result<(), ReplicationError> {
    let primary = server.config().primary_address().ok_or_else(|| {
        ReplicationError::Handshake {
            expected: "a --replicaof address".to_string(),
            got: "none".to_string(),
        }
    })?;

    info!(primary = %primary, "Connecting to primary");
    let mut stream = TcpStream::connect(&primary).await?;
    let mut buf = BytesMut::with_capacity(4096);

    handshake(&server, &mut stream, &mut buf).await?;

    server.replication().reset_replica_offset();
    info!(primary = %primary, "Handshake complete, ingesting command stream");

    ingest(&server, &mut stream, &mut buf).await
}

/// Runs the 4 handshake steps and consumes the snapshot payload.
async fn handshake(
    server: &Server,
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<(), ReplicationError> {
    let port = server.config().port.to_string();

    send_command(stream, &["PING"]).await?;
    expect_simple_string(stream, buf, "PONG").await?;

    send_command(stream, &["REPLCONF", "listening-port", &port]).await?;
    expect_simple_string(stream, buf, "OK").await?;

    send_command(stream, &["REPLCONF", "capa", "psync2"]).await?;
    expect_simple_string(stream, buf, "OK").await?;

    send_command(stream, &["PSYNC", "?", "-1"]).await?;
    let line = read_line(stream, buf).await?;
    if let Some(rest) = line.strip_prefix("+FULLRESYNC ") {
        let mut parts = rest.split_whitespace();
        if let Some(id) = parts.next() {
            debug!(replication_id = id, "Primary announced full resync");
        }
    } else if line != "+CONTINUE" {
        return Err(ReplicationError::Handshake {
            expected: "+FULLRESYNC <id> <offset>".to_string(),
            got: line,
        });
    }

    // Snapshot payload: "$<len>\r\n" then exactly <len> bytes, no trailing
    // CRLF. A fresh replica has nothing to merge, so the payload is
    // discarded.
    let header = read_line(stream, buf).await?;
    let len: usize = header
        .strip_prefix('$')
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| ReplicationError::Handshake {
            expected: "$<snapshot-length>".to_string(),
            got: header.clone(),
        })?;
    consume_exact(stream, buf, len).await?;
    debug!(bytes = len, "Discarded snapshot payload");

    Ok(())
}

/// The post-handshake loop: parse frames off the primary connection, apply
/// them, and keep the local offset aligned.
async fn ingest(
    server: &Server,
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<(), ReplicationError> {
    let mut parser = RespParser::new();

    loop {
        while let Some((value, consumed)) = parser.parse(buf)? {
            buf.advance(consumed);

            let Some(args) = command_args(value) else {
                warn!("Primary sent a non-command frame, skipping");
                continue;
            };
            if args.is_empty() {
                continue;
            }

            apply_frame(server, stream, &args).await?;
        }

        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(ReplicationError::PrimaryClosed);
        }
    }
}

/// Applies one frame from the primary and advances the local offset by the
/// frame's canonical length.
async fn apply_frame(
    server: &Server,
    stream: &mut TcpStream,
    args: &[Bytes],
) -> Result<(), ReplicationError> {
    let bytes = frame_len(args);
    let state = server.replication();
    let name = String::from_utf8_lossy(&args[0]).to_uppercase();

    // GETACK answers with the offset from before this frame, then counts it
    if name == "REPLCONF" {
        let sub = args
            .get(1)
            .map(|s| String::from_utf8_lossy(s).to_uppercase())
            .unwrap_or_default();
        if sub == "GETACK" {
            let offset = state.replica_offset();
            let ack = encode_command(&[
                Bytes::from_static(b"REPLCONF"),
                Bytes::from_static(b"ACK"),
                Bytes::from(offset.to_string()),
            ]);
            stream.write_all(&ack).await?;
            debug!(offset = offset, "Answered GETACK");
        }
        state.advance_replica_offset(bytes);
        return Ok(());
    }

    apply_write(server, &name, &args[1..]);
    state.advance_replica_offset(bytes);
    debug!(
        command = %name,
        bytes = bytes,
        offset = state.replica_offset(),
        "Ingested frame from primary"
    );
    Ok(())
}

/// Applies a replicated write to the local keyspace. Unknown commands are
/// ignored; their frames still count toward the offset.
fn apply_write(server: &Server, name: &str, args: &[Bytes]) {
    let storage = server.storage();

    match name {
        "SET" if args.len() >= 2 => {
            let mut ttl = None;
            if args.len() >= 4 {
                let opt = String::from_utf8_lossy(&args[2]).to_uppercase();
                let value = std::str::from_utf8(&args[3])
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok());
                match (opt.as_str(), value) {
                    ("PX", Some(ms)) => ttl = Some(Duration::from_millis(ms)),
                    ("EX", Some(secs)) => ttl = Some(Duration::from_secs(secs)),
                    _ => {}
                }
            }
            storage.set(args[0].clone(), args[1].clone(), ttl);
        }
        "INCR" if !args.is_empty() => {
            if let Err(e) = storage.incr_by(&args[0], 1) {
                warn!(error = %e, "Replicated INCR failed locally");
            }
        }
        "INCRBY" if args.len() >= 2 => {
            let delta = std::str::from_utf8(&args[1])
                .ok()
                .and_then(|s| s.parse::<i64>().ok());
            if let Some(delta) = delta {
                if let Err(e) = storage.incr_by(&args[0], delta) {
                    warn!(error = %e, "Replicated INCRBY failed locally");
                }
            }
        }
        "DEL" => {
            for key in args {
                storage.delete(key);
            }
        }
        "XADD" if args.len() >= 4 => {
            if let Ok(spec) = IdSpec::parse(&String::from_utf8_lossy(&args[1])) {
                let fields: Vec<(Bytes, Bytes)> = args[2..]
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                if let Err(e) = storage.stream_add(&args[0], spec, fields) {
                    warn!(error = %e, "Replicated XADD failed locally");
                }
            }
        }
        // PING heartbeats and anything unknown only move the offset
        _ => {}
    }
}

/// Encodes and sends one handshake command.
async fn send_command(stream: &mut TcpStream, parts: &[&str]) -> std::io::Result<()> {
    let args: Vec<Bytes> = parts
        .iter()
        .map(|p| Bytes::from(p.to_string()))
        .collect();
    stream.write_all(&encode_command(&args)).await
}

/// Reads one CRLF-terminated line, filling the buffer from the socket as
/// needed. Returns the line without its terminator.
async fn read_line(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<String, ReplicationError> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos + 2);
            let s = std::str::from_utf8(&line[..pos]).map_err(|_| {
                ReplicationError::Protocol(ParseError::InvalidUtf8(
                    "non-UTF8 handshake line".to_string(),
                ))
            })?;
            return Ok(s.to_string());
        }

        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(ReplicationError::PrimaryClosed);
        }
    }
}

/// Checks a `+<expected>\r\n` handshake reply.
async fn expect_simple_string(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    expected: &str,
) -> Result<(), ReplicationError> {
    let line = read_line(stream, buf).await?;
    if line.strip_prefix('+') != Some(expected) {
        return Err(ReplicationError::Handshake {
            expected: format!("+{}", expected),
            got: line,
        });
    }
    Ok(())
}

/// Discards exactly `len` bytes, draining the buffer first.
async fn consume_exact(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut len: usize,
) -> Result<(), ReplicationError> {
    let buffered = len.min(buf.len());
    buf.advance(buffered);
    len -= buffered;

    while len > 0 {
        if buf.is_empty() {
            let n = stream.read_buf(buf).await?;
            if n == 0 {
                return Err(ReplicationError::PrimaryClosed);
            }
        }
        let take = len.min(buf.len());
        buf.advance(take);
        len -= take;
    }
    Ok(())
}
