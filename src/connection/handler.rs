//! Connection Handler Module
//!
//! This module handles individual client connections to VoltKV.
//! Each client gets its own handler task that runs in a loop, reading
//! framed commands and sending responses.
//!
//! ## Routing
//!
//! Most commands go straight to the [`CommandHandler`]. Three groups are
//! resolved here instead, because they touch per-connection state:
//!
//! - `MULTI`/`EXEC`/`DISCARD` drive the connection's transaction state.
//!   While a transaction is open every other command is queued and answered
//!   `+QUEUED`; EXEC replays the queue through the normal dispatch path and
//!   emits the collected replies under one array header.
//! - `REPLCONF LISTENING-PORT`/`CAPA` record what a soon-to-be replica
//!   announces about itself before it sends PSYNC.
//! - `PSYNC` answers with a full resync (replication ID, offset, and the
//!   bulk-framed snapshot payload) and then *converts* the connection: the
//!   write half joins the replica registry for command fan-out, and the
//!   read half moves to a task that consumes `REPLCONF ACK` frames. The
//!   client loop ends there.
//!
//! ## Buffer Management
//!
//! A `BytesMut` buffer accumulates incoming data. TCP is a stream protocol;
//! we might receive partial commands, or multiple commands in a single
//! read (pipelining), and the incremental parser handles both.

use crate::commands::CommandHandler;
use crate::protocol::{command_args, ParseError, RespParser, RespValue};
use crate::server::Server;
use crate::snapshot::EMPTY_SNAPSHOT;
use crate::transaction::TransactionState;
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Maximum size for the read buffer (64 KB)
const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Connections promoted to replica links
    pub replicas_attached: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replica_attached(&self) {
        self.replicas_attached.fetch_add(1, Ordering::Relaxed);
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// RESP parse error; the client is disconnected without a reply
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Unexpected end of stream (partial command)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// How the main loop ended.
enum MainExit {
    /// The client closed the connection cleanly
    ClientClosed,
    /// PSYNC completed; the socket becomes a replica link
    ReplicaHandover,
}

/// What to do after routing one command.
enum Step {
    Continue,
    Handover,
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    /// The TCP stream for this connection
    stream: TcpStream,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// RESP parser
    parser: RespParser,

    /// Command dispatcher (cheap to clone, shared server state)
    handler: CommandHandler,

    /// Shared server state
    server: Arc<Server>,

    /// This connection's MULTI/EXEC state
    txn: TransactionState,

    /// Listening port announced via REPLCONF, attached at PSYNC time
    replconf_port: Option<String>,

    /// Capabilities announced via REPLCONF capa
    replconf_capa: Vec<String>,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        server: Arc<Server>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream,
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::new(),
            handler: CommandHandler::new(Arc::clone(&server)),
            server,
            txn: TransactionState::new(),
            replconf_port: None,
            replconf_capa: Vec::new(),
            stats,
        }
    }

    /// Runs the connection to completion.
    ///
    /// Transaction state dies with the handler; a PSYNC exit hands the
    /// socket over to the replication engine instead of closing it.
    pub async fn run(self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");
        let addr = self.addr;
        let stats = Arc::clone(&self.stats);

        let result = self.run_inner().await;
        stats.connection_closed();

        match &result {
            Ok(()) => {}
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %addr, error = %e, "Connection error"),
        }

        result
    }

    async fn run_inner(mut self) -> Result<(), ConnectionError> {
        match self.main_loop().await? {
            MainExit::ClientClosed => {
                info!(client = %self.addr, "Client disconnected gracefully");
                Ok(())
            }
            MainExit::ReplicaHandover => {
                info!(client = %self.addr, "Connection promoted to replica link");
                self.stats.replica_attached();

                let ConnectionHandler {
                    stream,
                    buffer,
                    server,
                    replconf_port,
                    replconf_capa,
                    ..
                } = self;

                let (read_half, write_half) = stream.into_split();
                let (id, acked) = server
                    .replication()
                    .register_replica(write_half, replconf_port, replconf_capa)
                    .await;
                tokio::spawn(replica_ack_loop(server, id, acked, read_half, buffer));
                Ok(())
            }
        }
    }

    /// The main read-route-respond loop.
    async fn main_loop(&mut self) -> Result<MainExit, ConnectionError> {
        loop {
            while let Some(args) = self.try_parse_command()? {
                if args.is_empty() {
                    self.write_value(&RespValue::error("ERR empty command")).await?;
                    continue;
                }

                self.stats.command_processed();
                match self.route(args).await? {
                    Step::Continue => {}
                    Step::Handover => return Ok(MainExit::ReplicaHandover),
                }
            }

            if !self.read_more_data().await? {
                if self.buffer.is_empty() {
                    return Ok(MainExit::ClientClosed);
                }
                // Partial command in buffer
                return Err(ConnectionError::UnexpectedEof);
            }
        }
    }

    /// Attempts to parse one command frame from the buffer.
    fn try_parse_command(&mut self) -> Result<Option<Vec<Bytes>>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((value, consumed))) => {
                self.buffer.advance(consumed);
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed frame"
                );
                match command_args(value) {
                    Some(args) => Ok(Some(args)),
                    None => Err(ConnectionError::ParseError(ParseError::ProtocolError(
                        "expected an array of bulk strings".to_string(),
                    ))),
                }
            }
            Ok(None) => Ok(None),
            Err(e) => {
                // Malformed framing: disconnect silently
                warn!(client = %self.addr, error = %e, "Parse error");
                Err(ConnectionError::ParseError(e))
            }
        }
    }

    /// Reads more data from the socket. Returns false on EOF.
    async fn read_more_data(&mut self) -> Result<bool, ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.read_buf(&mut self.buffer).await?;
        trace!(client = %self.addr, bytes = n, "Read data");
        Ok(n > 0)
    }

    /// Routes one parsed command.
    async fn route(&mut self, args: Vec<Bytes>) -> Result<Step, ConnectionError> {
        let name = String::from_utf8_lossy(&args[0]).to_uppercase();
        let rest = &args[1..];

        // An open transaction queues everything except its own controls
        if self.txn.is_active() && !matches!(name.as_str(), "MULTI" | "EXEC" | "DISCARD") {
            self.txn.queue(name, rest.to_vec());
            self.write_value(&RespValue::simple_string("QUEUED")).await?;
            return Ok(Step::Continue);
        }

        match name.as_str() {
            "MULTI" => {
                let reply = match self.txn.begin() {
                    Ok(()) => RespValue::ok(),
                    Err(msg) => RespValue::error(msg),
                };
                self.write_value(&reply).await?;
            }
            "EXEC" => self.exec().await?,
            "DISCARD" => {
                let reply = match self.txn.discard() {
                    Ok(()) => RespValue::ok(),
                    Err(msg) => RespValue::error(msg),
                };
                self.write_value(&reply).await?;
            }
            "REPLCONF" => self.replconf(rest).await?,
            "PSYNC" => return self.psync(rest).await,
            _ => {
                let reply = self.handler.execute(&name, rest).await;
                self.write_value(&reply).await?;
            }
        }

        Ok(Step::Continue)
    }

    /// Replays the queued commands and replies with the collected frames
    /// under one array header. Individual failures fill their slot without
    /// aborting the rest.
    async fn exec(&mut self) -> Result<(), ConnectionError> {
        let queued = match self.txn.take_queued() {
            Ok(queued) => queued,
            Err(msg) => {
                self.write_value(&RespValue::error(msg)).await?;
                return Ok(());
            }
        };

        let mut frames = Vec::with_capacity(queued.len());
        for command in queued {
            let reply = self.handler.execute(&command.name, &command.args).await;
            frames.push(RespValue::Verbatim(reply.serialize()));
        }

        self.write_value(&RespValue::Array(frames)).await
    }

    /// REPLCONF before PSYNC: record what the replica announces. GETACK on
    /// a plain connection echoes the best known offset (a replica answers
    /// its local offset, a primary knows nothing about a plain client).
    async fn replconf(&mut self, args: &[Bytes]) -> Result<(), ConnectionError> {
        let Some(sub) = args.first() else {
            self.write_value(&RespValue::error(
                "ERR wrong number of arguments for 'REPLCONF' command",
            ))
            .await?;
            return Ok(());
        };

        match String::from_utf8_lossy(sub).to_uppercase().as_str() {
            "LISTENING-PORT" => {
                self.replconf_port = args
                    .get(1)
                    .and_then(|p| std::str::from_utf8(p).ok())
                    .map(|p| p.to_string());
                debug!(client = %self.addr, port = ?self.replconf_port, "Replica announced port");
                self.write_value(&RespValue::ok()).await?;
            }
            "CAPA" => {
                self.replconf_capa.extend(
                    args[1..]
                        .iter()
                        .filter_map(|c| std::str::from_utf8(c).ok().map(|c| c.to_string())),
                );
                self.write_value(&RespValue::ok()).await?;
            }
            "GETACK" => {
                let offset = if self.server.is_primary() {
                    0
                } else {
                    self.server.replication().replica_offset()
                };
                let reply = RespValue::array(vec![
                    RespValue::bulk_string(Bytes::from_static(b"REPLCONF")),
                    RespValue::bulk_string(Bytes::from_static(b"ACK")),
                    RespValue::bulk_string(Bytes::from(offset.to_string())),
                ]);
                self.write_value(&reply).await?;
            }
            // ACK frames normally arrive on the replica link's read half;
            // one here is stale and gets no reply
            "ACK" => {}
            _ => self.write_value(&RespValue::ok()).await?,
        }

        Ok(())
    }

    /// PSYNC: reply, ship the snapshot, and request the handover.
    async fn psync(&mut self, args: &[Bytes]) -> Result<Step, ConnectionError> {
        if args.len() != 2 {
            self.write_value(&RespValue::error("ERR invalid PSYNC arguments"))
                .await?;
            return Ok(Step::Continue);
        }

        let replid = String::from_utf8_lossy(&args[0]);
        let offset = String::from_utf8_lossy(&args[1]);
        let state = self.server.replication();

        if replid == "?" && offset == "-1" {
            info!(client = %self.addr, "Full resync requested");
            let header = format!(
                "+FULLRESYNC {} {}\r\n",
                state.replication_id(),
                state.offset()
            );
            self.stream.write_all(header.as_bytes()).await?;

            // Bulk-framed snapshot payload, no trailing CRLF
            let bulk_header = format!("${}\r\n", EMPTY_SNAPSHOT.len());
            self.stream.write_all(bulk_header.as_bytes()).await?;
            self.stream.write_all(EMPTY_SNAPSHOT).await?;
        } else {
            info!(client = %self.addr, replid = %replid, offset = %offset, "Partial resync requested");
            self.stream.write_all(b"+CONTINUE\r\n").await?;
        }

        Ok(Step::Handover)
    }

    /// Serializes and sends a reply.
    async fn write_value(&mut self, value: &RespValue) -> Result<(), ConnectionError> {
        let bytes = value.serialize();
        self.stream.write_all(&bytes).await?;
        trace!(client = %self.addr, bytes = bytes.len(), "Sent response");
        Ok(())
    }
}

/// Owns the read half of a replica link after PSYNC: consumes
/// `REPLCONF ACK <n>` frames, records the acknowledged offset, and signals
/// any pending WAIT. Removes the replica from the registry when the link
/// dies.
async fn replica_ack_loop(
    server: Arc<Server>,
    id: crate::replication::ReplicaId,
    acked: Arc<AtomicU64>,
    mut read_half: OwnedReadHalf,
    mut buffer: BytesMut,
) {
    let ack_tx = server.replication().ack_sender();
    let mut parser = RespParser::new();

    'outer: loop {
        loop {
            match parser.parse(&buffer) {
                Ok(Some((value, consumed))) => {
                    buffer.advance(consumed);
                    let Some(args) = command_args(value) else {
                        continue;
                    };
                    if args.len() >= 3
                        && args[0].eq_ignore_ascii_case(b"REPLCONF")
                        && args[1].eq_ignore_ascii_case(b"ACK")
                    {
                        if let Some(offset) = std::str::from_utf8(&args[2])
                            .ok()
                            .and_then(|s| s.parse::<u64>().ok())
                        {
                            acked.store(offset, Ordering::SeqCst);
                            debug!(replica = id, offset = offset, "Replica acknowledged");
                            // Best effort: WAIT recounts on every signal
                            let _ = ack_tx.try_send(id);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(replica = id, error = %e, "Bad frame on replica link");
                    break 'outer;
                }
            }
        }

        match read_half.read_buf(&mut buffer).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(replica = id, error = %e, "Replica link read failed");
                break;
            }
        }
    }

    server.replication().remove_replica(id).await;
}

/// Handles a client connection to completion.
///
/// This is the entry point the accept loop spawns for every connection.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    server: Arc<Server>,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, server, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
