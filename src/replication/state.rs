//! Primary-Side Replication State
//!
//! The primary owns a 40-character replication ID, a monotonically
//! increasing byte offset, and a registry of attached replicas. Every
//! accepted write command is applied locally and then fanned out inside a
//! single critical section: encode the frame once, advance the offset by
//! its length, and write it to every replica in registration order. That
//! one lock is what gives all replicas the same frame sequence.
//!
//! Two counters live on every link and they mean different things:
//!
//! - `bytes_sent` advances on every successful write to the replica's
//!   socket. It is a transmission counter, nothing more.
//! - `acked` advances only when the replica sends `REPLCONF ACK <n>`. WAIT
//!   counts replicas by `acked`, never by `bytes_sent`.
//!
//! ACK frames arrive on the replica link's read half, which is owned by a
//! per-replica task (see `connection`); that task stores the offset and
//! offers the replica ID to a bounded ack channel that a pending WAIT
//! drains.

use crate::protocol::encode_command;
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the ack-signal channel. Producers drop when full; WAIT
/// recounts on every receive so a dropped signal only delays, never loses,
/// an ack.
const ACK_CHANNEL_CAPACITY: usize = 100;

/// Identifies one replica link for the lifetime of its connection.
pub type ReplicaId = u64;

/// A registered replica: the write half of its socket plus offset
/// bookkeeping. The read half lives in the per-replica ACK task.
pub struct ReplicaLink {
    pub id: ReplicaId,
    writer: OwnedWriteHalf,
    /// Bytes the replica has acknowledged via REPLCONF ACK
    acked: Arc<AtomicU64>,
    /// Bytes successfully written to the replica's socket
    bytes_sent: u64,
    /// Port the replica announced with REPLCONF listening-port
    pub listening_port: Option<String>,
    /// Capabilities announced with REPLCONF capa
    pub capabilities: Vec<String>,
}

impl ReplicaLink {
    /// Bytes successfully transmitted to this replica. A transmission
    /// counter only; WAIT never consults it.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Offset the replica has acknowledged via REPLCONF ACK.
    pub fn acked_offset(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }
}

/// Replication state shared by every connection on this server.
///
/// On a replica, `replica_offset` tracks bytes consumed from the primary
/// and the fan-out side sits unused (replicas never register sub-replicas).
pub struct ReplicationState {
    replication_id: String,
    /// Total byte length of every write-command frame fanned out so far.
    /// Only mutated while `replicas` is locked.
    offset: AtomicU64,
    replicas: Mutex<Vec<ReplicaLink>>,
    next_replica_id: AtomicU64,
    ack_tx: mpsc::Sender<ReplicaId>,
    /// Drained by WAIT; a Mutex because WAITs on different connections
    /// serialize against each other.
    ack_rx: Mutex<mpsc::Receiver<ReplicaId>>,
    /// Replica role only: bytes consumed from the primary's stream
    replica_offset: AtomicU64,
}

impl std::fmt::Debug for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationState")
            .field("replication_id", &self.replication_id)
            .field("offset", &self.offset.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationState {
    pub fn new() -> Self {
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        Self {
            replication_id: generate_replication_id(),
            offset: AtomicU64::new(0),
            replicas: Mutex::new(Vec::new()),
            next_replica_id: AtomicU64::new(1),
            ack_tx,
            ack_rx: Mutex::new(ack_rx),
            replica_offset: AtomicU64::new(0),
        }
    }

    /// The 40-character replication ID generated at startup.
    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    /// The primary's current replication offset.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Sender half of the ack-signal channel, cloned into ACK reader tasks.
    pub fn ack_sender(&self) -> mpsc::Sender<ReplicaId> {
        self.ack_tx.clone()
    }

    /// Registers a replica after a successful PSYNC. The returned `acked`
    /// handle is shared with the ACK reader task for that link.
    pub async fn register_replica(
        &self,
        writer: OwnedWriteHalf,
        listening_port: Option<String>,
        capabilities: Vec<String>,
    ) -> (ReplicaId, Arc<AtomicU64>) {
        let id = self.next_replica_id.fetch_add(1, Ordering::Relaxed);
        let acked = Arc::new(AtomicU64::new(0));

        let mut replicas = self.replicas.lock().await;
        replicas.push(ReplicaLink {
            id,
            writer,
            acked: Arc::clone(&acked),
            bytes_sent: 0,
            listening_port,
            capabilities,
        });
        info!(replica = id, total = replicas.len(), "Replica registered");
        (id, acked)
    }

    /// Removes a replica, typically because its connection closed.
    pub async fn remove_replica(&self, id: ReplicaId) {
        let mut replicas = self.replicas.lock().await;
        let before = replicas.len();
        replicas.retain(|r| r.id != id);
        if replicas.len() != before {
            info!(replica = id, total = replicas.len(), "Replica removed");
        }
    }

    /// Number of currently attached replicas.
    pub async fn replica_count(&self) -> usize {
        self.replicas.lock().await.len()
    }

    /// Runs a write command under the fan-out lock.
    ///
    /// `apply` mutates the keyspace and returns the client reply plus the
    /// frame to broadcast (`None` if the write was rejected and must not
    /// replicate). Keeping apply, offset advance, and fan-out in one
    /// critical section means every replica receives the same frame
    /// sequence in the order the writes actually took effect.
    pub async fn apply_write<T>(&self, apply: impl FnOnce() -> (T, Option<Vec<Bytes>>)) -> T {
        let mut replicas = self.replicas.lock().await;
        let (reply, fan_out) = apply();
        if let Some(args) = fan_out {
            self.fan_out_locked(&mut replicas, &args).await;
        }
        reply
    }

    /// Fans a write command out to every replica.
    ///
    /// Prefer [`apply_write`](Self::apply_write), which also covers the
    /// local mutation with the same lock.
    pub async fn propagate(&self, args: &[Bytes]) {
        let mut replicas = self.replicas.lock().await;
        self.fan_out_locked(&mut replicas, args).await;
    }

    /// Advances the offset and writes one frame to every replica. A replica
    /// whose socket write fails is dropped on the spot. Caller holds the
    /// registry lock.
    async fn fan_out_locked(&self, replicas: &mut Vec<ReplicaLink>, args: &[Bytes]) {
        let frame = encode_command(args);
        let new_offset =
            self.offset.fetch_add(frame.len() as u64, Ordering::SeqCst) + frame.len() as u64;
        debug!(
            bytes = frame.len(),
            offset = new_offset,
            replicas = replicas.len(),
            "Propagating write command"
        );

        let mut i = 0;
        while i < replicas.len() {
            match replicas[i].writer.write_all(&frame).await {
                Ok(()) => {
                    replicas[i].bytes_sent += frame.len() as u64;
                    i += 1;
                }
                Err(e) => {
                    warn!(replica = replicas[i].id, error = %e, "Dropping dead replica");
                    replicas.remove(i);
                }
            }
        }
    }

    /// Sends `REPLCONF GETACK *` to every replica. The probe frame is not a
    /// write command and does not advance the primary's offset.
    pub async fn broadcast_getack(&self) {
        let frame = encode_command(&[
            Bytes::from_static(b"REPLCONF"),
            Bytes::from_static(b"GETACK"),
            Bytes::from_static(b"*"),
        ]);

        let mut replicas = self.replicas.lock().await;
        let mut i = 0;
        while i < replicas.len() {
            match replicas[i].writer.write_all(&frame).await {
                Ok(()) => i += 1,
                Err(e) => {
                    warn!(replica = replicas[i].id, error = %e, "Dropping dead replica");
                    replicas.remove(i);
                }
            }
        }
    }

    /// Counts replicas whose acknowledged offset has reached `target`.
    pub async fn count_acked(&self, target: u64) -> usize {
        let replicas = self.replicas.lock().await;
        replicas
            .iter()
            .filter(|r| r.acked.load(Ordering::SeqCst) >= target)
            .count()
    }

    /// The WAIT barrier: block until at least `want` replicas have
    /// acknowledged everything fanned out before this call, or until
    /// `timeout_ms` elapses. Returns the number of caught-up replicas.
    pub async fn wait_for_acks(&self, want: usize, timeout_ms: u64) -> usize {
        let target = self.offset();

        self.broadcast_getack().await;

        let mut count = self.count_acked(target).await;
        if count >= want {
            return count;
        }

        let deadline = Instant::now() + std::time::Duration::from_millis(timeout_ms);
        let mut ack_rx = self.ack_rx.lock().await;

        while count < want {
            match tokio::time::timeout_at(deadline, ack_rx.recv()).await {
                Ok(Some(replica)) => {
                    debug!(replica = replica, "WAIT observed an ack");
                    count = self.count_acked(target).await;
                }
                // Channel closed (never happens while self lives) or deadline
                Ok(None) | Err(_) => break,
            }
        }

        count
    }

    // ======================================================================
    // Replica role
    // ======================================================================

    /// Bytes this replica has consumed from its primary.
    pub fn replica_offset(&self) -> u64 {
        self.replica_offset.load(Ordering::SeqCst)
    }

    /// Advances the replica-side offset by one frame's length.
    pub fn advance_replica_offset(&self, bytes: u64) {
        self.replica_offset.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Resets the replica-side offset after the handshake snapshot.
    pub fn reset_replica_offset(&self) {
        self.replica_offset.store(0, Ordering::SeqCst);
    }
}

/// Generates a 40-character alphanumeric replication ID.
fn generate_replication_id() -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}
