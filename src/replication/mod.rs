//! Replication Engine
//!
//! Primary/replica replication over the same wire protocol clients speak.
//! The primary registers replicas when they PSYNC, fans every accepted
//! write command out to them with byte-offset accounting, and answers WAIT
//! by counting acknowledged offsets. A server started with `--replicaof`
//! runs the replica role instead: handshake, snapshot, then an ingestion
//! loop that applies the primary's stream and tracks a local offset.
//!
//! ## Modules
//!
//! - `state`: primary-side registry, offsets, fan-out, and the WAIT barrier
//! - `replica`: replica-side handshake driver and ingestion loop

pub mod replica;
pub mod state;

pub use replica::{run_replica, ReplicationError};
pub use state::{ReplicaId, ReplicaLink, ReplicationState};
