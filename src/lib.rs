//! # VoltKV - A Redis-Wire-Compatible In-Memory Key-Value Server
//!
//! VoltKV speaks the RESP protocol and implements the core of a Redis-style
//! server: a typed in-memory keyspace (strings with TTL, append-only
//! streams), MULTI/EXEC transactions, primary/replica replication with
//! byte-offset accounting, and a reader for the binary snapshot format.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               VoltKV                                 │
//! │                                                                      │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐               │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │               │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │               │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘               │
//! │                            │                  │                      │
//! │          MULTI queue, PSYNC│                  ▼                      │
//! │                            │    ┌──────────────────────────────────┐ │
//! │  ┌─────────────┐           │    │          StorageEngine           │ │
//! │  │   RESP      │           │    │  64 shards, tagged values,       │ │
//! │  │   Parser    │           │    │  TTL, per-stream locks           │ │
//! │  └─────────────┘           │    └──────────────────────────────────┘ │
//! │                            ▼                  ▲                      │
//! │  ┌──────────────────────────────┐             │                      │
//! │  │      ReplicationState        │   ┌─────────┴────────┐             │
//! │  │  replica links, offsets,     │   │  SnapshotLoader  │             │
//! │  │  fan-out, WAIT barrier       │   │   (startup)      │             │
//! │  └──────────────────────────────┘   └──────────────────┘             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Data flow: bytes → parser → command → (if in MULTI) transaction queue,
//! else → handler → keyspace / stream / replication fan-out → reply bytes.
//! A server started with `--replicaof` additionally runs the replica role:
//! handshake with the primary, then ingest its command stream and track a
//! local byte offset.
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP parser, serializer, and command-frame accounting
//! - [`storage`]: sharded keyspace, stream log, expiry sweeper
//! - [`snapshot`]: binary dump reader that seeds the keyspace
//! - [`transaction`]: per-connection MULTI/EXEC state
//! - [`replication`]: primary-side registry/fan-out/WAIT and the replica role
//! - [`commands`]: command dispatch
//! - [`connection`]: per-connection loop and replica-link handover
//! - [`server`]: configuration and shared state
//!
//! ## Supported Commands
//!
//! `PING`, `ECHO`, `GET`, `SET` (`PX`/`EX`), `INCR`, `INCRBY`, `DEL`,
//! `EXISTS`, `TYPE`, `KEYS`, `CONFIG GET`, `INFO`, `COMMAND`, `MULTI`,
//! `EXEC`, `DISCARD`, `REPLCONF`, `PSYNC`, `WAIT`, `XADD`, `XRANGE`,
//! `XREAD` (with `BLOCK`).

pub mod commands;
pub mod connection;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod snapshot;
pub mod storage;
pub mod transaction;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use connection::{handle_connection, ConnectionError, ConnectionStats};
pub use protocol::{ParseError, RespParser, RespValue};
pub use server::{Config, Role, Server};
pub use storage::{start_expiry_sweeper, StorageEngine};

/// The default port VoltKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// Version of VoltKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
