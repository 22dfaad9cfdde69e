//! Storage Engine Module
//!
//! This module provides the core storage functionality for VoltKV: a
//! thread-safe, sharded keyspace of tagged values (strings and streams)
//! with TTL support, the stream log itself, and a background expiry
//! sweeper.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...64    │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │           │
//! │  └────┬────┘ └─────────┘ └─────────┘ └─────────┘           │
//! │       │  key -> String(bytes) | Stream(Arc<StreamLog>)     │
//! │       ▼                                                     │
//! │  ┌───────────────┐   per-stream RwLock, append-only log    │
//! │  │   StreamLog   │                                          │
//! │  └───────────────┘                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Sharded Storage**: 64 independent shards reduce lock contention
//! - **Tagged Values**: each key holds exactly one kind; type-confused
//!   access fails with `WRONGTYPE`
//! - **TTL Support**: lazy expiry on access plus an active background sweep
//! - **Streams**: per-key append-only logs with strictly increasing IDs and
//!   an append signal for blocking readers

pub mod engine;
pub mod expiry;
pub mod stream;

// Re-export commonly used types
pub use engine::{Entry, StorageEngine, StorageError, StorageStats, SweepOutcome, Value};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
pub use stream::{IdSpec, StreamEntry, StreamId, StreamIdError, StreamLog};
