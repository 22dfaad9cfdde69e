//! Command Handler Module
//!
//! This module implements the command processing layer for VoltKV.
//! It receives parsed commands, executes them against the storage engine
//! and replication state, and returns the RESP reply.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Parser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Connection loop │  (connection module: transactions, REPLCONF, PSYNC)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Dispatch     │
//! │  - Validate     │
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌──────────────────────────────────┐
//! │ StorageEngine │ ReplicationState │
//! └──────────────────────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### String and key commands
//! - `SET`, `GET`, `INCR`, `INCRBY`, `DEL`, `EXISTS`, `TYPE`, `KEYS`
//!
//! ### Stream commands
//! - `XADD`, `XRANGE`, `XREAD` (with `BLOCK`)
//!
//! ### Server commands
//! - `PING`, `ECHO`, `INFO`, `CONFIG GET`, `COMMAND`, `WAIT`

pub mod handler;

// Re-export the main command handler
pub use handler::CommandHandler;
