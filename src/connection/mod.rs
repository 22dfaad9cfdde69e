//! Connection Handler Module
//!
//! This module manages individual client connections to VoltKV.
//! Each client connection is handled by its own async task, allowing
//! the server to handle thousands of concurrent clients efficiently.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                      (main.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept() + spawn
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  read bytes ──> parse RESP ──> route:                       │
//! │                    │                                        │
//! │                    ├── MULTI/EXEC/DISCARD (txn state)       │
//! │                    ├── REPLCONF / PSYNC (replica session)   │
//! │                    └── CommandHandler (everything else)     │
//! │                                                             │
//! │  PSYNC exit: write half -> replica registry,                │
//! │              read half  -> ACK reader task                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: one Tokio task per connection
//! - **Pipelining**: multiple commands per TCP segment
//! - **Transactions**: per-connection MULTI/EXEC queue, dropped on disconnect
//! - **Replica handover**: a PSYNC turns the connection into a replication link

pub mod handler;

// Re-export commonly used types
pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
