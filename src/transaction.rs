//! Per-Connection Transaction State
//!
//! MULTI/EXEC transactions are a per-connection concern: each connection
//! handler owns one `TransactionState`, so cleanup on disconnect is just
//! dropping the handler. While a transaction is active, the dispatch loop
//! queues every command other than MULTI/EXEC/DISCARD instead of executing
//! it, and EXEC later replays the queue through the normal path.

use bytes::Bytes;

/// A command captured while a transaction was active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    /// Uppercased command name
    pub name: String,
    /// The command's arguments, name excluded
    pub args: Vec<Bytes>,
}

/// The MULTI/EXEC state of one connection.
#[derive(Debug, Default)]
pub struct TransactionState {
    active: bool,
    queued: Vec<QueuedCommand>,
}

impl TransactionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a MULTI is currently open on this connection.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Opens a transaction. Fails if one is already open.
    pub fn begin(&mut self) -> Result<(), &'static str> {
        if self.active {
            return Err("MULTI calls can not be nested");
        }
        self.active = true;
        self.queued.clear();
        Ok(())
    }

    /// Appends a command to the open transaction's queue.
    pub fn queue(&mut self, name: String, args: Vec<Bytes>) {
        self.queued.push(QueuedCommand { name, args });
    }

    /// Closes the transaction and hands back the queued commands for
    /// execution. Fails if no transaction is open.
    pub fn take_queued(&mut self) -> Result<Vec<QueuedCommand>, &'static str> {
        if !self.active {
            return Err("ERR EXEC without MULTI");
        }
        self.active = false;
        Ok(std::mem::take(&mut self.queued))
    }

    /// Drops the transaction and its queue. Fails if no transaction is open.
    pub fn discard(&mut self) -> Result<(), &'static str> {
        if !self.active {
            return Err("ERR DISCARD without MULTI");
        }
        self.active = false;
        self.queued.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_queue() {
        let mut txn = TransactionState::new();
        assert!(!txn.is_active());

        txn.begin().unwrap();
        assert!(txn.is_active());

        txn.queue("SET".to_string(), vec![Bytes::from("x"), Bytes::from("1")]);
        txn.queue("INCR".to_string(), vec![Bytes::from("x")]);

        let queued = txn.take_queued().unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].name, "SET");
        assert_eq!(queued[1].name, "INCR");
        assert!(!txn.is_active());
    }

    #[test]
    fn test_nested_multi_rejected() {
        let mut txn = TransactionState::new();
        txn.begin().unwrap();
        assert_eq!(txn.begin(), Err("MULTI calls can not be nested"));
        // The original transaction is still open
        assert!(txn.is_active());
    }

    #[test]
    fn test_exec_without_multi() {
        let mut txn = TransactionState::new();
        assert_eq!(txn.take_queued(), Err("ERR EXEC without MULTI"));
    }

    #[test]
    fn test_discard() {
        let mut txn = TransactionState::new();
        assert_eq!(txn.discard(), Err("ERR DISCARD without MULTI"));

        txn.begin().unwrap();
        txn.queue("SET".to_string(), vec![Bytes::from("x"), Bytes::from("1")]);
        txn.discard().unwrap();
        assert!(!txn.is_active());

        // A fresh MULTI starts with an empty queue
        txn.begin().unwrap();
        assert!(txn.take_queued().unwrap().is_empty());
    }

    #[test]
    fn test_begin_clears_stale_queue() {
        let mut txn = TransactionState::new();
        txn.begin().unwrap();
        txn.queue("SET".to_string(), vec![Bytes::from("x"), Bytes::from("1")]);
        txn.discard().unwrap();

        txn.begin().unwrap();
        assert!(txn.take_queued().unwrap().is_empty());
    }
}
