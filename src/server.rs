//! Server Configuration and Shared State
//!
//! `Config` is what the CLI flags resolve to; `Server` bundles the pieces
//! every connection task needs: the configuration, the storage engine, and
//! the replication state. One `Arc<Server>` is cloned into each task.

use crate::replication::ReplicationState;
use crate::storage::StorageEngine;
use std::path::PathBuf;
use std::sync::Arc;

/// Which side of the replication topology this server is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// Server configuration resolved from CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on
    pub port: u16,
    /// Directory holding the snapshot file
    pub dir: String,
    /// Snapshot file name; empty means no snapshot load
    pub dbfilename: String,
    /// Primary to follow, as `(host, port)`; presence switches the role
    pub replica_of: Option<(String, u16)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6379,
            dir: String::new(),
            dbfilename: String::new(),
            replica_of: None,
        }
    }
}

impl Config {
    /// Returns the bind address as a string.
    pub fn bind_address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn role(&self) -> Role {
        if self.replica_of.is_some() {
            Role::Replica
        } else {
            Role::Primary
        }
    }

    /// The primary's address, if this server is a replica.
    pub fn primary_address(&self) -> Option<String> {
        self.replica_of
            .as_ref()
            .map(|(host, port)| format!("{}:{}", host, port))
    }

    /// The snapshot path, if a dbfilename was configured.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        if self.dbfilename.is_empty() {
            return None;
        }
        let mut path = PathBuf::from(&self.dir);
        path.push(&self.dbfilename);
        Some(path)
    }
}

/// Everything a connection task needs, shared behind one `Arc`.
#[derive(Debug)]
pub struct Server {
    config: Config,
    storage: Arc<StorageEngine>,
    replication: ReplicationState,
}

impl Server {
    pub fn new(config: Config, storage: Arc<StorageEngine>) -> Self {
        Self {
            config,
            storage,
            replication: ReplicationState::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn replication(&self) -> &ReplicationState {
        &self.replication
    }

    pub fn role(&self) -> Role {
        self.config.role()
    }

    pub fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }

    /// The replication section served by INFO.
    pub fn replication_info(&self) -> String {
        let mut info = String::from("# Replication\r\n");
        match self.role() {
            Role::Primary => {
                info.push_str("role:master\r\n");
                info.push_str(&format!(
                    "master_replid:{}\r\n",
                    self.replication.replication_id()
                ));
                info.push_str(&format!(
                    "master_repl_offset:{}\r\n",
                    self.replication.offset()
                ));
            }
            Role::Replica => {
                info.push_str("role:slave\r\n");
                if let Some((host, port)) = &self.config.replica_of {
                    info.push_str(&format!("master_host:{}\r\n", host));
                    info.push_str(&format!("master_port:{}\r\n", port));
                }
                info.push_str(&format!(
                    "master_replid:{}\r\n",
                    self.replication.replication_id()
                ));
                info.push_str(&format!(
                    "master_repl_offset:{}\r\n",
                    self.replication.replica_offset()
                ));
            }
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_config() {
        let config = Config::default();
        assert_eq!(config.role(), Role::Primary);

        let config = Config {
            replica_of: Some(("localhost".to_string(), 6380)),
            ..Default::default()
        };
        assert_eq!(config.role(), Role::Replica);
        assert_eq!(config.primary_address().unwrap(), "localhost:6380");
    }

    #[test]
    fn test_snapshot_path() {
        let config = Config::default();
        assert!(config.snapshot_path().is_none());

        let config = Config {
            dir: "/tmp/data".to_string(),
            dbfilename: "dump.rdb".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.snapshot_path().unwrap(),
            PathBuf::from("/tmp/data/dump.rdb")
        );
    }

    #[test]
    fn test_replication_info_primary() {
        let server = Server::new(Config::default(), Arc::new(StorageEngine::new()));
        let info = server.replication_info();
        assert!(info.contains("role:master"));
        assert!(info.contains("master_repl_offset:0"));
        assert!(info.contains(&format!(
            "master_replid:{}",
            server.replication().replication_id()
        )));
    }

    #[test]
    fn test_replication_info_replica() {
        let config = Config {
            replica_of: Some(("127.0.0.1".to_string(), 7000)),
            ..Default::default()
        };
        let server = Server::new(config, Arc::new(StorageEngine::new()));
        let info = server.replication_info();
        assert!(info.contains("role:slave"));
        assert!(info.contains("master_host:127.0.0.1"));
        assert!(info.contains("master_port:7000"));
    }
}
