//! Command Handler Module
//!
//! This module implements the data-plane commands for VoltKV. It receives
//! a command name plus raw byte arguments and returns the RESP reply.
//!
//! ## Supported Commands
//!
//! ### Strings and keys
//! - `SET key value [PX ms | EX secs]`, `GET key`
//! - `INCR key`, `INCRBY key delta`
//! - `DEL key [key ...]`, `EXISTS key [key ...]`
//! - `TYPE key`, `KEYS pattern`
//!
//! ### Streams
//! - `XADD key id field value [field value ...]`
//! - `XRANGE key start end`
//! - `XREAD [BLOCK ms] STREAMS key [key ...] id [id ...]`
//!
//! ### Server
//! - `PING [message]`, `ECHO message`
//! - `INFO [section]`, `CONFIG GET parameter`, `COMMAND`
//! - `WAIT numreplicas timeout`
//!
//! Session-scoped commands (`MULTI`/`EXEC`/`DISCARD`, `REPLCONF`, `PSYNC`)
//! are resolved by the connection loop, which owns the per-connection
//! state they touch; everything here is a pure `args -> reply` function
//! over shared server state, which is also what lets EXEC replay queued
//! commands through this same path.
//!
//! Write commands check the server's role first: a replica refuses them
//! with `READONLY` and never touches the keyspace. On the primary, the
//! local mutation and the fan-out to replicas happen under the replication
//! registry lock so that all replicas see writes in effect order.

use crate::protocol::RespValue;
use crate::server::Server;
use crate::storage::{IdSpec, StreamEntry, StreamId};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reply sent for any write command arriving on a replica.
const READONLY_ERROR: &str = "READONLY You can't write against a read only replica.";

/// Executes data-plane commands against shared server state.
#[derive(Clone)]
pub struct CommandHandler {
    server: Arc<Server>,
}

impl CommandHandler {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Executes a command and returns the response.
    ///
    /// `name` must already be uppercased by the caller; `args` excludes the
    /// command name.
    pub async fn execute(&self, name: &str, args: &[Bytes]) -> RespValue {
        debug!(command = name, args = args.len(), "Executing command");

        match name {
            "PING" => self.cmd_ping(args),
            "ECHO" => self.cmd_echo(args),
            "GET" => self.cmd_get(args),
            "SET" => self.cmd_set(args).await,
            "INCR" => self.cmd_incr_by(args, 1).await,
            "INCRBY" => self.cmd_incrby(args).await,
            "DEL" => self.cmd_del(args).await,
            "EXISTS" => self.cmd_exists(args),
            "TYPE" => self.cmd_type(args),
            "KEYS" => self.cmd_keys(args),
            "CONFIG" => self.cmd_config(args),
            "INFO" => self.cmd_info(args),
            "COMMAND" => RespValue::ok(),
            "WAIT" => self.cmd_wait(args).await,
            "XADD" => self.cmd_xadd(args).await,
            "XRANGE" => self.cmd_xrange(args),
            "XREAD" => self.cmd_xread(args).await,
            _ => RespValue::error(format!("unknown command '{}'", name)),
        }
    }

    // ========================================================================
    // Helper functions
    // ========================================================================

    fn arg_str(args: &[Bytes], index: usize) -> Option<String> {
        args.get(index)
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(|s| s.to_string())
    }

    fn arg_int(args: &[Bytes], index: usize) -> Option<i64> {
        Self::arg_str(args, index).and_then(|s| s.parse().ok())
    }

    fn arity_error(command: &str) -> RespValue {
        RespValue::error(format!(
            "ERR wrong number of arguments for '{}' command",
            command
        ))
    }

    // ========================================================================
    // String commands
    // ========================================================================

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> RespValue {
        if args.len() != 1 {
            return Self::arity_error("GET");
        }

        match self.server.storage().get(&args[0]) {
            Ok(Some(value)) => RespValue::bulk_string(value),
            Ok(None) => RespValue::null(),
            Err(e) => RespValue::error(e.to_string()),
        }
    }

    /// SET key value [PX milliseconds | EX seconds]
    async fn cmd_set(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return Self::arity_error("SET");
        }
        if !self.server.is_primary() {
            return RespValue::error(READONLY_ERROR);
        }

        let key = args[0].clone();
        let value = args[1].clone();

        let mut ttl: Option<Duration> = None;
        let mut i = 2;
        while i < args.len() {
            let opt = match Self::arg_str(args, i) {
                Some(s) => s.to_uppercase(),
                None => return RespValue::error("ERR syntax error"),
            };
            match opt.as_str() {
                "PX" => {
                    let ms = match Self::arg_int(args, i + 1) {
                        Some(ms) if ms > 0 => ms as u64,
                        _ => return RespValue::error("ERR invalid expire time in 'set' command"),
                    };
                    ttl = Some(Duration::from_millis(ms));
                    i += 2;
                }
                "EX" => {
                    let secs = match Self::arg_int(args, i + 1) {
                        Some(secs) if secs > 0 => secs as u64,
                        _ => return RespValue::error("ERR invalid expire time in 'set' command"),
                    };
                    ttl = Some(Duration::from_secs(secs));
                    i += 2;
                }
                _ => return RespValue::error("ERR syntax error"),
            }
        }

        // Rebuild the canonical frame for replicas: SET key value [PX ms]
        let mut fan_out = vec![Bytes::from_static(b"SET"), key.clone(), value.clone()];
        if let Some(ttl) = ttl {
            fan_out.push(Bytes::from_static(b"PX"));
            fan_out.push(Bytes::from(ttl.as_millis().to_string()));
        }

        let storage = self.server.storage();
        self.server
            .replication()
            .apply_write(|| {
                storage.set(key, value, ttl);
                (RespValue::ok(), Some(fan_out))
            })
            .await
    }

    /// INCR key (delta 1)
    async fn cmd_incr_by(&self, args: &[Bytes], delta: i64) -> RespValue {
        if args.len() != 1 {
            return Self::arity_error("INCR");
        }
        if !self.server.is_primary() {
            return RespValue::error(READONLY_ERROR);
        }

        let key = args[0].clone();
        let fan_out = vec![
            Bytes::from_static(b"INCRBY"),
            key.clone(),
            Bytes::from(delta.to_string()),
        ];

        let storage = self.server.storage();
        self.server
            .replication()
            .apply_write(|| match storage.incr_by(&key, delta) {
                Ok(n) => (RespValue::integer(n), Some(fan_out)),
                // A rejected write is not replicated
                Err(e) => (RespValue::error(e.to_string()), None),
            })
            .await
    }

    /// INCRBY key delta
    async fn cmd_incrby(&self, args: &[Bytes]) -> RespValue {
        if args.len() != 2 {
            return Self::arity_error("INCRBY");
        }
        let Some(delta) = Self::arg_int(args, 1) else {
            return RespValue::error("ERR value is not an integer or out of range");
        };
        self.cmd_incr_by(&args[..1], delta).await
    }

    /// DEL key [key ...]
    async fn cmd_del(&self, args: &[Bytes]) -> RespValue {
        if args.is_empty() {
            return Self::arity_error("DEL");
        }
        if !self.server.is_primary() {
            return RespValue::error(READONLY_ERROR);
        }

        let mut fan_out = vec![Bytes::from_static(b"DEL")];
        fan_out.extend(args.iter().cloned());

        let storage = self.server.storage();
        self.server
            .replication()
            .apply_write(|| {
                let deleted = args.iter().filter(|key| storage.delete(key)).count();
                (RespValue::integer(deleted as i64), Some(fan_out))
            })
            .await
    }

    /// EXISTS key [key ...]
    fn cmd_exists(&self, args: &[Bytes]) -> RespValue {
        if args.is_empty() {
            return Self::arity_error("EXISTS");
        }

        let storage = self.server.storage();
        let count = args.iter().filter(|key| storage.exists(key)).count();
        RespValue::integer(count as i64)
    }

    // ========================================================================
    // Key commands
    // ========================================================================

    /// TYPE key
    fn cmd_type(&self, args: &[Bytes]) -> RespValue {
        if args.len() != 1 {
            return Self::arity_error("TYPE");
        }
        RespValue::simple_string(self.server.storage().value_type(&args[0]))
    }

    /// KEYS pattern
    fn cmd_keys(&self, args: &[Bytes]) -> RespValue {
        if args.len() != 1 {
            return Self::arity_error("KEYS");
        }

        let pattern = match Self::arg_str(args, 0) {
            Some(p) => p,
            None => return RespValue::error("ERR invalid pattern"),
        };

        let keys = self.server.storage().keys(&pattern);
        RespValue::array(keys.into_iter().map(RespValue::bulk_string).collect())
    }

    // ========================================================================
    // Server commands
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, args: &[Bytes]) -> RespValue {
        match args.first() {
            Some(msg) => RespValue::bulk_string(msg.clone()),
            None => RespValue::pong(),
        }
    }

    /// ECHO message
    fn cmd_echo(&self, args: &[Bytes]) -> RespValue {
        if args.len() != 1 {
            return Self::arity_error("ECHO");
        }
        RespValue::bulk_string(args[0].clone())
    }

    /// CONFIG GET parameter
    fn cmd_config(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return Self::arity_error("CONFIG");
        }

        let subcommand = Self::arg_str(args, 0).unwrap_or_default().to_uppercase();
        if subcommand != "GET" {
            return RespValue::error(format!(
                "ERR unknown CONFIG subcommand '{}'",
                subcommand
            ));
        }

        let parameter = Self::arg_str(args, 1).unwrap_or_default().to_lowercase();
        let config = self.server.config();
        match parameter.as_str() {
            "dir" => RespValue::array(vec![
                RespValue::bulk_string(Bytes::from_static(b"dir")),
                RespValue::bulk_string(Bytes::from(config.dir.clone())),
            ]),
            "dbfilename" => RespValue::array(vec![
                RespValue::bulk_string(Bytes::from_static(b"dbfilename")),
                RespValue::bulk_string(Bytes::from(config.dbfilename.clone())),
            ]),
            _ => RespValue::error("ERR unsupported CONFIG parameter"),
        }
    }

    /// INFO [section]
    fn cmd_info(&self, _args: &[Bytes]) -> RespValue {
        // Only the replication section is populated
        RespValue::bulk_string(Bytes::from(self.server.replication_info()))
    }

    /// WAIT numreplicas timeout
    async fn cmd_wait(&self, args: &[Bytes]) -> RespValue {
        if args.len() != 2 {
            return Self::arity_error("WAIT");
        }
        if !self.server.is_primary() {
            return RespValue::error("ERR WAIT cannot be used with replica instances");
        }

        let (Some(want), Some(timeout_ms)) =
            (Self::arg_int(args, 0), Self::arg_int(args, 1))
        else {
            return RespValue::error("ERR timeout is not an integer or out of range");
        };
        if want < 0 || timeout_ms < 0 {
            return RespValue::error("ERR timeout is negative");
        }

        let acked = self
            .server
            .replication()
            .wait_for_acks(want as usize, timeout_ms as u64)
            .await;
        RespValue::integer(acked as i64)
    }

    // ========================================================================
    // Stream commands
    // ========================================================================

    /// XADD key id field value [field value ...]
    async fn cmd_xadd(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 4 || (args.len() - 2) % 2 != 0 {
            return Self::arity_error("XADD");
        }
        if !self.server.is_primary() {
            return RespValue::error(READONLY_ERROR);
        }

        let key = args[0].clone();
        let spec = match Self::arg_str(args, 1).as_deref().map(IdSpec::parse) {
            Some(Ok(spec)) => spec,
            _ => {
                return RespValue::error(
                    "ERR Invalid stream ID specified as stream command argument",
                )
            }
        };

        let fields: Vec<(Bytes, Bytes)> = args[2..]
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        let storage = self.server.storage();
        self.server
            .replication()
            .apply_write(|| match storage.stream_add(&key, spec, fields.clone()) {
                Ok(id) => {
                    // Replicas get the resolved ID so auto-generation cannot
                    // diverge between nodes
                    let mut fan_out = vec![
                        Bytes::from_static(b"XADD"),
                        key.clone(),
                        Bytes::from(id.to_string()),
                    ];
                    for (name, value) in &fields {
                        fan_out.push(name.clone());
                        fan_out.push(value.clone());
                    }
                    (
                        RespValue::bulk_string(Bytes::from(id.to_string())),
                        Some(fan_out),
                    )
                }
                Err(e) => (RespValue::error(e.to_string()), None),
            })
            .await
    }

    /// XRANGE key start end
    fn cmd_xrange(&self, args: &[Bytes]) -> RespValue {
        if args.len() != 3 {
            return Self::arity_error("XRANGE");
        }

        let (start, end) = match (Self::arg_str(args, 1), Self::arg_str(args, 2)) {
            (Some(s), Some(e)) => match (
                StreamId::parse_range_start(&s),
                StreamId::parse_range_end(&e),
            ) {
                (Ok(start), Ok(end)) => (start, end),
                (Err(err), _) | (_, Err(err)) => return RespValue::error(err.to_string()),
            },
            _ => {
                return RespValue::error(
                    "ERR Invalid stream ID specified as stream command argument",
                )
            }
        };

        match self.server.storage().stream_range(&args[0], start, end) {
            Ok(entries) => entries_reply(&entries),
            Err(e) => RespValue::error(e.to_string()),
        }
    }

    /// XREAD [BLOCK milliseconds] STREAMS key [key ...] id [id ...]
    async fn cmd_xread(&self, args: &[Bytes]) -> RespValue {
        if args.len() < 3 {
            return Self::arity_error("XREAD");
        }

        let mut index = 0;
        let mut block_ms: Option<u64> = None;

        if Self::arg_str(args, 0)
            .map(|s| s.eq_ignore_ascii_case("BLOCK"))
            .unwrap_or(false)
        {
            let Some(ms) = Self::arg_int(args, 1).filter(|ms| *ms >= 0) else {
                return RespValue::error("ERR timeout is not an integer or out of range");
            };
            block_ms = Some(ms as u64);
            index = 2;
        }

        if !Self::arg_str(args, index)
            .map(|s| s.eq_ignore_ascii_case("STREAMS"))
            .unwrap_or(false)
        {
            return RespValue::error("ERR syntax error");
        }
        index += 1;

        let remaining = &args[index..];
        if remaining.is_empty() || remaining.len() % 2 != 0 {
            return RespValue::error(
                "ERR Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified",
            );
        }

        let count = remaining.len() / 2;
        let keys: Vec<Bytes> = remaining[..count].to_vec();

        // Resolve start IDs now; `$` pins to the stream's last ID at
        // request time, so entries appended afterwards are the ones seen
        let storage = self.server.storage();
        let mut after = Vec::with_capacity(count);
        for (i, raw) in remaining[count..].iter().enumerate() {
            let Some(raw) = std::str::from_utf8(raw).ok() else {
                return RespValue::error(
                    "ERR Invalid stream ID specified as stream command argument",
                );
            };
            if raw == "$" {
                after.push(storage.stream_last_id(&keys[i]));
            } else {
                match StreamId::parse(raw) {
                    Ok(id) => after.push(id),
                    Err(e) => return RespValue::error(e.to_string()),
                }
            }
        }

        match block_ms {
            None => match storage.stream_read_multi(&keys, &after) {
                Ok(results) => xread_reply(&results),
                Err(e) => RespValue::error(e.to_string()),
            },
            Some(block_ms) => self.blocking_xread(&keys, &after, block_ms).await,
        }
    }

    /// Re-scans the requested streams after every append signal until
    /// something shows up or the deadline passes. `block_ms == 0` blocks
    /// until data arrives.
    async fn blocking_xread(
        &self,
        keys: &[Bytes],
        after: &[StreamId],
        block_ms: u64,
    ) -> RespValue {
        let storage = self.server.storage();
        let deadline =
            (block_ms > 0).then(|| tokio::time::Instant::now() + Duration::from_millis(block_ms));

        loop {
            // Arm the signal before scanning so an append between the scan
            // and the await still wakes us
            let appended = storage.stream_appended();

            match storage.stream_read_multi(keys, after) {
                Ok(results) if !results.is_empty() => return xread_reply(&results),
                Ok(_) => {}
                Err(e) => return RespValue::error(e.to_string()),
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = appended => {}
                        _ = tokio::time::sleep_until(deadline) => return RespValue::null(),
                    }
                }
                None => appended.await,
            }
        }
    }
}

/// Encodes stream entries as `[[id, [field, value, ...]], ...]`.
fn entries_reply(entries: &[StreamEntry]) -> RespValue {
    RespValue::array(
        entries
            .iter()
            .map(|entry| {
                let mut fields = Vec::with_capacity(entry.fields.len() * 2);
                for (name, value) in &entry.fields {
                    fields.push(RespValue::bulk_string(name.clone()));
                    fields.push(RespValue::bulk_string(value.clone()));
                }
                RespValue::array(vec![
                    RespValue::bulk_string(Bytes::from(entry.id.to_string())),
                    RespValue::array(fields),
                ])
            })
            .collect(),
    )
}

/// Encodes an XREAD result as `[[key, entries], ...]`, or the null reply
/// when no stream produced anything.
fn xread_reply(results: &[(Bytes, Vec<StreamEntry>)]) -> RespValue {
    if results.is_empty() {
        return RespValue::null();
    }
    RespValue::array(
        results
            .iter()
            .map(|(key, entries)| {
                RespValue::array(vec![
                    RespValue::bulk_string(key.clone()),
                    entries_reply(entries),
                ])
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Config;
    use crate::storage::StorageEngine;

    fn primary_handler() -> CommandHandler {
        let server = Server::new(Config::default(), Arc::new(StorageEngine::new()));
        CommandHandler::new(Arc::new(server))
    }

    fn replica_handler() -> CommandHandler {
        let config = Config {
            replica_of: Some(("127.0.0.1".to_string(), 1)),
            ..Default::default()
        };
        let server = Server::new(config, Arc::new(StorageEngine::new()));
        CommandHandler::new(Arc::new(server))
    }

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::from(p.to_string())).collect()
    }

    #[tokio::test]
    async fn test_ping() {
        let handler = primary_handler();

        let response = handler.execute("PING", &[]).await;
        assert_eq!(response, RespValue::simple_string("PONG"));

        let response = handler.execute("PING", &args(&["hello"])).await;
        assert_eq!(response, RespValue::bulk_string(Bytes::from("hello")));
    }

    #[tokio::test]
    async fn test_echo() {
        let handler = primary_handler();
        let response = handler.execute("ECHO", &args(&["hey"])).await;
        assert_eq!(response, RespValue::bulk_string(Bytes::from("hey")));

        let response = handler.execute("ECHO", &[]).await;
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_set_get() {
        let handler = primary_handler();

        let response = handler.execute("SET", &args(&["key", "value"])).await;
        assert_eq!(response, RespValue::ok());

        let response = handler.execute("GET", &args(&["key"])).await;
        assert_eq!(response, RespValue::bulk_string(Bytes::from("value")));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let handler = primary_handler();
        let response = handler.execute("GET", &args(&["nope"])).await;
        assert_eq!(response, RespValue::null());
    }

    #[tokio::test]
    async fn test_set_px_expires() {
        let handler = primary_handler();

        let response = handler
            .execute("SET", &args(&["foo", "bar", "PX", "80"]))
            .await;
        assert_eq!(response, RespValue::ok());

        let response = handler.execute("GET", &args(&["foo"])).await;
        assert_eq!(response, RespValue::bulk_string(Bytes::from("bar")));

        tokio::time::sleep(Duration::from_millis(130)).await;
        let response = handler.execute("GET", &args(&["foo"])).await;
        assert_eq!(response, RespValue::null());
    }

    #[tokio::test]
    async fn test_set_advances_replication_offset() {
        let handler = primary_handler();
        assert_eq!(handler.server.replication().offset(), 0);

        handler.execute("SET", &args(&["k", "v"])).await;
        let expected = crate::protocol::frame_len(&args(&["SET", "k", "v"]));
        assert_eq!(handler.server.replication().offset(), expected);

        // Reads do not move the offset
        handler.execute("GET", &args(&["k"])).await;
        assert_eq!(handler.server.replication().offset(), expected);
    }

    #[tokio::test]
    async fn test_write_commands_readonly_on_replica() {
        let handler = replica_handler();

        for (name, cmd_args) in [
            ("SET", args(&["k", "v"])),
            ("INCR", args(&["k"])),
            ("DEL", args(&["k"])),
            ("XADD", args(&["s", "*", "a", "1"])),
        ] {
            let response = handler.execute(name, &cmd_args).await;
            assert_eq!(
                response,
                RespValue::error(READONLY_ERROR),
                "{} should be refused on a replica",
                name
            );
        }

        // Reads still work
        let response = handler.execute("GET", &args(&["k"])).await;
        assert_eq!(response, RespValue::null());
    }

    #[tokio::test]
    async fn test_incr() {
        let handler = primary_handler();

        assert_eq!(
            handler.execute("INCR", &args(&["counter"])).await,
            RespValue::integer(1)
        );
        assert_eq!(
            handler.execute("INCR", &args(&["counter"])).await,
            RespValue::integer(2)
        );
        assert_eq!(
            handler.execute("INCRBY", &args(&["counter", "10"])).await,
            RespValue::integer(12)
        );

        handler.execute("SET", &args(&["text", "abc"])).await;
        let response = handler.execute("INCR", &args(&["text"])).await;
        assert_eq!(
            response,
            RespValue::error("ERR value is not an integer or out of range")
        );
    }

    #[tokio::test]
    async fn test_del_exists() {
        let handler = primary_handler();

        handler.execute("SET", &args(&["k1", "v"])).await;
        handler.execute("SET", &args(&["k2", "v"])).await;

        assert_eq!(
            handler.execute("EXISTS", &args(&["k1", "k2", "k3"])).await,
            RespValue::integer(2)
        );
        assert_eq!(
            handler.execute("DEL", &args(&["k1", "k3"])).await,
            RespValue::integer(1)
        );
        assert_eq!(
            handler.execute("EXISTS", &args(&["k1"])).await,
            RespValue::integer(0)
        );
    }

    #[tokio::test]
    async fn test_type() {
        let handler = primary_handler();

        assert_eq!(
            handler.execute("TYPE", &args(&["missing"])).await,
            RespValue::simple_string("none")
        );

        handler.execute("SET", &args(&["s", "hello"])).await;
        assert_eq!(
            handler.execute("TYPE", &args(&["s"])).await,
            RespValue::simple_string("string")
        );

        handler.execute("SET", &args(&["n", "17"])).await;
        assert_eq!(
            handler.execute("TYPE", &args(&["n"])).await,
            RespValue::simple_string("integer")
        );

        handler.execute("SET", &args(&["f", "1.5"])).await;
        assert_eq!(
            handler.execute("TYPE", &args(&["f"])).await,
            RespValue::simple_string("float")
        );

        handler.execute("XADD", &args(&["st", "1-1", "a", "b"])).await;
        assert_eq!(
            handler.execute("TYPE", &args(&["st"])).await,
            RespValue::simple_string("stream")
        );
    }

    #[tokio::test]
    async fn test_keys() {
        let handler = primary_handler();

        handler.execute("SET", &args(&["hello", "1"])).await;
        handler.execute("SET", &args(&["hallo", "2"])).await;
        handler.execute("SET", &args(&["world", "3"])).await;

        let response = handler.execute("KEYS", &args(&["h?llo"])).await;
        let arr = response.into_array().unwrap();
        assert_eq!(arr.len(), 2);
    }

    #[tokio::test]
    async fn test_config_get() {
        let config = Config {
            dir: "/data".to_string(),
            dbfilename: "dump.rdb".to_string(),
            ..Default::default()
        };
        let server = Server::new(config, Arc::new(StorageEngine::new()));
        let handler = CommandHandler::new(Arc::new(server));

        let response = handler.execute("CONFIG", &args(&["GET", "dir"])).await;
        assert_eq!(
            response,
            RespValue::array(vec![
                RespValue::bulk_string(Bytes::from("dir")),
                RespValue::bulk_string(Bytes::from("/data")),
            ])
        );

        let response = handler
            .execute("CONFIG", &args(&["GET", "dbfilename"]))
            .await;
        assert_eq!(
            response,
            RespValue::array(vec![
                RespValue::bulk_string(Bytes::from("dbfilename")),
                RespValue::bulk_string(Bytes::from("dump.rdb")),
            ])
        );

        let response = handler.execute("CONFIG", &args(&["GET", "maxmemory"])).await;
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_info_replication() {
        let handler = primary_handler();
        let response = handler.execute("INFO", &args(&["replication"])).await;
        let text = String::from_utf8(response.as_bytes().unwrap().to_vec()).unwrap();
        assert!(text.contains("role:master"));
        assert!(text.contains("master_repl_offset:0"));
    }

    #[tokio::test]
    async fn test_wait_no_replicas() {
        let handler = primary_handler();
        let start = std::time::Instant::now();
        let response = handler.execute("WAIT", &args(&["0", "100"])).await;
        assert_eq!(response, RespValue::integer(0));
        assert!(start.elapsed() < Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_wait_on_replica_errors() {
        let handler = replica_handler();
        let response = handler.execute("WAIT", &args(&["0", "100"])).await;
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let handler = primary_handler();
        let response = handler.execute("FROB", &args(&["x"])).await;
        assert_eq!(response, RespValue::error("unknown command 'FROB'"));
    }

    // ========================================================================
    // Stream command tests
    // ========================================================================

    #[tokio::test]
    async fn test_xadd_id_validation() {
        let handler = primary_handler();

        let response = handler.execute("XADD", &args(&["s", "0-0", "a", "1"])).await;
        assert_eq!(
            response,
            RespValue::error("ERR The ID specified in XADD must be greater than 0-0")
        );

        let response = handler.execute("XADD", &args(&["s", "0-1", "a", "1"])).await;
        assert_eq!(response, RespValue::bulk_string(Bytes::from("0-1")));

        let response = handler.execute("XADD", &args(&["s", "0-1", "a", "2"])).await;
        assert_eq!(
            response,
            RespValue::error(
                "ERR The ID specified in XADD is equal or smaller than the target stream top item"
            )
        );

        let response = handler.execute("XADD", &args(&["s", "0-*", "b", "2"])).await;
        assert_eq!(response, RespValue::bulk_string(Bytes::from("0-2")));
    }

    #[tokio::test]
    async fn test_xadd_odd_fields_is_arity_error() {
        let handler = primary_handler();
        let response = handler.execute("XADD", &args(&["s", "*", "a"])).await;
        assert_eq!(
            response,
            RespValue::error("ERR wrong number of arguments for 'XADD' command")
        );
    }

    #[tokio::test]
    async fn test_xadd_wrongtype() {
        let handler = primary_handler();
        handler.execute("SET", &args(&["plain", "v"])).await;
        let response = handler
            .execute("XADD", &args(&["plain", "*", "a", "1"]))
            .await;
        assert_eq!(
            response,
            RespValue::error(
                "WRONGTYPE Operation against a key holding the wrong kind of value"
            )
        );
    }

    #[tokio::test]
    async fn test_xrange() {
        let handler = primary_handler();

        for id in ["0-1", "0-2", "1-0"] {
            handler.execute("XADD", &args(&["s", id, "n", "x"])).await;
        }

        let response = handler.execute("XRANGE", &args(&["s", "-", "+"])).await;
        let entries = response.into_array().unwrap();
        assert_eq!(entries.len(), 3);

        // First entry is [id, [field, value]]
        let first = entries[0].clone().into_array().unwrap();
        assert_eq!(first[0], RespValue::bulk_string(Bytes::from("0-1")));
        assert_eq!(
            first[1],
            RespValue::array(vec![
                RespValue::bulk_string(Bytes::from("n")),
                RespValue::bulk_string(Bytes::from("x")),
            ])
        );

        let response = handler.execute("XRANGE", &args(&["s", "0-2", "+"])).await;
        let entries = response.into_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].clone().into_array().unwrap()[0],
            RespValue::bulk_string(Bytes::from("0-2"))
        );
    }

    #[tokio::test]
    async fn test_xrange_missing_key() {
        let handler = primary_handler();
        let response = handler.execute("XRANGE", &args(&["nope", "-", "+"])).await;
        assert_eq!(response, RespValue::array(vec![]));
    }

    #[tokio::test]
    async fn test_xread() {
        let handler = primary_handler();

        handler.execute("XADD", &args(&["s", "1-1", "a", "1"])).await;
        handler.execute("XADD", &args(&["s", "1-2", "a", "2"])).await;

        let response = handler
            .execute("XREAD", &args(&["STREAMS", "s", "1-1"]))
            .await;
        let streams = response.into_array().unwrap();
        assert_eq!(streams.len(), 1);

        let stream = streams[0].clone().into_array().unwrap();
        assert_eq!(stream[0], RespValue::bulk_string(Bytes::from("s")));
        let entries = stream[1].clone().into_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].clone().into_array().unwrap()[0],
            RespValue::bulk_string(Bytes::from("1-2"))
        );

        // Nothing after the last ID
        let response = handler
            .execute("XREAD", &args(&["STREAMS", "s", "1-2"]))
            .await;
        assert_eq!(response, RespValue::null());
    }

    #[tokio::test]
    async fn test_xread_multiple_streams() {
        let handler = primary_handler();

        handler.execute("XADD", &args(&["a", "1-1", "f", "1"])).await;
        handler.execute("XADD", &args(&["b", "1-1", "f", "2"])).await;

        let response = handler
            .execute("XREAD", &args(&["STREAMS", "a", "b", "0-0", "0-0"]))
            .await;
        let streams = response.into_array().unwrap();
        assert_eq!(streams.len(), 2);
    }

    #[tokio::test]
    async fn test_xread_block_returns_on_append() {
        let handler = primary_handler();
        handler.execute("XADD", &args(&["s", "1-1", "a", "1"])).await;

        let reader = handler.clone();
        let read_task = tokio::spawn(async move {
            reader
                .execute("XREAD", &args(&["BLOCK", "2000", "STREAMS", "s", "$"]))
                .await
        });

        // Let the reader block, then append
        tokio::time::sleep(Duration::from_millis(50)).await;
        handler.execute("XADD", &args(&["s", "2-1", "a", "2"])).await;

        let response = read_task.await.unwrap();
        let streams = response.into_array().unwrap();
        let stream = streams[0].clone().into_array().unwrap();
        let entries = stream[1].clone().into_array().unwrap();
        assert_eq!(
            entries[0].clone().into_array().unwrap()[0],
            RespValue::bulk_string(Bytes::from("2-1"))
        );
    }

    #[tokio::test]
    async fn test_xread_block_times_out_with_null() {
        let handler = primary_handler();
        handler.execute("XADD", &args(&["s", "1-1", "a", "1"])).await;

        let start = std::time::Instant::now();
        let response = handler
            .execute("XREAD", &args(&["BLOCK", "80", "STREAMS", "s", "$"]))
            .await;
        assert_eq!(response, RespValue::null());
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_xread_unbalanced() {
        let handler = primary_handler();
        let response = handler
            .execute("XREAD", &args(&["STREAMS", "a", "b", "0-0"]))
            .await;
        assert!(response.is_error());
    }
}
