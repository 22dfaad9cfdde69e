//! Thread-Safe Typed Keyspace with Expiry Support
//!
//! This module implements the core storage engine for VoltKV: a concurrent
//! mapping from binary keys to tagged values (strings or streams) with
//! TTL support.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: Instead of one big lock, we use multiple shards to reduce contention.
//! 2. **Lazy Expiry**: Keys are checked for expiry on access (lazy) plus background cleanup.
//! 3. **Tagged Values**: One map holds both value kinds, so "a key maps to
//!    exactly one variant" and `WRONGTYPE` are decidable per key.
//! 4. **Per-Stream Locks**: Streams are shared as `Arc<StreamLog>` handles
//!    with their own lock, so appends never hold a shard lock.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys are distributed across shards using a hash function. This allows
//! multiple tasks to read/write different keys concurrently without
//! blocking each other.

use crate::storage::stream::{IdSpec, StreamEntry, StreamId, StreamIdError, StreamLog};
use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Number of shards for the storage engine.
/// More shards = less lock contention, but more memory overhead.
const NUM_SHARDS: usize = 64;

/// Errors surfaced by keyspace operations. The display strings are the
/// exact wire error messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The key holds a value of a different kind than the operation expects
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// INCR/INCRBY against a value that is not a decimal integer
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    /// Stream ID parse/generation failure
    #[error(transparent)]
    StreamId(#[from] StreamIdError),
}

/// A stored value: exactly one variant per key.
#[derive(Debug, Clone)]
pub enum Value {
    /// A binary-safe string
    String(Bytes),
    /// An append-only stream, shared so appenders lock the stream, not the shard
    Stream(Arc<StreamLog>),
}

/// Represents a stored value with optional expiry time.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The actual value stored
    pub value: Value,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// When this entry was created
    pub created_at: Instant,
}

impl Entry {
    /// Creates a new entry without expiry.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
            created_at: Instant::now(),
        }
    }

    /// Creates a new entry with TTL.
    pub fn with_ttl(value: Value, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: Some(now + ttl),
            created_at: now,
        }
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }
}

/// A single shard containing a portion of the key-value pairs.
#[derive(Debug)]
struct Shard {
    data: RwLock<HashMap<Bytes, Entry>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

/// The main storage engine for VoltKV.
///
/// This struct is designed to be wrapped in an `Arc` and shared across
/// all client handler tasks. All operations are thread-safe.
///
/// # Example
///
/// ```
/// use voltkv::storage::StorageEngine;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Bytes::from("mika"), None);
/// let value = engine.get(&Bytes::from("name")).unwrap();
/// assert_eq!(value, Some(Bytes::from("mika")));
///
/// // Set with expiry
/// engine.set(
///     Bytes::from("session"),
///     Bytes::from("abc123"),
///     Some(Duration::from_secs(60)),
/// );
/// ```
pub struct StorageEngine {
    /// Sharded storage for reduced lock contention
    shards: Vec<Shard>,

    /// Signaled after every stream append; blocking XREADs wait on this
    stream_signal: Notify,

    /// Statistics: total number of keys (approximate)
    key_count: AtomicU64,

    /// Statistics: total GET operations
    get_count: AtomicU64,

    /// Statistics: total SET operations
    set_count: AtomicU64,

    /// Statistics: total DEL operations
    del_count: AtomicU64,

    /// Statistics: number of expired keys cleaned up
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates a new storage engine with default settings.
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::new()).collect();

        Self {
            shards,
            stream_signal: Notify::new(),
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    /// Determines which shard a key belongs to.
    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    /// Gets the shard for a given key.
    #[inline]
    fn get_shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Sets a string value, overwriting any existing value of any kind and
    /// resetting the TTL from this call.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(&key);
        let mut data = shard.data.write().unwrap();

        let entry = match ttl {
            Some(ttl) => Entry::with_ttl(Value::String(value), ttl),
            None => Entry::new(Value::String(value)),
        };

        if data.insert(key, entry).is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Gets the string value for a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired; fails with
    /// `WRONGTYPE` if the key holds a stream. This implements "lazy
    /// expiry" - expired keys are detected and removed on access.
    pub fn get(&self, key: &Bytes) -> Result<Option<Bytes>, StorageError> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(key);

        // Fast path: read lock for live keys
        {
            let data = shard.data.read().unwrap();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => {
                    return match &entry.value {
                        Value::String(b) => Ok(Some(b.clone())),
                        Value::Stream(_) => Err(StorageError::WrongType),
                    };
                }
                Some(_) => {} // expired, fall through to removal
                None => return Ok(None),
            }
        }

        // Key exists but is expired - need write lock to remove it
        self.remove_if_expired(key);
        Ok(None)
    }

    /// Removes a key if its entry has expired. Returns true if removed.
    fn remove_if_expired(&self, key: &Bytes) -> bool {
        let shard = self.get_shard(key);
        let mut data = shard.data.write().unwrap();
        if data.get(key).map(|e| e.is_expired()).unwrap_or(false) {
            data.remove(key);
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            self.expired_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Increments an integer-valued key by `delta` and returns the new value.
    ///
    /// An absent (or expired) key is initialized to `delta` with no TTL.
    /// An existing TTL is preserved across the rewrite.
    pub fn incr_by(&self, key: &Bytes, delta: i64) -> Result<i64, StorageError> {
        let shard = self.get_shard(key);
        let mut data = shard.data.write().unwrap();

        let (current, expires_at) = match data.get(key) {
            Some(entry) if !entry.is_expired() => match &entry.value {
                Value::String(b) => {
                    let s = std::str::from_utf8(b).map_err(|_| StorageError::NotAnInteger)?;
                    let n: i64 = s.parse().map_err(|_| StorageError::NotAnInteger)?;
                    (n, entry.expires_at)
                }
                Value::Stream(_) => return Err(StorageError::WrongType),
            },
            _ => (0, None),
        };

        let new_value = current.checked_add(delta).ok_or(StorageError::NotAnInteger)?;

        let now = Instant::now();
        let is_new = data
            .insert(
                key.clone(),
                Entry {
                    value: Value::String(Bytes::from(new_value.to_string())),
                    expires_at,
                    created_at: now,
                },
            )
            .is_none();

        if is_new {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }

        Ok(new_value)
    }

    /// Deletes a key of any kind from the database.
    ///
    /// Returns `true` if the key was deleted, `false` if it didn't exist.
    pub fn delete(&self, key: &Bytes) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(key);
        let mut data = shard.data.write().unwrap();

        if data.remove(key).is_some() {
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Checks if a key exists (and is not expired).
    pub fn exists(&self, key: &Bytes) -> bool {
        let shard = self.get_shard(key);
        let data = shard.data.read().unwrap();

        data.get(key).map(|e| !e.is_expired()).unwrap_or(false)
    }

    /// Returns the type name of the value stored at a key.
    ///
    /// Strings report their sub-type derived by parsing: `"integer"` when
    /// the bytes parse as a signed integer, `"float"` when they parse as a
    /// decimal float but not an integer, otherwise `"string"`. Streams are
    /// `"stream"` and missing keys `"none"`.
    pub fn value_type(&self, key: &Bytes) -> &'static str {
        let shard = self.get_shard(key);
        let data = shard.data.read().unwrap();

        match data.get(key) {
            Some(entry) if !entry.is_expired() => match &entry.value {
                Value::String(b) => match std::str::from_utf8(b) {
                    Ok(s) if s.parse::<i64>().is_ok() => "integer",
                    Ok(s) if s.parse::<f64>().is_ok() => "float",
                    _ => "string",
                },
                Value::Stream(_) => "stream",
            },
            _ => "none",
        }
    }

    /// Visits every live key/entry pair across all shards.
    ///
    /// **Warning**: holds each shard's read lock for the duration of its
    /// visit; keep the visitor cheap.
    pub fn for_each(&self, mut visitor: impl FnMut(&Bytes, &Entry)) {
        for shard in &self.shards {
            let data = shard.data.read().unwrap();
            for (key, entry) in data.iter() {
                if !entry.is_expired() {
                    visitor(key, entry);
                }
            }
        }
    }

    /// Returns all keys matching a shell-style glob pattern.
    ///
    /// Supported patterns:
    /// - `*` matches everything
    /// - `h*llo` matches hello, hallo, hxllo
    /// - `h?llo` matches hello, hallo, but not hllo
    /// - `h[ae]llo` matches hello and hallo, but not hillo
    ///
    /// **Warning**: This operation scans all keys and can be slow on large databases.
    pub fn keys(&self, pattern: &str) -> Vec<Bytes> {
        let mut result = Vec::new();
        let pattern = GlobPattern::new(pattern);

        self.for_each(|key, _| {
            if pattern.matches(key) {
                result.push(key.clone());
            }
        });

        result
    }

    /// Returns the approximate number of keys in the database.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Returns true if the database is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry from all shards, counting reclaims per
    /// value kind. This is the active-expiry pass driven by the background
    /// sweeper.
    pub fn sweep_expired(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for shard in &self.shards {
            let mut data = shard.data.write().unwrap();
            data.retain(|_, entry| {
                if !entry.is_expired() {
                    return true;
                }
                match &entry.value {
                    Value::String(_) => outcome.strings += 1,
                    Value::Stream(_) => outcome.streams += 1,
                }
                false
            });
        }

        let total = outcome.total();
        if total > 0 {
            self.key_count.fetch_sub(total, Ordering::Relaxed);
            self.expired_count.fetch_add(total, Ordering::Relaxed);
        }

        outcome
    }

    /// Total expired keys removed by one sweep, without the per-kind split.
    pub fn cleanup_expired(&self) -> u64 {
        self.sweep_expired().total()
    }

    /// Rewrites a key's expiry to the distant past so sweeper tests can
    /// exercise reclaim of any value kind without waiting out a TTL.
    #[cfg(test)]
    pub(crate) fn force_expire(&self, key: &Bytes) -> bool {
        let shard = self.get_shard(key);
        let mut data = shard.data.write().unwrap();
        match data.get_mut(key) {
            Some(entry) => {
                // is_expired treats `now >= expires_at` as dead
                entry.expires_at = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Returns database statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Stream operations
    // ========================================================================

    /// Returns the stream handle stored at `key`, or `None` if the key is
    /// absent or expired. A live string at the key is `WRONGTYPE`.
    fn stream_handle(&self, key: &Bytes) -> Result<Option<Arc<StreamLog>>, StorageError> {
        let shard = self.get_shard(key);
        let data = shard.data.read().unwrap();
        match data.get(key) {
            Some(entry) if !entry.is_expired() => match &entry.value {
                Value::Stream(log) => Ok(Some(Arc::clone(log))),
                Value::String(_) => Err(StorageError::WrongType),
            },
            _ => Ok(None),
        }
    }

    /// Like [`stream_handle`](Self::stream_handle), but a missing (or
    /// expired) entry is replaced by a fresh empty stream with no TTL.
    fn stream_handle_or_create(&self, key: &Bytes) -> Result<Arc<StreamLog>, StorageError> {
        let shard = self.get_shard(key);
        let mut data = shard.data.write().unwrap();
        if let Some(entry) = data.get(key) {
            if !entry.is_expired() {
                return match &entry.value {
                    Value::Stream(log) => Ok(Arc::clone(log)),
                    Value::String(_) => Err(StorageError::WrongType),
                };
            }
        }

        let was_expired = data.contains_key(key);
        let log = Arc::new(StreamLog::new());
        data.insert(key.clone(), Entry::new(Value::Stream(Arc::clone(&log))));
        if was_expired {
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(log)
    }

    /// Appends an entry to the stream at `key`, creating the stream lazily.
    ///
    /// Returns the assigned ID and wakes any blocked stream readers.
    pub fn stream_add(
        &self,
        key: &Bytes,
        spec: IdSpec,
        fields: Vec<(Bytes, Bytes)>,
    ) -> Result<StreamId, StorageError> {
        let log = self.stream_handle_or_create(key)?;
        let id = log.add(spec, fields)?;
        self.stream_signal.notify_waiters();
        Ok(id)
    }

    /// Returns the entries with `start <= id <= end`, or an empty vector
    /// for a missing key.
    pub fn stream_range(
        &self,
        key: &Bytes,
        start: StreamId,
        end: StreamId,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        match self.stream_handle(key)? {
            Some(log) => Ok(log.range(start, end)),
            None => Ok(Vec::new()),
        }
    }

    /// Returns the entries with `id > after`, or an empty vector for a
    /// missing key.
    pub fn stream_read_after(
        &self,
        key: &Bytes,
        after: StreamId,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        match self.stream_handle(key)? {
            Some(log) => Ok(log.read_after(after)),
            None => Ok(Vec::new()),
        }
    }

    /// Reads several streams at once, keeping key order and excluding keys
    /// with no new entries.
    pub fn stream_read_multi(
        &self,
        keys: &[Bytes],
        after: &[StreamId],
    ) -> Result<Vec<(Bytes, Vec<StreamEntry>)>, StorageError> {
        let mut results = Vec::new();
        for (key, after) in keys.iter().zip(after) {
            let entries = self.stream_read_after(key, *after)?;
            if !entries.is_empty() {
                results.push((key.clone(), entries));
            }
        }
        Ok(results)
    }

    /// The last ID of the stream at `key`, or `0-0` if there is no stream
    /// there. This resolves the `$` sentinel at XREAD request time.
    pub fn stream_last_id(&self, key: &Bytes) -> StreamId {
        match self.stream_handle(key) {
            Ok(Some(log)) => log.last_id(),
            _ => StreamId::ZERO,
        }
    }

    /// A future that resolves after the next stream append anywhere in the
    /// keyspace. Blocking readers grab this *before* scanning so an append
    /// between scan and await is not lost.
    pub fn stream_appended(&self) -> Notified<'_> {
        self.stream_signal.notified()
    }
}

/// What one active-expiry pass reclaimed, split by value kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Expired string entries removed
    pub strings: u64,
    /// Expired stream entries removed
    pub streams: u64,
}

impl SweepOutcome {
    pub fn total(&self) -> u64 {
        self.strings + self.streams
    }
}

/// Database statistics.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    /// Number of keys currently stored
    pub keys: u64,
    /// Total GET operations
    pub get_ops: u64,
    /// Total SET operations
    pub set_ops: u64,
    /// Total DEL operations
    pub del_ops: u64,
    /// Total expired keys cleaned up
    pub expired: u64,
}

/// Simple glob pattern matcher for the KEYS command.
struct GlobPattern {
    pattern: Vec<u8>,
}

impl GlobPattern {
    fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.as_bytes().to_vec(),
        }
    }

    fn matches(&self, text: &[u8]) -> bool {
        self.matches_recursive(&self.pattern, text)
    }

    fn matches_recursive(&self, pattern: &[u8], text: &[u8]) -> bool {
        if pattern.is_empty() {
            return text.is_empty();
        }

        match pattern[0] {
            b'*' => {
                // Try matching zero or more characters
                for i in 0..=text.len() {
                    if self.matches_recursive(&pattern[1..], &text[i..]) {
                        return true;
                    }
                }
                false
            }
            b'?' => {
                // Match exactly one character
                !text.is_empty() && self.matches_recursive(&pattern[1..], &text[1..])
            }
            b'[' => {
                // Character class
                if text.is_empty() {
                    return false;
                }

                let mut i = 1;
                let mut matched = false;
                let negate = pattern.get(1) == Some(&b'^');
                if negate {
                    i += 1;
                }

                while i < pattern.len() && pattern[i] != b']' {
                    if pattern[i] == text[0] {
                        matched = true;
                    }
                    // Handle ranges like [a-z]
                    if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
                        if text[0] >= pattern[i] && text[0] <= pattern[i + 2] {
                            matched = true;
                        }
                        i += 2;
                    }
                    i += 1;
                }

                if negate {
                    matched = !matched;
                }

                if i < pattern.len() {
                    matched && self.matches_recursive(&pattern[i + 1..], &text[1..])
                } else {
                    false
                }
            }
            b'\\' => {
                // Escape character
                if pattern.len() > 1 && !text.is_empty() && pattern[1] == text[0] {
                    self.matches_recursive(&pattern[2..], &text[1..])
                } else {
                    false
                }
            }
            c => {
                // Literal character
                !text.is_empty()
                    && c == text[0]
                    && self.matches_recursive(&pattern[1..], &text[1..])
            }
        }
    }
}
