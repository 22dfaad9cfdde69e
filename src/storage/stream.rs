//! Append-Only Stream Log
//!
//! Streams are time-ordered logs of field/value entries keyed by a
//! `<milliseconds>-<sequence>` ID. IDs are strictly increasing within a
//! stream, which makes range scans and "everything after X" reads cheap and
//! deterministic.
//!
//! ## ID resolution
//!
//! XADD accepts three spec shapes, resolved against the stream's last ID
//! under the stream's own lock:
//!
//! - `*` - generate both parts from the wall clock, falling back to
//!   `last_ms-(last_seq+1)` if the clock ran backwards
//! - `<ms>-*` - generate the sequence within a caller-chosen millisecond
//! - `<ms>-<seq>` - explicit, must be strictly greater than the last ID
//!
//! `0-0` is never a valid entry ID.
//!
//! ## Locking
//!
//! Each stream embeds its own `RwLock` so that appends to one stream never
//! contend with reads of another, and the keyspace shard lock is not held
//! across stream operations.

use bytes::Bytes;
use std::fmt;
use std::sync::RwLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors produced while parsing or generating stream IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamIdError {
    /// The explicit ID `0-0` was requested
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    ZeroId,

    /// The requested ID does not sort after the stream's last entry
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    NotMonotonic,

    /// The ID string is not `<ms>`, `<ms>-<seq>`, or a recognised sentinel
    #[error("ERR Invalid stream ID specified as stream command argument")]
    Malformed,
}

/// A stream entry ID: a millisecond timestamp plus a per-millisecond
/// sequence number. The derived ordering (ms first, then seq) is the total
/// order all stream operations rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The smallest possible ID; also the `last_id` of an empty stream.
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    /// The largest possible ID, used as the open upper range bound.
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parses an explicit `<ms>-<seq>` ID. A bare `<ms>` coerces to
    /// `<ms>-0`.
    pub fn parse(s: &str) -> Result<Self, StreamIdError> {
        match s.split_once('-') {
            Some((ms, seq)) => {
                let ms = ms.parse().map_err(|_| StreamIdError::Malformed)?;
                let seq = seq.parse().map_err(|_| StreamIdError::Malformed)?;
                Ok(Self { ms, seq })
            }
            None => {
                let ms = s.parse().map_err(|_| StreamIdError::Malformed)?;
                Ok(Self { ms, seq: 0 })
            }
        }
    }

    /// Parses a range start bound: `-` is the minimum, otherwise an ID.
    pub fn parse_range_start(s: &str) -> Result<Self, StreamIdError> {
        if s == "-" {
            Ok(Self::ZERO)
        } else {
            Self::parse(s)
        }
    }

    /// Parses a range end bound: `+` is the maximum, otherwise an ID.
    pub fn parse_range_end(s: &str) -> Result<Self, StreamIdError> {
        if s == "+" {
            Ok(Self::MAX)
        } else {
            Self::parse(s)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl Default for StreamId {
    fn default() -> Self {
        StreamId::ZERO
    }
}

/// How XADD asked for an entry ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpec {
    /// `*` - generate both parts
    Auto,
    /// `<ms>-*` - generate the sequence within the given millisecond
    AutoSeq(u64),
    /// `<ms>-<seq>` - fully explicit
    Explicit(StreamId),
}

impl IdSpec {
    pub fn parse(s: &str) -> Result<Self, StreamIdError> {
        if s == "*" {
            return Ok(IdSpec::Auto);
        }
        if let Some(ms) = s.strip_suffix("-*") {
            let ms = ms.parse().map_err(|_| StreamIdError::Malformed)?;
            return Ok(IdSpec::AutoSeq(ms));
        }
        Ok(IdSpec::Explicit(StreamId::parse(s)?))
    }
}

/// One appended entry: its assigned ID, the field/value pairs in the order
/// they were given, and the wall time of the append.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(Bytes, Bytes)>,
    pub wall_time: Instant,
}

#[derive(Debug, Default)]
struct StreamInner {
    entries: Vec<StreamEntry>,
    last_id: StreamId,
}

/// An append-only stream with its own lock.
///
/// `last_id` always equals the ID of the last appended entry (`0-0` when
/// empty) and every append moves it strictly forward, so the entry vector
/// is sorted by ID and insertion order at all times.
#[derive(Debug, Default)]
pub struct StreamLog {
    inner: RwLock<StreamInner>,
}

impl StreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry, resolving `spec` against the current last ID.
    ///
    /// Returns the assigned ID.
    pub fn add(
        &self,
        spec: IdSpec,
        fields: Vec<(Bytes, Bytes)>,
    ) -> Result<StreamId, StreamIdError> {
        let mut inner = self.inner.write().unwrap();
        let id = Self::resolve_id(&inner, spec)?;

        inner.entries.push(StreamEntry {
            id,
            fields,
            wall_time: Instant::now(),
        });
        inner.last_id = id;
        Ok(id)
    }

    fn resolve_id(inner: &StreamInner, spec: IdSpec) -> Result<StreamId, StreamIdError> {
        let last = inner.last_id;

        match spec {
            IdSpec::Auto => {
                let now = now_unix_ms();
                if now > last.ms {
                    Ok(StreamId::new(now, 0))
                } else if now == last.ms {
                    Ok(StreamId::new(now, last.seq + 1))
                } else {
                    // Clock regressed: stay at the last millisecond
                    Ok(StreamId::new(last.ms, last.seq + 1))
                }
            }
            IdSpec::AutoSeq(ms) => {
                if inner.entries.is_empty() {
                    // A fresh stream starts at <ms>-0, except that 0-0 is
                    // reserved so millisecond zero starts at 0-1
                    return Ok(StreamId::new(ms, if ms == 0 { 1 } else { 0 }));
                }
                if ms > last.ms {
                    Ok(StreamId::new(ms, 0))
                } else if ms == last.ms {
                    Ok(StreamId::new(ms, last.seq + 1))
                } else {
                    Err(StreamIdError::NotMonotonic)
                }
            }
            IdSpec::Explicit(id) => {
                if id == StreamId::ZERO {
                    Err(StreamIdError::ZeroId)
                } else if id <= last {
                    Err(StreamIdError::NotMonotonic)
                } else {
                    Ok(id)
                }
            }
        }
    }

    /// Returns the entries with `start <= id <= end`, in insertion order.
    pub fn range(&self, start: StreamId, end: StreamId) -> Vec<StreamEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.id >= start && e.id <= end)
            .cloned()
            .collect()
    }

    /// Returns the entries with `id > after`, in insertion order.
    pub fn read_after(&self, after: StreamId) -> Vec<StreamEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect()
    }

    /// The ID of the last appended entry, or `0-0` if the stream is empty.
    pub fn last_id(&self) -> StreamId {
        self.inner.read().unwrap().last_id
    }

    /// Number of entries in the stream.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
