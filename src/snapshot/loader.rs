//! Binary Snapshot Reader
//!
//! Reads the versioned binary keyspace dump and primes the storage engine
//! at startup. This is strictly a reader; the server never writes snapshot
//! files.
//!
//! ## File layout
//!
//! ```text
//! "REDIS" <4 ASCII version digits>          9-byte header
//! 0xFA <string key> <string value>          metadata (logged, otherwise ignored)
//! 0xFE <length dbindex>                     database selector (ignored)
//! 0xFB <length total> <length with-expiry>  resize hint (informational)
//! 0x00 <string key> <string value>          string entry, no TTL
//! 0xFD <u32 LE secs> 0x00 <key> <value>     entry with absolute-seconds expiry
//! 0xFC <u64 LE ms>   0x00 <key> <value>     entry with absolute-ms expiry
//! 0xFF <8 checksum bytes>                   end of file (checksum not verified)
//! ```
//!
//! Length prefixes use the top two bits of the first byte: `00` six-bit
//! length, `01` fourteen-bit big-endian length, `10` 32-bit big-endian
//! length, `11` a special string encoding (8/16/32-bit little-endian
//! integers rendered as decimal strings; LZF compression is unsupported).
//!
//! Entries whose absolute expiry is already in the past are skipped; live
//! entries are inserted with the remaining TTL.

use crate::storage::StorageEngine;
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Opcodes introducing each record.
mod opcode {
    pub const METADATA: u8 = 0xFA;
    pub const RESIZE_HINT: u8 = 0xFB;
    pub const EXPIRY_MS: u8 = 0xFC;
    pub const EXPIRY_SECS: u8 = 0xFD;
    pub const SELECT_DB: u8 = 0xFE;
    pub const EOF: u8 = 0xFF;
    pub const TYPE_STRING: u8 = 0x00;
}

/// Errors that can occur while reading a snapshot file.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not start with the REDIS magic
    #[error("invalid snapshot file: missing REDIS header")]
    BadMagic,

    /// A record opcode this reader does not understand
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// An expiry record not followed by a string entry
    #[error("unexpected value type after expiry: {0:#04x}")]
    BadExpiryRecord(u8),

    /// A `11`-prefixed length in a length (not string) position
    #[error("unsupported length encoding")]
    BadLength,

    /// LZF-compressed strings are not supported
    #[error("compressed string encoding not supported")]
    CompressedString,

    /// Unknown `11`-prefixed string encoding
    #[error("unknown special string encoding: {0:#04x}")]
    BadStringEncoding(u8),
}

/// Counters reported by a successful load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Entries inserted into the keyspace
    pub loaded: u64,
    /// Entries skipped because their expiry had already passed
    pub expired: u64,
}

/// Reads the snapshot at `path` and inserts every live entry into
/// `storage`. Only database 0 is populated; selector records are skipped.
pub fn load_snapshot(path: &Path, storage: &StorageEngine) -> Result<LoadStats, SnapshotError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 9];
    reader.read_exact(&mut header)?;
    if &header[..5] != b"REDIS" {
        return Err(SnapshotError::BadMagic);
    }
    info!(
        version = %String::from_utf8_lossy(&header[5..]),
        "Loading snapshot"
    );

    let mut stats = LoadStats::default();

    loop {
        let op = match read_u8(&mut reader) {
            Ok(op) => op,
            // A dump without the EOF marker just ends
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };

        match op {
            opcode::METADATA => {
                let key = read_string(&mut reader)?;
                let value = read_string(&mut reader)?;
                debug!(
                    key = %String::from_utf8_lossy(&key),
                    value = %String::from_utf8_lossy(&value),
                    "Snapshot metadata"
                );
            }
            opcode::SELECT_DB => {
                let db = read_length(&mut reader)?;
                debug!(db = db, "Snapshot database selector");
            }
            opcode::RESIZE_HINT => {
                let total = read_length(&mut reader)?;
                let expiring = read_length(&mut reader)?;
                debug!(total = total, expiring = expiring, "Snapshot resize hint");
            }
            opcode::TYPE_STRING => {
                let key = read_string(&mut reader)?;
                let value = read_string(&mut reader)?;
                storage.set(key, value, None);
                stats.loaded += 1;
            }
            opcode::EXPIRY_SECS => {
                let mut raw = [0u8; 4];
                reader.read_exact(&mut raw)?;
                let expires_at_ms = u32::from_le_bytes(raw) as u64 * 1000;
                load_expiring_entry(&mut reader, storage, expires_at_ms, &mut stats)?;
            }
            opcode::EXPIRY_MS => {
                let mut raw = [0u8; 8];
                reader.read_exact(&mut raw)?;
                let expires_at_ms = u64::from_le_bytes(raw);
                load_expiring_entry(&mut reader, storage, expires_at_ms, &mut stats)?;
            }
            opcode::EOF => {
                let mut checksum = [0u8; 8];
                reader.read_exact(&mut checksum)?;
                break;
            }
            other => return Err(SnapshotError::UnknownOpcode(other)),
        }
    }

    info!(
        loaded = stats.loaded,
        expired = stats.expired,
        "Snapshot load complete"
    );
    Ok(stats)
}

/// Reads the `0x00 <key> <value>` that follows an expiry record and inserts
/// it with the remaining TTL, or skips it if already expired.
fn load_expiring_entry(
    reader: &mut impl Read,
    storage: &StorageEngine,
    expires_at_ms: u64,
    stats: &mut LoadStats,
) -> Result<(), SnapshotError> {
    let value_type = read_u8(reader)?;
    if value_type != opcode::TYPE_STRING {
        return Err(SnapshotError::BadExpiryRecord(value_type));
    }

    let key = read_string(reader)?;
    let value = read_string(reader)?;

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    if expires_at_ms <= now_ms {
        warn!(
            key = %String::from_utf8_lossy(&key),
            "Skipping snapshot entry with past expiry"
        );
        stats.expired += 1;
        return Ok(());
    }

    let remaining = Duration::from_millis(expires_at_ms - now_ms);
    storage.set(key, value, Some(remaining));
    stats.loaded += 1;
    Ok(())
}

fn read_u8(reader: &mut impl Read) -> std::io::Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Decodes a length prefix. Fails on the `11` special encoding, which is
/// only valid in string position.
fn read_length(reader: &mut impl Read) -> Result<u64, SnapshotError> {
    let first = read_u8(reader)?;
    match first >> 6 {
        0b00 => Ok((first & 0x3F) as u64),
        0b01 => {
            let second = read_u8(reader)?;
            Ok((((first & 0x3F) as u64) << 8) | second as u64)
        }
        0b10 => {
            let mut raw = [0u8; 4];
            reader.read_exact(&mut raw)?;
            Ok(u32::from_be_bytes(raw) as u64)
        }
        _ => Err(SnapshotError::BadLength),
    }
}

/// Decodes a string: either a length-prefixed run of bytes, or one of the
/// `11`-prefixed integer encodings rendered as a decimal string.
fn read_string(reader: &mut impl Read) -> Result<Bytes, SnapshotError> {
    let first = read_u8(reader)?;
    let length = match first >> 6 {
        0b00 => (first & 0x3F) as u64,
        0b01 => {
            let second = read_u8(reader)?;
            (((first & 0x3F) as u64) << 8) | second as u64
        }
        0b10 => {
            let mut raw = [0u8; 4];
            reader.read_exact(&mut raw)?;
            u32::from_be_bytes(raw) as u64
        }
        _ => {
            return match first & 0x3F {
                0 => {
                    let b = read_u8(reader)?;
                    Ok(Bytes::from((b as i8).to_string()))
                }
                1 => {
                    let mut raw = [0u8; 2];
                    reader.read_exact(&mut raw)?;
                    Ok(Bytes::from(i16::from_le_bytes(raw).to_string()))
                }
                2 => {
                    let mut raw = [0u8; 4];
                    reader.read_exact(&mut raw)?;
                    Ok(Bytes::from(i32::from_le_bytes(raw).to_string()))
                }
                3 => Err(SnapshotError::CompressedString),
                other => Err(SnapshotError::BadStringEncoding(other)),
            };
        }
    };

    let mut buf = vec![0u8; length as usize];
    reader.read_exact(&mut buf)?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_string(buf: &mut Vec<u8>, s: &[u8]) {
        assert!(s.len() < 64);
        buf.push(s.len() as u8);
        buf.extend_from_slice(s);
    }

    fn snapshot_with(records: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let mut buf = b"REDIS0011".to_vec();
        buf.extend_from_slice(records);
        buf.push(opcode::EOF);
        buf.extend_from_slice(&[0u8; 8]);
        file.write_all(&buf).unwrap();
        file
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    #[test]
    fn test_load_plain_entries() {
        let mut records = Vec::new();
        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"foo");
        write_string(&mut records, b"bar");
        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"baz");
        write_string(&mut records, b"qux");

        let file = snapshot_with(&records);
        let storage = StorageEngine::new();
        let stats = load_snapshot(file.path(), &storage).unwrap();

        assert_eq!(stats.loaded, 2);
        assert_eq!(stats.expired, 0);
        assert_eq!(
            storage.get(&Bytes::from("foo")).unwrap(),
            Some(Bytes::from("bar"))
        );
        assert_eq!(
            storage.get(&Bytes::from("baz")).unwrap(),
            Some(Bytes::from("qux"))
        );
    }

    #[test]
    fn test_load_metadata_and_hints_are_skipped() {
        let mut records = Vec::new();
        records.push(opcode::METADATA);
        write_string(&mut records, b"redis-ver");
        write_string(&mut records, b"7.2.0");
        records.push(opcode::SELECT_DB);
        records.push(0x00); // db 0
        records.push(opcode::RESIZE_HINT);
        records.push(0x01);
        records.push(0x00);
        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"k");
        write_string(&mut records, b"v");

        let file = snapshot_with(&records);
        let storage = StorageEngine::new();
        let stats = load_snapshot(file.path(), &storage).unwrap();

        assert_eq!(stats.loaded, 1);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_load_ms_expiry_live_and_expired() {
        let mut records = Vec::new();

        // Live for another minute
        records.push(opcode::EXPIRY_MS);
        records.extend_from_slice(&(now_ms() + 60_000).to_le_bytes());
        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"live");
        write_string(&mut records, b"1");

        // Expired a minute ago
        records.push(opcode::EXPIRY_MS);
        records.extend_from_slice(&(now_ms() - 60_000).to_le_bytes());
        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"dead");
        write_string(&mut records, b"2");

        let file = snapshot_with(&records);
        let storage = StorageEngine::new();
        let stats = load_snapshot(file.path(), &storage).unwrap();

        assert_eq!(stats.loaded, 1);
        assert_eq!(stats.expired, 1);
        assert!(storage.exists(&Bytes::from("live")));
        assert!(!storage.exists(&Bytes::from("dead")));
    }

    #[test]
    fn test_load_seconds_expiry() {
        let mut records = Vec::new();
        let expires_secs = (now_ms() / 1000 + 3600) as u32;
        records.push(opcode::EXPIRY_SECS);
        records.extend_from_slice(&expires_secs.to_le_bytes());
        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"hour");
        write_string(&mut records, b"v");

        let file = snapshot_with(&records);
        let storage = StorageEngine::new();
        let stats = load_snapshot(file.path(), &storage).unwrap();

        assert_eq!(stats.loaded, 1);
        assert!(storage.exists(&Bytes::from("hour")));
    }

    #[test]
    fn test_load_integer_encoded_strings() {
        let mut records = Vec::new();
        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"int8");
        records.push(0xC0); // 11, encoding 0
        records.push(0x40u8); // 64

        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"int16");
        records.push(0xC1);
        records.extend_from_slice(&(-2i16).to_le_bytes());

        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"int32");
        records.push(0xC2);
        records.extend_from_slice(&100_000i32.to_le_bytes());

        let file = snapshot_with(&records);
        let storage = StorageEngine::new();
        load_snapshot(file.path(), &storage).unwrap();

        assert_eq!(
            storage.get(&Bytes::from("int8")).unwrap(),
            Some(Bytes::from("64"))
        );
        assert_eq!(
            storage.get(&Bytes::from("int16")).unwrap(),
            Some(Bytes::from("-2"))
        );
        assert_eq!(
            storage.get(&Bytes::from("int32")).unwrap(),
            Some(Bytes::from("100000"))
        );
    }

    #[test]
    fn test_load_fourteen_bit_length() {
        let payload = vec![b'x'; 300];
        let mut records = Vec::new();
        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"big");
        // 01-prefixed 14-bit length: 300 = 0b01_00000001 00101100
        records.push(0x40 | ((300 >> 8) as u8));
        records.push((300 & 0xFF) as u8);
        records.extend_from_slice(&payload);

        let file = snapshot_with(&records);
        let storage = StorageEngine::new();
        load_snapshot(file.path(), &storage).unwrap();

        assert_eq!(
            storage.get(&Bytes::from("big")).unwrap(),
            Some(Bytes::from(payload))
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"NOTRDB123").unwrap();

        let storage = StorageEngine::new();
        let err = load_snapshot(file.path(), &storage).unwrap_err();
        assert!(matches!(err, SnapshotError::BadMagic));
    }

    #[test]
    fn test_unknown_opcode_aborts() {
        let file = snapshot_with(&[0x42]);
        let storage = StorageEngine::new();
        let err = load_snapshot(file.path(), &storage).unwrap_err();
        assert!(matches!(err, SnapshotError::UnknownOpcode(0x42)));
    }

    #[test]
    fn test_compressed_string_unsupported() {
        let mut records = Vec::new();
        records.push(opcode::TYPE_STRING);
        write_string(&mut records, b"k");
        records.push(0xC3); // LZF

        let file = snapshot_with(&records);
        let storage = StorageEngine::new();
        let err = load_snapshot(file.path(), &storage).unwrap_err();
        assert!(matches!(err, SnapshotError::CompressedString));
    }

    #[test]
    fn test_empty_fullresync_snapshot_parses() {
        // The payload served to replicas during FULLRESYNC must round-trip
        // through this loader.
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(crate::snapshot::EMPTY_SNAPSHOT).unwrap();

        let storage = StorageEngine::new();
        let stats = load_snapshot(file.path(), &storage).unwrap();
        assert_eq!(stats, LoadStats::default());
        assert!(storage.is_empty());
    }
}
