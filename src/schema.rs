//! Maps the three backend tables (`kv_entries`, `leases`, `revisions`) onto the flat,
//! order-preserving byte keyspace exposed by [`crate::storage::engine::Engine`], and
//! defines the row types stored at those keys.
//!
//! Composite keys are built with a small escape scheme: each `0x00` byte in the
//! original key becomes `0x00 0xFF`, and exact-key keys are closed with a `0x00 0x00`
//! terminator. Escaping maps each input byte independently and preserves order and
//! concatenation (`escape(a) || escape(b) == escape(a || b)`), so prefix-matching the
//! escaped bytes of an arbitrary key prefix against the escaped+terminated composite
//! keys correctly selects every row for every key beginning with that prefix, and the
//! terminator keeps one key's rows from being mistaken for a prefix of a longer key's.

use std::collections::BTreeSet;
use std::ops::Bound;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

const TABLE_KV_ENTRIES: u8 = 0x01;
const TABLE_LEASES: u8 = 0x02;
const TABLE_REVISIONS: u8 = 0x03;

/// Escapes `0x00` bytes as `0x00 0xFF` so the result can be safely terminated or
/// prefix-matched without colliding with a shorter or longer key.
fn escape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for &b in raw {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xff);
        } else {
            out.push(b);
        }
    }
    out
}

/// Reverses [`escape`].
fn unescape(encoded: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        if encoded[i] == 0x00 {
            out.push(0x00);
            i += 2;
        } else {
            out.push(encoded[i]);
            i += 1;
        }
    }
    out
}

/// Prefix for `scan_prefix`-ing every row in the `kv_entries` table.
pub fn kv_entries_table_prefix() -> Vec<u8> {
    vec![TABLE_KV_ENTRIES]
}

/// Prefix for `scan_prefix`-ing every `kv_entries` row whose original key begins with
/// `prefix`, across all revisions of every such key.
pub fn kv_entries_prefix_scan_key(prefix: &[u8]) -> Vec<u8> {
    let mut out = vec![TABLE_KV_ENTRIES];
    out.extend(escape(prefix));
    out
}

/// Prefix for `scan_prefix`-ing every `kv_entries` row for exactly `key`, across all
/// its historical revisions. The `0x00 0x00` terminator ensures this never also
/// matches rows belonging to a longer key that happens to share this byte prefix.
pub fn kv_entries_history_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = vec![TABLE_KV_ENTRIES];
    out.extend(escape(key));
    out.push(0x00);
    out.push(0x00);
    out
}

/// The composite `(key, mod_revision)` primary key for a `kv_entries` row.
pub fn kv_entry_key(key: &[u8], mod_revision: u64) -> Vec<u8> {
    let mut out = kv_entries_history_prefix(key);
    out.write_u64::<BigEndian>(mod_revision).expect("write to Vec never fails");
    out
}

/// Recovers the original key from a `kv_entries` composite key.
pub fn decode_kv_entry_key(composite: &[u8]) -> CResult<Vec<u8>> {
    if composite.first() != Some(&TABLE_KV_ENTRIES) {
        return Err(Error::Internal("not a kv_entries key".to_string()));
    }
    let body = &composite[1..composite.len() - 8];
    let escaped_key = split_terminator(body)?;
    Ok(unescape(escaped_key))
}

/// Recovers the `mod_revision` suffix from a `kv_entries` composite key.
pub fn decode_mod_revision(composite: &[u8]) -> CResult<u64> {
    let mut tail = &composite[composite.len() - 8..];
    tail.read_u64::<BigEndian>().map_err(|e| Error::Internal(e.to_string()))
}

/// Finds the `0x00 0x00` terminator in an escaped+terminated key body, returning the
/// escaped key bytes before it.
fn split_terminator(body: &[u8]) -> CResult<&[u8]> {
    let mut i = 0;
    while i + 1 < body.len() {
        if body[i] == 0x00 && body[i + 1] == 0x00 {
            return Ok(&body[..i]);
        }
        if body[i] == 0x00 {
            i += 2;
        } else {
            i += 1;
        }
    }
    Err(Error::Internal("malformed composite key: missing terminator".to_string()))
}

/// Prefix for `scan_prefix`-ing every `leases` row.
pub fn leases_table_prefix() -> Vec<u8> {
    vec![TABLE_LEASES]
}

/// The primary key for a `leases` row.
pub fn lease_key(id: &str) -> Vec<u8> {
    let mut out = vec![TABLE_LEASES];
    out.extend(escape(id.as_bytes()));
    out.push(0x00);
    out.push(0x00);
    out
}

/// The primary key for a `revisions` row.
pub fn revision_key(revision: u64) -> Vec<u8> {
    let mut out = vec![TABLE_REVISIONS];
    out.write_u64::<BigEndian>(revision).expect("write to Vec never fails");
    out
}

/// Range covering every `revisions` row with `revision > after`.
pub fn revisions_after_range(after: u64) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = match after.checked_add(1) {
        Some(r) => revision_key(r),
        None => return (Bound::Excluded(revision_key(after)), Bound::Excluded(revision_key(after))),
    };
    (Bound::Included(start), Bound::Excluded(vec![TABLE_REVISIONS + 1]))
}

/// Range covering every `revisions` row with `revision <= upto`, used by compaction.
pub fn revisions_upto_range(upto: u64) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    (Bound::Included(vec![TABLE_REVISIONS]), Bound::Included(revision_key(upto)))
}

/// One historical version of a key, as returned by the public API (`key` included).
#[derive(Clone, Debug, PartialEq)]
pub struct KvEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    pub create_revision: u64,
    pub mod_revision: u64,
    pub lease_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// The on-disk row for a `kv_entries` record, keyed by `(key, mod_revision)`. A row
/// with `deleted = true` is the tombstone marker for all prior live rows of that key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KvEntryRow {
    pub value: Vec<u8>,
    pub version: u64,
    pub create_revision: u64,
    pub mod_revision: u64,
    pub lease_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub deleted: bool,
}

impl KvEntryRow {
    pub fn into_entry(self, key: Vec<u8>) -> KvEntry {
        KvEntry {
            key,
            value: self.value,
            version: self.version,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            lease_id: self.lease_id,
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }
}

/// The kind of mutation a [`RevisionLogRecord`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Put,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Put => write!(f, "put"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// One entry of the append-only revision log: the audit trail the Watch Hub tails.
///
/// `keys` holds every key this revision touched -- one for `put`, and for
/// `delete` every key a range delete actually tombstoned, so a watch on any of
/// them finds a matching record at this revision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevisionLogRecord {
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub keys: Vec<Vec<u8>>,
    /// For `put`, the new per-key version. Empty for `delete`.
    pub details: Option<u64>,
}

/// The on-disk row for a `leases` record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseRow {
    pub id: String,
    pub ttl_s: i64,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub keys: BTreeSet<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_roundtrip() {
        let raw = b"a\x00b\x00\x00c";
        assert_eq!(unescape(&escape(raw)), raw.to_vec());
    }

    #[test]
    fn prefix_preserved_under_escaping() {
        let prefix = b"cfg/\x00";
        let key = b"cfg/\x00suffix";
        assert!(escape(key).starts_with(&escape(prefix)));
    }

    #[test]
    fn kv_entry_key_roundtrips_original_key() {
        let key = b"some\x00key";
        let composite = kv_entry_key(key, 7);
        assert_eq!(decode_kv_entry_key(&composite).unwrap(), key.to_vec());
    }

    #[test]
    fn history_prefix_does_not_match_sibling_key() {
        // "a"'s history prefix must not be a byte-prefix of "ab"'s composite key:
        // the 0x00 0x00 terminator after "a" diverges from the 'b' that follows in "ab".
        let a_prefix = kv_entries_history_prefix(b"a");
        let ab_composite = kv_entry_key(b"ab", 1);
        assert!(!ab_composite.starts_with(a_prefix.as_slice()));
    }

    #[test]
    fn revisions_after_range_excludes_boundary() {
        let (start, _end) = revisions_after_range(5);
        assert_eq!(start, Bound::Included(revision_key(6)));
    }
}
