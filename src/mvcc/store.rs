use chrono::{DateTime, Utc};

use crate::error::{CResult, Error};
use crate::schema::{self, KvEntry, KvEntryRow, Operation, RevisionLogRecord};
use crate::storage::engine::Engine;

/// Scans the full history of `key` and returns the row with the greatest
/// `mod_revision`, live or tombstoned, if any row exists at all.
fn latest_row<E: Engine>(engine: &mut E, key: &[u8]) -> CResult<Option<(u64, KvEntryRow)>> {
    let prefix = schema::kv_entries_history_prefix(key);
    match engine.scan_prefix(&prefix).next_back() {
        None => Ok(None),
        Some(item) => {
            let (composite, value) = item?;
            let mod_revision = schema::decode_mod_revision(&composite)?;
            let row: KvEntryRow = serde_json::from_slice(&value)?;
            Ok(Some((mod_revision, row)))
        }
    }
}

fn append_log<E: Engine>(
    engine: &mut E,
    revision: u64,
    timestamp: DateTime<Utc>,
    operation: Operation,
    keys: Vec<Vec<u8>>,
    details: Option<u64>,
) -> CResult<()> {
    let record = RevisionLogRecord { revision, timestamp, operation, keys, details };
    engine.set(&schema::revision_key(revision), serde_json::to_vec(&record)?)?;
    Ok(())
}

/// Writes a new version of `key`, continuing its current lifetime if a live entry
/// exists, or starting a fresh one (version 1) otherwise. Returns the new revision.
///
/// Caller must hold the store mutex; `current_revision` is bumped in place.
pub fn put_locked<E: Engine>(
    engine: &mut E,
    current_revision: &mut u64,
    now: DateTime<Utc>,
    key: &[u8],
    value: Vec<u8>,
    lease_id: Option<String>,
) -> CResult<u64> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".to_string()));
    }

    let prev_live = match latest_row(engine, key)? {
        Some((_, row)) if !row.deleted => Some(row),
        _ => None,
    };

    // Candidate only; `current_revision` is not committed until every fallible
    // engine write below has succeeded, so a failed write never advances it.
    let revision = *current_revision + 1;

    let (version, create_revision, created_at) = match &prev_live {
        Some(prev) => (prev.version + 1, prev.create_revision, prev.created_at),
        None => (1, revision, now),
    };

    let row = KvEntryRow {
        value,
        version,
        create_revision,
        mod_revision: revision,
        lease_id: lease_id.clone(),
        created_at,
        modified_at: now,
        deleted: false,
    };
    engine.set(&schema::kv_entry_key(key, revision), serde_json::to_vec(&row)?)?;
    append_log(engine, revision, now, Operation::Put, vec![key.to_vec()], Some(version))?;

    *current_revision = revision;
    Ok(revision)
}

/// Returns the latest live entry for `key`, or the entry live at `revision` if given.
pub fn get_locked<E: Engine>(
    engine: &mut E,
    compacted_revision: u64,
    key: &[u8],
    revision: Option<u64>,
) -> CResult<Option<KvEntry>> {
    match revision {
        None => match latest_row(engine, key)? {
            Some((_, row)) if !row.deleted => Ok(Some(row.into_entry(key.to_vec()))),
            _ => Ok(None),
        },
        Some(target) => {
            if target <= compacted_revision && engine.get(&schema::revision_key(target))?.is_none() {
                return Err(Error::CompactedOutOfRange { requested: target, compacted: compacted_revision });
            }
            let prefix = schema::kv_entries_history_prefix(key);
            let mut best: Option<KvEntryRow> = None;
            for item in engine.scan_prefix(&prefix) {
                let (composite, value) = item?;
                let mod_revision = schema::decode_mod_revision(&composite)?;
                if mod_revision > target {
                    break;
                }
                let row: KvEntryRow = serde_json::from_slice(&value)?;
                best = Some(row);
            }
            match best {
                Some(row) if !row.deleted => Ok(Some(row.into_entry(key.to_vec()))),
                _ => Ok(None),
            }
        }
    }
}

/// Returns the latest live entry for every key beginning with `prefix`, ascending.
pub fn get_prefix_locked<E: Engine>(engine: &mut E, prefix: &[u8]) -> CResult<Vec<KvEntry>> {
    let scan_prefix = schema::kv_entries_prefix_scan_key(prefix);
    let mut by_key: Vec<(Vec<u8>, KvEntryRow)> = Vec::new();
    for item in engine.scan_prefix(&scan_prefix) {
        let (composite, value) = item?;
        let key = schema::decode_kv_entry_key(&composite)?;
        let row: KvEntryRow = serde_json::from_slice(&value)?;
        if let Some(last) = by_key.last_mut() {
            if last.0 == key {
                if row.mod_revision > last.1.mod_revision {
                    last.1 = row;
                }
                continue;
            }
        }
        by_key.push((key, row));
    }
    Ok(by_key
        .into_iter()
        .filter(|(_, row)| !row.deleted)
        .map(|(key, row)| row.into_entry(key))
        .collect())
}

/// Returns up to `limit` historical entries for `key`, newest first, stopping at the
/// compaction boundary. Tombstones are included with an empty value.
pub fn history_locked<E: Engine>(
    engine: &mut E,
    compacted_revision: u64,
    key: &[u8],
    limit: usize,
) -> CResult<Vec<KvEntry>> {
    let prefix = schema::kv_entries_history_prefix(key);
    let mut rows: Vec<(u64, KvEntryRow)> = Vec::new();
    for item in engine.scan_prefix(&prefix) {
        let (composite, value) = item?;
        let mod_revision = schema::decode_mod_revision(&composite)?;
        if mod_revision <= compacted_revision {
            continue;
        }
        let row: KvEntryRow = serde_json::from_slice(&value)?;
        rows.push((mod_revision, row));
    }
    rows.sort_by(|a, b| b.0.cmp(&a.0));
    rows.truncate(limit);
    Ok(rows.into_iter().map(|(_, row)| row.into_entry(key.to_vec())).collect())
}

/// The outcome of a delete: the revision it consumed and the keys it tombstoned
/// (used by the lease manager to unbind them).
pub struct DeleteOutcome {
    pub revision: u64,
    /// Every key tombstoned by this delete, paired with the lease it was bound to
    /// (if any), so the caller can unbind it from that lease.
    pub deleted_keys: Vec<(Vec<u8>, Option<String>)>,
}

/// Deletes `key`, or every live key in `[key, range_end)` when `range_end` is given.
/// The whole operation -- single key or range -- consumes exactly one revision.
///
/// Single-key deletes always emit a tombstone and a revision-log record, even if no
/// live entry existed, to keep the audit trail deterministic. Range deletes only
/// tombstone keys that were actually live.
pub fn delete_locked<E: Engine>(
    engine: &mut E,
    current_revision: &mut u64,
    now: DateTime<Utc>,
    key: &[u8],
    range_end: Option<&[u8]>,
) -> CResult<DeleteOutcome> {
    // Candidate only; committed to `current_revision` after every fallible
    // engine write below (including the log record) has succeeded.
    let revision = *current_revision + 1;

    let targets: Vec<Vec<u8>> = match range_end {
        None => vec![key.to_vec()],
        Some(end) => {
            let mut live_keys = Vec::new();
            for item in get_prefix_locked(engine, &[])? {
                if item.key.as_slice() >= key && item.key.as_slice() < end {
                    live_keys.push(item.key);
                }
            }
            live_keys
        }
    };

    let mut deleted_keys = Vec::new();
    for k in targets {
        let prev = latest_row(engine, &k)?;
        let was_live = matches!(&prev, Some((_, row)) if !row.deleted);
        if range_end.is_some() && !was_live {
            continue;
        }

        let (version, create_revision, created_at, lease_id) = match &prev {
            Some((_, row)) => (row.version, row.create_revision, row.created_at, row.lease_id.clone()),
            None => (0, revision, now, None),
        };
        let row = KvEntryRow {
            value: Vec::new(),
            version,
            create_revision,
            mod_revision: revision,
            lease_id: lease_id.clone(),
            created_at,
            modified_at: now,
            deleted: true,
        };
        engine.set(&schema::kv_entry_key(&k, revision), serde_json::to_vec(&row)?)?;
        deleted_keys.push((k, lease_id));
    }

    let affected: Vec<Vec<u8>> = deleted_keys.iter().map(|(k, _)| k.clone()).collect();
    append_log(engine, revision, now, Operation::Delete, affected, None)?;

    *current_revision = revision;
    Ok(DeleteOutcome { revision, deleted_keys })
}

/// Advances `compacted_revision` and purges revision-log records and (optionally)
/// superseded `kv_entries` rows at or below `revision`.
pub fn compact_locked<E: Engine>(
    engine: &mut E,
    current_revision: u64,
    compacted_revision: &mut u64,
    revision: u64,
    purge_superseded_entries: bool,
) -> CResult<()> {
    if revision > current_revision {
        return Err(Error::FutureRevision { requested: revision, current: current_revision });
    }

    let (start, end) = schema::revisions_upto_range(revision);
    let stale: Vec<Vec<u8>> =
        engine.scan_dyn((start, end)).map(|item| item.map(|(k, _)| k)).collect::<CResult<Vec<_>>>()?;
    for k in stale {
        engine.delete(&k)?;
    }

    if purge_superseded_entries {
        purge_superseded(engine, revision)?;
    }

    *compacted_revision = (*compacted_revision).max(revision);
    Ok(())
}

/// Drops every `kv_entries` row at or below `revision` that is not the latest such
/// row for its key; rows above `revision` are always left untouched.
fn purge_superseded<E: Engine>(engine: &mut E, revision: u64) -> CResult<()> {
    let table_prefix = schema::kv_entries_table_prefix();
    let mut rows: Vec<(Vec<u8>, Vec<u8>, u64)> = Vec::new();
    for item in engine.scan_prefix(&table_prefix) {
        let (composite, _value) = item?;
        let key = schema::decode_kv_entry_key(&composite)?;
        let mod_revision = schema::decode_mod_revision(&composite)?;
        rows.push((composite, key, mod_revision));
    }

    use std::collections::HashMap;
    let mut latest_at_or_below: HashMap<Vec<u8>, u64> = HashMap::new();
    for (_, key, mod_revision) in &rows {
        if *mod_revision <= revision {
            let entry = latest_at_or_below.entry(key.clone()).or_insert(0);
            if *mod_revision > *entry {
                *entry = *mod_revision;
            }
        }
    }

    for (composite, key, mod_revision) in rows {
        if mod_revision > revision {
            continue;
        }
        if mod_revision != latest_at_or_below[&key] {
            engine.delete(&composite)?;
        }
    }
    Ok(())
}
