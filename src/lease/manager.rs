use chrono::{DateTime, Utc};

use crate::config::MAX_LEASE_TTL_S;
use crate::error::{CResult, Error};
use crate::mvcc::store as mvcc;
use crate::schema::{self, LeaseRow};
use crate::storage::engine::Engine;

fn load_lease<E: Engine>(engine: &mut E, lease_id: &str) -> CResult<Option<LeaseRow>> {
    match engine.get(&schema::lease_key(lease_id))? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn save_lease<E: Engine>(engine: &mut E, lease: &LeaseRow) -> CResult<()> {
    engine.set(&schema::lease_key(&lease.id), serde_json::to_vec(lease)?)
}

/// Grants a fresh lease with the given TTL, returning its opaque id.
pub fn grant_locked<E: Engine>(engine: &mut E, now: DateTime<Utc>, ttl_s: i64) -> CResult<String> {
    if ttl_s <= 0 || ttl_s > MAX_LEASE_TTL_S {
        return Err(Error::InvalidTtl(format!("ttl_s must be in (0, {MAX_LEASE_TTL_S}], got {ttl_s}")));
    }
    let id = format!("lease-{:016x}", rand::random::<u64>());
    let lease = LeaseRow {
        id: id.clone(),
        ttl_s,
        granted_at: now,
        expires_at: now + chrono::Duration::seconds(ttl_s),
        keys: Default::default(),
    };
    save_lease(engine, &lease)?;
    Ok(id)
}

/// Extends `lease_id`'s deadline to `now + ttl_s`. Returns `false` if the lease is
/// unknown (already revoked or swept); never errors for that case.
pub fn keepalive_locked<E: Engine>(engine: &mut E, now: DateTime<Utc>, lease_id: &str) -> CResult<bool> {
    match load_lease(engine, lease_id)? {
        Some(mut lease) => {
            lease.expires_at = now + chrono::Duration::seconds(lease.ttl_s);
            save_lease(engine, &lease)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Returns true if the lease exists and has not yet expired.
pub fn is_active_locked<E: Engine>(engine: &mut E, now: DateTime<Utc>, lease_id: &str) -> CResult<bool> {
    Ok(load_lease(engine, lease_id)?.map(|l| l.expires_at > now).unwrap_or(false))
}

/// Binds `key` to `lease_id`'s key set, idempotently. Fails with `LeaseNotFound` if
/// the lease does not exist or has already expired.
pub fn bind_key_locked<E: Engine>(
    engine: &mut E,
    now: DateTime<Utc>,
    lease_id: &str,
    key: &[u8],
) -> CResult<()> {
    let mut lease =
        load_lease(engine, lease_id)?.ok_or_else(|| Error::LeaseNotFound(lease_id.to_string()))?;
    if lease.expires_at <= now {
        return Err(Error::LeaseNotFound(lease_id.to_string()));
    }
    lease.keys.insert(key.to_vec());
    save_lease(engine, &lease)
}

/// Removes `key` from `lease_id`'s key set, if both exist.
pub fn unbind_key_locked<E: Engine>(engine: &mut E, lease_id: &str, key: &[u8]) -> CResult<()> {
    if let Some(mut lease) = load_lease(engine, lease_id)? {
        if lease.keys.remove(key) {
            save_lease(engine, &lease)?;
        }
    }
    Ok(())
}

/// Deletes every key bound to `lease_id` (each consuming its own revision) and then
/// removes the lease record. Revoking a missing lease is a no-op.
pub fn revoke_locked<E: Engine>(
    engine: &mut E,
    current_revision: &mut u64,
    now: DateTime<Utc>,
    lease_id: &str,
) -> CResult<()> {
    let lease = match load_lease(engine, lease_id)? {
        Some(l) => l,
        None => return Ok(()),
    };
    for key in &lease.keys {
        mvcc::delete_locked(engine, current_revision, now, key, None)?;
    }
    engine.delete(&schema::lease_key(lease_id))?;
    Ok(())
}

/// Lists the ids of every lease whose deadline has passed as of `now`. Used by the
/// sweeper to take a snapshot before revoking leases one at a time.
pub fn list_expired_locked<E: Engine>(engine: &mut E, now: DateTime<Utc>) -> CResult<Vec<String>> {
    let mut expired = Vec::new();
    for item in engine.scan_prefix(&schema::leases_table_prefix()) {
        let (_key, value) = item?;
        let lease: LeaseRow = serde_json::from_slice(&value)?;
        if lease.expires_at < now {
            expired.push(lease.id);
        }
    }
    Ok(expired)
}

/// Counts leases that are still active (not yet expired) as of `now`.
pub fn count_active_locked<E: Engine>(engine: &mut E, now: DateTime<Utc>) -> CResult<u64> {
    let mut count = 0;
    for item in engine.scan_prefix(&schema::leases_table_prefix()) {
        let (_key, value) = item?;
        let lease: LeaseRow = serde_json::from_slice(&value)?;
        if lease.expires_at > now {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Memory;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn grant_rejects_non_positive_ttl() {
        let mut engine = Memory::new();
        assert!(matches!(grant_locked(&mut engine, now(), 0), Err(Error::InvalidTtl(_))));
        assert!(matches!(grant_locked(&mut engine, now(), -5), Err(Error::InvalidTtl(_))));
    }

    #[test]
    fn grant_rejects_ttl_above_cap() {
        let mut engine = Memory::new();
        assert!(matches!(
            grant_locked(&mut engine, now(), MAX_LEASE_TTL_S + 1),
            Err(Error::InvalidTtl(_))
        ));
    }

    #[test]
    fn keepalive_on_unknown_lease_returns_false() {
        let mut engine = Memory::new();
        assert_eq!(keepalive_locked(&mut engine, now(), "nope").unwrap(), false);
    }

    #[test]
    fn bind_is_idempotent() {
        let mut engine = Memory::new();
        let id = grant_locked(&mut engine, now(), 60).unwrap();
        bind_key_locked(&mut engine, now(), &id, b"k").unwrap();
        bind_key_locked(&mut engine, now(), &id, b"k").unwrap();
        let lease = load_lease(&mut engine, &id).unwrap().unwrap();
        assert_eq!(lease.keys.len(), 1);
    }

    #[test]
    fn revoke_deletes_bound_keys() {
        let mut engine = Memory::new();
        let mut rev = 0u64;
        let id = grant_locked(&mut engine, now(), 60).unwrap();
        mvcc::put_locked(&mut engine, &mut rev, now(), b"k", b"v".to_vec(), Some(id.clone())).unwrap();
        bind_key_locked(&mut engine, now(), &id, b"k").unwrap();

        revoke_locked(&mut engine, &mut rev, now(), &id).unwrap();
        assert!(mvcc::get_locked(&mut engine, 0, b"k", None).unwrap().is_none());
        assert!(load_lease(&mut engine, &id).unwrap().is_none());
    }

    #[test]
    fn expired_lease_is_listed_by_sweeper_scan() {
        let mut engine = Memory::new();
        let id = grant_locked(&mut engine, now(), 1).unwrap();
        let later = now() + chrono::Duration::seconds(5);
        assert_eq!(list_expired_locked(&mut engine, later).unwrap(), vec![id]);
    }
}
