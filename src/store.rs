//! The top-level facade: wires the MVCC store, lease manager, lease sweeper,
//! transaction executor, watch hub, and cluster info reporter together around one
//! backend engine and one store mutex.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::cluster::{self, ClusterInfo};
use crate::config::StoreConfig;
use crate::error::{CResult, Error};
use crate::lease::manager as lease;
use crate::lease::sweeper::{LeaseSweeper, SweepTarget};
use crate::mvcc::store as mvcc;
use crate::schema::{self, KvEntry, KvEntryRow, RevisionLogRecord};
use crate::storage::engine::Engine;
use crate::txn::{self, Compare, TxnOp, TxnResult};
use crate::watch::{WatchCallback, WatchHub, WatchSource};

struct Inner<E: Engine> {
    engine: E,
    current_revision: u64,
    compacted_revision: u64,
}

/// Shared state behind an `Arc`, handed to the watch dispatcher and lease sweeper
/// background threads alongside the foreground `ConfigStore` handle.
struct StoreCore<E: Engine> {
    inner: Mutex<Inner<E>>,
    clock: Arc<dyn Clock>,
    member_id: String,
}

impl<E: Engine> WatchSource for StoreCore<E> {
    fn records_after(&self, after: u64) -> CResult<Vec<RevisionLogRecord>> {
        let mut inner = self.inner.lock().unwrap();
        let (start, end) = schema::revisions_after_range(after);
        let mut out = Vec::new();
        for item in inner.engine.scan_dyn((start, end)) {
            let (_key, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn value_written_at(&self, key: &[u8], revision: u64) -> CResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.engine.get(&schema::kv_entry_key(key, revision))? {
            Some(bytes) => {
                let row: KvEntryRow = serde_json::from_slice(&bytes)?;
                Ok(row.value)
            }
            None => Ok(Vec::new()),
        }
    }

    fn current_revision(&self) -> u64 {
        self.inner.lock().unwrap().current_revision
    }
}

impl<E: Engine> SweepTarget for StoreCore<E> {
    fn expired_lease_ids(&self) -> CResult<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        lease::list_expired_locked(&mut inner.engine, now)
    }

    fn revoke_lease(&self, lease_id: &str) -> CResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        lease::revoke_locked(&mut inner.engine, &mut inner.current_revision, now, lease_id)
    }
}

/// A single-node MVCC key-value configuration store: durable revision-tracked puts
/// and deletes, time-bounded leases, prefix watches, and CAS transactions, all
/// layered over an arbitrary [`Engine`] backend.
pub struct ConfigStore<E: Engine + 'static> {
    core: Arc<StoreCore<E>>,
    watch_hub: Mutex<Option<WatchHub<StoreCore<E>>>>,
    sweeper: Mutex<Option<LeaseSweeper>>,
}

impl<E: Engine + 'static> ConfigStore<E> {
    /// Opens a store over `engine` using the real system clock.
    pub fn open(engine: E, config: StoreConfig) -> Self {
        Self::open_with_clock(engine, config, Arc::new(SystemClock))
    }

    /// Opens a store over `engine` with an explicit clock, for deterministic tests
    /// of lease expiry without sleeping for real TTLs.
    pub fn open_with_clock(engine: E, config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Inner { engine, current_revision: 0, compacted_revision: 0 };
        let core = Arc::new(StoreCore { inner: Mutex::new(inner), clock, member_id: config.member_id });

        let watch_hub = WatchHub::start(core.clone(), config.watch_poll_interval);
        let sweeper = LeaseSweeper::start(core.clone(), config.sweeper_interval);

        Self { core, watch_hub: Mutex::new(Some(watch_hub)), sweeper: Mutex::new(Some(sweeper)) }
    }

    fn now(&self) -> DateTime<Utc> {
        self.core.clock.now()
    }

    /// Writes a new version of `key`. If `lease_id` is given, the lease must exist
    /// and not be expired, and `key` is idempotently bound to it.
    pub fn put(&self, key: &[u8], value: Vec<u8>, lease_id: Option<String>) -> CResult<u64> {
        let mut inner = self.core.inner.lock().unwrap();
        let now = self.now();

        if let Some(ref lid) = lease_id {
            if !lease::is_active_locked(&mut inner.engine, now, lid)? {
                return Err(Error::LeaseNotFound(lid.clone()));
            }
        }

        let revision =
            mvcc::put_locked(&mut inner.engine, &mut inner.current_revision, now, key, value, lease_id.clone())?;

        if let Some(lid) = lease_id {
            lease::bind_key_locked(&mut inner.engine, now, &lid, key)?;
        }

        Ok(revision)
    }

    /// Returns the latest live entry for `key`, or its state as of `revision`.
    pub fn get(&self, key: &[u8], revision: Option<u64>) -> CResult<Option<KvEntry>> {
        let mut inner = self.core.inner.lock().unwrap();
        let compacted_revision = inner.compacted_revision;
        mvcc::get_locked(&mut inner.engine, compacted_revision, key, revision)
    }

    /// Deletes `key`, or every live key in `[key, range_end)`. Unbinds any lease the
    /// deleted keys were bound to.
    pub fn delete(&self, key: &[u8], range_end: Option<&[u8]>) -> CResult<u64> {
        let mut inner = self.core.inner.lock().unwrap();
        let now = self.now();
        let outcome = mvcc::delete_locked(&mut inner.engine, &mut inner.current_revision, now, key, range_end)?;
        for (deleted_key, bound_lease) in &outcome.deleted_keys {
            if let Some(lid) = bound_lease {
                lease::unbind_key_locked(&mut inner.engine, lid, deleted_key)?;
            }
        }
        Ok(outcome.revision)
    }

    /// Returns the latest live entry for every key beginning with `prefix`.
    pub fn get_prefix(&self, prefix: &[u8]) -> CResult<Vec<KvEntry>> {
        let mut inner = self.core.inner.lock().unwrap();
        mvcc::get_prefix_locked(&mut inner.engine, prefix)
    }

    /// Returns up to `limit` historical entries for `key`, newest first.
    pub fn history(&self, key: &[u8], limit: usize) -> CResult<Vec<KvEntry>> {
        let mut inner = self.core.inner.lock().unwrap();
        let compacted_revision = inner.compacted_revision;
        mvcc::history_locked(&mut inner.engine, compacted_revision, key, limit)
    }

    /// Advances the compaction boundary to `revision`, purging the revision log up
    /// to it and, if requested, superseded `kv_entries` rows.
    pub fn compact(&self, revision: u64, purge_superseded_entries: bool) -> CResult<()> {
        let mut inner = self.core.inner.lock().unwrap();
        let current = inner.current_revision;
        mvcc::compact_locked(
            &mut inner.engine,
            current,
            &mut inner.compacted_revision,
            revision,
            purge_superseded_entries,
        )
    }

    /// Grants a fresh lease with the given TTL in seconds.
    pub fn grant_lease(&self, ttl_s: i64) -> CResult<String> {
        let mut inner = self.core.inner.lock().unwrap();
        let now = self.now();
        lease::grant_locked(&mut inner.engine, now, ttl_s)
    }

    /// Extends a lease's deadline by its original TTL from now. Returns `false`
    /// (never an error) if the lease does not exist.
    pub fn keepalive(&self, lease_id: &str) -> CResult<bool> {
        let mut inner = self.core.inner.lock().unwrap();
        let now = self.now();
        lease::keepalive_locked(&mut inner.engine, now, lease_id)
    }

    /// Deletes every key bound to `lease_id` and removes the lease. A no-op if the
    /// lease does not exist.
    pub fn revoke_lease(&self, lease_id: &str) -> CResult<()> {
        let mut inner = self.core.inner.lock().unwrap();
        let now = self.now();
        lease::revoke_locked(&mut inner.engine, &mut inner.current_revision, now, lease_id)
    }

    /// Evaluates `compares` against the live keyspace, then atomically applies
    /// `on_success` or `on_failure`.
    pub fn txn(&self, compares: &[Compare], on_success: &[TxnOp], on_failure: &[TxnOp]) -> CResult<TxnResult> {
        let mut inner = self.core.inner.lock().unwrap();
        let now = self.now();
        let (result, deletes) =
            txn::txn_locked(&mut inner.engine, &mut inner.current_revision, now, compares, on_success, on_failure)?;
        for (deleted_key, bound_lease) in deletes.0 {
            if let Some(lid) = bound_lease {
                lease::unbind_key_locked(&mut inner.engine, &lid, &deleted_key)?;
            }
        }
        Ok(result)
    }

    /// Registers a prefix subscription and returns its watch id.
    pub fn watch(&self, key_prefix: Vec<u8>, callback: WatchCallback) -> String {
        self.watch_hub
            .lock()
            .unwrap()
            .as_ref()
            .expect("watch hub used after close")
            .subscribe(key_prefix, callback)
    }

    /// Removes a watch subscription.
    pub fn unwatch(&self, watch_id: &str) {
        if let Some(hub) = self.watch_hub.lock().unwrap().as_ref() {
            hub.unsubscribe(watch_id);
        }
    }

    /// Returns a self-consistent snapshot of member identity and store size.
    pub fn cluster_info(&self) -> CResult<ClusterInfo> {
        let mut inner = self.core.inner.lock().unwrap();
        let now = self.now();
        cluster::cluster_info_locked(
            &mut inner.engine,
            &self.core.member_id,
            inner.current_revision,
            inner.compacted_revision,
            now,
        )
    }

    /// Stops the sweeper and watch dispatcher, then flushes the backend.
    pub fn close(&self) -> CResult<()> {
        if let Some(mut hub) = self.watch_hub.lock().unwrap().take() {
            hub.stop();
        }
        if let Some(mut sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.stop();
        }
        self.core.inner.lock().unwrap().engine.flush()
    }
}

impl<E: Engine + 'static> Drop for ConfigStore<E> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
