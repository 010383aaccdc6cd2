//! The read-only cluster/member snapshot surface.

use chrono::{DateTime, Utc};

use crate::error::CResult;
use crate::lease::manager as lease;
use crate::mvcc::store as mvcc;
use crate::storage::engine::Engine;

/// A self-consistent snapshot of store identity and size, sampled under the store
/// mutex. `member_id` is a process-wide constant configured at init.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterInfo {
    pub member_id: String,
    pub revision: u64,
    pub compacted_revision: u64,
    pub lease_count: u64,
    pub key_count: u64,
}

/// Builds a [`ClusterInfo`] snapshot. Caller must hold the store mutex.
pub fn cluster_info_locked<E: Engine>(
    engine: &mut E,
    member_id: &str,
    current_revision: u64,
    compacted_revision: u64,
    now: DateTime<Utc>,
) -> CResult<ClusterInfo> {
    let lease_count = lease::count_active_locked(engine, now)?;
    let key_count = mvcc::get_prefix_locked(engine, &[])?.len() as u64;
    Ok(ClusterInfo {
        member_id: member_id.to_string(),
        revision: current_revision,
        compacted_revision,
        lease_count,
        key_count,
    })
}
