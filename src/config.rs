//! Init-time configuration for a [`crate::store::ConfigStore`].

use std::path::PathBuf;
use std::time::Duration;

/// Maximum lease TTL accepted by `grant_lease`, in seconds (30 days).
pub const MAX_LEASE_TTL_S: i64 = 30 * 24 * 60 * 60;

/// Default cadence at which the lease sweeper scans for expired leases.
pub const DEFAULT_SWEEPER_INTERVAL: Duration = Duration::from_secs(5);

/// Default cadence at which the watch dispatcher polls the revision log.
pub const DEFAULT_WATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for opening a [`crate::store::ConfigStore`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Process-wide identity reported by `cluster_info()`.
    pub member_id: String,

    /// Directory holding the backend's on-disk files. Only consulted by
    /// disk-backed engines (e.g. `LogCask`); ignored by `Memory`.
    pub data_dir: PathBuf,

    /// Cadence at which the lease sweeper scans for expired leases.
    pub sweeper_interval: Duration,

    /// Cadence at which the watch dispatcher polls the revision log.
    pub watch_poll_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            member_id: "node-1".to_string(),
            data_dir: PathBuf::from("data/kvconf"),
            sweeper_interval: DEFAULT_SWEEPER_INTERVAL,
            watch_poll_interval: DEFAULT_WATCH_POLL_INTERVAL,
        }
    }
}
