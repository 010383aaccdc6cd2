use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info};

use crate::error::CResult;

/// The surface the sweeper needs from the store: list expired lease ids without
/// holding the store mutex across the whole scan, then revoke them one at a time.
pub trait SweepTarget: Send + Sync {
    fn expired_lease_ids(&self) -> CResult<Vec<String>>;
    fn revoke_lease(&self, lease_id: &str) -> CResult<()>;
}

/// Background task that wakes on a fixed cadence and revokes every lease whose
/// deadline has passed. Owned by the store for its whole lifetime; `shutdown` stops
/// it deterministically on `close()`.
pub struct LeaseSweeper {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseSweeper {
    pub fn start<T: SweepTarget + 'static>(target: Arc<T>, interval: Duration) -> Self {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));

        let loop_shutdown = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*loop_shutdown;
            loop {
                let guard = lock.lock().expect("sweeper shutdown mutex poisoned");
                let (guard, _) =
                    cvar.wait_timeout(guard, interval).expect("sweeper shutdown mutex poisoned");
                if *guard {
                    break;
                }
                drop(guard);

                match target.expired_lease_ids() {
                    Ok(ids) => {
                        for id in ids {
                            if let Err(e) = target.revoke_lease(&id) {
                                error!("lease sweeper: failed to revoke lease {id}: {e}");
                            }
                        }
                    }
                    Err(e) => error!("lease sweeper: failed to scan for expired leases: {e}"),
                }
            }
            info!("lease sweeper stopped");
        });

        Self { shutdown, handle: Some(handle) }
    }

    /// Signals the sweeper to exit and waits for it to stop.
    pub fn stop(&mut self) {
        {
            let (lock, cvar) = &*self.shutdown;
            let mut guard = lock.lock().expect("sweeper shutdown mutex poisoned");
            *guard = true;
            cvar.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LeaseSweeper {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}
