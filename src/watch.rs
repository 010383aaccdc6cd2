//! Prefix-filtered subscriptions over the revision log. A single background
//! dispatcher tails the log per registered watch and delivers matching events to
//! callbacks in strictly increasing revision order, exactly once per record.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, warn};

use crate::error::CResult;
use crate::schema::{Operation, RevisionLogRecord};

/// The surface the dispatcher needs from the store to tail the log without taking
/// the store mutex for the whole dispatch round.
pub trait WatchSource: Send + Sync {
    /// Every revision-log record with `revision > after`, in ascending order.
    fn records_after(&self, after: u64) -> CResult<Vec<RevisionLogRecord>>;

    /// The value written by a `put` at exactly `revision` for `key`. Used to
    /// reconstruct the event payload, since the revision log itself is valueless.
    fn value_written_at(&self, key: &[u8], revision: u64) -> CResult<Vec<u8>>;

    /// The store's current revision, used as the cursor starting point for a watch
    /// registered right now.
    fn current_revision(&self) -> u64;
}

pub type WatchCallback = Box<dyn Fn(Operation, &[u8], &[u8]) + Send + Sync>;

struct WatchEntry {
    id: String,
    key_prefix: Vec<u8>,
    last_delivered_revision: Mutex<u64>,
    callback: WatchCallback,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Owns every live watch subscription and the background dispatcher that serves
/// them. Its registry lock is separate from the store mutex, so subscribing or
/// unsubscribing never blocks a concurrent writer.
pub struct WatchHub<T: WatchSource> {
    source: Arc<T>,
    watches: Arc<Mutex<HashMap<String, Arc<WatchEntry>>>>,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl<T: WatchSource + 'static> WatchHub<T> {
    pub fn start(source: Arc<T>, poll_interval: Duration) -> Self {
        let watches: Arc<Mutex<HashMap<String, Arc<WatchEntry>>>> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));

        let loop_source = source.clone();
        let loop_watches = watches.clone();
        let loop_shutdown = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*loop_shutdown;
            loop {
                let guard = lock.lock().expect("watch shutdown mutex poisoned");
                let (guard, _) =
                    cvar.wait_timeout(guard, poll_interval).expect("watch shutdown mutex poisoned");
                if *guard {
                    break;
                }
                drop(guard);

                dispatch_round(&loop_source, &loop_watches);
            }
        });

        Self { source, watches, shutdown, handle: Some(handle) }
    }

    /// Registers a new prefix subscription, starting from the store's current
    /// revision, and returns its id.
    pub fn subscribe(&self, key_prefix: Vec<u8>, callback: WatchCallback) -> String {
        let id = format!("watch-{:016x}", rand::random::<u64>());
        let entry = Arc::new(WatchEntry {
            id: id.clone(),
            key_prefix,
            last_delivered_revision: Mutex::new(self.source.current_revision()),
            callback,
            created_at: Utc::now(),
        });
        self.watches.lock().expect("watch registry mutex poisoned").insert(id.clone(), entry);
        id
    }

    /// Removes a subscription. A dispatch round already in flight for it may still
    /// complete, but no new events will be delivered afterward.
    pub fn unsubscribe(&self, watch_id: &str) {
        self.watches.lock().expect("watch registry mutex poisoned").remove(watch_id);
    }

    pub fn stop(&mut self) {
        {
            let (lock, cvar) = &*self.shutdown;
            let mut guard = lock.lock().expect("watch shutdown mutex poisoned");
            *guard = true;
            cvar.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn dispatch_round<T: WatchSource>(source: &Arc<T>, watches: &Arc<Mutex<HashMap<String, Arc<WatchEntry>>>>) {
    let snapshot: Vec<Arc<WatchEntry>> =
        watches.lock().expect("watch registry mutex poisoned").values().cloned().collect();

    for watch in snapshot {
        let after = *watch.last_delivered_revision.lock().expect("watch cursor mutex poisoned");
        let records = match source.records_after(after) {
            Ok(records) => records,
            Err(e) => {
                error!("watch dispatcher: failed to read revision log for {}: {e}", watch.id);
                continue;
            }
        };

        let mut max_delivered = after;
        for record in records {
            let mut matched = false;
            for key in &record.keys {
                if !key.starts_with(watch.key_prefix.as_slice()) {
                    continue;
                }
                matched = true;

                let value = match record.operation {
                    Operation::Delete => Vec::new(),
                    Operation::Put => match source.value_written_at(key, record.revision) {
                        Ok(v) => v,
                        Err(e) => {
                            error!(
                                "watch dispatcher: failed to read value for {:?}@{}: {e}",
                                key, record.revision
                            );
                            continue;
                        }
                    },
                };

                let callback = &watch.callback;
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    callback(record.operation, key, &value);
                }));
                if result.is_err() {
                    warn!("watch dispatcher: callback for {} panicked and was suppressed", watch.id);
                }
            }

            if matched {
                max_delivered = record.revision;
            }
        }

        if max_delivered > after {
            *watch.last_delivered_revision.lock().expect("watch cursor mutex poisoned") = max_delivered;
        }
    }
}

impl<T: WatchSource> Drop for WatchHub<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let (lock, cvar) = &*self.shutdown;
            let mut guard = lock.lock().expect("watch shutdown mutex poisoned");
            *guard = true;
            cvar.notify_one();
            drop(guard);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeSource {
        records: StdMutex<Vec<RevisionLogRecord>>,
        values: StdMutex<HashMap<(Vec<u8>, u64), Vec<u8>>>,
        revision: AtomicU64,
    }

    impl WatchSource for FakeSource {
        fn records_after(&self, after: u64) -> CResult<Vec<RevisionLogRecord>> {
            Ok(self.records.lock().unwrap().iter().filter(|r| r.revision > after).cloned().collect())
        }

        fn value_written_at(&self, key: &[u8], revision: u64) -> CResult<Vec<u8>> {
            Ok(self.values.lock().unwrap().get(&(key.to_vec(), revision)).cloned().unwrap_or_default())
        }

        fn current_revision(&self) -> u64 {
            self.revision.load(Ordering::SeqCst)
        }
    }

    fn record(revision: u64, op: Operation, key: &[u8]) -> RevisionLogRecord {
        RevisionLogRecord {
            revision,
            timestamp: Utc::now(),
            operation: op,
            keys: vec![key.to_vec()],
            details: None,
        }
    }

    #[test]
    fn dispatch_round_delivers_in_order_and_advances_cursor() {
        let source = Arc::new(FakeSource {
            records: StdMutex::new(vec![
                record(1, Operation::Put, b"k"),
                record(2, Operation::Put, b"k"),
                record(3, Operation::Delete, b"k"),
            ]),
            values: StdMutex::new(HashMap::from([
                ((b"k".to_vec(), 1), b"v1".to_vec()),
                ((b"k".to_vec(), 2), b"v2".to_vec()),
            ])),
            revision: AtomicU64::new(0),
        });

        let watches: Arc<Mutex<HashMap<String, Arc<WatchEntry>>>> = Arc::new(Mutex::new(HashMap::new()));
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let sink = delivered.clone();
        let entry = Arc::new(WatchEntry {
            id: "w1".to_string(),
            key_prefix: b"k".to_vec(),
            last_delivered_revision: Mutex::new(0),
            callback: Box::new(move |op, key, value| {
                sink.lock().unwrap().push((op, key.to_vec(), value.to_vec()));
            }),
            created_at: Utc::now(),
        });
        watches.lock().unwrap().insert("w1".to_string(), entry.clone());

        dispatch_round(&source, &watches);

        let got = delivered.lock().unwrap();
        assert_eq!(
            *got,
            vec![
                (Operation::Put, b"k".to_vec(), b"v1".to_vec()),
                (Operation::Put, b"k".to_vec(), b"v2".to_vec()),
                (Operation::Delete, b"k".to_vec(), b"".to_vec()),
            ]
        );
        assert_eq!(*entry.last_delivered_revision.lock().unwrap(), 3);
    }

    #[test]
    fn dispatch_round_delivers_every_key_in_a_range_delete_record() {
        let source = Arc::new(FakeSource {
            records: StdMutex::new(vec![RevisionLogRecord {
                revision: 1,
                timestamp: Utc::now(),
                operation: Operation::Delete,
                keys: vec![b"a".to_vec(), b"b".to_vec()],
                details: None,
            }]),
            values: StdMutex::new(HashMap::new()),
            revision: AtomicU64::new(0),
        });

        let watches: Arc<Mutex<HashMap<String, Arc<WatchEntry>>>> = Arc::new(Mutex::new(HashMap::new()));
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let sink = delivered.clone();
        let entry = Arc::new(WatchEntry {
            id: "w2".to_string(),
            key_prefix: b"b".to_vec(),
            last_delivered_revision: Mutex::new(0),
            callback: Box::new(move |op, key, value| {
                sink.lock().unwrap().push((op, key.to_vec(), value.to_vec()));
            }),
            created_at: Utc::now(),
        });
        watches.lock().unwrap().insert("w2".to_string(), entry.clone());

        dispatch_round(&source, &watches);

        let got = delivered.lock().unwrap();
        assert_eq!(*got, vec![(Operation::Delete, b"b".to_vec(), b"".to_vec())]);
        assert_eq!(*entry.last_delivered_revision.lock().unwrap(), 1);
    }
}
