#![allow(non_camel_case_types)]

//! A single-node MVCC key-value configuration store: revision-tracked puts and
//! deletes, time-bounded leases that auto-expire dependent keys, prefix watches
//! that replay changes in revision order, and compare-and-swap transactions over
//! groups of operations.
//!
//! ## Getting started
//!
//! ```rust
//! use kvconf::config::StoreConfig;
//! use kvconf::storage::memory::Memory;
//! use kvconf::store::ConfigStore;
//!
//! fn main() {
//!     let store = ConfigStore::open(Memory::new(), StoreConfig::default());
//!
//!     store.put(b"cfg/greeting", b"hello".to_vec(), None).unwrap();
//!     let entry = store.get(b"cfg/greeting", None).unwrap().unwrap();
//!     assert_eq!(entry.value, b"hello");
//!     assert_eq!(entry.version, 1);
//! }
//! ```

pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod lease;
pub mod mvcc;
pub mod schema;
pub mod storage;
pub mod store;
pub mod txn;
pub mod watch;
