//! MVCC primitives: the revision-ordered put/get/delete/prefix/history/compact
//! operations that sit directly on top of the [`crate::storage::engine::Engine`]
//! backend. Every function here takes the engine and revision counters by mutable
//! reference and assumes its caller already holds the store mutex -- hence the
//! `_locked` naming convention used throughout the store's public API.

pub mod store;
