//! Lease grant/keepalive/revoke/bind semantics, and the background sweeper that
//! expires leases whose deadline has passed.

pub mod manager;
pub mod sweeper;
