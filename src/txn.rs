//! Compare-and-swap transactions: evaluate a set of compare clauses against the
//! current keyspace, then atomically apply either the success or failure branch.
//! The whole evaluate-then-apply sequence runs under the store mutex, so no
//! interleaved mutation can change a compared value between steps.

use chrono::{DateTime, Utc};

use crate::error::{CResult, Error};
use crate::mvcc::store as mvcc;
use crate::storage::engine::Engine;

/// The comparison applied to a compare clause's target key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
}

/// One compare clause: `key op value`, evaluated against the latest live value of
/// `key`. `Equal` is false if the key is absent; `NotEqual` is true if absent.
#[derive(Clone, Debug)]
pub struct Compare {
    pub key: Vec<u8>,
    pub op: CompareOp,
    pub value: Vec<u8>,
}

/// One mutation applied as part of a transaction branch.
#[derive(Clone, Debug)]
pub enum TxnOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// The revision a single applied op landed at.
#[derive(Clone, Debug, PartialEq)]
pub struct TxnOpResult {
    pub key: Vec<u8>,
    pub revision: u64,
}

/// The outcome of a `txn` call.
#[derive(Clone, Debug, PartialEq)]
pub struct TxnResult {
    pub succeeded: bool,
    pub results: Vec<TxnOpResult>,
}

fn evaluate<E: Engine>(engine: &mut E, compares: &[Compare]) -> CResult<bool> {
    for compare in compares {
        let entry = mvcc::get_locked(engine, 0, &compare.key, None)?;
        let passed = match compare.op {
            CompareOp::Equal => entry.as_ref().map(|e| e.value == compare.value).unwrap_or(false),
            CompareOp::NotEqual => entry.as_ref().map(|e| e.value != compare.value).unwrap_or(true),
        };
        if !passed {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Every delete applied while running a transaction branch, so the caller (the
/// store) can unbind any lease those keys were bound to.
pub struct TxnDeletes(pub Vec<(Vec<u8>, Option<String>)>);

/// Evaluates `compares`, then applies `on_success` if all passed or `on_failure`
/// otherwise. Caller must hold the store mutex; `current_revision` is bumped once
/// per applied put/delete.
pub fn txn_locked<E: Engine>(
    engine: &mut E,
    current_revision: &mut u64,
    now: DateTime<Utc>,
    compares: &[Compare],
    on_success: &[TxnOp],
    on_failure: &[TxnOp],
) -> CResult<(TxnResult, TxnDeletes)> {
    let succeeded = evaluate(engine, compares)?;
    let ops = if succeeded { on_success } else { on_failure };

    let mut results = Vec::with_capacity(ops.len());
    let mut deletes = Vec::new();
    for op in ops {
        match op {
            TxnOp::Put { key, value } => {
                if key.is_empty() {
                    return Err(Error::InvalidArgument("txn put key must not be empty".to_string()));
                }
                let revision =
                    mvcc::put_locked(engine, current_revision, now, key, value.clone(), None)?;
                results.push(TxnOpResult { key: key.clone(), revision });
            }
            TxnOp::Delete { key } => {
                if key.is_empty() {
                    return Err(Error::InvalidArgument("txn delete key must not be empty".to_string()));
                }
                let outcome = mvcc::delete_locked(engine, current_revision, now, key, None)?;
                deletes.extend(outcome.deleted_keys.clone());
                results.push(TxnOpResult { key: key.clone(), revision: outcome.revision });
            }
        }
    }

    Ok((TxnResult { succeeded, results }, TxnDeletes(deletes)))
}
