//! # etcd-kv
//!
//! `etcd-kv` is a thin typed gateway over a strongly-consistent KV store
//! with multi-key compare-and-swap transactions and TTL-bound keys.
//!
//! The [`KvStore`] trait is the seam: [`EtcdKv`] talks to a real etcd
//! cluster over mutually-authenticated TLS, while [`MemoryKv`] is an
//! in-process store with the same transactional semantics (including
//! lease expiry) used by tests.
//!
//! Transactions are described with a small data model ([`Compare`],
//! [`TxnOp`], [`Txn`]) that mirrors the etcd API, including nested
//! transactions: a [`TxnOp::Txn`] is a single op whose own `succeeded`
//! flag is reported in the parent's [`TxnOutcome`].
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::time::Duration;

use async_trait::async_trait;

pub mod error;
pub mod etcd;
pub mod memory;

pub use crate::error::{StoreError, StoreResult};
pub use crate::etcd::{EtcdKv, StoreConfig};
pub use crate::memory::MemoryKv;

/// Opaque handle to a store-side lease. Every key written under a lease
/// disappears atomically when the lease expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(i64);

impl LeaseId {
    pub(crate) fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw store-assigned lease id.
    pub fn id(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A `(key, value)` pair returned by [`KvStore::get_prefix`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key, including whatever prefix was scanned.
    pub key: String,
    /// Stored value.
    pub value: String,
}

/// Transaction guard. All guards of a [`Txn`] must hold for the success
/// branch to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// The key exists (any value, any revision).
    Exists(String),
    /// The key does not exist.
    Missing(String),
    /// The key exists with exactly this value.
    ValueEquals {
        /// Key under comparison.
        key: String,
        /// Expected value.
        value: String,
    },
}

impl Compare {
    /// Guard: key exists.
    pub fn exists(key: impl Into<String>) -> Self {
        Compare::Exists(key.into())
    }

    /// Guard: key is missing.
    pub fn missing(key: impl Into<String>) -> Self {
        Compare::Missing(key.into())
    }

    /// Guard: key holds exactly `value`.
    pub fn value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Compare::ValueEquals {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A single operation inside a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Write `key = value`, optionally bound to a lease.
    Put {
        /// Key to write.
        key: String,
        /// Value to store.
        value: String,
        /// Lease binding the key's lifetime, if any.
        lease: Option<LeaseId>,
    },
    /// Delete the key.
    Delete {
        /// Key to delete.
        key: String,
    },
    /// A nested guarded transaction, executed as one op of the parent.
    Txn(Txn),
}

impl TxnOp {
    /// Put without a lease.
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    /// Put bound to `lease`; the key vanishes when the lease expires.
    pub fn put_with_lease(key: impl Into<String>, value: impl Into<String>, lease: LeaseId) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    /// Delete a key.
    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    /// Nest a whole transaction as a single op.
    pub fn txn(txn: Txn) -> Self {
        TxnOp::Txn(txn)
    }
}

/// A guarded multi-key transaction, serializable at the store.
///
/// Builder surface mirrors the etcd client: guards via [`Txn::when`],
/// branches via [`Txn::and_then`] / [`Txn::or_else`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub(crate) guards: Vec<Compare>,
    pub(crate) success: Vec<TxnOp>,
    pub(crate) failure: Vec<TxnOp>,
}

impl Txn {
    /// Empty transaction; guards and branches are added with the builder
    /// methods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guards. The success branch runs only if every guard holds.
    pub fn when(mut self, guards: impl Into<Vec<Compare>>) -> Self {
        self.guards = guards.into();
        self
    }

    /// Ops to apply when all guards hold.
    pub fn and_then(mut self, ops: impl Into<Vec<TxnOp>>) -> Self {
        self.success = ops.into();
        self
    }

    /// Ops to apply when any guard fails.
    pub fn or_else(mut self, ops: impl Into<Vec<TxnOp>>) -> Self {
        self.failure = ops.into();
        self
    }
}

/// Result of one op within a committed transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// A put, delete or read completed; nothing further to report.
    Done,
    /// A nested transaction ran; its own outcome, including whether its
    /// guards held.
    Txn(TxnOutcome),
}

/// Result of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnOutcome {
    /// Whether the guards held (success branch ran).
    pub succeeded: bool,
    /// Per-op results of whichever branch ran, in op order.
    pub responses: Vec<OpOutcome>,
}

impl TxnOutcome {
    /// The outcome of the nested transaction at op index `idx` on the
    /// branch that ran, if that op was a [`TxnOp::Txn`].
    pub fn nested(&self, idx: usize) -> Option<&TxnOutcome> {
        match self.responses.get(idx) {
            Some(OpOutcome::Txn(outcome)) => Some(outcome),
            _ => None,
        }
    }
}

/// Typed gateway over the store's transactional and TTL-bearing
/// operations. Implementations must be safe to share across tasks.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read one key.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Read every key starting with `prefix`, ascending by key.
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// Write one key, optionally bound to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Delete one key.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Grant a store-side lease lasting `ttl`.
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Commit a guarded transaction.
    async fn txn(&self, txn: Txn) -> StoreResult<TxnOutcome>;
}
