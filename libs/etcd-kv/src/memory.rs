//! In-memory [`KvStore`] with the same transactional semantics as the
//! etcd backend, including lease-bound key lifetimes.
//!
//! Used by tests; leases are tracked with expiry instants and expired
//! keys are purged on every operation, so store-side TTL behavior is
//! observable without a real cluster. [`MemoryKv::expire_lease`] and
//! [`MemoryKv::expire_all_leases`] let a test harness force expiry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::{Compare, KeyValue, KvStore, LeaseId, OpOutcome, Txn, TxnOp, TxnOutcome};

/// Shared in-memory store. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    kvs: BTreeMap<String, Entry>,
    /// live leases and when they expire
    leases: HashMap<i64, Instant>,
    next_lease: i64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

impl MemoryKv {
    /// New empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let mut inner = self.lock();
        purge_expired(&mut inner);
        inner.kvs.len()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The lease a key is bound to, if any.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut inner = self.lock();
        purge_expired(&mut inner);
        inner.kvs.get(key).and_then(|entry| entry.lease)
    }

    /// Force one lease to expire immediately, dropping every key bound to
    /// it. Test-harness hook emulating store-side TTL expiry.
    pub fn expire_lease(&self, lease: LeaseId) {
        let mut inner = self.lock();
        inner.leases.remove(&lease.id());
        purge_expired(&mut inner);
    }

    /// Force every outstanding lease to expire immediately.
    pub fn expire_all_leases(&self) {
        let mut inner = self.lock();
        inner.leases.clear();
        purge_expired(&mut inner);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory kv lock poisoned")
    }
}

/// Drop expired leases and every key bound to a dead lease.
fn purge_expired(inner: &mut Inner) {
    let now = Instant::now();
    let Inner { kvs, leases, .. } = inner;
    leases.retain(|_, expires_at| *expires_at > now);
    kvs.retain(|_, entry| {
        entry
            .lease
            .is_none_or(|lease| leases.contains_key(&lease.id()))
    });
}

fn holds(kvs: &BTreeMap<String, Entry>, guard: &Compare) -> bool {
    match guard {
        Compare::Exists(key) => kvs.contains_key(key),
        Compare::Missing(key) => !kvs.contains_key(key),
        Compare::ValueEquals { key, value } => {
            kvs.get(key).is_some_and(|entry| entry.value == *value)
        }
    }
}

/// Reject transactions referencing leases the store no longer knows,
/// before any op is applied.
fn check_leases(inner: &Inner, txn: &Txn) -> StoreResult<()> {
    for op in txn.success.iter().chain(txn.failure.iter()) {
        match op {
            TxnOp::Put {
                lease: Some(lease), ..
            } if !inner.leases.contains_key(&lease.id()) => {
                return Err(StoreError::LeaseNotFound(*lease));
            }
            TxnOp::Txn(nested) => check_leases(inner, nested)?,
            _ => {}
        }
    }
    Ok(())
}

fn apply(kvs: &mut BTreeMap<String, Entry>, op: TxnOp) -> OpOutcome {
    match op {
        TxnOp::Put { key, value, lease } => {
            kvs.insert(key, Entry { value, lease });
            OpOutcome::Done
        }
        TxnOp::Delete { key } => {
            kvs.remove(&key);
            OpOutcome::Done
        }
        TxnOp::Txn(nested) => OpOutcome::Txn(eval(kvs, nested)),
    }
}

fn eval(kvs: &mut BTreeMap<String, Entry>, txn: Txn) -> TxnOutcome {
    let succeeded = txn.guards.iter().all(|guard| holds(kvs, guard));
    let branch = if succeeded { txn.success } else { txn.failure };
    let responses = branch.into_iter().map(|op| apply(kvs, op)).collect();
    TxnOutcome {
        succeeded,
        responses,
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock();
        purge_expired(&mut inner);
        Ok(inner.kvs.get(key).map(|entry| entry.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut inner = self.lock();
        purge_expired(&mut inner);
        Ok(inner
            .kvs
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut inner = self.lock();
        purge_expired(&mut inner);
        if let Some(lease) = lease
            && !inner.leases.contains_key(&lease.id())
        {
            return Err(StoreError::LeaseNotFound(lease));
        }
        inner.kvs.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                lease,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        purge_expired(&mut inner);
        inner.kvs.remove(key);
        Ok(())
    }

    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut inner = self.lock();
        purge_expired(&mut inner);
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(id, Instant::now() + ttl);
        Ok(LeaseId::new(id))
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnOutcome> {
        let mut inner = self.lock();
        purge_expired(&mut inner);
        check_leases(&inner, &txn)?;
        Ok(eval(&mut inner.kvs, txn))
    }
}
