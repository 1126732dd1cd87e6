//! The lease state machine, expressed as guarded multi-key transactions
//! against the store.
//!
//! Per address the states are: absent → free (bootstrap/reclaim),
//! free → leased (claim), leased → leased (renew), leased → free
//! (revoke), leased → absent (store-side TTL expiry). A DHCP lease is
//! the key pair `ips/leased/<ip>` ↔ `nics/leased/<mac>`, written and
//! deleted together and bound to one store lease.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use etcd_kv::{Compare, KvStore, Txn, TxnOp};
use tracing::{debug, info};

use crate::error::{LeaseError, LeaseResult};
use crate::keys::KeySchema;
use crate::range::Ipv4Range;

/// Issues every store transaction the plugin performs. Generic over the
/// store so tests run against the in-memory backend.
#[derive(Debug, Clone)]
pub struct LeaseEngine<S> {
    store: S,
    keys: KeySchema,
    range: Ipv4Range,
}

impl<S> LeaseEngine<S> {
    /// New engine over `store` for the given key namespace and range.
    pub fn new(store: S, keys: KeySchema, range: Ipv4Range) -> Self {
        Self { store, keys, range }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The managed range.
    pub fn range(&self) -> Ipv4Range {
        self.range
    }
}

impl<S> LeaseEngine<S>
where
    S: KvStore,
{
    /// The address this client currently holds, if any.
    pub async fn current_ip(&self, mac: &str) -> LeaseResult<Option<Ipv4Addr>> {
        let key = self.keys.leased_nic(mac);
        match self.store.get(&key).await? {
            Some(value) => Ok(Some(parse_stored_ip(&key, &value)?)),
            None => {
                debug!(%key, "no current lease");
                Ok(None)
            }
        }
    }

    /// Lowest currently-free address. No reservation is taken; offers are
    /// advisory and the address is only bound at claim time.
    pub async fn first_free(&self) -> LeaseResult<Ipv4Addr> {
        let kvs = self.store.get_prefix(&self.keys.free_ip_prefix()).await?;
        match kvs.first() {
            Some(kv) => parse_stored_ip(&kv.key, &kv.value),
            None => Err(LeaseError::NoFreeAddress),
        }
    }

    /// Claim a free address for `mac`, or renew an existing binding,
    /// under a fresh store lease of `ttl`.
    ///
    /// One compound transaction decides which case applies: if the
    /// address is still free, the nested claim branch unfrees it and
    /// writes both binding keys; otherwise the nested renew branch
    /// rewrites the binding under the new lease only if the existing
    /// cross-references still match. Whichever nested transaction ran,
    /// `applied == false` means the address is not available to this
    /// client and the caller should NAK.
    pub async fn lease(&self, mac: &str, ip: Ipv4Addr, ttl: Duration) -> LeaseResult<()> {
        let lease = self.store.grant(ttl).await?;

        let free_ip = self.keys.free_ip(ip);
        let leased_ip = self.keys.leased_ip(ip);
        let leased_nic = self.keys.leased_nic(mac);
        let ip_text = ip.to_string();

        let claim = Txn::new()
            .when(vec![
                Compare::missing(&leased_nic),
                Compare::missing(&leased_ip),
            ])
            .and_then(vec![
                TxnOp::delete(&free_ip),
                TxnOp::put_with_lease(&leased_nic, &ip_text, lease),
                TxnOp::put_with_lease(&leased_ip, mac, lease),
            ]);

        let renew = Txn::new()
            .when(vec![
                Compare::value(&leased_nic, &ip_text),
                Compare::value(&leased_ip, mac),
            ])
            .and_then(vec![
                TxnOp::put_with_lease(&leased_nic, &ip_text, lease),
                TxnOp::put_with_lease(&leased_ip, mac, lease),
            ]);

        let outcome = self
            .store
            .txn(
                Txn::new()
                    .when(vec![Compare::exists(&free_ip)])
                    .and_then(vec![TxnOp::txn(claim)])
                    .or_else(vec![TxnOp::txn(renew)]),
            )
            .await?;

        // both branches carry exactly one nested transaction
        let applied = outcome.nested(0).is_some_and(|inner| inner.succeeded);
        if !applied {
            return Err(LeaseError::AlreadyLeased(ip));
        }
        debug!(%ip, mac, lease = %lease, claimed = outcome.succeeded, "bound address");
        Ok(())
    }

    /// Tear down this client's binding and return the address to the
    /// free set. An absent binding is already revoked, not an error.
    pub async fn revoke(&self, mac: &str) -> LeaseResult<Option<Ipv4Addr>> {
        let Some(ip) = self.current_ip(mac).await? else {
            return Ok(None);
        };

        let free_ip = self.keys.free_ip(ip);
        let leased_ip = self.keys.leased_ip(ip);
        let leased_nic = self.keys.leased_nic(mac);

        let outcome = self
            .store
            .txn(
                Txn::new()
                    .when(vec![
                        Compare::exists(&leased_ip),
                        Compare::exists(&leased_nic),
                    ])
                    .and_then(vec![
                        TxnOp::delete(&leased_ip),
                        TxnOp::delete(&leased_nic),
                        TxnOp::put(&free_ip, ip.to_string()),
                    ]),
            )
            .await?;

        if !outcome.succeeded {
            return Err(LeaseError::RevokeConflict(ip));
        }
        Ok(Some(ip))
    }

    /// Stamp `ip` as free iff it is currently neither free nor leased.
    /// Returns whether the stamp applied. This is the only transition out
    /// of the absent state, shared by bootstrap and the reclaimer; its
    /// guards make it safe against an engine mid-claim.
    pub async fn stamp_free(&self, ip: Ipv4Addr) -> LeaseResult<bool> {
        let free_ip = self.keys.free_ip(ip);
        let leased_ip = self.keys.leased_ip(ip);
        let outcome = self
            .store
            .txn(
                Txn::new()
                    .when(vec![Compare::missing(&free_ip), Compare::missing(&leased_ip)])
                    .and_then(vec![TxnOp::put(&free_ip, ip.to_string())]),
            )
            .await?;
        Ok(outcome.succeeded)
    }

    /// Stamp every address in the range that is neither free nor leased.
    /// Idempotent; re-runs and peer instances are harmless. Fails fast on
    /// the first store error.
    pub async fn bootstrap(&self) -> LeaseResult<()> {
        for ip in self.range.iter() {
            if self.stamp_free(ip).await? {
                debug!(%ip, "established as free");
            }
        }
        Ok(())
    }

    /// One reclaim sweep: any range address that appears under neither
    /// key family has expired at the store and is re-stamped free.
    /// Returns how many addresses were reclaimed.
    pub async fn reclaim(&self) -> LeaseResult<usize> {
        let leased = self.ip_set(&self.keys.leased_ip_prefix()).await?;
        let free = self.ip_set(&self.keys.free_ip_prefix()).await?;

        let mut reclaimed = 0;
        for ip in self.range.iter() {
            let text = ip.to_string();
            if leased.contains(&text) || free.contains(&text) {
                continue;
            }
            if self.stamp_free(ip).await? {
                info!(%ip, "moved from expired to free");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn ip_set(&self, prefix: &str) -> LeaseResult<HashSet<String>> {
        Ok(self
            .store
            .get_prefix(prefix)
            .await?
            .into_iter()
            .map(|kv| self.keys.leaf(&kv.key).to_owned())
            .collect())
    }
}

fn parse_stored_ip(key: &str, value: &str) -> LeaseResult<Ipv4Addr> {
    value.parse().map_err(|_| LeaseError::BadStoredValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEFAULT_SEPARATOR;
    use etcd_kv::MemoryKv;

    const TTL: Duration = Duration::from_secs(600);

    fn engine(store: MemoryKv) -> LeaseEngine<MemoryKv> {
        LeaseEngine::new(
            store,
            KeySchema::new("dhcp", DEFAULT_SEPARATOR),
            Ipv4Range::new(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 13)),
        )
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let store = MemoryKv::new();
        let engine = engine(store.clone());
        engine.bootstrap().await.unwrap();
        assert_eq!(store.len(), 3);
        engine.bootstrap().await.unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(
            store.get("dhcp::ips::free::10.0.0.10").await.unwrap(),
            Some("10.0.0.10".into())
        );
    }

    #[tokio::test]
    async fn claim_unfrees_and_binds_both_keys() {
        let store = MemoryKv::new();
        let engine = engine(store.clone());
        engine.bootstrap().await.unwrap();

        let ip = Ipv4Addr::new(10, 0, 0, 10);
        engine.lease("aa:bb:cc:00:00:01", ip, TTL).await.unwrap();

        assert_eq!(store.get("dhcp::ips::free::10.0.0.10").await.unwrap(), None);
        assert_eq!(
            store.get("dhcp::ips::leased::10.0.0.10").await.unwrap(),
            Some("aa:bb:cc:00:00:01".into())
        );
        assert_eq!(
            store
                .get("dhcp::nics::leased::aa:bb:cc:00:00:01")
                .await
                .unwrap(),
            Some("10.0.0.10".into())
        );
        // the binding pair shares one store lease
        assert_eq!(
            store.lease_of("dhcp::ips::leased::10.0.0.10"),
            store.lease_of("dhcp::nics::leased::aa:bb:cc:00:00:01"),
        );
        assert!(store.lease_of("dhcp::ips::leased::10.0.0.10").is_some());
    }

    #[tokio::test]
    async fn renew_replaces_the_store_lease() {
        let store = MemoryKv::new();
        let engine = engine(store.clone());
        engine.bootstrap().await.unwrap();

        let ip = Ipv4Addr::new(10, 0, 0, 10);
        engine.lease("aa:bb:cc:00:00:01", ip, TTL).await.unwrap();
        let first = store.lease_of("dhcp::ips::leased::10.0.0.10").unwrap();

        engine.lease("aa:bb:cc:00:00:01", ip, TTL).await.unwrap();
        let second = store.lease_of("dhcp::ips::leased::10.0.0.10").unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn contended_claim_naks_the_loser() {
        let store = MemoryKv::new();
        let engine = engine(store.clone());
        engine.bootstrap().await.unwrap();

        let ip = Ipv4Addr::new(10, 0, 0, 10);
        engine.lease("aa:bb:cc:00:00:01", ip, TTL).await.unwrap();
        let err = engine
            .lease("aa:bb:cc:00:00:02", ip, TTL)
            .await
            .unwrap_err();
        assert!(err.is_already_leased());
        // the loser did not disturb the winner's binding
        assert_eq!(
            store.get("dhcp::ips::leased::10.0.0.10").await.unwrap(),
            Some("aa:bb:cc:00:00:01".into())
        );
    }

    #[tokio::test]
    async fn stale_renewal_is_rejected() {
        let store = MemoryKv::new();
        let engine = engine(store.clone());
        engine.bootstrap().await.unwrap();

        // client holds .10 but asks to renew .11, which another client owns
        engine
            .lease("aa:bb:cc:00:00:01", Ipv4Addr::new(10, 0, 0, 10), TTL)
            .await
            .unwrap();
        engine
            .lease("aa:bb:cc:00:00:02", Ipv4Addr::new(10, 0, 0, 11), TTL)
            .await
            .unwrap();
        let err = engine
            .lease("aa:bb:cc:00:00:01", Ipv4Addr::new(10, 0, 0, 11), TTL)
            .await
            .unwrap_err();
        assert!(err.is_already_leased());
    }

    #[tokio::test]
    async fn revoke_returns_address_to_free() {
        let store = MemoryKv::new();
        let engine = engine(store.clone());
        engine.bootstrap().await.unwrap();

        let ip = Ipv4Addr::new(10, 0, 0, 10);
        engine.lease("aa:bb:cc:00:00:01", ip, TTL).await.unwrap();
        let revoked = engine.revoke("aa:bb:cc:00:00:01").await.unwrap();
        assert_eq!(revoked, Some(ip));

        assert_eq!(
            store.get("dhcp::ips::free::10.0.0.10").await.unwrap(),
            Some("10.0.0.10".into())
        );
        assert_eq!(store.get("dhcp::ips::leased::10.0.0.10").await.unwrap(), None);
        assert_eq!(
            store
                .get("dhcp::nics::leased::aa:bb:cc:00:00:01")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn revoke_of_absent_binding_is_noop() {
        let store = MemoryKv::new();
        let engine = engine(store);
        assert_eq!(engine.revoke("aa:bb:cc:00:00:09").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reclaim_restamps_expired_addresses() {
        let store = MemoryKv::new();
        let engine = engine(store.clone());
        engine.bootstrap().await.unwrap();

        let ip = Ipv4Addr::new(10, 0, 0, 11);
        engine.lease("aa:bb:cc:00:00:03", ip, TTL).await.unwrap();
        store.expire_all_leases();
        // expired: in neither family until the next sweep
        assert_eq!(store.get("dhcp::ips::free::10.0.0.11").await.unwrap(), None);
        assert_eq!(store.get("dhcp::ips::leased::10.0.0.11").await.unwrap(), None);

        let reclaimed = engine.reclaim().await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(
            store.get("dhcp::ips::free::10.0.0.11").await.unwrap(),
            Some("10.0.0.11".into())
        );
    }

    #[tokio::test]
    async fn first_free_is_lowest_and_errors_when_exhausted() {
        let store = MemoryKv::new();
        let engine = engine(store.clone());
        engine.bootstrap().await.unwrap();

        assert_eq!(
            engine.first_free().await.unwrap(),
            Ipv4Addr::new(10, 0, 0, 10)
        );

        for (i, ip) in engine.range().iter().enumerate() {
            engine
                .lease(&format!("aa:bb:cc:00:00:0{i}"), ip, TTL)
                .await
                .unwrap();
        }
        assert!(matches!(
            engine.first_free().await.unwrap_err(),
            LeaseError::NoFreeAddress
        ));
    }
}
