//! etcd-backed [`KvStore`] with mutually-authenticated TLS and a
//! background endpoint-sync task.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, CompareOp, ConnectOptions, GetOptions, Identity, PutOptions, SortOrder,
    SortTarget, TlsOptions, TxnOpResponse, TxnResponse,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{StoreError, StoreResult};
use crate::{Compare, KeyValue, KvStore, LeaseId, OpOutcome, Txn, TxnOp, TxnOutcome};

/// How often the endpoint list is refreshed.
const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for a single endpoint-sync round trip.
const SYNC_DEADLINE: Duration = Duration::from_secs(30);

/// Connection settings for the etcd cluster.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PEM file with the cluster CA certificate.
    pub ca: PathBuf,
    /// PEM file with the client certificate.
    pub cert: PathBuf,
    /// PEM file with the client private key.
    pub key: PathBuf,
    /// Initial endpoint list.
    pub endpoints: Vec<String>,
}

/// An etcd client wrapped behind [`KvStore`].
///
/// Cheap to clone; all clones share one underlying connection.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl std::fmt::Debug for EtcdKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdKv").finish_non_exhaustive()
    }
}

impl EtcdKv {
    /// Connect to the cluster and perform the initial endpoint sync.
    ///
    /// Fails on unreadable PEM material, an empty endpoint list, or a
    /// store that is unreachable at the initial sync.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        if config.endpoints.is_empty() {
            return Err(StoreError::Config("no endpoints configured".into()));
        }
        let ca = read_pem(&config.ca)?;
        let cert = read_pem(&config.cert)?;
        let key = read_pem(&config.key)?;

        let tls = TlsOptions::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key));

        let client = Client::connect(
            &config.endpoints,
            Some(ConnectOptions::new().with_tls(tls)),
        )
        .await
        .map_err(|err| StoreError::Transport(format!("could not connect: {err}")))?;

        let store = Self { client };
        let members = store.sync_endpoints().await?;
        debug!(members, endpoints = ?config.endpoints, "connected to etcd");
        Ok(store)
    }

    /// Refresh the endpoint list once, under [`SYNC_DEADLINE`]. Returns
    /// the member count.
    pub async fn sync_endpoints(&self) -> StoreResult<usize> {
        let mut cluster = self.client.cluster_client();
        match tokio::time::timeout(SYNC_DEADLINE, cluster.member_list()).await {
            Ok(Ok(resp)) => Ok(resp.members().len()),
            Ok(Err(err)) => Err(StoreError::Transport(format!("member list failed: {err}"))),
            Err(_) => Err(StoreError::Timeout(format!(
                "member list exceeded {SYNC_DEADLINE:?}"
            ))),
        }
    }

    /// Spawn the endpoint-sync loop: every [`SYNC_INTERVAL`], refresh the
    /// member list under [`SYNC_DEADLINE`]. A failed sync exits the
    /// process so an external supervisor restarts it with a fresh client.
    /// Exits promptly when `token` is cancelled.
    pub fn spawn_endpoint_sync(&self, token: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SYNC_INTERVAL);
            // the constructor already synced once; skip the immediate tick
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("endpoint sync task exiting");
                        return;
                    }
                    _ = tick.tick() => {}
                }
                match store.sync_endpoints().await {
                    Ok(members) => info!(members, "synced endpoint list"),
                    Err(err) => {
                        error!(%err, "failed to sync endpoints");
                        std::process::exit(1);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl KvStore for EtcdKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut client = self.client.kv_client();
        let resp = client.get(key, None).await.map_err(transport)?;
        resp.kvs().first().map(|kv| utf8(kv.value())).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut client = self.client.kv_client();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = client.get(prefix, Some(options)).await.map_err(transport)?;
        resp.kvs()
            .iter()
            .map(|kv| {
                Ok(KeyValue {
                    key: utf8(kv.key())?,
                    value: utf8(kv.value())?,
                })
            })
            .collect()
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut client = self.client.kv_client();
        let options = lease.map(|lease| PutOptions::new().with_lease(lease.id()));
        client.put(key, value, options).await.map_err(transport)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut client = self.client.kv_client();
        client.delete(key, None).await.map_err(transport)?;
        Ok(())
    }

    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut client = self.client.lease_client();
        // etcd rejects sub-second leases
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
        let resp = client.grant(secs, None).await.map_err(transport)?;
        Ok(LeaseId::new(resp.id()))
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnOutcome> {
        let mut client = self.client.kv_client();
        let resp = client.txn(into_etcd_txn(txn)).await.map_err(transport)?;
        Ok(from_etcd_outcome(&resp))
    }
}

fn read_pem(path: &std::path::Path) -> StoreResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|err| StoreError::Config(format!("could not read {}: {err}", path.display())))
}

fn transport(err: etcd_client::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

fn utf8(bytes: &[u8]) -> StoreResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|err| StoreError::Codec(format!("stored bytes are not utf-8: {err}")))
}

fn into_etcd_txn(txn: Txn) -> etcd_client::Txn {
    let guards: Vec<_> = txn.guards.into_iter().map(into_etcd_cmp).collect();
    let success: Vec<_> = txn.success.into_iter().map(into_etcd_op).collect();
    let failure: Vec<_> = txn.failure.into_iter().map(into_etcd_op).collect();
    etcd_client::Txn::new()
        .when(guards)
        .and_then(success)
        .or_else(failure)
}

fn into_etcd_cmp(cmp: Compare) -> etcd_client::Compare {
    match cmp {
        // key presence is a version comparison in the etcd API
        Compare::Missing(key) => etcd_client::Compare::version(key, CompareOp::Equal, 0),
        Compare::Exists(key) => etcd_client::Compare::version(key, CompareOp::Greater, 0),
        Compare::ValueEquals { key, value } => {
            etcd_client::Compare::value(key, CompareOp::Equal, value)
        }
    }
}

fn into_etcd_op(op: TxnOp) -> etcd_client::TxnOp {
    match op {
        TxnOp::Put { key, value, lease } => {
            let options = lease.map(|lease| PutOptions::new().with_lease(lease.id()));
            etcd_client::TxnOp::put(key, value, options)
        }
        TxnOp::Delete { key } => etcd_client::TxnOp::delete(key, None),
        TxnOp::Txn(nested) => etcd_client::TxnOp::txn(into_etcd_txn(nested)),
    }
}

fn from_etcd_outcome(resp: &TxnResponse) -> TxnOutcome {
    let responses = resp
        .op_responses()
        .into_iter()
        .map(|op| match op {
            TxnOpResponse::Txn(inner) => OpOutcome::Txn(from_etcd_outcome(&inner)),
            _ => OpOutcome::Done,
        })
        .collect();
    TxnOutcome {
        succeeded: resp.succeeded(),
        responses,
    }
}
