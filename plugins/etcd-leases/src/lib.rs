//! # etcd-leases
//!
//! DHCPv4 address assignment with its authoritative state in etcd.
//!
//! The host dispatcher hands each decoded request plus a prepared reply
//! to [`EtcdLeases::handle`]; this plugin decides whether to offer,
//! lease, renew or deny an address and mutates the shared store with
//! compare-and-swap transactions. Lease lifetime is bound to store-side
//! leases, so crashed or silent clients release their addresses without
//! any action here; a background reclaimer re-stamps expired addresses
//! as free. Successful leases optionally publish A/CNAME records for an
//! external DNS publisher.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use dhcproto::v4::{DhcpOption, Message, MessageType, OptionCode};
use etcd_kv::{EtcdKv, KvStore, StoreConfig};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod keys;
pub mod range;
mod reclaim;

pub use crate::config::Config;
pub use crate::dns::DnsRegistry;
pub use crate::engine::LeaseEngine;
pub use crate::error::{LeaseError, LeaseResult};
pub use crate::keys::KeySchema;
pub use crate::range::Ipv4Range;

/// Lease time handed out when neither the prepared reply nor the client
/// asks for one.
const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(600);

/// Deadline covering all store interactions for one packet.
const HANDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// One plugin instance: the lease engine, the DNS registry, and the
/// background tasks tied to the instance's lifetime.
pub struct EtcdLeases<S> {
    engine: LeaseEngine<S>,
    dns: DnsRegistry,
    // Rough lock for the whole instance; mutations are already
    // store-transactional, so this could shard by client hardware
    // address, but the coarse guard keeps each packet's read-then-txn
    // sequence from interleaving with another packet's.
    lock: Mutex<()>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> fmt::Debug for EtcdLeases<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdLeases")
            .field("range", &self.engine.range())
            .finish_non_exhaustive()
    }
}

impl<S> Drop for EtcdLeases<S> {
    fn drop(&mut self) {
        self.token.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Build a plugin instance from the host's configuration payload:
/// connect to etcd over mutual TLS, bootstrap the range, and start the
/// reclaimer and endpoint-sync tasks. Every failure here is a setup
/// failure for the host dispatcher.
pub async fn setup(args: &str) -> Result<EtcdLeases<EtcdKv>> {
    let config = Config::parse(args)?;
    info!(?config, "setting up etcd lease plugin");

    let store = EtcdKv::connect(&StoreConfig {
        ca: config.ca.clone(),
        cert: config.cert.clone(),
        key: config.key.clone(),
        endpoints: config.endpoints.clone(),
    })
    .await
    .context("could not create etcd client")?;

    let mut plugin = EtcdLeases::with_store(store.clone(), config).await?;
    plugin
        .tasks
        .push(store.spawn_endpoint_sync(plugin.token.child_token()));
    Ok(plugin)
}

impl<S> EtcdLeases<S>
where
    S: KvStore + Clone,
{
    /// Assemble the plugin over an already-connected store, bootstrap
    /// the range, and start the reclaimer. Tests use this with the
    /// in-memory store.
    pub async fn with_store(store: S, config: Config) -> Result<Self> {
        let keys = KeySchema::new(&config.prefix, &config.separator);
        let range = Ipv4Range::new(config.start, config.end);
        let engine = LeaseEngine::new(store, keys, range);
        let dns = DnsRegistry::new(
            &config.dns_prefix,
            &config.dns_zone,
            &config.separator,
            config.dns_names.as_deref(),
        )
        .context("could not initialize DNS registry")?;

        engine
            .bootstrap()
            .await
            .context("unable to bootstrap leasable range")?;

        let token = CancellationToken::new();
        let tasks = vec![reclaim::spawn_reclaimer(engine.clone(), token.child_token())];
        Ok(Self {
            engine,
            dns,
            lock: Mutex::new(()),
            token,
            tasks,
        })
    }

    /// The engine, for inspection in tests and tooling.
    pub fn engine(&self) -> &LeaseEngine<S> {
        &self.engine
    }

    /// Handle one DHCPv4 packet. `resp` is the host's prepared reply;
    /// the return value is `(reply_or_none, stop_chain)` — `(None, true)`
    /// tells the host to drop the packet with no reply.
    ///
    /// Packets are serialized by the instance lock and bounded by a
    /// 5-second deadline covering every store call.
    #[instrument(level = "debug", skip_all, fields(msg_type = ?req.opts().msg_type()))]
    pub async fn handle(&self, req: &Message, resp: Message) -> (Option<Message>, bool) {
        let _guard = self.lock.lock().await;
        match tokio::time::timeout(HANDLE_TIMEOUT, self.dispatch(req, resp)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("packet handling exceeded deadline, dropping");
                (None, true)
            }
        }
    }

    async fn dispatch(&self, req: &Message, resp: Message) -> (Option<Message>, bool) {
        let mac = keys::mac_string(req.chaddr());
        match req.opts().msg_type() {
            Some(MessageType::Discover) => self.discover(resp, &mac).await,
            Some(MessageType::Request) => self.request(req, resp, &mac).await,
            Some(MessageType::Release) | Some(MessageType::Decline) => {
                self.revoke(req, resp, &mac).await
            }
            other => {
                error!(msg_type = ?other, "unhandled DHCPv4 packet");
                (None, true)
            }
        }
    }

    /// DISCOVER → OFFER. A client with a live binding is offered its
    /// current address; otherwise the lowest free address. Nothing is
    /// reserved: a concurrent client may win the race at REQUEST time
    /// and the loser will be NAKed then.
    async fn discover(&self, mut resp: Message, mac: &str) -> (Option<Message>, bool) {
        match self.engine.current_ip(mac).await {
            Ok(Some(ip)) => {
                info!(%ip, mac, "found previous lease");
                resp.set_yiaddr(ip);
                return (Some(resp), false);
            }
            Ok(None) => {}
            Err(err) => {
                error!(%err, mac, "unable to look up existing lease");
                return (None, true);
            }
        }

        match self.engine.first_free().await {
            Ok(ip) => {
                info!(%ip, mac, "offering free IP");
                resp.set_yiaddr(ip);
                (Some(resp), false)
            }
            Err(err) => {
                error!(%err, mac, "unable to fetch free IP");
                (None, true)
            }
        }
    }

    /// REQUEST → ACK / NAK.
    async fn request(&self, req: &Message, mut resp: Message, mac: &str) -> (Option<Message>, bool) {
        // deny REQUESTs without a server identifier
        let server_id = match req.opts().get(OptionCode::ServerIdentifier) {
            Some(DhcpOption::ServerIdentifier(id)) => *id,
            _ => {
                error!("no server identifier in DHCP request, returning negative reply");
                resp.opts_mut()
                    .insert(DhcpOption::MessageType(MessageType::Nak));
                return (Some(resp), false);
            }
        };
        // is the message meant for this server?
        if server_id != resp.siaddr() {
            debug!(%server_id, "ignoring DHCP request meant for another server");
            return (None, true);
        }

        // prefer the requested-IP option, fall back to the client IP field
        let ip = match req.opts().get(OptionCode::RequestedIpAddress) {
            Some(DhcpOption::RequestedIpAddress(ip)) => *ip,
            _ => req.ciaddr(),
        };

        let mut lease_time = match resp.opts().get(OptionCode::AddressLeaseTime) {
            Some(DhcpOption::AddressLeaseTime(secs)) => Duration::from_secs(u64::from(*secs)),
            _ => DEFAULT_LEASE_TIME,
        };
        // did the client request a different lease time than ours?
        if let Some(DhcpOption::AddressLeaseTime(secs)) = req.opts().get(OptionCode::AddressLeaseTime)
        {
            let requested = Duration::from_secs(u64::from(*secs));
            if requested != lease_time {
                debug!(?requested, "client requested its own lease time, using that");
                lease_time = requested;
            }
        }
        resp.opts_mut().insert(DhcpOption::AddressLeaseTime(
            lease_time.as_secs().try_into().unwrap_or(u32::MAX),
        ));

        if let Err(err) = self.engine.lease(mac, ip, lease_time).await {
            if err.is_already_leased() {
                debug!(%ip, "already leased, returning negative reply");
                resp.opts_mut()
                    .insert(DhcpOption::MessageType(MessageType::Nak));
                return (Some(resp), false);
            }
            error!(%err, mac, %ip, "unable to lease");
            return (None, true);
        }
        resp.set_yiaddr(ip);

        // register DNS if the client announced a hostname
        if let Some(DhcpOption::Hostname(hostname)) = req.opts().get(OptionCode::Hostname)
            && !hostname.is_empty()
        {
            if let Err(err) = self
                .dns
                .register(self.engine.store(), hostname, ip, mac, lease_time)
                .await
            {
                // drop the reply; a client whose records could not be
                // written will retry
                error!(%err, %hostname, "could not register DNS records");
                return (None, true);
            }
        }

        info!(%ip, mac, "returning requested IP");
        (Some(resp), false)
    }

    /// RELEASE / DECLINE → revoke. The reply is returned unmodified; a
    /// failed revoke drops the packet.
    async fn revoke(&self, req: &Message, resp: Message, mac: &str) -> (Option<Message>, bool) {
        match req.opts().get(OptionCode::ServerIdentifier) {
            Some(DhcpOption::ServerIdentifier(id)) if *id == resp.siaddr() => {}
            other => {
                debug!(server_id = ?other, "ignoring DHCP release meant for another server");
                return (None, true);
            }
        }

        match self.engine.revoke(mac).await {
            Ok(Some(ip)) => info!(%ip, mac, "revoked lease"),
            Ok(None) => debug!(mac, "no lease to revoke"),
            Err(err) => {
                error!(%err, mac, "error revoking lease");
                return (None, true);
            }
        }
        (Some(resp), false)
    }
}
