//! Background reclaim task: periodically re-stamps addresses as free
//! after their TTL-bound leased keys have vanished at the store.

use std::time::Duration;

use etcd_kv::KvStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::engine::LeaseEngine;

/// Time between reclaim sweeps.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(10);

/// Spawn the reclaim loop. The cadence is the timer's: a sweep that
/// outlasts the interval is not preempted, the next tick just fires
/// sooner after it finishes. Sweep errors are logged and the loop
/// continues. Exits promptly when `token` is cancelled.
pub(crate) fn spawn_reclaimer<S>(
    engine: LeaseEngine<S>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    S: KvStore + Clone,
{
    tokio::spawn(async move {
        info!("starting lease reclaimer");
        let mut tick = tokio::time::interval(RECLAIM_INTERVAL);
        // the interval's first tick completes immediately
        tick.tick().await;
        loop {
            match engine.reclaim().await {
                Ok(0) => trace!("reclaim sweep found nothing expired"),
                Ok(reclaimed) => info!(reclaimed, "resurrected expired addresses"),
                Err(err) => error!(%err, "could not reclaim expired addresses"),
            }
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("reclaimer exiting");
                    return;
                }
                _ = tick.tick() => {}
            }
        }
    })
}
