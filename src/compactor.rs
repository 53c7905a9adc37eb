use std::io;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::model::TenantId;
use crate::store::{SharedTenantState, WalCommand};

/// Rewrite a tenant's WAL as a snapshot of `shard`.
///
/// The read lock is held until the command is queued: writers hold the write
/// lock across their WAL append, so nothing can slip in between the snapshot and
/// the swap.
pub(crate) async fn compact_tenant(
    shard: &SharedTenantState,
    writer: &mpsc::Sender<WalCommand>,
) -> io::Result<()> {
    let guard = shard.read().await;
    let events = guard.snapshot();
    let (tx, rx) = oneshot::channel();
    writer
        .send(WalCommand::Compact { events, response: tx })
        .await
        .map_err(|_| io::Error::other("WAL writer shut down"))?;
    drop(guard);
    rx.await
        .map_err(|_| io::Error::other("WAL writer dropped response"))?
}

pub(crate) async fn appends_since_compact(writer: &mpsc::Sender<WalCommand>) -> u64 {
    let (tx, rx) = oneshot::channel();
    if writer
        .send(WalCommand::AppendsSinceCompact { response: tx })
        .await
        .is_err()
    {
        return 0;
    }
    rx.await.unwrap_or(0)
}

/// Background task that compacts a tenant's WAL once enough appends pile up.
pub(crate) async fn run_compactor(
    tenant: TenantId,
    shard: SharedTenantState,
    writer: mpsc::Sender<WalCommand>,
    threshold: u64,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        if writer.is_closed() {
            return;
        }
        let appends = appends_since_compact(&writer).await;
        if appends < threshold {
            continue;
        }
        match compact_tenant(&shard, &writer).await {
            Ok(()) => info!("tenant {tenant}: compacted WAL after {appends} appends"),
            Err(e) => warn!("tenant {tenant}: WAL compaction failed: {e}"),
        }
    }
}
