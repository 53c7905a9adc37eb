use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::model::*;
use crate::wal::Wal;

use super::memory::{Journal, ShardedStore};
use super::state::SharedTenantState;
use super::*;

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns one tenant's WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, fsync once,
/// answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Everything queued before the command lands in the old file.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so stray buffered bytes don't ride along
    // with the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One WAL file per tenant under `data_dir`, each with its own writer task and
/// compactor.
pub struct WalJournal {
    data_dir: PathBuf,
    compact_threshold: u64,
    compact_interval: Duration,
    writers: DashMap<TenantId, mpsc::Sender<WalCommand>>,
}

impl WalJournal {
    pub fn new(data_dir: impl Into<PathBuf>, compact_threshold: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            compact_threshold,
            compact_interval: Duration::from_secs(60),
            writers: DashMap::new(),
        }
    }

    pub fn with_compact_interval(mut self, every: Duration) -> Self {
        self.compact_interval = every;
        self
    }

    pub fn wal_path(&self, tenant: &TenantId) -> PathBuf {
        wal_path(&self.data_dir, tenant)
    }

    fn writer(&self, tenant: &TenantId) -> Result<mpsc::Sender<WalCommand>, StoreError> {
        self.writers
            .get(tenant)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::Wal(format!("no WAL writer for tenant {tenant}")))
    }
}

fn wal_path(data_dir: &Path, tenant: &TenantId) -> PathBuf {
    data_dir.join(format!("{}.wal", tenant.as_str()))
}

#[async_trait]
impl Journal for WalJournal {
    fn open(&self, tenant: &TenantId, state: &mut TenantState) -> Result<(), StoreError> {
        let path = self.wal_path(tenant);
        let events = Wal::replay(&path).map_err(|e| StoreError::Wal(e.to_string()))?;
        let wal = Wal::open(&path).map_err(|e| StoreError::Wal(e.to_string()))?;
        for event in &events {
            state.apply(event);
        }
        if !events.is_empty() {
            info!("tenant {tenant}: replayed {} WAL records", events.len());
        }
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        self.writers.insert(tenant.clone(), tx);
        Ok(())
    }

    fn attached(&self, tenant: &TenantId, state: &SharedTenantState) {
        let Ok(tx) = self.writer(tenant) else {
            return;
        };
        tokio::spawn(crate::compactor::run_compactor(
            tenant.clone(),
            state.clone(),
            tx,
            self.compact_threshold,
            self.compact_interval,
        ));
    }

    async fn append(&self, tenant: &TenantId, event: &Event) -> Result<(), StoreError> {
        let writer = self.writer(tenant)?;
        let (tx, rx) = oneshot::channel();
        writer
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }
}

/// Store whose every write is fsynced to the tenant's WAL before it is applied.
pub type DurableStore = ShardedStore<WalJournal>;

impl ShardedStore<WalJournal> {
    /// Open a store over `data_dir`, creating it if needed. Tenant logs are
    /// replayed lazily on first touch.
    pub fn open(data_dir: impl Into<PathBuf>, compact_threshold: u64) -> io::Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        debug!("durable store at {}", data_dir.display());
        Ok(ShardedStore::with_journal(WalJournal::new(data_dir, compact_threshold)))
    }

    /// Rewrite the tenant's WAL as a snapshot of its current state.
    pub async fn compact(&self, tenant: &TenantId) -> Result<(), StoreError> {
        let shard = self.shard(tenant)?;
        let writer = self.journal.writer(tenant)?;
        crate::compactor::compact_tenant(&shard, &writer)
            .await
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self, tenant: &TenantId) -> Result<u64, StoreError> {
        self.shard(tenant)?;
        let writer = self.journal.writer(tenant)?;
        Ok(crate::compactor::appends_since_compact(&writer).await)
    }
}
