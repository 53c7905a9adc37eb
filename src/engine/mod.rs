mod blocked;
mod booking;
mod calendar;
mod error;
mod ledger;
mod lifecycle;
mod slots;

pub use booking::Proposal;
pub use calendar::windows_contain;
pub use error::BookingError;
pub use slots::DaySlots;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::clock::Clock;
use crate::model::*;
use crate::notify::{Notice, NoticeKind, Notifier};
use crate::store::{BookingStore, FinancialLedger, StoreError};

/// Availability and booking rules over an injected store.
///
/// Every mutation of a tenant's appointments runs under that tenant's lock and
/// re-validates against current state before committing. Slot listings take no
/// lock and are advisory.
pub struct Engine {
    pub(super) store: Arc<dyn BookingStore>,
    pub(super) ledger: Arc<dyn FinancialLedger>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) clock: Arc<dyn Clock>,
    tenant_locks: DashMap<TenantId, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn BookingStore>,
        ledger: Arc<dyn FinancialLedger>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            clock,
            tenant_locks: DashMap::new(),
        }
    }

    /// Engine over a store that also keeps the ledger.
    pub fn with_store<S>(store: Arc<S>, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self
    where
        S: BookingStore + FinancialLedger + 'static,
    {
        Self::new(store.clone(), store, notifier, clock)
    }

    pub(super) fn tenant_lock(&self, tenant: &TenantId) -> Arc<Mutex<()>> {
        self.tenant_locks
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub(super) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Best effort: a failed notice is logged and counted, nothing else.
    pub(super) async fn notify(&self, kind: NoticeKind, appointment: &Appointment) {
        let notice = Notice::for_appointment(kind, appointment);
        if let Err(e) = self.notifier.dispatch(&notice).await {
            warn!(
                "tenant {}: {kind:?} notice for {} not delivered: {e}",
                appointment.tenant_id, appointment.id
            );
            metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL).increment(1);
        }
    }
}

/// Map a store failure, logging the ones the caller can't act on.
pub(super) fn store_failure(e: StoreError) -> BookingError {
    let err = BookingError::from(e);
    if let BookingError::Internal(msg) = &err {
        error!("store failure: {msg}");
    }
    err
}
