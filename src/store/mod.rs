//! Collaborator interfaces the booking engine talks to, plus two implementations:
//! a volatile [`InMemoryStore`] and the WAL-backed [`DurableStore`].

mod durable;
mod memory;
mod state;

pub use durable::{DurableStore, WalJournal};
pub(crate) use durable::WalCommand;
pub use memory::{InMemoryStore, Journal, ShardedStore, Volatile};
pub use state::{SharedTenantState, TenantState};

use std::fmt;

use async_trait::async_trait;
use chrono::Weekday;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    /// The write would make two active appointments overlap.
    Overlap(AppointmentId),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    Wal(String),
    Tenant(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "not found"),
            StoreError::Overlap(id) => write!(f, "overlaps active appointment {id}"),
            StoreError::Invalid(msg) => write!(f, "invalid: {msg}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
            StoreError::Tenant(e) => write!(f, "tenant error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Read-only view of a tenant's services, weekly windows and booking settings.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Active windows for the weekday, ordered by start time.
    async fn active_working_windows(
        &self,
        tenant: &TenantId,
        weekday: Weekday,
    ) -> Result<Vec<WorkingWindow>, StoreError>;

    async fn service(&self, tenant: &TenantId, id: ServiceId) -> Result<Option<Service>, StoreError>;

    /// Falls back to [`BookingConfig::default`] for tenants that never set one.
    async fn booking_config(&self, tenant: &TenantId) -> Result<BookingConfig, StoreError>;
}

#[async_trait]
pub trait BlockedPeriodStore: Send + Sync {
    /// Blocked periods overlapping `window`, ordered by start.
    async fn blocked_periods(
        &self,
        tenant: &TenantId,
        window: TimeSpan,
    ) -> Result<Vec<BlockedPeriod>, StoreError>;
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Fails with [`StoreError::Overlap`] if an active appointment would collide.
    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError>;

    /// Reschedules are subject to the same overlap constraint as inserts.
    async fn update_appointment(
        &self,
        tenant: &TenantId,
        id: AppointmentId,
        change: AppointmentChange,
        at: Timestamp,
    ) -> Result<Appointment, StoreError>;

    /// Active appointments overlapping `span`, minus `exclude`, ordered by start.
    async fn active_overlapping(
        &self,
        tenant: &TenantId,
        span: TimeSpan,
        exclude: Option<AppointmentId>,
    ) -> Result<Vec<Appointment>, StoreError>;

    async fn appointment(
        &self,
        tenant: &TenantId,
        id: AppointmentId,
    ) -> Result<Option<Appointment>, StoreError>;

    async fn appointment_by_token(
        &self,
        tenant: &TenantId,
        token: &str,
    ) -> Result<Option<Appointment>, StoreError>;

    /// Every appointment (any status) starting inside `span`, ordered by start.
    async fn appointments_between(
        &self,
        tenant: &TenantId,
        span: TimeSpan,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// Permanent removal. Returns false if the row did not exist.
    async fn erase_appointment(&self, tenant: &TenantId, id: AppointmentId) -> Result<bool, StoreError>;
}

/// Everything the booking engine reads and writes.
pub trait BookingStore: CatalogStore + BlockedPeriodStore + AppointmentStore {}

impl<T: CatalogStore + BlockedPeriodStore + AppointmentStore> BookingStore for T {}

/// Income sink fed by appointment completion.
#[async_trait]
pub trait FinancialLedger: Send + Sync {
    /// Idempotent per `(tenant, appointment_id)`: a repeat call records nothing.
    /// Returns true if a new entry was written.
    async fn record_income(
        &self,
        tenant: &TenantId,
        appointment_id: AppointmentId,
        amount_cents: i64,
        description: String,
        at: Timestamp,
    ) -> Result<bool, StoreError>;

    async fn ledger_entries(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// Owner-side catalog maintenance. Not part of the booking path; the engine only reads
/// what these write.
#[async_trait]
pub trait TenantAdmin: Send + Sync {
    async fn set_booking_config(&self, tenant: &TenantId, config: BookingConfig) -> Result<(), StoreError>;

    /// Insert or replace by id.
    async fn put_working_window(&self, window: WorkingWindow) -> Result<(), StoreError>;

    async fn remove_working_window(&self, tenant: &TenantId, id: WindowId) -> Result<(), StoreError>;

    /// Insert or replace by id.
    async fn put_service(&self, service: Service) -> Result<(), StoreError>;

    async fn add_blocked_period(&self, period: BlockedPeriod) -> Result<(), StoreError>;

    async fn remove_blocked_period(&self, tenant: &TenantId, id: BlockedPeriodId) -> Result<(), StoreError>;
}
