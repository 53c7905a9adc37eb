use async_trait::async_trait;
use chrono::Weekday;

use crate::model::*;
use crate::tenant::TenantRegistry;

use super::state::SharedTenantState;
use super::*;

/// Where validated events go before they touch memory.
#[async_trait]
pub trait Journal: Send + Sync + 'static {
    /// Rebuild a tenant's history the first time its shard is touched.
    fn open(&self, tenant: &TenantId, state: &mut TenantState) -> Result<(), StoreError>;

    /// Called once the new shard is registered.
    fn attached(&self, _tenant: &TenantId, _state: &SharedTenantState) {}

    /// Make `event` durable. The caller holds the tenant's write lock.
    async fn append(&self, tenant: &TenantId, event: &Event) -> Result<(), StoreError>;
}

/// No persistence at all.
pub struct Volatile;

#[async_trait]
impl Journal for Volatile {
    fn open(&self, _tenant: &TenantId, _state: &mut TenantState) -> Result<(), StoreError> {
        Ok(())
    }

    async fn append(&self, _tenant: &TenantId, _event: &Event) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Tenant shards behind per-tenant `RwLock`s. Writes are validate → journal →
/// apply under the write lock, so readers never see an event that was not journaled.
pub struct ShardedStore<J: Journal> {
    registry: TenantRegistry,
    pub(super) journal: J,
}

pub type InMemoryStore = ShardedStore<Volatile>;

impl InMemoryStore {
    pub fn new() -> Self {
        ShardedStore::with_journal(Volatile)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: Journal> ShardedStore<J> {
    pub fn with_journal(journal: J) -> Self {
        Self {
            registry: TenantRegistry::new(),
            journal,
        }
    }

    pub(super) fn shard(&self, tenant: &TenantId) -> Result<SharedTenantState, StoreError> {
        if let Some(shard) = self.registry.get(tenant) {
            return Ok(shard);
        }
        let (shard, created) = self
            .registry
            .get_or_open(tenant, |state| self.journal.open(tenant, state))?;
        if created {
            self.journal.attached(tenant, &shard);
        }
        Ok(shard)
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        self.registry.tenants()
    }

    async fn read<R>(&self, tenant: &TenantId, f: impl FnOnce(&TenantState) -> R) -> Result<R, StoreError> {
        let shard = self.shard(tenant)?;
        let guard = shard.read().await;
        Ok(f(&guard))
    }

    /// Validate, journal, then apply. Returns the state for post-write reads.
    async fn commit(&self, tenant: &TenantId, event: Event) -> Result<tokio::sync::OwnedRwLockWriteGuard<TenantState>, StoreError> {
        let shard = self.shard(tenant)?;
        let mut guard = shard.write_owned().await;
        guard.validate(&event)?;
        self.journal.append(tenant, &event).await?;
        guard.apply(&event);
        Ok(guard)
    }
}

#[async_trait]
impl<J: Journal> CatalogStore for ShardedStore<J> {
    async fn active_working_windows(
        &self,
        tenant: &TenantId,
        weekday: Weekday,
    ) -> Result<Vec<WorkingWindow>, StoreError> {
        self.read(tenant, |s| s.active_windows(weekday)).await
    }

    async fn service(&self, tenant: &TenantId, id: ServiceId) -> Result<Option<Service>, StoreError> {
        self.read(tenant, |s| s.service(id)).await
    }

    async fn booking_config(&self, tenant: &TenantId) -> Result<BookingConfig, StoreError> {
        self.read(tenant, |s| s.config()).await
    }
}

#[async_trait]
impl<J: Journal> BlockedPeriodStore for ShardedStore<J> {
    async fn blocked_periods(
        &self,
        tenant: &TenantId,
        window: TimeSpan,
    ) -> Result<Vec<BlockedPeriod>, StoreError> {
        self.read(tenant, |s| s.blocked_overlapping(window)).await
    }
}

#[async_trait]
impl<J: Journal> AppointmentStore for ShardedStore<J> {
    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        let tenant = appointment.tenant_id.clone();
        self.commit(
            &tenant,
            Event::AppointmentInserted {
                appointment: appointment.clone(),
            },
        )
        .await?;
        Ok(())
    }

    async fn update_appointment(
        &self,
        tenant: &TenantId,
        id: AppointmentId,
        change: AppointmentChange,
        at: Timestamp,
    ) -> Result<Appointment, StoreError> {
        let guard = self
            .commit(tenant, Event::AppointmentChanged { id, change, at })
            .await?;
        guard.appointment(id).ok_or(StoreError::NotFound)
    }

    async fn active_overlapping(
        &self,
        tenant: &TenantId,
        span: TimeSpan,
        exclude: Option<AppointmentId>,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.read(tenant, |s| s.active_overlapping(span, exclude)).await
    }

    async fn appointment(
        &self,
        tenant: &TenantId,
        id: AppointmentId,
    ) -> Result<Option<Appointment>, StoreError> {
        self.read(tenant, |s| s.appointment(id)).await
    }

    async fn appointment_by_token(
        &self,
        tenant: &TenantId,
        token: &str,
    ) -> Result<Option<Appointment>, StoreError> {
        self.read(tenant, |s| s.appointment_by_token(token)).await
    }

    async fn appointments_between(
        &self,
        tenant: &TenantId,
        span: TimeSpan,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.read(tenant, |s| s.appointments_starting_in(span)).await
    }

    async fn erase_appointment(&self, tenant: &TenantId, id: AppointmentId) -> Result<bool, StoreError> {
        match self.commit(tenant, Event::AppointmentErased { id }).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<J: Journal> FinancialLedger for ShardedStore<J> {
    async fn record_income(
        &self,
        tenant: &TenantId,
        appointment_id: AppointmentId,
        amount_cents: i64,
        description: String,
        at: Timestamp,
    ) -> Result<bool, StoreError> {
        let shard = self.shard(tenant)?;
        let mut guard = shard.write().await;
        if guard.has_income_for(appointment_id) {
            return Ok(false);
        }
        let event = Event::IncomeRecorded {
            entry: LedgerEntry {
                tenant_id: tenant.clone(),
                appointment_id,
                amount_cents,
                description,
                recorded_at: at,
            },
        };
        guard.validate(&event)?;
        self.journal.append(tenant, &event).await?;
        guard.apply(&event);
        metrics::counter!(crate::observability::LEDGER_ENTRIES_TOTAL).increment(1);
        Ok(true)
    }

    async fn ledger_entries(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.read(tenant, |s| s.ledger().to_vec()).await
    }
}

#[async_trait]
impl<J: Journal> TenantAdmin for ShardedStore<J> {
    async fn set_booking_config(&self, tenant: &TenantId, config: BookingConfig) -> Result<(), StoreError> {
        self.commit(tenant, Event::ConfigSet { config }).await?;
        Ok(())
    }

    async fn put_working_window(&self, window: WorkingWindow) -> Result<(), StoreError> {
        let tenant = window.tenant_id.clone();
        self.commit(&tenant, Event::WindowPut { window }).await?;
        Ok(())
    }

    async fn remove_working_window(&self, tenant: &TenantId, id: WindowId) -> Result<(), StoreError> {
        self.commit(tenant, Event::WindowRemoved { id }).await?;
        Ok(())
    }

    async fn put_service(&self, service: Service) -> Result<(), StoreError> {
        let tenant = service.tenant_id.clone();
        self.commit(&tenant, Event::ServicePut { service }).await?;
        Ok(())
    }

    async fn add_blocked_period(&self, period: BlockedPeriod) -> Result<(), StoreError> {
        let tenant = period.tenant_id.clone();
        self.commit(&tenant, Event::BlockedPeriodAdded { period }).await?;
        Ok(())
    }

    async fn remove_blocked_period(&self, tenant: &TenantId, id: BlockedPeriodId) -> Result<(), StoreError> {
        self.commit(tenant, Event::BlockedPeriodRemoved { id }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveTime, TimeZone, Utc};
    use std::sync::Arc;

    fn tenant(name: &str) -> TenantId {
        TenantId::parse(name).unwrap()
    }

    fn at(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap()
    }

    fn appt(tenant_id: TenantId, start: Timestamp, minutes: i64) -> Appointment {
        Appointment {
            id: AppointmentId::new(),
            tenant_id,
            service_id: ServiceId::new(),
            customer_ref: "cust".into(),
            start,
            end: start + Duration::minutes(minutes),
            status: AppointmentStatus::Pending,
            manage_token: new_manage_token(),
            created_at: start,
            updated_at: start,
        }
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = InMemoryStore::new();
        let a = tenant("salon-a");
        let b = tenant("salon-b");

        store
            .put_working_window(WorkingWindow {
                id: WindowId::new(),
                tenant_id: a.clone(),
                weekday: Weekday::Mon,
                start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                active: true,
            })
            .await
            .unwrap();
        let booked = appt(a.clone(), at(10, 0), 60);
        store.insert_appointment(&booked).await.unwrap();

        assert_eq!(store.active_working_windows(&a, Weekday::Mon).await.unwrap().len(), 1);
        assert!(store.active_working_windows(&b, Weekday::Mon).await.unwrap().is_empty());

        // Same interval in another tenant is free.
        store.insert_appointment(&appt(b.clone(), at(10, 0), 60)).await.unwrap();
        assert!(store.appointment(&b, booked.id).await.unwrap().is_none());
        assert!(
            store
                .appointment_by_token(&b, &booked.manage_token)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn config_defaults_until_set() {
        let store = InMemoryStore::new();
        let t = tenant("fresh");
        assert_eq!(store.booking_config(&t).await.unwrap(), BookingConfig::default());
        let cfg = BookingConfig {
            slot_granularity_minutes: 15,
            max_advance_days: 30,
            utc_offset_minutes: 60,
        };
        store.set_booking_config(&t, cfg).await.unwrap();
        assert_eq!(store.booking_config(&t).await.unwrap(), cfg);

        let bad = BookingConfig {
            max_advance_days: 0,
            ..cfg
        };
        assert!(matches!(
            store.set_booking_config(&t, bad).await,
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(store.booking_config(&t).await.unwrap(), cfg);
    }

    #[tokio::test]
    async fn insert_overlap_reports_existing_id() {
        let store = InMemoryStore::new();
        let t = tenant("overlap");
        let first = appt(t.clone(), at(10, 0), 60);
        store.insert_appointment(&first).await.unwrap();
        let err = store
            .insert_appointment(&appt(t.clone(), at(10, 30), 30))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Overlap(first.id));
    }

    #[tokio::test]
    async fn concurrent_inserts_admit_one() {
        let store = Arc::new(InMemoryStore::new());
        let t = tenant("race");
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let a = appt(t.clone(), at(14, 0), 45);
            handles.push(tokio::spawn(async move { store.insert_appointment(&a).await }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        let span = Span::new(at(0, 0), at(23, 0));
        assert_eq!(store.active_overlapping(&t, span, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_returns_new_row() {
        let store = InMemoryStore::new();
        let t = tenant("update");
        let a = appt(t.clone(), at(10, 0), 60);
        store.insert_appointment(&a).await.unwrap();
        let updated = store
            .update_appointment(
                &t,
                a.id,
                AppointmentChange::Status(AppointmentStatus::Confirmed),
                at(9, 0),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, AppointmentStatus::Confirmed);
        assert_eq!(updated.updated_at, at(9, 0));

        let missing = store
            .update_appointment(
                &t,
                AppointmentId::new(),
                AppointmentChange::Status(AppointmentStatus::Confirmed),
                at(9, 0),
            )
            .await;
        assert_eq!(missing, Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn appointments_between_lists_every_status_in_order() {
        let store = InMemoryStore::new();
        let t = tenant("between");
        let late = appt(t.clone(), at(15, 0), 30);
        let early = appt(t.clone(), at(9, 0), 30);
        store.insert_appointment(&late).await.unwrap();
        store.insert_appointment(&early).await.unwrap();
        store
            .update_appointment(
                &t,
                late.id,
                AppointmentChange::Status(AppointmentStatus::Cancelled),
                at(8, 0),
            )
            .await
            .unwrap();

        let day = Span::new(at(0, 0), at(23, 59));
        let ids: Vec<AppointmentId> = store
            .appointments_between(&t, day)
            .await
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn erase_reports_existence() {
        let store = InMemoryStore::new();
        let t = tenant("erase");
        let a = appt(t.clone(), at(10, 0), 60);
        store.insert_appointment(&a).await.unwrap();
        assert!(store.erase_appointment(&t, a.id).await.unwrap());
        assert!(!store.erase_appointment(&t, a.id).await.unwrap());
    }

    #[tokio::test]
    async fn record_income_is_idempotent() {
        let store = InMemoryStore::new();
        let t = tenant("ledger");
        let id = AppointmentId::new();
        assert!(store.record_income(&t, id, 4500, "Cut".into(), at(12, 0)).await.unwrap());
        assert!(!store.record_income(&t, id, 4500, "Cut".into(), at(12, 0)).await.unwrap());
        let entries = store.ledger_entries(&t).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount_cents, 4500);
        assert!(store.ledger_entries(&tenant("other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_periods_add_query_remove() {
        let store = InMemoryStore::new();
        let t = tenant("blocked");
        let period = BlockedPeriod {
            id: BlockedPeriodId::new(),
            tenant_id: t.clone(),
            start: at(13, 0),
            end: at(14, 0),
            reason: Some("lunch".into()),
        };
        store.add_blocked_period(period.clone()).await.unwrap();
        let hit = store
            .blocked_periods(&t, Span::new(at(12, 0), at(13, 30)))
            .await
            .unwrap();
        assert_eq!(hit, vec![period.clone()]);
        let miss = store
            .blocked_periods(&t, Span::new(at(14, 0), at(15, 0)))
            .await
            .unwrap();
        assert!(miss.is_empty());

        store.remove_blocked_period(&t, period.id).await.unwrap();
        assert_eq!(
            store.remove_blocked_period(&t, period.id).await,
            Err(StoreError::NotFound)
        );
    }

    #[derive(Default)]
    struct Counting {
        attaches: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Journal for Counting {
        fn open(&self, _tenant: &TenantId, _state: &mut TenantState) -> Result<(), StoreError> {
            Ok(())
        }

        fn attached(&self, _tenant: &TenantId, _state: &SharedTenantState) {
            self.attaches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        async fn append(&self, _tenant: &TenantId, _event: &Event) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_touch_attaches_once() {
        let store = Arc::new(ShardedStore::with_journal(Counting::default()));
        let t = tenant("first-touch");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let t = t.clone();
                tokio::spawn(async move { store.booking_config(&t).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        store.booking_config(&t).await.unwrap();
        assert_eq!(store.journal.attaches.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
