use chrono::NaiveDate;
use tracing::info;

use crate::model::*;
use crate::notify::NoticeKind;

use super::{store_failure, BookingError, Engine, Proposal};

/// Whether `from → to` is allowed. `Ok(false)` means the appointment is
/// already there and nothing should change.
pub(super) fn check_transition(from: AppointmentStatus, to: AppointmentStatus) -> Result<bool, BookingError> {
    use AppointmentStatus::*;
    if from == to {
        return Ok(false);
    }
    let allowed = match (from, to) {
        (Completed | Cancelled, _) => false,
        (Pending, Confirmed) => true,
        (Pending | Confirmed | NoShow, Completed | Cancelled) => true,
        (Pending | Confirmed, NoShow) => true,
        _ => false,
    };
    if allowed {
        Ok(true)
    } else {
        Err(BookingError::InvalidTransition { from, to })
    }
}

fn notice_kind(status: AppointmentStatus) -> NoticeKind {
    match status {
        AppointmentStatus::Pending => NoticeKind::Booked,
        AppointmentStatus::Confirmed => NoticeKind::Confirmed,
        AppointmentStatus::Completed => NoticeKind::Completed,
        AppointmentStatus::Cancelled => NoticeKind::Cancelled,
        AppointmentStatus::NoShow => NoticeKind::NoShow,
    }
}

impl Engine {
    pub async fn confirm(&self, tenant: &TenantId, id: AppointmentId) -> Result<Appointment, BookingError> {
        self.transition(tenant, id, AppointmentStatus::Confirmed).await
    }

    /// Mark done and book the service price as income, exactly once per appointment.
    pub async fn complete(&self, tenant: &TenantId, id: AppointmentId) -> Result<Appointment, BookingError> {
        self.transition(tenant, id, AppointmentStatus::Completed).await
    }

    /// Soft delete: the row stays, the interval is freed.
    pub async fn cancel(&self, tenant: &TenantId, id: AppointmentId) -> Result<Appointment, BookingError> {
        self.transition(tenant, id, AppointmentStatus::Cancelled).await
    }

    pub async fn mark_no_show(&self, tenant: &TenantId, id: AppointmentId) -> Result<Appointment, BookingError> {
        self.transition(tenant, id, AppointmentStatus::NoShow).await
    }

    async fn transition(
        &self,
        tenant: &TenantId,
        id: AppointmentId,
        to: AppointmentStatus,
    ) -> Result<Appointment, BookingError> {
        let lock = self.tenant_lock(tenant);
        let guard = lock.lock().await;

        let current = self.appointment(tenant, id).await?;
        if !check_transition(current.status, to)? {
            return Ok(current);
        }
        let now = self.now();
        if to == AppointmentStatus::Completed {
            // Ledger first: a crash between the two writes leaves a completable
            // appointment whose retry is deduplicated by the ledger.
            self.record_income(tenant, &current, now).await?;
        }
        let updated = self
            .store
            .update_appointment(tenant, id, AppointmentChange::Status(to), now)
            .await
            .map_err(store_failure)?;
        drop(guard);

        info!("tenant {tenant}: appointment {id} {} -> {to}", current.status);
        self.notify(notice_kind(to), &updated).await;
        Ok(updated)
    }

    async fn record_income(
        &self,
        tenant: &TenantId,
        appt: &Appointment,
        at: Timestamp,
    ) -> Result<(), BookingError> {
        let service = self
            .store
            .service(tenant, appt.service_id)
            .await
            .map_err(store_failure)?;
        let (amount, description) = match service {
            Some(s) => (s.price_cents, s.name),
            None => (0, format!("service {}", appt.service_id)),
        };
        let recorded = self
            .ledger
            .record_income(tenant, appt.id, amount, description, at)
            .await
            .map_err(store_failure)?;
        if !recorded {
            info!("tenant {tenant}: income for {} already recorded", appt.id);
        }
        Ok(())
    }

    /// Permanent removal, unlike [`Engine::cancel`].
    pub async fn erase(&self, tenant: &TenantId, id: AppointmentId) -> Result<(), BookingError> {
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        if !self
            .store
            .erase_appointment(tenant, id)
            .await
            .map_err(store_failure)?
        {
            return Err(BookingError::NotFound);
        }
        info!("tenant {tenant}: erased appointment {id}");
        Ok(())
    }

    pub async fn appointment(&self, tenant: &TenantId, id: AppointmentId) -> Result<Appointment, BookingError> {
        self.store
            .appointment(tenant, id)
            .await
            .map_err(store_failure)?
            .ok_or(BookingError::NotFound)
    }

    /// Every appointment starting on the tenant-local `date`, any status, by start.
    pub async fn appointments_on(&self, tenant: &TenantId, date: NaiveDate) -> Result<Vec<Appointment>, BookingError> {
        let config = self.store.booking_config(tenant).await.map_err(store_failure)?;
        let day = config
            .day_span(date)
            .ok_or(BookingError::InvalidRequest("date out of range"))?;
        self.store
            .appointments_between(tenant, day)
            .await
            .map_err(store_failure)
    }

    // ── Management-token self-service ───────────────────────

    pub async fn appointment_by_token(&self, tenant: &TenantId, token: &str) -> Result<Appointment, BookingError> {
        self.store
            .appointment_by_token(tenant, token.trim())
            .await
            .map_err(store_failure)?
            .ok_or(BookingError::NotFound)
    }

    pub async fn cancel_by_token(&self, tenant: &TenantId, token: &str) -> Result<Appointment, BookingError> {
        let appt = self.appointment_by_token(tenant, token).await?;
        self.cancel(tenant, appt.id).await
    }

    /// Move the token's appointment to `new_start`, keeping its service and customer.
    pub async fn reschedule_by_token(
        &self,
        tenant: &TenantId,
        token: &str,
        new_start: Timestamp,
    ) -> Result<Appointment, BookingError> {
        let appt = self.appointment_by_token(tenant, token).await?;
        let proposal = Proposal::new(appt.service_id, new_start, appt.customer_ref).rescheduling(appt.id);
        self.propose_appointment(tenant, proposal).await
    }
}
