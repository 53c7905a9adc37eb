use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::limits::MAX_CUSTOMER_REF_LEN;
use crate::model::*;
use crate::notify::NoticeKind;
use crate::store::StoreError;

use super::{store_failure, BookingError, Engine};

/// A request to book `service_id` at `start`, or to move an existing appointment
/// there when `exclude_appointment_id` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub service_id: ServiceId,
    pub start: Timestamp,
    pub customer_ref: String,
    #[serde(default)]
    pub exclude_appointment_id: Option<AppointmentId>,
    /// Status of a new booking: pending unless the caller confirms up front.
    /// Ignored when rescheduling.
    #[serde(default = "pending")]
    pub status: AppointmentStatus,
}

fn pending() -> AppointmentStatus {
    AppointmentStatus::Pending
}

impl Proposal {
    pub fn new(service_id: ServiceId, start: Timestamp, customer_ref: impl Into<String>) -> Self {
        Self {
            service_id,
            start,
            customer_ref: customer_ref.into(),
            exclude_appointment_id: None,
            status: AppointmentStatus::Pending,
        }
    }

    pub fn confirmed(mut self) -> Self {
        self.status = AppointmentStatus::Confirmed;
        self
    }

    pub fn rescheduling(mut self, id: AppointmentId) -> Self {
        self.exclude_appointment_id = Some(id);
        self
    }
}

enum Attempt {
    Committed(Appointment),
    /// The store's own overlap check fired after ours passed.
    Conflict(AppointmentId),
}

impl Engine {
    /// Validate and commit a booking or reschedule.
    ///
    /// Checks run in a fixed order (service, request sanity, working hours,
    /// blocked periods, overlaps) under the tenant lock; the first failure is
    /// returned and nothing is written.
    pub async fn propose_appointment(
        &self,
        tenant: &TenantId,
        proposal: Proposal,
    ) -> Result<Appointment, BookingError> {
        let lock = self.tenant_lock(tenant);
        let guard = lock.lock().await;

        let mut attempt = self.attempt(tenant, &proposal).await;
        if let Ok(Attempt::Conflict(other)) = &attempt {
            debug!("tenant {tenant}: store overlap with {other} on commit, revalidating");
            attempt = self.attempt(tenant, &proposal).await;
        }
        drop(guard);

        let result = match attempt {
            Ok(Attempt::Committed(appt)) => Ok(appt),
            Ok(Attempt::Conflict(other)) => Err(BookingError::SlotTaken(Some(other))),
            Err(e) => Err(e),
        };
        let outcome = match &result {
            Ok(_) => "booked",
            Err(e) => e.code(),
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);

        match &result {
            Ok(appt) => {
                let kind = if proposal.exclude_appointment_id.is_some() {
                    info!("tenant {tenant}: rescheduled {} to {}", appt.id, appt.start);
                    NoticeKind::Rescheduled
                } else {
                    info!("tenant {tenant}: booked {} at {}", appt.id, appt.start);
                    NoticeKind::Booked
                };
                self.notify(kind, appt).await;
            }
            Err(e) => debug!("tenant {tenant}: proposal rejected: {e}"),
        }
        result
    }

    async fn attempt(&self, tenant: &TenantId, proposal: &Proposal) -> Result<Attempt, BookingError> {
        let service = self
            .store
            .service(tenant, proposal.service_id)
            .await
            .map_err(store_failure)?
            .filter(|s| s.active)
            .ok_or(BookingError::InvalidService)?;
        let start = proposal.start;
        let end = start
            .checked_add_signed(service.duration())
            .ok_or(BookingError::InvalidRequest("start time out of range"))?;

        let config = self.store.booking_config(tenant).await.map_err(store_failure)?;
        let now = self.now();
        let bookable = config
            .local(start)
            .is_some_and(|local| config.is_bookable_date(local.date(), now));
        if !bookable {
            return Err(BookingError::InvalidRequest(
                "date must be after today and within the booking horizon",
            ));
        }
        let customer_ref = proposal.customer_ref.trim();
        if customer_ref.is_empty() {
            return Err(BookingError::InvalidRequest("customer reference required"));
        }
        if customer_ref.len() > MAX_CUSTOMER_REF_LEN {
            return Err(BookingError::InvalidRequest("customer reference too long"));
        }
        let existing = match proposal.exclude_appointment_id {
            Some(id) => {
                let appt = self
                    .store
                    .appointment(tenant, id)
                    .await
                    .map_err(store_failure)?
                    .ok_or(BookingError::NotFound)?;
                if !appt.is_active() {
                    return Err(BookingError::InvalidTransition {
                        from: appt.status,
                        to: AppointmentStatus::Pending,
                    });
                }
                Some(appt)
            }
            None => {
                if !proposal.status.is_active() {
                    return Err(BookingError::InvalidRequest(
                        "new appointments start pending or confirmed",
                    ));
                }
                None
            }
        };

        if !self.within_working_hours(tenant, &config, start, end).await? {
            return Err(BookingError::OutsideWorkingHours);
        }
        if self.has_blocking_overlap(tenant, start, end).await? {
            return Err(BookingError::SlotBlocked);
        }
        let exclude = existing.as_ref().map(|a| a.id);
        if let Some(other) = self
            .find_overlapping_active(tenant, start, end, exclude)
            .await?
            .first()
        {
            return Err(BookingError::SlotTaken(Some(other.id)));
        }

        let span = Span::new(start, end);
        let committed = match existing {
            Some(appt) => {
                let change = AppointmentChange::Reschedule {
                    service_id: service.id,
                    span,
                };
                self.store
                    .update_appointment(tenant, appt.id, change, now)
                    .await
            }
            None => {
                let appt = Appointment {
                    id: AppointmentId::new(),
                    tenant_id: tenant.clone(),
                    service_id: service.id,
                    customer_ref: customer_ref.to_string(),
                    start,
                    end,
                    status: proposal.status,
                    manage_token: new_manage_token(),
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_appointment(&appt).await.map(|()| appt)
            }
        };
        match committed {
            Ok(appt) => Ok(Attempt::Committed(appt)),
            Err(StoreError::Overlap(other)) => Ok(Attempt::Conflict(other)),
            Err(e) => Err(store_failure(e)),
        }
    }
}
