use crate::model::*;

use super::{store_failure, BookingError, Engine};

impl Engine {
    /// Active appointments overlapping `[start, end)`, ordered by start. Empty means
    /// the interval is free. `exclude` lets a reschedule ignore its own row.
    pub async fn find_overlapping_active(
        &self,
        tenant: &TenantId,
        start: Timestamp,
        end: Timestamp,
        exclude: Option<AppointmentId>,
    ) -> Result<Vec<Appointment>, BookingError> {
        let span = Span::try_new(start, end).ok_or(BookingError::InvalidRequest("start must be before end"))?;
        let mut found = self
            .store
            .active_overlapping(tenant, span, exclude)
            .await
            .map_err(store_failure)?;
        found.retain(|a| a.is_active() && Some(a.id) != exclude && a.span().overlaps(&span));
        found.sort_by_key(|a| (a.start, a.id));
        Ok(found)
    }
}
