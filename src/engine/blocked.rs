use crate::model::*;

use super::{store_failure, BookingError, Engine};

impl Engine {
    /// True if any blocked period of the tenant overlaps `[start, end)`, partially
    /// or totally.
    pub async fn has_blocking_overlap(
        &self,
        tenant: &TenantId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<bool, BookingError> {
        let span = Span::try_new(start, end).ok_or(BookingError::InvalidRequest("start must be before end"))?;
        let periods = self
            .store
            .blocked_periods(tenant, span)
            .await
            .map_err(store_failure)?;
        Ok(periods.iter().any(|p| p.span().overlaps(&span)))
    }
}
