use chrono::{Datelike, NaiveDate, NaiveTime};

use crate::model::*;

use super::{store_failure, BookingError, Engine};

/// An absolute interval seen as wall-clock times on one salon day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct LocalInterval {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// `None` unless the interval starts and ends on the same local date. An end at
/// exactly midnight belongs to the next day and so is rejected too.
pub(super) fn local_interval(config: &BookingConfig, start: Timestamp, end: Timestamp) -> Option<LocalInterval> {
    if start >= end {
        return None;
    }
    let (start, end) = (config.local(start)?, config.local(end)?);
    (start.date() == end.date()).then(|| LocalInterval {
        date: start.date(),
        start: start.time(),
        end: end.time(),
    })
}

/// True if some active window fully contains `[start, end)`. A booking may end
/// exactly when its window closes.
pub fn windows_contain(windows: &[WorkingWindow], start: NaiveTime, end: NaiveTime) -> bool {
    windows
        .iter()
        .any(|w| w.active && contains(w.start_time, w.end_time, start, end))
}

impl Engine {
    pub async fn is_within_working_hours(
        &self,
        tenant: &TenantId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<bool, BookingError> {
        let config = self.store.booking_config(tenant).await.map_err(store_failure)?;
        self.within_working_hours(tenant, &config, start, end).await
    }

    pub(super) async fn within_working_hours(
        &self,
        tenant: &TenantId,
        config: &BookingConfig,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<bool, BookingError> {
        let Some(local) = local_interval(config, start, end) else {
            return Ok(false);
        };
        let windows = self
            .store
            .active_working_windows(tenant, local.date.weekday())
            .await
            .map_err(store_failure)?;
        Ok(windows_contain(&windows, local.start, local.end))
    }
}
