use chrono::{Datelike, Duration, NaiveDate, NaiveTime};

use crate::model::*;

use super::calendar::{local_interval, windows_contain};
use super::{store_failure, BookingError, Engine};

/// Bookable start times for one service on one day.
///
/// Holds the day's windows, blocked periods and busy intervals as read when the
/// listing was made; candidates are filtered on each pass over [`DaySlots::iter`].
#[derive(Debug, Clone)]
pub struct DaySlots {
    date: Option<NaiveDate>,
    config: BookingConfig,
    duration: Duration,
    candidates: Vec<NaiveTime>,
    windows: Vec<WorkingWindow>,
    blocked: Vec<TimeSpan>,
    busy: Vec<TimeSpan>,
}

impl DaySlots {
    pub fn empty() -> Self {
        Self {
            date: None,
            config: BookingConfig::default(),
            duration: Duration::zero(),
            candidates: Vec::new(),
            windows: Vec::new(),
            blocked: Vec::new(),
            busy: Vec::new(),
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    /// Ascending. Restartable: every call walks the candidates afresh.
    pub fn iter(&self) -> impl Iterator<Item = NaiveTime> + '_ {
        self.candidates.iter().copied().filter(|t| self.fits(*t))
    }

    pub fn to_vec(&self) -> Vec<NaiveTime> {
        self.iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Absolute interval a booking at `start` would occupy.
    pub fn span_at(&self, start: NaiveTime) -> Option<TimeSpan> {
        let date = self.date?;
        let begin = self.config.to_utc(date.and_time(start))?;
        Span::try_new(begin, begin.checked_add_signed(self.duration)?)
    }

    fn fits(&self, start: NaiveTime) -> bool {
        let Some(span) = self.span_at(start) else {
            return false;
        };
        let Some(local) = local_interval(&self.config, span.start, span.end) else {
            return false;
        };
        windows_contain(&self.windows, local.start, local.end)
            && !self.blocked.iter().any(|b| b.overlaps(&span))
            && !self.busy.iter().any(|b| b.overlaps(&span))
    }
}

impl<'a> IntoIterator for &'a DaySlots {
    type Item = NaiveTime;
    type IntoIter = Box<dyn Iterator<Item = NaiveTime> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Grid anchored at each window's start, stepping by `granularity` while the
/// candidate still starts inside the window. Merged, deduplicated, ascending.
pub(super) fn candidate_starts(windows: &[WorkingWindow], granularity: Duration) -> Vec<NaiveTime> {
    let mut out = Vec::new();
    for w in windows.iter().filter(|w| w.active) {
        let mut t = w.start_time;
        while t < w.end_time {
            out.push(t);
            let (next, wrapped) = t.overflowing_add_signed(granularity);
            if wrapped != 0 || next <= t {
                break;
            }
            t = next;
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

impl Engine {
    /// Open start times for `service_id` on the tenant-local `date`.
    ///
    /// Empty (not an error) for dates outside the booking horizon, unknown or
    /// inactive services and closed days.
    pub async fn generate_slots(
        &self,
        tenant: &TenantId,
        service_id: ServiceId,
        date: NaiveDate,
    ) -> Result<DaySlots, BookingError> {
        metrics::counter!(crate::observability::SLOT_QUERIES_TOTAL).increment(1);
        let config = self.store.booking_config(tenant).await.map_err(store_failure)?;
        if !config.is_bookable_date(date, self.now()) {
            return Ok(DaySlots::empty());
        }
        let service = match self.store.service(tenant, service_id).await.map_err(store_failure)? {
            Some(s) if s.active => s,
            _ => return Ok(DaySlots::empty()),
        };
        let windows = self
            .store
            .active_working_windows(tenant, date.weekday())
            .await
            .map_err(store_failure)?;
        if windows.is_empty() {
            return Ok(DaySlots::empty());
        }

        let Some(day) = config.day_span(date) else {
            return Ok(DaySlots::empty());
        };
        let blocked = self
            .store
            .blocked_periods(tenant, day)
            .await
            .map_err(store_failure)?
            .iter()
            .map(BlockedPeriod::span)
            .collect();
        let busy = self
            .store
            .active_overlapping(tenant, day, None)
            .await
            .map_err(store_failure)?
            .iter()
            .map(Appointment::span)
            .collect();

        Ok(DaySlots {
            date: Some(date),
            config,
            duration: service.duration(),
            candidates: candidate_starts(&windows, config.granularity()),
            windows,
            blocked,
            busy,
        })
    }
}
