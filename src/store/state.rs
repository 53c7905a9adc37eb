use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Weekday};
use tokio::sync::RwLock;

use crate::limits::*;
use crate::model::*;

use super::StoreError;

pub type SharedTenantState = Arc<RwLock<TenantState>>;

/// Everything one salon owns. Every write goes through [`TenantState::validate`]
/// then [`TenantState::apply`]; a durable store logs the event in between.
#[derive(Debug, Clone)]
pub struct TenantState {
    pub tenant_id: TenantId,
    config: Option<BookingConfig>,
    /// Sorted by (weekday, start_time).
    windows: Vec<WorkingWindow>,
    services: HashMap<ServiceId, Service>,
    /// Sorted by start.
    blocked: Vec<BlockedPeriod>,
    appointments: HashMap<AppointmentId, Appointment>,
    /// Spans of active appointments, sorted by start. Pairwise disjoint.
    active: Vec<(TimeSpan, AppointmentId)>,
    tokens: HashMap<String, AppointmentId>,
    ledger: Vec<LedgerEntry>,
    ledger_index: HashSet<AppointmentId>,
}

/// Items of a start-sorted list of disjoint-ish intervals that overlap `query`.
/// Everything from `partition_point` on starts at or after `query.end`.
fn overlapping_by_start<'a, T>(
    items: &'a [T],
    span_of: impl Fn(&T) -> TimeSpan + Copy + 'a,
    query: TimeSpan,
) -> impl Iterator<Item = &'a T> + 'a {
    let right_bound = items.partition_point(|i| span_of(i).start < query.end);
    items[..right_bound]
        .iter()
        .filter(move |i| span_of(i).end > query.start)
}

impl TenantState {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            config: None,
            windows: Vec::new(),
            services: HashMap::new(),
            blocked: Vec::new(),
            appointments: HashMap::new(),
            active: Vec::new(),
            tokens: HashMap::new(),
            ledger: Vec::new(),
            ledger_index: HashSet::new(),
        }
    }

    // ── Queries ──────────────────────────────────────────────

    pub fn config(&self) -> BookingConfig {
        self.config.unwrap_or_default()
    }

    pub fn active_windows(&self, weekday: Weekday) -> Vec<WorkingWindow> {
        self.windows
            .iter()
            .filter(|w| w.weekday == weekday && w.active)
            .cloned()
            .collect()
    }

    pub fn service(&self, id: ServiceId) -> Option<Service> {
        self.services.get(&id).cloned()
    }

    pub fn blocked_overlapping(&self, query: TimeSpan) -> Vec<BlockedPeriod> {
        overlapping_by_start(&self.blocked, BlockedPeriod::span, query)
            .cloned()
            .collect()
    }

    pub fn active_overlapping(&self, query: TimeSpan, exclude: Option<AppointmentId>) -> Vec<Appointment> {
        overlapping_by_start(&self.active, |(span, _)| *span, query)
            .filter(|(_, id)| Some(*id) != exclude)
            .filter_map(|(_, id)| self.appointments.get(id).cloned())
            .collect()
    }

    pub fn appointment(&self, id: AppointmentId) -> Option<Appointment> {
        self.appointments.get(&id).cloned()
    }

    pub fn appointment_by_token(&self, token: &str) -> Option<Appointment> {
        self.tokens
            .get(token)
            .and_then(|id| self.appointments.get(id))
            .cloned()
    }

    pub fn appointments_starting_in(&self, span: TimeSpan) -> Vec<Appointment> {
        let mut found: Vec<Appointment> = self
            .appointments
            .values()
            .filter(|a| span.start <= a.start && a.start < span.end)
            .cloned()
            .collect();
        found.sort_by_key(|a| (a.start, a.id));
        found
    }

    pub fn has_income_for(&self, id: AppointmentId) -> bool {
        self.ledger_index.contains(&id)
    }

    pub fn ledger(&self) -> &[LedgerEntry] {
        &self.ledger
    }

    fn first_active_conflict(&self, span: TimeSpan, exclude: Option<AppointmentId>) -> Option<AppointmentId> {
        overlapping_by_start(&self.active, |(s, _)| *s, span)
            .map(|(_, id)| *id)
            .find(|id| Some(*id) != exclude)
    }

    // ── Validation ───────────────────────────────────────────

    /// Reject an event that would break a tenant invariant. Pure: never mutates.
    pub fn validate(&self, event: &Event) -> Result<(), StoreError> {
        match event {
            Event::ConfigSet { config } => validate_config(config),
            Event::WindowPut { window } => {
                if window.start_time >= window.end_time {
                    return Err(StoreError::Invalid("window start must be before end"));
                }
                let same_day: Vec<&WorkingWindow> = self
                    .windows
                    .iter()
                    .filter(|w| w.weekday == window.weekday && w.id != window.id)
                    .collect();
                if same_day.len() >= MAX_WINDOWS_PER_WEEKDAY {
                    return Err(StoreError::LimitExceeded("too many windows on weekday"));
                }
                if window.active
                    && same_day
                        .iter()
                        .any(|w| w.active && w.span().overlaps(&window.span()))
                {
                    return Err(StoreError::Invalid("window overlaps another active window"));
                }
                Ok(())
            }
            Event::WindowRemoved { id } => self
                .windows
                .iter()
                .any(|w| w.id == *id)
                .then_some(())
                .ok_or(StoreError::NotFound),
            Event::ServicePut { service } => {
                if service.duration_minutes == 0 || service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
                    return Err(StoreError::Invalid("service duration out of range"));
                }
                if service.price_cents < 0 {
                    return Err(StoreError::Invalid("negative price"));
                }
                if service.name.len() > MAX_NAME_LEN {
                    return Err(StoreError::LimitExceeded("service name too long"));
                }
                if !self.services.contains_key(&service.id) && self.services.len() >= MAX_SERVICES_PER_TENANT {
                    return Err(StoreError::LimitExceeded("too many services"));
                }
                Ok(())
            }
            Event::BlockedPeriodAdded { period } => {
                if period.start >= period.end {
                    return Err(StoreError::Invalid("blocked period start must be before end"));
                }
                if period.end - period.start > Duration::days(MAX_BLOCKED_SPAN_DAYS) {
                    return Err(StoreError::LimitExceeded("blocked period too long"));
                }
                if period.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
                    return Err(StoreError::LimitExceeded("reason too long"));
                }
                if self.blocked.len() >= MAX_BLOCKED_PERIODS_PER_TENANT {
                    return Err(StoreError::LimitExceeded("too many blocked periods"));
                }
                if self.blocked.iter().any(|b| b.id == period.id) {
                    return Err(StoreError::Invalid("duplicate blocked period id"));
                }
                Ok(())
            }
            Event::BlockedPeriodRemoved { id } => self
                .blocked
                .iter()
                .any(|b| b.id == *id)
                .then_some(())
                .ok_or(StoreError::NotFound),
            Event::AppointmentInserted { appointment } => {
                if appointment.start >= appointment.end {
                    return Err(StoreError::Invalid("appointment start must be before end"));
                }
                if self.appointments.contains_key(&appointment.id) {
                    return Err(StoreError::Invalid("duplicate appointment id"));
                }
                if self.appointments.len() >= MAX_APPOINTMENTS_PER_TENANT {
                    return Err(StoreError::LimitExceeded("too many appointments"));
                }
                if appointment.is_active()
                    && let Some(other) = self.first_active_conflict(appointment.span(), None)
                {
                    return Err(StoreError::Overlap(other));
                }
                Ok(())
            }
            Event::AppointmentChanged { id, change, .. } => {
                let current = self.appointments.get(id).ok_or(StoreError::NotFound)?;
                let (span, active) = match change {
                    AppointmentChange::Reschedule { span, .. } => {
                        if span.start >= span.end {
                            return Err(StoreError::Invalid("appointment start must be before end"));
                        }
                        (*span, current.is_active())
                    }
                    AppointmentChange::Status(status) => (current.span(), status.is_active()),
                };
                if active && let Some(other) = self.first_active_conflict(span, Some(*id)) {
                    return Err(StoreError::Overlap(other));
                }
                Ok(())
            }
            Event::AppointmentErased { id } => self
                .appointments
                .contains_key(id)
                .then_some(())
                .ok_or(StoreError::NotFound),
            Event::IncomeRecorded { entry } => {
                if self.ledger_index.contains(&entry.appointment_id) {
                    return Err(StoreError::Invalid("income already recorded"));
                }
                Ok(())
            }
        }
    }

    // ── Application ──────────────────────────────────────────

    /// Apply a validated (or replayed) event.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ConfigSet { config } => self.config = Some(*config),
            Event::WindowPut { window } => {
                self.windows.retain(|w| w.id != window.id);
                let key = |w: &WorkingWindow| (weekday_index(w.weekday), w.start_time);
                let pos = self.windows.partition_point(|w| key(w) <= key(window));
                self.windows.insert(pos, window.clone());
            }
            Event::WindowRemoved { id } => self.windows.retain(|w| w.id != *id),
            Event::ServicePut { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::BlockedPeriodAdded { period } => {
                let pos = self.blocked.partition_point(|b| b.start <= period.start);
                self.blocked.insert(pos, period.clone());
            }
            Event::BlockedPeriodRemoved { id } => self.blocked.retain(|b| b.id != *id),
            Event::AppointmentInserted { appointment } => {
                self.tokens
                    .insert(appointment.manage_token.clone(), appointment.id);
                if appointment.is_active() {
                    self.index_active(appointment.span(), appointment.id);
                }
                self.appointments.insert(appointment.id, appointment.clone());
            }
            Event::AppointmentChanged { id, change, at } => {
                let Some(appt) = self.appointments.get_mut(id) else {
                    return;
                };
                match change {
                    AppointmentChange::Reschedule { service_id, span } => {
                        appt.service_id = *service_id;
                        appt.start = span.start;
                        appt.end = span.end;
                    }
                    AppointmentChange::Status(status) => appt.status = *status,
                }
                appt.updated_at = *at;
                let (span, active) = (appt.span(), appt.is_active());
                self.unindex_active(*id);
                if active {
                    self.index_active(span, *id);
                }
            }
            Event::AppointmentErased { id } => {
                if let Some(appt) = self.appointments.remove(id) {
                    self.tokens.remove(&appt.manage_token);
                }
                self.unindex_active(*id);
            }
            Event::IncomeRecorded { entry } => {
                if self.ledger_index.insert(entry.appointment_id) {
                    self.ledger.push(entry.clone());
                }
            }
        }
    }

    fn index_active(&mut self, span: TimeSpan, id: AppointmentId) {
        let pos = self.active.partition_point(|(s, _)| s.start <= span.start);
        self.active.insert(pos, (span, id));
    }

    fn unindex_active(&mut self, id: AppointmentId) {
        if let Some(pos) = self.active.iter().position(|(_, a)| *a == id) {
            self.active.remove(pos);
        }
    }

    /// Minimal event list that rebuilds this state from nothing.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(config) = self.config {
            events.push(Event::ConfigSet { config });
        }
        events.extend(self.windows.iter().map(|w| Event::WindowPut { window: w.clone() }));
        let mut services: Vec<&Service> = self.services.values().collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(|s| Event::ServicePut { service: s.clone() }));
        events.extend(
            self.blocked
                .iter()
                .map(|b| Event::BlockedPeriodAdded { period: b.clone() }),
        );
        let mut appointments: Vec<&Appointment> = self.appointments.values().collect();
        appointments.sort_by_key(|a| (a.start, a.id));
        events.extend(appointments.into_iter().map(|a| Event::AppointmentInserted {
            appointment: a.clone(),
        }));
        events.extend(self.ledger.iter().map(|e| Event::IncomeRecorded { entry: e.clone() }));
        events
    }
}

pub(crate) fn validate_config(config: &BookingConfig) -> Result<(), StoreError> {
    if config.slot_granularity_minutes == 0 || config.slot_granularity_minutes > MAX_GRANULARITY_MINUTES {
        return Err(StoreError::Invalid("slot granularity out of range"));
    }
    if config.max_advance_days == 0 || config.max_advance_days > MAX_ADVANCE_DAYS_LIMIT {
        return Err(StoreError::Invalid("max advance days out of range"));
    }
    if config.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(StoreError::Invalid("utc offset out of range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Utc};

    fn tenant() -> TenantId {
        TenantId::parse("state-salon").unwrap()
    }

    fn at(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap()
    }

    fn appt(start: Timestamp, end: Timestamp, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: AppointmentId::new(),
            tenant_id: tenant(),
            service_id: ServiceId::new(),
            customer_ref: "c".into(),
            start,
            end,
            status,
            manage_token: new_manage_token(),
            created_at: start,
            updated_at: start,
        }
    }

    fn commit(state: &mut TenantState, event: Event) -> Result<(), StoreError> {
        state.validate(&event)?;
        state.apply(&event);
        Ok(())
    }

    fn window(weekday: Weekday, from: u32, to: u32) -> WorkingWindow {
        WorkingWindow {
            id: WindowId::new(),
            tenant_id: tenant(),
            weekday,
            start_time: NaiveTime::from_hms_opt(from, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(to, 0, 0).unwrap(),
            active: true,
        }
    }

    #[test]
    fn insert_rejects_overlapping_active() {
        let mut state = TenantState::new(tenant());
        let first = appt(at(10, 0), at(11, 0), AppointmentStatus::Confirmed);
        commit(&mut state, Event::AppointmentInserted { appointment: first.clone() }).unwrap();

        let clash = appt(at(10, 30), at(11, 30), AppointmentStatus::Pending);
        assert_eq!(
            commit(&mut state, Event::AppointmentInserted { appointment: clash }),
            Err(StoreError::Overlap(first.id))
        );

        let adjacent = appt(at(11, 0), at(12, 0), AppointmentStatus::Pending);
        commit(&mut state, Event::AppointmentInserted { appointment: adjacent }).unwrap();
    }

    #[test]
    fn inactive_appointments_do_not_block() {
        let mut state = TenantState::new(tenant());
        let old = appt(at(10, 0), at(11, 0), AppointmentStatus::Cancelled);
        commit(&mut state, Event::AppointmentInserted { appointment: old }).unwrap();
        let new = appt(at(10, 0), at(11, 0), AppointmentStatus::Pending);
        commit(&mut state, Event::AppointmentInserted { appointment: new }).unwrap();
        assert_eq!(state.active_overlapping(Span::new(at(9, 0), at(12, 0)), None).len(), 1);
    }

    #[test]
    fn reschedule_excludes_self_and_reindexes() {
        let mut state = TenantState::new(tenant());
        let a = appt(at(10, 0), at(11, 0), AppointmentStatus::Pending);
        let b = appt(at(12, 0), at(13, 0), AppointmentStatus::Pending);
        commit(&mut state, Event::AppointmentInserted { appointment: a.clone() }).unwrap();
        commit(&mut state, Event::AppointmentInserted { appointment: b.clone() }).unwrap();

        // Onto its own slot, shifted by 30 min: only overlaps itself.
        let moved = Span::new(at(10, 30), at(11, 30));
        commit(
            &mut state,
            Event::AppointmentChanged {
                id: a.id,
                change: AppointmentChange::Reschedule { service_id: a.service_id, span: moved },
                at: at(8, 0),
            },
        )
        .unwrap();

        // Into b: rejected.
        let into_b = Span::new(at(12, 30), at(13, 30));
        let result = commit(
            &mut state,
            Event::AppointmentChanged {
                id: a.id,
                change: AppointmentChange::Reschedule { service_id: a.service_id, span: into_b },
                at: at(8, 0),
            },
        );
        assert_eq!(result, Err(StoreError::Overlap(b.id)));

        let hits = state.active_overlapping(Span::new(at(10, 0), at(10, 31)), None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, at(10, 30));
        assert_eq!(hits[0].updated_at, at(8, 0));
    }

    #[test]
    fn cancel_frees_index_but_keeps_row() {
        let mut state = TenantState::new(tenant());
        let a = appt(at(10, 0), at(11, 0), AppointmentStatus::Confirmed);
        commit(&mut state, Event::AppointmentInserted { appointment: a.clone() }).unwrap();
        commit(
            &mut state,
            Event::AppointmentChanged {
                id: a.id,
                change: AppointmentChange::Status(AppointmentStatus::Cancelled),
                at: at(9, 0),
            },
        )
        .unwrap();
        assert!(state.active_overlapping(a.span(), None).is_empty());
        assert_eq!(state.appointment(a.id).unwrap().status, AppointmentStatus::Cancelled);
        assert_eq!(state.appointment_by_token(&a.manage_token).unwrap().id, a.id);
    }

    #[test]
    fn erase_removes_row_and_token() {
        let mut state = TenantState::new(tenant());
        let a = appt(at(10, 0), at(11, 0), AppointmentStatus::Pending);
        commit(&mut state, Event::AppointmentInserted { appointment: a.clone() }).unwrap();
        commit(&mut state, Event::AppointmentErased { id: a.id }).unwrap();
        assert!(state.appointment(a.id).is_none());
        assert!(state.appointment_by_token(&a.manage_token).is_none());
        assert!(state.active_overlapping(a.span(), None).is_empty());
        assert_eq!(
            commit(&mut state, Event::AppointmentErased { id: a.id }),
            Err(StoreError::NotFound)
        );
    }

    #[test]
    fn windows_must_not_overlap_on_same_day() {
        let mut state = TenantState::new(tenant());
        commit(&mut state, Event::WindowPut { window: window(Weekday::Mon, 9, 12) }).unwrap();
        commit(&mut state, Event::WindowPut { window: window(Weekday::Mon, 13, 17) }).unwrap();
        commit(&mut state, Event::WindowPut { window: window(Weekday::Tue, 10, 18) }).unwrap();
        assert!(matches!(
            commit(&mut state, Event::WindowPut { window: window(Weekday::Mon, 11, 14) }),
            Err(StoreError::Invalid(_))
        ));

        let mon = state.active_windows(Weekday::Mon);
        assert_eq!(mon.len(), 2);
        assert!(mon[0].start_time < mon[1].start_time);
    }

    #[test]
    fn blocked_periods_query_by_overlap() {
        let mut state = TenantState::new(tenant());
        for (from, to) in [(8, 9), (13, 14), (20, 22)] {
            commit(
                &mut state,
                Event::BlockedPeriodAdded {
                    period: BlockedPeriod {
                        id: BlockedPeriodId::new(),
                        tenant_id: tenant(),
                        start: at(from, 0),
                        end: at(to, 0),
                        reason: None,
                    },
                },
            )
            .unwrap();
        }
        let hits = state.blocked_overlapping(Span::new(at(9, 0), at(13, 30)));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, at(13, 0));
    }

    #[test]
    fn income_recorded_once() {
        let mut state = TenantState::new(tenant());
        let entry = LedgerEntry {
            tenant_id: tenant(),
            appointment_id: AppointmentId::new(),
            amount_cents: 4500,
            description: "Cut".into(),
            recorded_at: at(12, 0),
        };
        commit(&mut state, Event::IncomeRecorded { entry: entry.clone() }).unwrap();
        assert!(commit(&mut state, Event::IncomeRecorded { entry }).is_err());
        assert_eq!(state.ledger().len(), 1);
    }

    #[test]
    fn config_bounds() {
        let bad = BookingConfig {
            slot_granularity_minutes: 0,
            ..Default::default()
        };
        assert!(validate_config(&bad).is_err());
        let bad = BookingConfig {
            utc_offset_minutes: 15 * 60,
            ..Default::default()
        };
        assert!(validate_config(&bad).is_err());
        assert!(validate_config(&BookingConfig::default()).is_ok());
    }

    #[test]
    fn snapshot_rebuilds_equivalent_state() {
        let mut state = TenantState::new(tenant());
        commit(&mut state, Event::ConfigSet { config: BookingConfig::default() }).unwrap();
        commit(&mut state, Event::WindowPut { window: window(Weekday::Mon, 9, 17) }).unwrap();
        let a = appt(at(10, 0), at(11, 0), AppointmentStatus::Confirmed);
        let b = appt(at(12, 0), at(13, 0), AppointmentStatus::Cancelled);
        commit(&mut state, Event::AppointmentInserted { appointment: a.clone() }).unwrap();
        commit(&mut state, Event::AppointmentInserted { appointment: b.clone() }).unwrap();

        let mut rebuilt = TenantState::new(tenant());
        for event in state.snapshot() {
            rebuilt.apply(&event);
        }
        assert_eq!(rebuilt.config(), state.config());
        assert_eq!(rebuilt.active_windows(Weekday::Mon), state.active_windows(Weekday::Mon));
        assert_eq!(rebuilt.appointment(a.id), Some(a.clone()));
        assert_eq!(rebuilt.appointment(b.id), Some(b));
        assert_eq!(rebuilt.active_overlapping(a.span(), None), vec![a]);
    }
}
