use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_TENANT_NAME_LEN;

/// Absolute instant. Everything stored is UTC; local wall time only exists
/// transiently through [`BookingConfig::local`].
pub type Timestamp = DateTime<Utc>;

// ── Interval arithmetic ──────────────────────────────────────────

/// Half-open overlap test: touching endpoints do not overlap.
pub fn overlaps<T: Ord>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < b_end && b_start < a_end
}

/// True if `[inner_start, inner_end)` lies within `[outer_start, outer_end)`.
pub fn contains<T: Ord>(outer_start: T, outer_end: T, inner_start: T, inner_end: T) -> bool {
    outer_start <= inner_start && inner_end <= outer_end
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span<T> {
    pub start: T,
    pub end: T,
}

impl<T: Ord + Copy> Span<T> {
    pub fn new(start: T, end: T) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: T, end: T) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &Span<T>) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span<T>) -> bool {
        contains(self.start, self.end, other.start, other.end)
    }
}

pub type TimeSpan = Span<Timestamp>;

impl TimeSpan {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

// ── Identifiers ──────────────────────────────────────────────────

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(ServiceId);
ulid_id!(AppointmentId);
ulid_id!(BlockedPeriodId);
ulid_id!(WindowId);

/// A salon account, addressed by its slug. Only `[a-z0-9_-]` is accepted so the
/// slug can double as a file name for the tenant's WAL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidTenant {
    Empty,
    TooLong,
    BadChar(char),
}

impl fmt::Display for InvalidTenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidTenant::Empty => write!(f, "empty tenant name"),
            InvalidTenant::TooLong => write!(f, "tenant name too long"),
            InvalidTenant::BadChar(c) => write!(f, "invalid character {c:?} in tenant name"),
        }
    }
}

impl std::error::Error for InvalidTenant {}

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, InvalidTenant> {
        let slug = raw.trim().to_ascii_lowercase();
        if slug.is_empty() {
            return Err(InvalidTenant::Empty);
        }
        if slug.len() > MAX_TENANT_NAME_LEN {
            return Err(InvalidTenant::TooLong);
        }
        if let Some(c) = slug
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(InvalidTenant::BadChar(c));
        }
        Ok(Self(slug))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Weekday from the `0..=6`, Sunday-first numbering used by booking clients.
pub fn weekday_from_index(index: u8) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

pub fn weekday_index(weekday: Weekday) -> u8 {
    weekday.num_days_from_sunday() as u8
}

// ── Catalog ──────────────────────────────────────────────────────

/// Per-tenant booking knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingConfig {
    pub slot_granularity_minutes: u32,
    pub max_advance_days: u32,
    /// Fixed offset of the salon's local day from UTC.
    pub utc_offset_minutes: i32,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            slot_granularity_minutes: 30,
            max_advance_days: 90,
            utc_offset_minutes: 0,
        }
    }
}

impl BookingConfig {
    fn offset_delta(&self) -> Duration {
        Duration::minutes(self.utc_offset_minutes as i64)
    }

    /// Wall-clock time at the salon. `None` at the edges of the representable range.
    pub fn local(&self, ts: Timestamp) -> Option<NaiveDateTime> {
        ts.naive_utc().checked_add_signed(self.offset_delta())
    }

    pub fn to_utc(&self, local: NaiveDateTime) -> Option<Timestamp> {
        local.checked_sub_signed(self.offset_delta()).map(|utc| utc.and_utc())
    }

    pub fn today(&self, now: Timestamp) -> Option<NaiveDate> {
        self.local(now).map(|local| local.date())
    }

    /// The absolute interval covered by the local `date`, midnight to midnight.
    pub fn day_span(&self, date: NaiveDate) -> Option<TimeSpan> {
        let start = self.to_utc(date.and_time(NaiveTime::default()))?;
        let end = start.checked_add_signed(Duration::days(1))?;
        Some(Span::new(start, end))
    }

    pub fn granularity(&self) -> Duration {
        Duration::minutes(self.slot_granularity_minutes.max(1) as i64)
    }

    /// Bookable dates run from tomorrow through `today + max_advance_days`.
    pub fn is_bookable_date(&self, date: NaiveDate, now: Timestamp) -> bool {
        let Some(today) = self.today(now) else {
            return false;
        };
        let Some(last) = today.checked_add_signed(Duration::days(self.max_advance_days as i64)) else {
            return false;
        };
        date > today && date <= last
    }
}

/// Recurring weekly opening window, time-of-day only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingWindow {
    pub id: WindowId,
    pub tenant_id: TenantId,
    pub weekday: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub active: bool,
}

impl WorkingWindow {
    pub fn span(&self) -> Span<NaiveTime> {
        Span::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedPeriod {
    pub id: BlockedPeriodId,
    pub tenant_id: TenantId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub reason: Option<String>,
}

impl BlockedPeriod {
    pub fn span(&self) -> TimeSpan {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub tenant_id: TenantId,
    pub name: String,
    pub duration_minutes: u32,
    pub price_cents: i64,
    pub active: bool,
}

impl Service {
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes as i64)
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    /// Active appointments occupy their interval.
    pub fn is_active(self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }

    /// Completed and cancelled appointments never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub tenant_id: TenantId,
    pub service_id: ServiceId,
    pub customer_ref: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub status: AppointmentStatus,
    /// Opaque self-service token handed to the customer.
    pub manage_token: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Appointment {
    pub fn span(&self) -> TimeSpan {
        Span::new(self.start, self.end)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Fresh management token: a ULID carries 80 random bits.
pub fn new_manage_token() -> String {
    Ulid::new().to_string().to_ascii_lowercase()
}

/// A mutation of an existing appointment row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentChange {
    Reschedule { service_id: ServiceId, span: TimeSpan },
    Status(AppointmentStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tenant_id: TenantId,
    pub appointment_id: AppointmentId,
    pub amount_cents: i64,
    pub description: String,
    pub recorded_at: Timestamp,
}

// ── WAL records ──────────────────────────────────────────────────

/// One WAL record. Each tenant has its own log, so records carry no tenant key
/// beyond what the entities themselves hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ConfigSet {
        config: BookingConfig,
    },
    WindowPut {
        window: WorkingWindow,
    },
    WindowRemoved {
        id: WindowId,
    },
    ServicePut {
        service: Service,
    },
    BlockedPeriodAdded {
        period: BlockedPeriod,
    },
    BlockedPeriodRemoved {
        id: BlockedPeriodId,
    },
    AppointmentInserted {
        appointment: Appointment,
    },
    AppointmentChanged {
        id: AppointmentId,
        change: AppointmentChange,
        at: Timestamp,
    },
    AppointmentErased {
        id: AppointmentId,
    },
    IncomeRecorded {
        entry: LedgerEntry,
    },
}
