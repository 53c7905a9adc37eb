// Hard caps. Anything a client controls is bounded here.

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_WINDOWS_PER_WEEKDAY: usize = 16;
pub const MAX_SERVICES_PER_TENANT: usize = 1_000;
pub const MAX_BLOCKED_PERIODS_PER_TENANT: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_TENANT: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1_024;
pub const MAX_CUSTOMER_REF_LEN: usize = 256;

/// Longest bookable service: one full day.
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_GRANULARITY_MINUTES: u32 = 24 * 60;
pub const MAX_ADVANCE_DAYS_LIMIT: u32 = 3 * 365;
/// UTC offsets beyond ±14h do not exist.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Widest blocked period accepted (a year-long closure).
pub const MAX_BLOCKED_SPAN_DAYS: i64 = 366;

pub const MAX_REQUEST_LINE_LEN: usize = 64 * 1024;

pub const MAX_LISTENS_PER_CONNECTION: usize = 64;
/// Notices waiting to be written to one connection.
pub const NOTICE_QUEUE_LEN: usize = 256;
