use crate::model::{AppointmentId, AppointmentStatus};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Unknown or inactive service.
    InvalidService,
    OutsideWorkingHours,
    SlotBlocked,
    /// Another active appointment holds the interval, when known.
    SlotTaken(Option<AppointmentId>),
    InvalidRequest(&'static str),
    NotFound,
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    Internal(String),
}

impl BookingError {
    /// Stable snake_case code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::InvalidService => "invalid_service",
            BookingError::OutsideWorkingHours => "outside_working_hours",
            BookingError::SlotBlocked => "slot_blocked",
            BookingError::SlotTaken(_) => "slot_taken",
            BookingError::InvalidRequest(_) => "invalid_request",
            BookingError::NotFound => "not_found",
            BookingError::InvalidTransition { .. } => "invalid_transition",
            BookingError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::InvalidService => write!(f, "service does not exist or is inactive"),
            BookingError::OutsideWorkingHours => write!(f, "requested time is outside working hours"),
            BookingError::SlotBlocked => write!(f, "requested time overlaps a blocked period"),
            BookingError::SlotTaken(Some(id)) => write!(f, "slot already taken by appointment {id}"),
            BookingError::SlotTaken(None) => write!(f, "slot already taken"),
            BookingError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            BookingError::NotFound => write!(f, "appointment not found"),
            BookingError::InvalidTransition { from, to } => {
                write!(f, "cannot move appointment from {from} to {to}")
            }
            BookingError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Overlap(id) => BookingError::SlotTaken(Some(id)),
            StoreError::NotFound => BookingError::NotFound,
            other => BookingError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_booking_errors() {
        let id = AppointmentId::new();
        assert_eq!(BookingError::from(StoreError::Overlap(id)), BookingError::SlotTaken(Some(id)));
        assert_eq!(BookingError::from(StoreError::NotFound), BookingError::NotFound);
        assert!(matches!(
            BookingError::from(StoreError::Wal("disk full".into())),
            BookingError::Internal(msg) if msg.contains("disk full")
        ));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(BookingError::SlotTaken(None).code(), "slot_taken");
        assert_eq!(
            BookingError::InvalidTransition {
                from: AppointmentStatus::Cancelled,
                to: AppointmentStatus::Confirmed,
            }
            .to_string(),
            "cannot move appointment from cancelled to confirmed"
        );
    }
}
