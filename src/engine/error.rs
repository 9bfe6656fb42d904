use chrono::NaiveDate;

use crate::model::{BookingId, FacilityId};
use crate::recurrence::InvalidRecurrence;

#[derive(Debug)]
pub enum EngineError {
    /// Required field missing or malformed. Raised before any state is touched.
    Validation(String),
    FacilityNotFound(FacilityId),
    BookingNotFound(BookingId),
    FacilityExists(FacilityId),
    DuplicateName(String),
    HasBookings(FacilityId),
    /// First date (ascending) whose range overlaps an existing booking.
    Conflict {
        date: NaiveDate,
        existing: BookingId,
    },
    Unauthorized(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::FacilityNotFound(id) => write!(f, "facility not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::FacilityExists(id) => write!(f, "facility already exists: {id}"),
            EngineError::DuplicateName(name) => write!(f, "facility name already in use: {name}"),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete facility {id}: it still has bookings")
            }
            EngineError::Conflict { date, existing } => {
                write!(f, "conflict on date {date} (overlaps booking {existing})")
            }
            EngineError::Unauthorized(msg) => write!(f, "not allowed: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<InvalidRecurrence> for EngineError {
    fn from(e: InvalidRecurrence) -> Self {
        EngineError::Validation(e.to_string())
    }
}
