use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn required<T>(value: Option<T>, field: &str) -> Result<T, EngineError> {
    value.ok_or_else(|| EngineError::Validation(format!("missing required field: {field}")))
}

pub(crate) fn validate_time_range(start: Minute, end: Minute) -> Result<TimeRange, EngineError> {
    TimeRange::new(start, end).ok_or_else(|| {
        EngineError::Validation(format!(
            "end_time {} must be after start_time {}",
            format_clock(end),
            format_clock(start)
        ))
    })
}

pub(crate) fn validate_color(color: &str) -> Result<(), EngineError> {
    if color.trim().is_empty() {
        return Err(EngineError::Validation("missing required field: color".into()));
    }
    if color.len() > MAX_COLOR_LEN {
        return Err(EngineError::LimitExceeded("color too long"));
    }
    Ok(())
}

pub(crate) fn validate_requester(requester: &Requester) -> Result<(), EngineError> {
    let too_long = |field: &Option<String>, max: usize| field.as_ref().is_some_and(|s| s.len() > max);
    if too_long(&requester.name, MAX_REQUESTER_NAME_LEN) {
        return Err(EngineError::LimitExceeded("requester name too long"));
    }
    if too_long(&requester.phone, MAX_REQUESTER_PHONE_LEN) {
        return Err(EngineError::LimitExceeded("requester phone too long"));
    }
    if too_long(&requester.activity, MAX_ACTIVITY_LEN) {
        return Err(EngineError::LimitExceeded("activity description too long"));
    }
    Ok(())
}

pub(crate) fn validate_facility_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation("missing required field: name".into()));
    }
    if name.len() > MAX_FACILITY_NAME_LEN {
        return Err(EngineError::LimitExceeded("facility name too long"));
    }
    Ok(name.to_string())
}

/// Key used for the case-insensitive unique-name index.
pub(crate) fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Half-open overlap test against every booking on `(facility, date)`,
/// optionally ignoring one booking (the one being edited).
pub(crate) fn check_no_conflict(
    fs: &FacilityState,
    date: NaiveDate,
    range: &TimeRange,
    exclude: Option<BookingId>,
) -> Result<(), EngineError> {
    match fs.overlapping(date, range).find(|b| Some(b.id) != exclude) {
        Some(existing) => Err(EngineError::Conflict {
            date,
            existing: existing.id,
        }),
        None => Ok(()),
    }
}
