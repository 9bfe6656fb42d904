use chrono::NaiveDate;

use crate::model::*;

use super::availability::free_slots;
use super::conflict::name_key;
use super::{Engine, EngineError};

/// Conditions for listing bookings. Unset fields match everything; the date
/// bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub facility_id: Option<FacilityId>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub owner: Option<String>,
}

impl Engine {
    /// All facilities, ordered by name (case-insensitive), then id.
    pub async fn list_facilities(&self) -> Vec<FacilityInfo> {
        let shared: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for fs in shared {
            let guard = fs.read().await;
            out.push(FacilityInfo {
                id: guard.id,
                name: guard.name.clone(),
                booking_count: guard.booking_count(),
            });
        }
        out.sort_by(|a, b| name_key(&a.name).cmp(&name_key(&b.name)).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get_booking(&self, id: BookingId) -> Result<BookingInfo, EngineError> {
        let location = self.locate(&id).ok_or(EngineError::BookingNotFound(id))?;
        let fs = self
            .get_facility(&location.facility_id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let guard = fs.read().await;
        let booking = guard
            .get_booking(location.date, id)
            .ok_or(EngineError::BookingNotFound(id))?;
        Ok(BookingInfo {
            booking: booking.clone(),
            facility_name: guard.name.clone(),
        })
    }

    /// Bookings matching `filter`, ordered by date, start time, facility.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<BookingInfo> {
        let from = filter.from.unwrap_or(NaiveDate::MIN);
        let to = filter.to.unwrap_or(NaiveDate::MAX);
        let shared: Vec<_> = match filter.facility_id {
            Some(id) => self.get_facility(&id).into_iter().collect(),
            None => self.facilities.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for fs in shared {
            let guard = fs.read().await;
            out.extend(
                guard
                    .bookings_between(from, to)
                    .filter(|b| filter.owner.as_ref().is_none_or(|o| &b.owner == o))
                    .map(|b| BookingInfo {
                        booking: b.clone(),
                        facility_name: guard.name.clone(),
                    }),
            );
        }
        out.sort_by_key(|info| {
            let b = &info.booking;
            (b.date, b.time.start, b.facility_id)
        });
        out
    }

    /// Free intervals of one facility on one date, within `window` (the
    /// whole day when absent).
    pub async fn free_slots(
        &self,
        facility_id: FacilityId,
        date: NaiveDate,
        window: Option<TimeRange>,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::FacilityNotFound(facility_id))?;
        let guard = fs.read().await;
        Ok(free_slots(&guard, date, &window.unwrap_or_else(TimeRange::whole_day)))
    }
}
