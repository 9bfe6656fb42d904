use tokio::sync::OwnedRwLockWriteGuard;

use crate::limits::MAX_BOOKINGS_PER_FACILITY;
use crate::model::*;

use super::conflict::check_no_conflict;
use super::{apply_series, Engine, EngineError};

/// Write transaction over one facility's calendar.
///
/// Holding the facility's write guard for the whole check-then-insert
/// sequence is what keeps two concurrent series from both passing the
/// overlap check. Rows are only staged here; `commit` writes the whole
/// series as one WAL record and applies it. Dropping the transaction
/// without committing discards the staged rows, so every early return
/// (conflict, `?`, panic) is a rollback.
pub(super) struct SeriesTransaction<'e> {
    engine: &'e Engine,
    guard: OwnedRwLockWriteGuard<FacilityState>,
    staged: Vec<Booking>,
    committed: bool,
}

impl<'e> SeriesTransaction<'e> {
    pub(super) async fn begin(engine: &'e Engine, facility_id: FacilityId) -> Result<Self, EngineError> {
        let guard = engine.lock_facility(facility_id).await?;
        Ok(Self {
            engine,
            guard,
            staged: Vec::new(),
            committed: false,
        })
    }

    /// Check `booking` against committed rows and rows staged earlier in
    /// this transaction, then stage it.
    pub(super) fn stage(&mut self, booking: Booking) -> Result<(), EngineError> {
        check_no_conflict(&self.guard, booking.date, &booking.time, None)?;
        if let Some(earlier) = self
            .staged
            .iter()
            .find(|s| s.date == booking.date && s.time.overlaps(&booking.time))
        {
            return Err(EngineError::Conflict {
                date: booking.date,
                existing: earlier.id,
            });
        }
        if self.guard.booking_count() + self.staged.len() >= MAX_BOOKINGS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many bookings on facility"));
        }
        self.staged.push(booking);
        Ok(())
    }

    pub(super) async fn commit(mut self) -> Result<Vec<BookingId>, EngineError> {
        let ids: Vec<BookingId> = self.staged.iter().map(|b| b.id).collect();
        if !ids.is_empty() {
            let event = Event::SeriesBooked {
                facility_id: self.guard.id,
                bookings: self.staged.clone(),
            };
            self.engine.wal_append(&event).await?;
            let staged = std::mem::take(&mut self.staged);
            apply_series(&mut self.guard, staged, &self.engine.locations);
        }
        self.committed = true;
        Ok(ids)
    }
}

impl Drop for SeriesTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(
                "rolled back series on facility {} ({} staged rows discarded)",
                self.guard.id,
                self.staged.len()
            );
            metrics::counter!(crate::observability::SERIES_ROLLED_BACK_TOTAL).increment(1);
        }
    }
}
