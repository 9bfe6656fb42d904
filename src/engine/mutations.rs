use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_CREATED_TOTAL, BOOKING_CONFLICTS_TOTAL};
use crate::recurrence::{expand, RecurrenceRequest};

use super::conflict::{
    check_no_conflict, name_key, required, validate_color, validate_facility_name,
    validate_requester, validate_time_range,
};
use super::transaction::SeriesTransaction;
use super::{apply_cancel, apply_update, Engine, EngineError, WalCommand};

/// A booking request as submitted: one anchor occurrence plus recurrence.
/// Required fields are optional here so that their absence is reported as
/// a validation error instead of failing earlier in parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingRequest {
    pub facility_id: Option<FacilityId>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<Minute>,
    pub end_time: Option<Minute>,
    pub color: Option<String>,
    pub recurrence: RecurrenceRequest,
    pub requester: Requester,
}

/// Everything shared by the occurrences of one series.
#[derive(Debug, Clone)]
pub struct BookingDraft {
    pub facility_id: FacilityId,
    pub time: TimeRange,
    pub color: String,
    pub requester: Requester,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesOutcome {
    pub created_count: usize,
    pub ids: Vec<BookingId>,
    pub dates: Vec<NaiveDate>,
}

/// Partial edit of one booking. `None` leaves a field alone; for the
/// requester fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub facility_id: Option<FacilityId>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<Minute>,
    pub end_time: Option<Minute>,
    pub color: Option<String>,
    pub requester_name: Option<Option<String>>,
    pub requester_phone: Option<Option<String>>,
    pub activity: Option<Option<String>>,
}

impl BookingPatch {
    fn apply_to(self, booking: &mut Booking) -> Result<(), EngineError> {
        let start = self.start_time.unwrap_or(booking.time.start);
        let end = self.end_time.unwrap_or(booking.time.end);
        booking.time = validate_time_range(start, end)?;
        if let Some(facility_id) = self.facility_id {
            booking.facility_id = facility_id;
        }
        if let Some(date) = self.date {
            booking.date = date;
        }
        if let Some(color) = self.color {
            validate_color(&color)?;
            booking.color = color;
        }
        if let Some(name) = self.requester_name {
            booking.requester.name = name;
        }
        if let Some(phone) = self.requester_phone {
            booking.requester.phone = phone;
        }
        if let Some(activity) = self.activity {
            booking.requester.activity = activity;
        }
        validate_requester(&booking.requester)
    }
}

type FacilityGuard = OwnedRwLockWriteGuard<FacilityState>;

fn require_admin(actor: &Actor, action: &str) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(format!(
            "user {} may not {action}",
            actor.user
        )))
    }
}

impl Engine {
    /// Validate a request, expand its recurrence and insert the whole series.
    pub async fn book(&self, actor: &Actor, request: BookingRequest) -> Result<SeriesOutcome, EngineError> {
        let facility_id = required(request.facility_id, "facility_id")?;
        let anchor = required(request.date, "date")?;
        let start = required(request.start_time, "start_time")?;
        let end = required(request.end_time, "end_time")?;
        let time = validate_time_range(start, end)?;
        let color = required(request.color, "color")?;
        let rule = request.recurrence.resolve(&self.policy)?;

        let dates = expand(anchor, &rule, &self.policy);
        let draft = BookingDraft {
            facility_id,
            time,
            color,
            requester: request.requester,
        };
        let ids = self.create_booking_series(&actor.user, &draft, &dates).await?;
        Ok(SeriesOutcome {
            created_count: ids.len(),
            ids,
            dates,
        })
    }

    /// Insert one booking per date, all or nothing.
    ///
    /// Dates are checked in ascending order; the first one that overlaps an
    /// existing booking (or an earlier date of the same series) aborts the
    /// transaction and is reported in the error.
    pub async fn create_booking_series(
        &self,
        owner: &str,
        draft: &BookingDraft,
        dates: &[NaiveDate],
    ) -> Result<Vec<BookingId>, EngineError> {
        if owner.is_empty() {
            return Err(EngineError::Validation("missing booking owner".into()));
        }
        if owner.len() > MAX_OWNER_LEN {
            return Err(EngineError::LimitExceeded("owner name too long"));
        }
        validate_color(&draft.color)?;
        validate_requester(&draft.requester)?;
        if dates.is_empty() {
            return Err(EngineError::Validation("series has no dates".into()));
        }
        if dates.len() > MAX_SERIES_LEN {
            return Err(EngineError::LimitExceeded("series too long"));
        }
        let mut dates = dates.to_vec();
        dates.sort_unstable();
        dates.dedup();

        let mut tx = SeriesTransaction::begin(self, draft.facility_id).await?;
        for date in dates {
            let booking = Booking {
                id: Ulid::new(),
                facility_id: draft.facility_id,
                owner: owner.to_string(),
                date,
                time: draft.time,
                color: draft.color.clone(),
                requester: draft.requester.clone(),
            };
            if let Err(e) = tx.stage(booking) {
                if let EngineError::Conflict { date, existing } = &e {
                    metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
                    tracing::debug!(
                        "series on facility {} rejected: {date} {} overlaps {existing}",
                        draft.facility_id,
                        draft.time
                    );
                }
                return Err(e);
            }
        }
        let ids = tx.commit().await?;

        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(ids.len() as u64);
        tracing::info!(
            "{owner} booked {} occurrence(s) of {} on facility {}",
            ids.len(),
            draft.time,
            draft.facility_id
        );
        Ok(ids)
    }

    /// Lock `source` and, if different, `target` in ascending id order.
    async fn lock_pair(
        &self,
        source: FacilityId,
        target: FacilityId,
    ) -> Result<(FacilityGuard, Option<FacilityGuard>), EngineError> {
        if source == target {
            return Ok((self.lock_facility(source).await?, None));
        }
        if source < target {
            let s = self.lock_facility(source).await?;
            let t = self.lock_facility(target).await?;
            Ok((s, Some(t)))
        } else {
            let t = self.lock_facility(target).await?;
            let s = self.lock_facility(source).await?;
            Ok((s, Some(t)))
        }
    }

    /// Lock the facility holding `id` and return the booking as it is now.
    /// Retries if a concurrent update moved it while we waited.
    async fn lock_booking(
        &self,
        id: BookingId,
        target: Option<FacilityId>,
    ) -> Result<(BookingLocation, Booking, FacilityGuard, Option<FacilityGuard>), EngineError> {
        loop {
            let location = self.locate(&id).ok_or(EngineError::BookingNotFound(id))?;
            let target = target.unwrap_or(location.facility_id);
            let (source, target) = match self.lock_pair(location.facility_id, target).await {
                Ok(guards) => guards,
                // Our source vanished under us; the booking went with it.
                Err(EngineError::FacilityNotFound(fid)) if fid == location.facility_id => {
                    return Err(EngineError::BookingNotFound(id));
                }
                Err(e) => return Err(e),
            };
            if let Some(current) = source.get_booking(location.date, id).cloned() {
                return Ok((location, current, source, target));
            }
            tracing::debug!("booking {id} moved while waiting for its lock, retrying");
        }
    }

    /// Edit one booking. The overlap check runs against every other booking
    /// on the target facility and date, never against the booking itself.
    pub async fn update_booking(
        &self,
        actor: &Actor,
        id: BookingId,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        if let Some(color) = &patch.color {
            validate_color(color)?;
        }
        let (previous, current, mut source, mut target) = self.lock_booking(id, patch.facility_id).await?;
        if !actor.may_modify(&current) {
            return Err(EngineError::Unauthorized(format!(
                "booking {id} belongs to {}",
                current.owner
            )));
        }

        let mut updated = current;
        patch.apply_to(&mut updated)?;

        let destination: &FacilityState = target.as_deref().unwrap_or(&*source);
        if target.is_some() && destination.booking_count() >= MAX_BOOKINGS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many bookings on facility"));
        }
        if let Err(e) = check_no_conflict(destination, updated.date, &updated.time, Some(id)) {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let event = Event::BookingUpdated {
            previous,
            booking: updated.clone(),
        };
        self.wal_append(&event).await?;
        apply_update(&mut source, target.as_deref_mut(), previous, updated.clone(), &self.locations);
        tracing::info!("{} updated booking {id}", actor.user);
        Ok(updated)
    }

    pub async fn cancel_booking(&self, actor: &Actor, id: BookingId) -> Result<Booking, EngineError> {
        let (location, current, mut guard, _) = self.lock_booking(id, None).await?;
        if !actor.may_modify(&current) {
            return Err(EngineError::Unauthorized(format!(
                "booking {id} belongs to {}",
                current.owner
            )));
        }
        self.wal_append(&Event::BookingCancelled { id, location }).await?;
        apply_cancel(&mut guard, id, location, &self.locations);
        tracing::info!("{} cancelled booking {id}", actor.user);
        Ok(current)
    }

    // ── Facility roster (admin only) ─────────────────────

    /// Register a facility. Without an explicit id the next free one
    /// (current maximum + 1) is assigned.
    pub async fn create_facility(
        &self,
        actor: &Actor,
        id: Option<FacilityId>,
        name: &str,
    ) -> Result<FacilityId, EngineError> {
        require_admin(actor, "create facilities")?;
        let name = validate_facility_name(name)?;
        let mut catalog = self.catalog.lock().await;
        if self.facilities.len() >= MAX_FACILITIES {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }
        let key = name_key(&name);
        if catalog.contains_key(&key) {
            return Err(EngineError::DuplicateName(name));
        }
        let id = match id {
            Some(id) if id <= 0 => {
                return Err(EngineError::Validation(format!("facility id must be positive, got {id}")));
            }
            Some(id) if self.facilities.contains_key(&id) => return Err(EngineError::FacilityExists(id)),
            Some(id) => id,
            None => self
                .facilities
                .iter()
                .map(|e| *e.key())
                .max()
                .unwrap_or(0)
                .checked_add(1)
                .ok_or(EngineError::LimitExceeded("facility ids exhausted"))?,
        };

        self.wal_append(&Event::FacilityCreated { id, name: name.clone() }).await?;
        tracing::info!("facility {id} created: {name}");
        self.facilities
            .insert(id, Arc::new(RwLock::new(FacilityState::new(id, name))));
        catalog.insert(key, id);
        Ok(id)
    }

    pub async fn rename_facility(&self, actor: &Actor, id: FacilityId, name: &str) -> Result<(), EngineError> {
        require_admin(actor, "rename facilities")?;
        let name = validate_facility_name(name)?;
        let mut catalog = self.catalog.lock().await;
        let mut guard = self.lock_facility(id).await?;
        let key = name_key(&name);
        if let Some(&other) = catalog.get(&key)
            && other != id
        {
            return Err(EngineError::DuplicateName(name));
        }

        self.wal_append(&Event::FacilityRenamed { id, name: name.clone() }).await?;
        catalog.remove(&name_key(&guard.name));
        catalog.insert(key, id);
        tracing::info!("facility {id} renamed: {} -> {name}", guard.name);
        guard.name = name;
        Ok(())
    }

    /// Remove a facility. Refused while it still has bookings.
    pub async fn delete_facility(&self, actor: &Actor, id: FacilityId) -> Result<(), EngineError> {
        require_admin(actor, "delete facilities")?;
        let mut catalog = self.catalog.lock().await;
        let guard = self.lock_facility(id).await?;
        if guard.booking_count() > 0 {
            return Err(EngineError::HasBookings(id));
        }

        self.wal_append(&Event::FacilityDeleted { id }).await?;
        self.facilities.remove(&id);
        catalog.remove(&name_key(&guard.name));
        tracing::info!("facility {id} deleted: {}", guard.name);
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal event set for the current state: one
    /// `FacilityCreated` per facility and one `SeriesBooked` with all of its
    /// bookings.
    ///
    /// The roster lock and a read lock on every facility (ascending id) are
    /// held until the writer has swapped the file, so no append can land
    /// between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut ids: Vec<FacilityId> = self.facilities.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(fs) = self.get_facility(&id) {
                guards.push(fs.read_owned().await);
            }
        }

        let mut events = Vec::with_capacity(guards.len() * 2);
        for fs in &guards {
            events.push(Event::FacilityCreated {
                id: fs.id,
                name: fs.name.clone(),
            });
            if fs.booking_count() > 0 {
                events.push(Event::SeriesBooked {
                    facility_id: fs.id,
                    bookings: fs.iter_bookings().cloned().collect(),
                });
            }
        }
        let event_count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {event_count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
