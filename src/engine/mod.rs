mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod transaction;
#[cfg(test)]
mod tests;

pub use availability::{free_slots, merge_touching, subtract_ranges};
pub use error::EngineError;
pub use mutations::{BookingDraft, BookingPatch, BookingRequest, SeriesOutcome};
pub use queries::BookingFilter;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::recurrence::RecurrencePolicy;
use crate::wal::Wal;

use conflict::name_key;

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;

// ── WAL writer task ──────────────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that are already queued when the first one arrives
/// are committed together with a single fsync; maintenance commands run
/// after the batch ahead of them is durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Vec<PendingAppend> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut maintenance = match cmd {
            WalCommand::Append { event, response } => {
                pending.push((event, response));
                None
            }
            other => Some(other),
        };
        while maintenance.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => pending.push((event, response)),
                Ok(other) => maintenance = Some(other),
                Err(_) => break,
            }
        }
        if !pending.is_empty() {
            commit_batch(&mut wal, &mut pending);
        }
        if let Some(cmd) = maintenance {
            run_maintenance(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, pending: &mut Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(pending.len() as f64);
    let started = Instant::now();
    let result = pending
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    // A failed batch is rejected as a whole, so none of it may replay later.
    if let Err(e) = &result {
        tracing::error!("WAL commit of {} events failed: {e}", pending.len());
        if let Err(e) = wal.discard_unsynced() {
            tracing::error!("discarding failed WAL batch: {e}");
        }
    }
    for (_, response) in pending.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

fn run_maintenance(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── State application ────────────────────────────────────

pub(super) fn apply_series(
    fs: &mut FacilityState,
    bookings: Vec<Booking>,
    locations: &DashMap<BookingId, BookingLocation>,
) {
    for booking in bookings {
        locations.insert(booking.id, booking.location());
        fs.insert_booking(booking);
    }
}

/// Move/replace a booking. `target` is `None` when it stays on `source`.
pub(super) fn apply_update(
    source: &mut FacilityState,
    target: Option<&mut FacilityState>,
    previous: BookingLocation,
    booking: Booking,
    locations: &DashMap<BookingId, BookingLocation>,
) {
    source.remove_booking(previous.date, booking.id);
    locations.insert(booking.id, booking.location());
    match target {
        Some(target) => target.insert_booking(booking),
        None => source.insert_booking(booking),
    }
}

pub(super) fn apply_cancel(
    fs: &mut FacilityState,
    id: BookingId,
    location: BookingLocation,
    locations: &DashMap<BookingId, BookingLocation>,
) {
    fs.remove_booking(location.date, id);
    locations.remove(&id);
}

/// Plain-map state used while replaying, before anything is shared.
#[derive(Default)]
struct Replayed {
    facilities: BTreeMap<FacilityId, FacilityState>,
    locations: DashMap<BookingId, BookingLocation>,
}

impl Replayed {
    fn apply(&mut self, event: Event) {
        match event {
            Event::FacilityCreated { id, name } => {
                self.facilities.insert(id, FacilityState::new(id, name));
            }
            Event::FacilityRenamed { id, name } => {
                if let Some(fs) = self.facilities.get_mut(&id) {
                    fs.name = name;
                }
            }
            Event::FacilityDeleted { id } => {
                self.facilities.remove(&id);
            }
            Event::SeriesBooked { facility_id, bookings } => {
                if let Some(fs) = self.facilities.get_mut(&facility_id) {
                    apply_series(fs, bookings, &self.locations);
                }
            }
            Event::BookingUpdated { previous, booking } => {
                if previous.facility_id == booking.facility_id {
                    if let Some(fs) = self.facilities.get_mut(&previous.facility_id) {
                        apply_update(fs, None, previous, booking, &self.locations);
                    }
                } else {
                    if let Some(source) = self.facilities.get_mut(&previous.facility_id) {
                        source.remove_booking(previous.date, booking.id);
                    }
                    if let Some(target) = self.facilities.get_mut(&booking.facility_id) {
                        self.locations.insert(booking.id, booking.location());
                        target.insert_booking(booking);
                    }
                }
            }
            Event::BookingCancelled { id, location } => {
                if let Some(fs) = self.facilities.get_mut(&location.facility_id) {
                    apply_cancel(fs, id, location, &self.locations);
                }
            }
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// The booking store: facility calendars in memory, durable through the WAL.
///
/// Every facility sits behind its own `RwLock`; a facility's write lock is
/// the row lock for everything that checks and then mutates its calendar.
pub struct Engine {
    pub(super) facilities: DashMap<FacilityId, SharedFacilityState>,
    /// Booking id → facility and date.
    pub(super) locations: DashMap<BookingId, BookingLocation>,
    /// Case-folded facility name → id. Locking it also serializes facility
    /// create/rename/delete.
    pub(super) catalog: Mutex<HashMap<String, FacilityId>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) policy: RecurrencePolicy,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    pub fn new(wal_path: PathBuf, policy: RecurrencePolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        Ok(Self::from_wal(wal, events, policy))
    }

    /// Build state from already replayed `events` and hand `wal` to the
    /// writer task.
    fn from_wal(wal: Wal, events: Vec<Event>, policy: RecurrencePolicy) -> Self {
        let event_count = events.len();
        let wal_path = wal.path().to_path_buf();
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replayed = Replayed::default();
        for event in events {
            replayed.apply(event);
        }

        let facilities = DashMap::new();
        let mut names = HashMap::new();
        for (id, fs) in replayed.facilities {
            names.insert(name_key(&fs.name), id);
            facilities.insert(id, Arc::new(RwLock::new(fs)));
        }
        tracing::info!(
            "replayed {event_count} events from {}: {} facilities, {} bookings",
            wal_path.display(),
            facilities.len(),
            replayed.locations.len()
        );

        Self {
            facilities,
            locations: replayed.locations,
            catalog: Mutex::new(names),
            wal_tx,
            policy,
        }
    }

    /// Hand an event to the writer task and wait until it is durable.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_facility(&self, id: &FacilityId) -> Option<SharedFacilityState> {
        self.facilities.get(id).map(|e| e.value().clone())
    }

    pub fn locate(&self, booking_id: &BookingId) -> Option<BookingLocation> {
        self.locations.get(booking_id).map(|e| *e.value())
    }

    /// Take a facility's write lock. Fails if the facility is deleted (or
    /// replaced) while we wait.
    pub(super) async fn lock_facility(
        &self,
        id: FacilityId,
    ) -> Result<OwnedRwLockWriteGuard<FacilityState>, EngineError> {
        let shared = self.get_facility(&id).ok_or(EngineError::FacilityNotFound(id))?;
        let guard = shared.clone().write_owned().await;
        match self.facilities.get(&id) {
            Some(current) if Arc::ptr_eq(current.value(), &shared) => Ok(guard),
            _ => Err(EngineError::FacilityNotFound(id)),
        }
    }
}
