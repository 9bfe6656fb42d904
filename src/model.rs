use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type FacilityId = i64;
pub type BookingId = Ulid;

/// Minutes since midnight, `0..=1440`. The only time-of-day type.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Parse `HH:MM` or `HH:MM:SS` into minutes since midnight.
/// `24:00` is accepted as the end of the day; seconds must be zero.
pub fn parse_clock(s: &str) -> Option<Minute> {
    let mut parts = s.trim().split(':');
    let hours: u16 = parts.next()?.parse().ok()?;
    let minutes: u16 = parts.next()?.parse().ok()?;
    if let Some(seconds) = parts.next() {
        let seconds: u16 = seconds.parse().ok()?;
        if seconds != 0 {
            return None;
        }
    }
    if parts.next().is_some() || minutes >= 60 {
        return None;
    }
    let total = hours.checked_mul(60)?.checked_add(minutes)?;
    (total <= MINUTES_PER_DAY).then_some(total)
}

pub fn format_clock(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Half-open time-of-day interval `[start, end)` on a single date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Minute,
    pub end: Minute,
}

impl TimeRange {
    /// `None` unless `start < end <= 24:00`.
    pub fn new(start: Minute, end: Minute) -> Option<Self> {
        (start < end && end <= MINUTES_PER_DAY).then_some(Self { start, end })
    }

    pub fn whole_day() -> Self {
        Self { start: 0, end: MINUTES_PER_DAY }
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_clock(self.start), format_clock(self.end))
    }
}

/// Who asked for a booking and what for. All fields optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub activity: Option<String>,
}

/// One reserved interval on one facility on one date. Occurrences of a
/// recurring request are stored as independent bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub facility_id: FacilityId,
    pub owner: String,
    pub date: NaiveDate,
    pub time: TimeRange,
    pub color: String,
    pub requester: Requester,
}

impl Booking {
    pub fn location(&self) -> BookingLocation {
        BookingLocation {
            facility_id: self.facility_id,
            date: self.date,
        }
    }
}

/// Where a booking lives: enough to find its row without scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingLocation {
    pub facility_id: FacilityId,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user: String,
    pub role: Role,
}

impl Actor {
    pub fn user(name: impl Into<String>) -> Self {
        Self { user: name.into(), role: Role::User }
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self { user: name.into(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owners and admins may edit or delete a booking; nobody else.
    pub fn may_modify(&self, booking: &Booking) -> bool {
        self.is_admin() || booking.owner == self.user
    }
}

#[derive(Debug, Clone)]
pub struct FacilityState {
    pub id: FacilityId,
    pub name: String,
    /// Bookings grouped per date, each day sorted by `time.start`.
    days: BTreeMap<NaiveDate, Vec<Booking>>,
    booking_count: usize,
}

impl FacilityState {
    pub fn new(id: FacilityId, name: String) -> Self {
        Self {
            id,
            name,
            days: BTreeMap::new(),
            booking_count: 0,
        }
    }

    pub fn booking_count(&self) -> usize {
        self.booking_count
    }

    pub fn bookings_on(&self, date: NaiveDate) -> &[Booking] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All bookings, ascending by date then start time.
    pub fn iter_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.days.values().flatten()
    }

    /// Bookings with dates in `[from, to]`, ascending.
    pub fn bookings_between(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = &Booking> {
        let range = if from <= to { Some(from..=to) } else { None };
        range
            .into_iter()
            .flat_map(move |r| self.days.range(r))
            .flat_map(|(_, day)| day.iter())
    }

    pub fn get_booking(&self, date: NaiveDate, id: BookingId) -> Option<&Booking> {
        self.bookings_on(date).iter().find(|b| b.id == id)
    }

    /// Insert keeping the day sorted by start time.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.days.entry(booking.date).or_default();
        let pos = day.partition_point(|b| b.time.start <= booking.time.start);
        day.insert(pos, booking);
        self.booking_count += 1;
    }

    pub fn remove_booking(&mut self, date: NaiveDate, id: BookingId) -> Option<Booking> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        self.booking_count -= 1;
        Some(removed)
    }

    /// Bookings on `date` whose range overlaps `range`.
    /// Everything starting at or after `range.end` is skipped by binary search.
    pub fn overlapping(&self, date: NaiveDate, range: &TimeRange) -> impl Iterator<Item = &Booking> {
        let day = self.bookings_on(date);
        let right_bound = day.partition_point(|b| b.time.start < range.end);
        let range = *range;
        day[..right_bound]
            .iter()
            .filter(move |b| b.time.end > range.start)
    }
}

/// WAL record format. A whole booking series is one record, so a series is
/// either fully durable or absent after replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityCreated {
        id: FacilityId,
        name: String,
    },
    FacilityRenamed {
        id: FacilityId,
        name: String,
    },
    FacilityDeleted {
        id: FacilityId,
    },
    SeriesBooked {
        facility_id: FacilityId,
        bookings: Vec<Booking>,
    },
    BookingUpdated {
        previous: BookingLocation,
        booking: Booking,
    },
    BookingCancelled {
        id: BookingId,
        location: BookingLocation,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityInfo {
    pub id: FacilityId,
    pub name: String,
    pub booking_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub booking: Booking,
    pub facility_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn booking(d: &str, start: &str, end: &str) -> Booking {
        Booking {
            id: Ulid::new(),
            facility_id: 1,
            owner: "ana".into(),
            date: date(d),
            time: TimeRange::new(parse_clock(start).unwrap(), parse_clock(end).unwrap()).unwrap(),
            color: "azul".into(),
            requester: Requester::default(),
        }
    }

    #[test]
    fn clock_parsing() {
        assert_eq!(parse_clock("06:00"), Some(360));
        assert_eq!(parse_clock("6:30"), Some(390));
        assert_eq!(parse_clock("08:15:00"), Some(495));
        assert_eq!(parse_clock("24:00"), Some(1440));
        assert_eq!(parse_clock("24:01"), None);
        assert_eq!(parse_clock("10:60"), None);
        assert_eq!(parse_clock("10:00:30"), None);
        assert_eq!(parse_clock("ten"), None);
        assert_eq!(parse_clock(""), None);
        assert_eq!(format_clock(495), "08:15");
    }

    #[test]
    fn time_range_rejects_empty_and_reversed() {
        assert!(TimeRange::new(600, 600).is_none());
        assert!(TimeRange::new(660, 600).is_none());
        assert!(TimeRange::new(0, 1441).is_none());
        assert_eq!(TimeRange::new(0, 1440), Some(TimeRange::whole_day()));
    }

    #[test]
    fn time_range_overlap_is_half_open() {
        let a = TimeRange::new(480, 540).unwrap(); // 08:00-09:00
        let b = TimeRange::new(510, 570).unwrap(); // 08:30-09:30
        let c = TimeRange::new(540, 600).unwrap(); // 09:00-10:00
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // touching
        assert_eq!(a.to_string(), "08:00-09:00");
    }

    #[test]
    fn day_stays_sorted() {
        let mut fs = FacilityState::new(1, "Cancha 1".into());
        fs.insert_booking(booking("2024-01-01", "10:00", "11:00"));
        fs.insert_booking(booking("2024-01-01", "06:00", "07:00"));
        fs.insert_booking(booking("2024-01-01", "08:00", "09:00"));
        let starts: Vec<_> = fs
            .bookings_on(date("2024-01-01"))
            .iter()
            .map(|b| b.time.start)
            .collect();
        assert_eq!(starts, vec![360, 480, 600]);
        assert_eq!(fs.booking_count(), 3);
    }

    #[test]
    fn overlapping_is_per_date() {
        let mut fs = FacilityState::new(1, "Cancha 1".into());
        fs.insert_booking(booking("2024-01-01", "08:00", "09:00"));
        fs.insert_booking(booking("2024-01-02", "08:00", "09:00"));

        let q = TimeRange::new(510, 570).unwrap();
        assert_eq!(fs.overlapping(date("2024-01-01"), &q).count(), 1);
        assert_eq!(fs.overlapping(date("2024-01-03"), &q).count(), 0);
    }

    #[test]
    fn overlapping_skips_adjacent() {
        let mut fs = FacilityState::new(1, "Cancha 1".into());
        fs.insert_booking(booking("2024-01-01", "08:00", "09:00"));
        fs.insert_booking(booking("2024-01-01", "10:00", "11:00"));

        let q = TimeRange::new(540, 600).unwrap(); // 09:00-10:00
        assert_eq!(fs.overlapping(date("2024-01-01"), &q).count(), 0);

        let wide = TimeRange::new(0, 1440).unwrap();
        assert_eq!(fs.overlapping(date("2024-01-01"), &wide).count(), 2);
    }

    #[test]
    fn remove_drops_empty_day() {
        let mut fs = FacilityState::new(1, "Cancha 1".into());
        let b = booking("2024-01-01", "08:00", "09:00");
        let id = b.id;
        fs.insert_booking(b);
        assert!(fs.remove_booking(date("2024-01-01"), Ulid::new()).is_none());
        assert!(fs.remove_booking(date("2024-01-01"), id).is_some());
        assert_eq!(fs.booking_count(), 0);
        assert!(fs.bookings_on(date("2024-01-01")).is_empty());
        assert_eq!(fs.iter_bookings().count(), 0);
    }

    #[test]
    fn bookings_between_is_inclusive() {
        let mut fs = FacilityState::new(1, "Cancha 1".into());
        for d in ["2024-01-01", "2024-01-05", "2024-01-10"] {
            fs.insert_booking(booking(d, "08:00", "09:00"));
        }
        let hits: Vec<_> = fs
            .bookings_between(date("2024-01-05"), date("2024-01-10"))
            .map(|b| b.date)
            .collect();
        assert_eq!(hits, vec![date("2024-01-05"), date("2024-01-10")]);
        assert_eq!(fs.bookings_between(date("2024-02-01"), date("2024-01-01")).count(), 0);
    }

    #[test]
    fn owner_or_admin_may_modify() {
        let b = booking("2024-01-01", "08:00", "09:00");
        assert!(Actor::user("ana").may_modify(&b));
        assert!(Actor::admin("root").may_modify(&b));
        assert!(!Actor::user("luis").may_modify(&b));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SeriesBooked {
            facility_id: 1,
            bookings: vec![booking("2024-01-01", "06:00", "08:00")],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
