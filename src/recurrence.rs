//! Expansion of a recurrence rule into concrete booking dates.
//!
//! The expansion is a pure function of `(anchor, rule, policy)`: every step
//! derives a fresh date from the anchor, nothing is mutated in place, and the
//! result is always non-empty and strictly ascending.

use std::fmt;

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};

use crate::limits::{MAX_RECURRENCE_INTERVAL, MAX_SERIES_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    None,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl Frequency {
    /// Accepts the English names and the Spanish ones used by the booking form.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "nunca" | "" => Some(Frequency::None),
            "daily" | "diario" => Some(Frequency::Daily),
            "weekly" | "semanal" => Some(Frequency::Weekly),
            "monthly" | "mensual" => Some(Frequency::Monthly),
            "custom" => Some(Frequency::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    ByCount,
    ByEndDate,
}

impl TerminationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "by-count" | "count" | "repeticiones" => Some(TerminationMode::ByCount),
            "by-end-date" | "end-date" | "fecha" => Some(TerminationMode::ByEndDate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    ByCount(usize),
    /// Inclusive.
    ByEndDate(NaiveDate),
}

/// Set of weekdays, Sunday = 0 .. Saturday = 6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    /// `None` if any index is outside `0..=6`.
    pub fn from_indices(indices: &[u8]) -> Option<Self> {
        let mut bits = 0u8;
        for &i in indices {
            if i > 6 {
                return None;
            }
            bits |= 1 << i;
        }
        Some(Self(bits))
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub weekdays: WeekdaySet,
    pub termination: Termination,
}

impl RecurrenceRule {
    pub fn once() -> Self {
        Self {
            frequency: Frequency::None,
            interval: 1,
            weekdays: WeekdaySet::default(),
            termination: Termination::ByCount(1),
        }
    }
}

/// Tunables for expansion. Loaded from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurrencePolicy {
    /// Count used for `by-count` when the request gives none.
    pub default_repeat_count: usize,
    /// Weekly/custom walks never go further than this many days past the anchor.
    pub max_walk_days: u32,
    /// Hard cap on occurrences for any rule.
    pub max_occurrences: usize,
}

impl Default for RecurrencePolicy {
    fn default() -> Self {
        Self {
            default_repeat_count: 12,
            max_walk_days: 730,
            max_occurrences: MAX_SERIES_LEN,
        }
    }
}

/// Recurrence fields exactly as the client sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRequest {
    pub frequency: Frequency,
    pub interval: Option<u32>,
    pub weekdays: Vec<u8>,
    pub termination: Option<TerminationMode>,
    pub count: Option<u32>,
    pub end_date: Option<NaiveDate>,
}

impl Default for RecurrenceRequest {
    fn default() -> Self {
        Self {
            frequency: Frequency::None,
            interval: None,
            weekdays: Vec::new(),
            termination: None,
            count: None,
            end_date: None,
        }
    }
}

impl RecurrenceRequest {
    /// Validate and fill defaults. Without an explicit mode, an end date
    /// selects `by-end-date`; otherwise the rule is `by-count`.
    pub fn resolve(&self, policy: &RecurrencePolicy) -> Result<RecurrenceRule, InvalidRecurrence> {
        let interval = self.interval.unwrap_or(1);
        if interval == 0 {
            return Err(InvalidRecurrence::ZeroInterval);
        }
        if interval > MAX_RECURRENCE_INTERVAL {
            return Err(InvalidRecurrence::IntervalTooLarge(interval));
        }
        let weekdays = WeekdaySet::from_indices(&self.weekdays).ok_or_else(|| {
            let bad = self.weekdays.iter().copied().find(|d| *d > 6).unwrap_or_default();
            InvalidRecurrence::BadWeekday(bad)
        })?;

        let mode = self.termination.unwrap_or(if self.end_date.is_some() {
            TerminationMode::ByEndDate
        } else {
            TerminationMode::ByCount
        });
        let termination = match mode {
            TerminationMode::ByCount => {
                let count = self
                    .count
                    .map(|c| c as usize)
                    .unwrap_or(policy.default_repeat_count);
                if count == 0 {
                    return Err(InvalidRecurrence::ZeroCount);
                }
                if count > policy.max_occurrences {
                    return Err(InvalidRecurrence::CountTooLarge(count));
                }
                Termination::ByCount(count)
            }
            TerminationMode::ByEndDate => {
                Termination::ByEndDate(self.end_date.ok_or(InvalidRecurrence::MissingEndDate)?)
            }
        };

        Ok(RecurrenceRule {
            frequency: self.frequency,
            interval,
            weekdays,
            termination,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidRecurrence {
    ZeroInterval,
    IntervalTooLarge(u32),
    ZeroCount,
    CountTooLarge(usize),
    MissingEndDate,
    BadWeekday(u8),
}

impl fmt::Display for InvalidRecurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidRecurrence::ZeroInterval => write!(f, "interval must be at least 1"),
            InvalidRecurrence::IntervalTooLarge(n) => {
                write!(f, "interval {n} exceeds {MAX_RECURRENCE_INTERVAL}")
            }
            InvalidRecurrence::ZeroCount => write!(f, "repeat count must be at least 1"),
            InvalidRecurrence::CountTooLarge(n) => write!(f, "repeat count {n} is too large"),
            InvalidRecurrence::MissingEndDate => {
                write!(f, "by-end-date termination requires end_date")
            }
            InvalidRecurrence::BadWeekday(d) => write!(f, "weekday {d} outside 0..6"),
        }
    }
}

impl std::error::Error for InvalidRecurrence {}

/// Termination bookkeeping shared by every frequency.
struct Collector {
    dates: Vec<NaiveDate>,
    termination: Termination,
    cap: usize,
}

impl Collector {
    fn new(termination: Termination, cap: usize) -> Self {
        Self {
            dates: Vec::new(),
            termination,
            cap,
        }
    }

    /// True once no further candidate can be collected.
    fn done(&self, candidate: NaiveDate) -> bool {
        if self.dates.len() >= self.cap {
            return true;
        }
        match self.termination {
            Termination::ByCount(n) => self.dates.len() >= n,
            Termination::ByEndDate(end) => candidate > end,
        }
    }

    fn finish(mut self, anchor: NaiveDate) -> Vec<NaiveDate> {
        if self.dates.is_empty() {
            self.dates.push(anchor);
        }
        self.dates
    }
}

/// Expand `rule` from `anchor` into candidate booking dates.
pub fn expand(anchor: NaiveDate, rule: &RecurrenceRule, policy: &RecurrencePolicy) -> Vec<NaiveDate> {
    let mut c = Collector::new(rule.termination, policy.max_occurrences.max(1));
    let step = u64::from(rule.interval.max(1));

    match rule.frequency {
        Frequency::None => return vec![anchor],
        Frequency::Daily => {
            for k in 0u64.. {
                let Some(date) = k
                    .checked_mul(step)
                    .and_then(|days| anchor.checked_add_days(Days::new(days)))
                else {
                    break;
                };
                if c.done(date) {
                    break;
                }
                c.dates.push(date);
            }
        }
        Frequency::Monthly => {
            for k in 0u32.. {
                let Some(date) = k
                    .checked_mul(rule.interval.max(1))
                    .and_then(|months| anchor.checked_add_months(Months::new(months)))
                else {
                    break;
                };
                if c.done(date) {
                    break;
                }
                c.dates.push(date);
            }
        }
        Frequency::Weekly | Frequency::Custom => {
            if rule.weekdays.is_empty() {
                return vec![anchor];
            }
            let mut week = 0u64;
            for offset in 0..=u64::from(policy.max_walk_days) {
                let Some(date) = anchor.checked_add_days(Days::new(offset)) else {
                    break;
                };
                if offset > 0 && date.weekday() == Weekday::Mon {
                    week += 1;
                }
                if c.done(date) {
                    break;
                }
                if week % step == 0 && rule.weekdays.contains(date.weekday()) {
                    c.dates.push(date);
                }
            }
        }
    }

    c.finish(anchor)
}
