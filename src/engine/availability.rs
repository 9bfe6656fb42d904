use chrono::NaiveDate;

use crate::model::*;

// ── Free-slot computation ────────────────────────────────────────

/// Free gaps of `fs` on `date` inside `window`, ascending and disjoint.
pub fn free_slots(fs: &FacilityState, date: NaiveDate, window: &TimeRange) -> Vec<TimeRange> {
    // Days are kept sorted by start, so the clamped ranges are sorted too.
    let busy: Vec<TimeRange> = fs
        .overlapping(date, window)
        .filter_map(|b| TimeRange::new(b.time.start.max(window.start), b.time.end.min(window.end)))
        .collect();
    subtract_ranges(&[*window], &merge_touching(&busy))
}

/// Merge sorted overlapping or touching ranges into disjoint ranges.
pub fn merge_touching(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
pub fn subtract_ranges(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if let Some(gap) = TimeRange::new(current_start, r.start) {
                result.push(gap);
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if let Some(tail) = TimeRange::new(current_start, b.end) {
            result.push(tail);
        }
    }

    result
}
