//! Seat accounting for spaces that host more than one booker at a time.

use crate::model::{Clock, TimeRange};

/// Sweep events: `(time, delta)` sorted so releases at an instant come
/// before acquisitions, which keeps touching ranges from stacking.
fn sweep_events(allocs: &[(TimeRange, u32)]) -> Vec<(Clock, i64)> {
    let mut events: Vec<(Clock, i64)> = Vec::with_capacity(allocs.len() * 2);
    for (range, seats) in allocs {
        events.push((range.start, i64::from(*seats)));
        events.push((range.end, -i64::from(*seats)));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    events
}

/// Highest number of seats in use at any instant.
pub fn peak_usage(allocs: &[(TimeRange, u32)]) -> u32 {
    let mut used: i64 = 0;
    let mut peak: i64 = 0;
    for (_, delta) in sweep_events(allocs) {
        used += delta;
        peak = peak.max(used);
    }
    u32::try_from(peak).unwrap_or(u32::MAX)
}

/// Peak usage counting only the part of each allocation inside `window`.
pub fn peak_usage_within(allocs: &[(TimeRange, u32)], window: &TimeRange) -> u32 {
    let clipped: Vec<(TimeRange, u32)> = allocs
        .iter()
        .filter_map(|(r, seats)| {
            TimeRange::checked(r.start.max(window.start), r.end.min(window.end)).map(|c| (c, *seats))
        })
        .collect();
    peak_usage(&clipped)
}

/// Ranges during which usage reaches `capacity` (no seat left).
pub fn saturated_spans(allocs: &[(TimeRange, u32)], capacity: u32) -> Vec<TimeRange> {
    if allocs.is_empty() || capacity == 0 {
        return Vec::new();
    }
    let capacity = i64::from(capacity);
    let mut result: Vec<TimeRange> = Vec::new();
    let mut used: i64 = 0;
    let mut saturated_from: Option<Clock> = None;

    for (time, delta) in sweep_events(allocs) {
        used += delta;
        if used >= capacity && saturated_from.is_none() {
            saturated_from = Some(time);
        } else if used < capacity
            && let Some(start) = saturated_from.take()
            && let Some(span) = TimeRange::checked(start, time)
        {
            match result.last_mut() {
                Some(last) if last.end == span.start => last.end = span.end,
                _ => result.push(span),
            }
        }
    }
    result
}
