use chrono::{DateTime, NaiveDate, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::availability::DateStatus;
use crate::model::{Clock, Ms, TimeRange};

/// One bookable boundary at slot-interval granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub time: Clock,
    pub available: bool,
}

/// "Now" as seen from a space's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNow {
    pub date: NaiveDate,
    pub time: Clock,
}

impl LocalNow {
    pub fn at(tz: Tz, now: Ms) -> Self {
        let utc = DateTime::from_timestamp_millis(now).unwrap_or_default();
        let local = utc.with_timezone(&tz);
        let minutes = (local.hour() * 60 + local.minute()) as u16;
        Self {
            date: local.date_naive(),
            time: Clock::from_minutes(minutes).unwrap_or(Clock::MIDNIGHT),
        }
    }

    /// Whether a slot starting at `start` on `date` is already gone,
    /// counting `buffer_minutes` of notice after the current minute.
    pub fn has_passed(&self, date: NaiveDate, start: Clock, buffer_minutes: u16) -> bool {
        if date != self.date {
            return date < self.date;
        }
        start.minutes() <= self.time.minutes().saturating_add(buffer_minutes)
    }
}

/// Produce the slots of `date`, in ascending order.
///
/// Slots run at `slot_interval` steps across the span from the earliest
/// interval start to the latest interval end. A slot is available when its
/// whole window lies inside one interval, it is not already past (with
/// `buffer_minutes` of notice) and no busy window, widened by the buffer,
/// overlaps it.
pub fn generate_slots(
    date: NaiveDate,
    intervals: &[TimeRange],
    slot_interval: u16,
    buffer_minutes: u16,
    busy: &[TimeRange],
    now: LocalNow,
) -> Vec<TimeSlot> {
    let (Some(lo), Some(hi)) = (
        intervals.iter().map(|r| r.start).min(),
        intervals.iter().map(|r| r.end).max(),
    ) else {
        return Vec::new();
    };
    if slot_interval == 0 {
        return Vec::new();
    }

    let blocked: Vec<TimeRange> = busy.iter().map(|b| b.widen(buffer_minutes)).collect();
    let step = i32::from(slot_interval);
    let mut slots = Vec::new();
    let mut t = lo;
    while let Some(next) = t.add_minutes(step) {
        if next > hi {
            break;
        }
        let window = TimeRange::new(t, next);
        let inside = intervals.iter().any(|r| r.contains_range(&window));
        let passed = now.has_passed(date, t, buffer_minutes);
        let booked = blocked.iter().any(|b| b.overlaps(&window));
        slots.push(TimeSlot {
            time: t,
            available: inside && !passed && !booked,
        });
        t = next;
    }
    slots
}

/// Calendar summary of one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Available,
    Partial,
    Unavailable,
    /// Not bookable at all: past, beyond the horizon, or closed.
    Disabled,
}

pub fn day_status(date_status: DateStatus, slots: &[TimeSlot]) -> DayStatus {
    if !date_status.is_selectable() || slots.is_empty() {
        return DayStatus::Disabled;
    }
    let free = slots.iter().filter(|s| s.available).count();
    match free {
        0 => DayStatus::Unavailable,
        n if n == slots.len() => DayStatus::Available,
        _ => DayStatus::Partial,
    }
}
