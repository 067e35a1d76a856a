use chrono::{Days, NaiveDate};
use tracing::warn;
use ulid::Ulid;

use crate::availability::{DayAvailability, merge_touching};
use crate::limits::*;
use crate::model::*;
use crate::slots::LocalNow;

use super::StoreError;
use super::capacity::peak_usage_within;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_range(start: Clock, end: Clock) -> Result<TimeRange, StoreError> {
    TimeRange::checked(start, end)
        .ok_or_else(|| StoreError::invalid_range(format!("{start} is not before {end}")))
}

pub(crate) fn validate_settings(settings: &SpaceSettings) -> Result<(), StoreError> {
    if settings.capacity == 0 || settings.capacity > MAX_CAPACITY {
        return Err(StoreError::limit("capacity out of range"));
    }
    if !(MIN_SLOT_INTERVAL..=MAX_SLOT_INTERVAL).contains(&settings.slot_interval_minutes) {
        return Err(StoreError::limit("slot interval out of range"));
    }
    if settings.buffer_minutes > MAX_BUFFER_MINUTES {
        return Err(StoreError::limit("buffer too long"));
    }
    if !settings.rates.within(MAX_RATE_CENTS) {
        return Err(StoreError::limit("rate out of range"));
    }
    Ok(())
}

/// Reject requests for windows that can never be booked: past dates or
/// slots, dates beyond the horizon, and windows outside opening hours.
/// Undecodable availability is checked against the fallback hours the slot
/// generator offers for such days.
pub(crate) fn check_bookable(
    ss: &SpaceState,
    date: NaiveDate,
    range: &TimeRange,
    now: Ms,
) -> Result<(), StoreError> {
    let local = LocalNow::at(ss.settings.timezone, now);
    if local.has_passed(date, range.start, ss.settings.buffer_minutes) {
        return Err(StoreError::invalid_range(format!("{date} {} has already passed", range.start)));
    }
    let horizon = local
        .date
        .checked_add_days(Days::new(u64::from(MAX_HORIZON_DAYS)));
    if horizon.is_none_or(|limit| date > limit) {
        return Err(StoreError::invalid_range(format!("{date} is beyond the booking horizon")));
    }

    let day = ss.availability.effective(date);
    if day == DayAvailability::Unknown {
        warn!(space = %ss.id, %date, "availability unknown, checking against fallback hours");
    }
    let open = merge_touching(&day.intervals_or_fallback());
    if open.iter().any(|interval| interval.contains_range(range)) {
        Ok(())
    } else {
        Err(StoreError::OutsideAvailability { date, range: *range })
    }
}

/// Active claims on `date` whose buffered window overlaps `range`.
/// `ignore` skips the caller's own hold when it re-acquires.
pub(crate) fn blocking_claims(
    ss: &SpaceState,
    date: NaiveDate,
    range: &TimeRange,
    now: Ms,
    ignore: Option<Ulid>,
) -> Vec<Claim> {
    let buffer = ss.settings.buffer_minutes;
    ss.overlapping(date, &range.widen(buffer))
        .filter(|c| Some(c.id()) != ignore && c.is_active(now))
        .filter(|c| c.range().widen(buffer).overlaps(range))
        .cloned()
        .collect()
}

/// Whether `seats` more can occupy `range`. Exclusive spaces reject on any
/// overlapping active claim; shared spaces on peak usage over capacity.
pub(crate) fn check_no_conflict(
    ss: &SpaceState,
    date: NaiveDate,
    range: &TimeRange,
    seats: u32,
    now: Ms,
    ignore: Option<Ulid>,
) -> Result<(), StoreError> {
    let capacity = ss.settings.capacity;
    if seats > capacity {
        return Err(StoreError::CapacityExceeded { capacity, conflicts: Vec::new() });
    }
    let blocking = blocking_claims(ss, date, range, now, ignore);
    if blocking.is_empty() {
        return Ok(());
    }
    if capacity <= 1 {
        return Err(StoreError::Conflict { conflicts: blocking });
    }

    let buffer = ss.settings.buffer_minutes;
    let allocs: Vec<(TimeRange, u32)> = blocking
        .iter()
        .map(|c| (c.range().widen(buffer), c.seats()))
        .collect();
    if peak_usage_within(&allocs, range) + seats > capacity {
        return Err(StoreError::CapacityExceeded { capacity, conflicts: blocking });
    }
    Ok(())
}
