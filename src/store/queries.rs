use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::availability::AvailabilityPayload;
use crate::limits::*;
use crate::model::*;
use crate::slots::{LocalNow, TimeSlot, generate_slots};

use super::capacity::{peak_usage_within, saturated_spans};
use super::conflict::{blocking_claims, check_bookable, validate_range};
use super::{Store, StoreError};

/// Windows on `date` with no seat left, as booked. The slot generator
/// applies the buffer around them.
fn busy_ranges(ss: &SpaceState, date: NaiveDate, now: Ms) -> Vec<TimeRange> {
    let allocs: Vec<(TimeRange, u32)> = ss
        .days
        .get(&date)
        .into_iter()
        .flatten()
        .filter(|c| c.is_active(now))
        .map(|c| (c.range(), c.seats()))
        .collect();
    saturated_spans(&allocs, ss.settings.capacity)
}

fn day_slots(ss: &SpaceState, date: NaiveDate, now: Ms) -> Vec<TimeSlot> {
    let settings = &ss.settings;
    generate_slots(
        date,
        &ss.availability.effective(date).intervals_or_fallback(),
        settings.slot_interval_minutes,
        settings.buffer_minutes,
        &busy_ranges(ss, date, now),
        LocalNow::at(settings.timezone, now),
    )
}

impl Store {
    pub async fn get_space(&self, id: SpaceId) -> Result<SpaceInfo, StoreError> {
        let space = self.space_or_not_found(id)?;
        let guard = space.read().await;
        Ok(SpaceInfo {
            id: guard.id,
            name: guard.name.clone(),
            settings: guard.settings.clone(),
            availability: guard.availability.clone(),
        })
    }

    pub async fn get_availability(&self, id: SpaceId) -> Result<AvailabilityPayload, StoreError> {
        let space = self.space_or_not_found(id)?;
        let guard = space.read().await;
        Ok(guard.availability.clone())
    }

    /// Advisory overlap check. Reads under a shared lock and takes nothing,
    /// so a clear report guarantees nothing about a later lock attempt.
    pub async fn check_conflicts(
        &self,
        space_id: SpaceId,
        date: NaiveDate,
        start: Clock,
        end: Clock,
        seats: u32,
        now: Ms,
    ) -> Result<ConflictReport, StoreError> {
        let range = validate_range(start, end)?;
        let space = self.space_or_not_found(space_id)?;
        let guard = space.read().await;
        let conflicting = blocking_claims(&guard, date, &range, now, None);
        let capacity = guard.settings.capacity;
        let has_conflict = if capacity <= 1 {
            !conflicting.is_empty()
        } else {
            let buffer = guard.settings.buffer_minutes;
            let allocs: Vec<(TimeRange, u32)> = conflicting
                .iter()
                .map(|c| (c.range().widen(buffer), c.seats()))
                .collect();
            peak_usage_within(&allocs, &range) + seats.max(1) > capacity
        };
        Ok(ConflictReport { has_conflict, conflicting })
    }

    /// Active holds and bookings on `date`, sorted by start.
    pub async fn day_claims(&self, space_id: SpaceId, date: NaiveDate, now: Ms) -> Result<Vec<Claim>, StoreError> {
        let space = self.space_or_not_found(space_id)?;
        let guard = space.read().await;
        Ok(guard
            .days
            .get(&date)
            .into_iter()
            .flatten()
            .filter(|c| c.is_active(now))
            .cloned()
            .collect())
    }

    /// Slots of `date` as the store currently sees them.
    pub async fn day_slots(&self, space_id: SpaceId, date: NaiveDate, now: Ms) -> Result<Vec<TimeSlot>, StoreError> {
        let space = self.space_or_not_found(space_id)?;
        let guard = space.read().await;
        Ok(day_slots(&guard, date, now))
    }

    /// Start slots on `date` from which a contiguous run of
    /// `duration_minutes` is free, earliest first.
    pub async fn alternative_slots(
        &self,
        space_id: SpaceId,
        date: NaiveDate,
        duration_minutes: u32,
        now: Ms,
    ) -> Result<Vec<TimeSlot>, StoreError> {
        if duration_minutes == 0 || duration_minutes > u32::from(Clock::END_OF_DAY.minutes()) {
            return Err(StoreError::invalid_range("duration out of range"));
        }
        let space = self.space_or_not_found(space_id)?;
        let guard = space.read().await;
        let interval = guard.settings.slot_interval_minutes;
        let slots = day_slots(&guard, date, now);
        let needed = duration_minutes.div_ceil(u32::from(interval)) as usize;
        let step = i32::from(interval);

        let starts = slots
            .windows(needed)
            .filter(|run| {
                run.iter().all(|s| s.available)
                    && run.windows(2).all(|w| w[0].time.add_minutes(step) == Some(w[1].time))
            })
            .map(|run| run[0])
            .collect();
        Ok(starts)
    }

    /// Free seats per space for one window. Unknown spaces are left out;
    /// spaces that cannot take the window at all report zero.
    pub async fn batch_check(
        &self,
        space_ids: &[SpaceId],
        date: NaiveDate,
        start: Clock,
        end: Clock,
        now: Ms,
    ) -> Result<HashMap<SpaceId, SpotAvailability>, StoreError> {
        if space_ids.len() > MAX_BATCH_SPACES {
            return Err(StoreError::limit("too many spaces in one batch"));
        }
        let range = validate_range(start, end)?;
        let mut out = HashMap::with_capacity(space_ids.len());
        for id in space_ids {
            let Some(space) = self.get_space_state(id) else {
                continue;
            };
            let guard = space.read().await;
            let capacity = guard.settings.capacity;
            let available_spots = if check_bookable(&guard, date, &range, now).is_err() {
                0
            } else {
                let buffer = guard.settings.buffer_minutes;
                let allocs: Vec<(TimeRange, u32)> = blocking_claims(&guard, date, &range, now, None)
                    .iter()
                    .map(|c| (c.range().widen(buffer), c.seats()))
                    .collect();
                capacity.saturating_sub(peak_usage_within(&allocs, &range))
            };
            out.insert(*id, SpotAvailability { available_spots, max_capacity: capacity });
        }
        Ok(out)
    }

    /// Look up one claim by id, active or not.
    pub async fn find_claim(&self, id: Ulid) -> Result<Claim, StoreError> {
        let space_id = self.space_for_claim(&id).ok_or(StoreError::NotFound { id })?;
        let space = self.space_or_not_found(space_id)?;
        let guard = space.read().await;
        guard.find_claim(id).cloned().ok_or(StoreError::NotFound { id })
    }
}
