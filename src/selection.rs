//! Two-click range selection over a day's slots.
//!
//! [`reduce`] is the whole state machine; [`RangeSelector`] wraps it with the
//! current slot list and a keyboard focus cursor.

use serde::{Deserialize, Serialize};

use crate::model::{Clock, TimeRange};
use crate::slots::TimeSlot;

/// Slots per row of the keyboard grid.
pub const DEFAULT_GRID_STRIDE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    Idle,
    Pending(Clock),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectedRange {
    pub start_time: Clock,
    pub end_time: Clock,
    pub duration_hours: f64,
}

impl SelectedRange {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time)
    }

    pub fn duration_minutes(&self) -> u32 {
        u32::from(self.range().duration_minutes())
    }
}

/// Apply a click on `clicked` to `state`.
///
/// Clicks on unknown or unavailable slots leave the state unchanged. A second
/// click closes the span between the two slots in either order; if any slot
/// in it is unavailable or two neighbours are not exactly `slot_interval`
/// apart, selection restarts at the clicked slot.
pub fn reduce(
    state: Selection,
    clicked: Clock,
    slots: &[TimeSlot],
    slot_interval: u16,
) -> (Selection, Option<SelectedRange>) {
    let Some(end_idx) = slots.iter().position(|s| s.time == clicked && s.available) else {
        return (state, None);
    };
    let start = match state {
        Selection::Idle => return (Selection::Pending(clicked), None),
        Selection::Pending(start) => start,
    };
    // The first pick may have vanished when slots were regenerated.
    let Some(start_idx) = slots.iter().position(|s| s.time == start) else {
        return (Selection::Pending(clicked), None);
    };

    let (lo, hi) = if start_idx <= end_idx {
        (start_idx, end_idx)
    } else {
        (end_idx, start_idx)
    };
    let span = &slots[lo..=hi];
    let step = i32::from(slot_interval);
    let all_available = span.iter().all(|s| s.available);
    let contiguous = span
        .windows(2)
        .all(|w| w[0].time.add_minutes(step) == Some(w[1].time));
    if !all_available || !contiguous {
        return (Selection::Pending(clicked), None);
    }

    let Some(end_time) = span[span.len() - 1].time.add_minutes(step) else {
        return (Selection::Pending(clicked), None);
    };
    let range = TimeRange::new(span[0].time, end_time);
    let selected = SelectedRange {
        start_time: range.start,
        end_time: range.end,
        duration_hours: range.duration_hours(),
    };
    (Selection::Idle, Some(selected))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Left,
    Right,
    Up,
    Down,
    /// Enter or Space.
    Activate,
    Escape,
}

/// Selection state plus keyboard focus over the current slot list.
#[derive(Debug, Clone)]
pub struct RangeSelector {
    slots: Vec<TimeSlot>,
    slot_interval: u16,
    stride: usize,
    state: Selection,
    focus: Option<usize>,
}

impl RangeSelector {
    pub fn new(slots: Vec<TimeSlot>, slot_interval: u16) -> Self {
        Self {
            slots,
            slot_interval,
            stride: DEFAULT_GRID_STRIDE,
            state: Selection::Idle,
            focus: None,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }

    pub fn state(&self) -> Selection {
        self.state
    }

    pub fn focused(&self) -> Option<&TimeSlot> {
        self.focus.and_then(|i| self.slots.get(i))
    }

    pub fn slots(&self) -> &[TimeSlot] {
        &self.slots
    }

    /// New slots invalidate any half-made selection.
    pub fn set_slots(&mut self, slots: Vec<TimeSlot>) {
        self.slots = slots;
        self.state = Selection::Idle;
        self.focus = None;
    }

    pub fn click(&mut self, time: Clock) -> Option<SelectedRange> {
        let (next, emitted) = reduce(self.state, time, &self.slots, self.slot_interval);
        self.state = next;
        emitted
    }

    pub fn key(&mut self, key: Key) -> Option<SelectedRange> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }
        let Some(at) = self.focus else {
            // The first move only lands on the grid.
            match key {
                Key::Escape => self.state = Selection::Idle,
                Key::Activate => {}
                Key::Left | Key::Right | Key::Up | Key::Down => {
                    self.focus = Some(self.slots.iter().position(|s| s.available).unwrap_or(0));
                }
            }
            return None;
        };
        match key {
            Key::Right if at + 1 < len => self.focus = Some(at + 1),
            Key::Left if at > 0 => self.focus = Some(at - 1),
            Key::Down if at + self.stride < len => self.focus = Some(at + self.stride),
            Key::Up if at >= self.stride => self.focus = Some(at - self.stride),
            Key::Activate => {
                let time = self.focused()?.time;
                return self.click(time);
            }
            Key::Escape => self.state = Selection::Idle,
            _ => {}
        }
        None
    }
}
