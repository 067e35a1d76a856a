//! Recurring weekly schedule plus date exceptions, and the pure functions that
//! turn them into the open intervals of a given date.

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{Clock, TimeRange};

/// Opening hours assumed for a date whose availability could not be decoded.
pub const FALLBACK_OPENING: TimeRange = TimeRange {
    start: Clock::at(9, 0),
    end: Clock::at(18, 0),
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub slots: Vec<TimeRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    #[serde(default)]
    pub monday: DaySchedule,
    #[serde(default)]
    pub tuesday: DaySchedule,
    #[serde(default)]
    pub wednesday: DaySchedule,
    #[serde(default)]
    pub thursday: DaySchedule,
    #[serde(default)]
    pub friday: DaySchedule,
    #[serde(default)]
    pub saturday: DaySchedule,
    #[serde(default)]
    pub sunday: DaySchedule,
}

impl WeeklySchedule {
    pub fn day(&self, weekday: Weekday) -> &DaySchedule {
        match weekday {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }

    fn days(&self) -> [(&'static str, &DaySchedule); 7] {
        [
            ("monday", &self.monday),
            ("tuesday", &self.tuesday),
            ("wednesday", &self.wednesday),
            ("thursday", &self.thursday),
            ("friday", &self.friday),
            ("saturday", &self.saturday),
            ("sunday", &self.sunday),
        ]
    }
}

/// Date-specific override of the weekly schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    pub date: NaiveDate,
    /// Older payloads call this field `available`.
    #[serde(alias = "available", default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub slots: Option<Vec<TimeRange>>,
    #[serde(default)]
    pub note: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityData {
    #[serde(default)]
    pub recurring: WeeklySchedule,
    #[serde(default)]
    pub exceptions: Vec<Exception>,
}

impl AvailabilityData {
    /// Open intervals for `date`. An exception for the date wins outright:
    /// disabled blocks the day, enabled with slots replaces the weekly hours,
    /// enabled without slots falls back to the weekly hours.
    pub fn effective_intervals(&self, date: NaiveDate) -> Vec<TimeRange> {
        if let Some(exception) = self.exceptions.iter().find(|e| e.date == date) {
            if !exception.enabled {
                return Vec::new();
            }
            if let Some(slots) = exception.slots.as_ref().filter(|s| !s.is_empty()) {
                return sorted(slots.clone());
            }
        }
        let day = self.recurring.day(date.weekday());
        if day.enabled {
            sorted(day.slots.clone())
        } else {
            Vec::new()
        }
    }

    /// Every interval list must be well-formed: `start < end` and no overlaps.
    pub fn validate(&self) -> Result<(), String> {
        for (name, day) in self.recurring.days() {
            check_intervals(&day.slots).map_err(|e| format!("{name}: {e}"))?;
        }
        for exception in &self.exceptions {
            if let Some(slots) = &exception.slots {
                check_intervals(slots).map_err(|e| format!("exception {}: {e}", exception.date))?;
            }
        }
        Ok(())
    }
}

fn sorted(mut intervals: Vec<TimeRange>) -> Vec<TimeRange> {
    intervals.sort_by_key(|r| r.start);
    intervals
}

fn check_intervals(intervals: &[TimeRange]) -> Result<(), String> {
    if let Some(bad) = intervals.iter().find(|r| r.start >= r.end) {
        return Err(format!("interval {}-{} does not start before it ends", bad.start, bad.end));
    }
    let ordered = sorted(intervals.to_vec());
    for pair in ordered.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(format!("intervals {} and {} overlap", pair[0], pair[1]));
        }
    }
    Ok(())
}

/// Result of decoding a space's availability at the system boundary.
/// Downstream code matches on this and never re-parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityPayload {
    Parsed(AvailabilityData),
    Unparseable(String),
}

/// What a date looks like once exceptions and weekly hours are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayAvailability {
    Open(Vec<TimeRange>),
    Closed,
    /// The payload could not be decoded; nothing is known about this date.
    Unknown,
}

impl DayAvailability {
    /// Intervals to offer. Unknown days fall back to [`FALLBACK_OPENING`].
    pub fn intervals_or_fallback(&self) -> Vec<TimeRange> {
        match self {
            DayAvailability::Open(intervals) => intervals.clone(),
            DayAvailability::Closed => Vec::new(),
            DayAvailability::Unknown => vec![FALLBACK_OPENING],
        }
    }
}

impl AvailabilityPayload {
    /// Decode a raw payload. Accepts a JSON object, or a JSON string that
    /// itself contains the object (legacy rows stored it double-encoded).
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => Self::from_value(value),
            Err(e) => Self::Unparseable(format!("invalid JSON: {e}")),
        }
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        let value = match value {
            serde_json::Value::String(inner) => {
                match serde_json::from_str::<serde_json::Value>(&inner) {
                    Ok(v @ serde_json::Value::Object(_)) => v,
                    Ok(_) => return Self::Unparseable("string payload is not an object".into()),
                    Err(e) => return Self::Unparseable(format!("invalid JSON string payload: {e}")),
                }
            }
            v @ serde_json::Value::Object(_) => v,
            other => {
                return Self::Unparseable(format!("expected an object, got {}", json_kind(&other)));
            }
        };
        let data: AvailabilityData = match serde_json::from_value(value) {
            Ok(d) => d,
            Err(e) => return Self::Unparseable(e.to_string()),
        };
        match data.validate() {
            Ok(()) => Self::Parsed(data),
            Err(e) => Self::Unparseable(e),
        }
    }

    pub fn effective(&self, date: NaiveDate) -> DayAvailability {
        match self {
            AvailabilityPayload::Parsed(data) => {
                let intervals = data.effective_intervals(date);
                if intervals.is_empty() {
                    DayAvailability::Closed
                } else {
                    DayAvailability::Open(intervals)
                }
            }
            AvailabilityPayload::Unparseable(_) => DayAvailability::Unknown,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, AvailabilityPayload::Parsed(_))
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateStatus {
    Selectable,
    /// Open per a payload that could not be decoded; offered anyway.
    SelectableUnknown,
    Closed,
    Past,
    BeyondHorizon,
}

impl DateStatus {
    pub fn is_selectable(self) -> bool {
        matches!(self, DateStatus::Selectable | DateStatus::SelectableUnknown)
    }
}

/// Whether `date` can be picked. Past dates and dates beyond the horizon are
/// always disabled; an undecodable payload never disables a date.
pub fn date_status(
    payload: &AvailabilityPayload,
    date: NaiveDate,
    today: NaiveDate,
    horizon_days: u32,
) -> DateStatus {
    if date < today {
        return DateStatus::Past;
    }
    let horizon = today.checked_add_days(Days::new(u64::from(horizon_days)));
    if horizon.is_none_or(|limit| date > limit) {
        return DateStatus::BeyondHorizon;
    }
    match payload.effective(date) {
        DayAvailability::Open(_) => DateStatus::Selectable,
        DayAvailability::Closed => DateStatus::Closed,
        DayAvailability::Unknown => {
            if let AvailabilityPayload::Unparseable(reason) = payload {
                warn!(%date, %reason, "availability unknown, leaving date selectable");
            }
            DateStatus::SelectableUnknown
        }
    }
}

/// Merge overlapping or touching intervals into disjoint ones.
pub fn merge_touching(intervals: &[TimeRange]) -> Vec<TimeRange> {
    let mut ordered = intervals.to_vec();
    ordered.sort_by_key(|r| r.start);
    let mut merged: Vec<TimeRange> = Vec::with_capacity(ordered.len());
    for range in ordered {
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
