use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use ulid::Ulid;

use crate::availability::AvailabilityPayload;
use crate::pricing::Rates;

/// Unix milliseconds. Used for hold expiry and deadlines only; times of day are [`Clock`].
pub type Ms = i64;

pub type SpaceId = Ulid;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Wall-clock time of day in the space's timezone, as minutes since midnight.
///
/// `24:00` is a valid value so that a range can end at the close of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Clock(u16);

impl Clock {
    pub const MIDNIGHT: Clock = Clock(0);
    pub const END_OF_DAY: Clock = Clock(MINUTES_PER_DAY);

    /// Compile-time constructor; panics on an out-of-range time.
    pub const fn at(hour: u16, minute: u16) -> Self {
        assert!(minute < 60 && hour * 60 + minute <= MINUTES_PER_DAY);
        Self(hour * 60 + minute)
    }

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour.checked_mul(60)?.checked_add(minute)?)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// `None` when the result would leave `[00:00, 24:00]`.
    pub fn add_minutes(self, delta: i32) -> Option<Self> {
        let total = i32::from(self.0) + delta;
        u16::try_from(total).ok().and_then(Self::from_minutes)
    }

    pub fn saturating_add(self, delta: i32) -> Self {
        let total = (i32::from(self.0) + delta).clamp(0, i32::from(MINUTES_PER_DAY));
        Self(total as u16)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid time of day {0:?}, expected HH:MM")]
pub struct ClockParseError(pub String);

impl FromStr for Clock {
    type Err = ClockParseError;

    /// Accepts `H:MM`, `HH:MM` and `HH:MM:SS` (seconds are ignored).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ClockParseError(s.to_string());
        let mut parts = s.trim().split(':');
        let hour = parts.next().ok_or_else(err)?;
        let minute = parts.next().ok_or_else(err)?;
        if let Some(seconds) = parts.next()
            && (seconds.len() != 2 || !seconds.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(err());
        }
        if parts.next().is_some() || hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(err());
        }
        let hour: u16 = hour.parse().map_err(|_| err())?;
        let minute: u16 = minute.parse().map_err(|_| err())?;
        Clock::hm(hour, minute).ok_or_else(err)
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl Serialize for Clock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Clock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Half-open time-of-day interval `[start, end)` within one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Clock,
    pub end: Clock,
}

impl TimeRange {
    pub fn new(start: Clock, end: Clock) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn checked(start: Clock, end: Clock) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end.minutes() - self.start.minutes()
    }

    pub fn duration_hours(&self) -> f64 {
        f64::from(self.duration_minutes()) / 60.0
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Extend both ends by `minutes`, clamped to the day.
    pub fn widen(&self, minutes: u16) -> TimeRange {
        let m = i32::from(minutes);
        TimeRange {
            start: self.start.saturating_add(-m),
            end: self.end.saturating_add(m),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    PendingApproval,
    Confirmed,
    Cancelled,
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::PendingApproval => "pending_approval",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Time-boxed claim on a space/date/range, created at checkout start.
/// The token is the hold's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationHold {
    pub token: Ulid,
    pub space_id: SpaceId,
    pub user_id: String,
    pub date: NaiveDate,
    pub start_time: Clock,
    pub end_time: Clock,
    pub seats: u32,
    pub expires_at: Ms,
}

impl ReservationHold {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub space_id: SpaceId,
    pub user_id: String,
    pub date: NaiveDate,
    pub start_time: Clock,
    pub end_time: Clock,
    pub status: BookingStatus,
    pub guests_count: u32,
    pub reservation_token: Option<Ulid>,
    /// Payment must be captured before this instant or the booking is cancelled.
    pub slot_reserved_until: Option<Ms>,
    /// Host must approve before this instant or the request lapses.
    pub approval_deadline: Option<Ms>,
    pub payment_required: bool,
    pub total_cents: i64,
}

impl Booking {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time)
    }
}

/// Anything that occupies a space for a window: a live hold or a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Claim {
    Hold(ReservationHold),
    Booking(Booking),
}

impl Claim {
    pub fn id(&self) -> Ulid {
        match self {
            Claim::Hold(h) => h.token,
            Claim::Booking(b) => b.id,
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            Claim::Hold(h) => h.date,
            Claim::Booking(b) => b.date,
        }
    }

    pub fn range(&self) -> TimeRange {
        match self {
            Claim::Hold(h) => h.range(),
            Claim::Booking(b) => b.range(),
        }
    }

    pub fn seats(&self) -> u32 {
        match self {
            Claim::Hold(h) => h.seats,
            Claim::Booking(b) => b.guests_count,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Claim::Booking(b) if b.status == BookingStatus::Cancelled)
    }

    /// Whether the claim still occupies its window at `now`. Expired holds,
    /// unpaid bookings past `slot_reserved_until` and lapsed approval requests
    /// stop blocking immediately, before the reaper removes them.
    pub fn is_active(&self, now: Ms) -> bool {
        match self {
            Claim::Hold(h) => h.expires_at > now,
            Claim::Booking(b) => match b.status {
                BookingStatus::Cancelled => false,
                BookingStatus::Confirmed => true,
                BookingStatus::Pending => b.slot_reserved_until.is_none_or(|t| t > now),
                BookingStatus::PendingApproval => b.approval_deadline.is_none_or(|t| t > now),
            },
        }
    }
}

/// How a space turns a promoted hold into a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    #[default]
    Instant,
    HostApproval,
}

/// Host-editable booking parameters of a space. Missing fields take their
/// defaults when decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceSettings {
    /// Max seats occupied concurrently (1 = exclusive).
    pub capacity: u32,
    pub timezone: Tz,
    pub slot_interval_minutes: u16,
    /// Gap kept free on both sides of every claim.
    pub buffer_minutes: u16,
    pub confirmation: ConfirmationMode,
    pub rates: Rates,
}

impl Default for SpaceSettings {
    fn default() -> Self {
        Self {
            capacity: 1,
            timezone: chrono_tz::Europe::Rome,
            slot_interval_minutes: 30,
            buffer_minutes: 0,
            confirmation: ConfirmationMode::Instant,
            rates: Rates::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpaceState {
    pub id: SpaceId,
    pub name: Option<String>,
    pub settings: SpaceSettings,
    /// Raw availability JSON as registered; kept for compaction.
    pub availability_raw: String,
    pub availability: AvailabilityPayload,
    /// Claims per date, each list sorted by start time.
    pub days: BTreeMap<NaiveDate, Vec<Claim>>,
}

impl SpaceState {
    pub fn new(
        id: SpaceId,
        name: Option<String>,
        settings: SpaceSettings,
        availability_raw: String,
    ) -> Self {
        let availability = AvailabilityPayload::decode(&availability_raw);
        Self {
            id,
            name,
            settings,
            availability_raw,
            availability,
            days: BTreeMap::new(),
        }
    }

    /// Insert a claim keeping its date list sorted by start time.
    pub fn insert_claim(&mut self, claim: Claim) {
        let start = claim.range().start;
        let day = self.days.entry(claim.date()).or_default();
        let pos = day.partition_point(|c| c.range().start <= start);
        day.insert(pos, claim);
    }

    pub fn remove_claim(&mut self, date: NaiveDate, id: Ulid) -> Option<Claim> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|c| c.id() == id)?;
        let claim = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(claim)
    }

    pub fn claim_mut(&mut self, date: NaiveDate, id: Ulid) -> Option<&mut Claim> {
        self.days.get_mut(&date)?.iter_mut().find(|c| c.id() == id)
    }

    pub fn find_claim(&self, id: Ulid) -> Option<&Claim> {
        self.days.values().flatten().find(|c| c.id() == id)
    }

    /// Claims on `date` whose range overlaps `query`, active or not.
    /// Claims starting at or after `query.end` are skipped by binary search.
    pub fn overlapping(&self, date: NaiveDate, query: &TimeRange) -> impl Iterator<Item = &Claim> {
        let day: &[Claim] = self.days.get(&date).map(Vec::as_slice).unwrap_or(&[]);
        let right_bound = day.partition_point(|c| c.range().start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |c| c.range().end > query.start)
    }

    pub fn claim_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }
}

/// WAL record format. Flat; every mutation of the store is one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    SpaceRegistered {
        id: SpaceId,
        name: Option<String>,
        settings: SpaceSettings,
        availability: String,
    },
    SpaceUpdated {
        id: SpaceId,
        name: Option<String>,
        settings: SpaceSettings,
        availability: String,
    },
    SpaceRemoved {
        id: SpaceId,
    },
    HoldPlaced {
        hold: ReservationHold,
    },
    HoldRefreshed {
        token: Ulid,
        space_id: SpaceId,
        date: NaiveDate,
        expires_at: Ms,
    },
    HoldReleased {
        token: Ulid,
        space_id: SpaceId,
        date: NaiveDate,
    },
    /// Removes the hold and inserts the booking in one step.
    HoldPromoted {
        token: Ulid,
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        space_id: SpaceId,
        date: NaiveDate,
        status: BookingStatus,
        slot_reserved_until: Option<Ms>,
        approval_deadline: Option<Ms>,
    },
}

impl Event {
    pub fn space_id(&self) -> SpaceId {
        match self {
            Event::SpaceRegistered { id, .. }
            | Event::SpaceUpdated { id, .. }
            | Event::SpaceRemoved { id } => *id,
            Event::HoldPlaced { hold } => hold.space_id,
            Event::HoldPromoted { booking, .. } => booking.space_id,
            Event::HoldRefreshed { space_id, .. }
            | Event::HoldReleased { space_id, .. }
            | Event::BookingStatusChanged { space_id, .. } => *space_id,
        }
    }

    /// The day a claim event touches; `None` for space-wide events.
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Event::SpaceRegistered { .. } | Event::SpaceUpdated { .. } | Event::SpaceRemoved { .. } => None,
            Event::HoldPlaced { hold } => Some(hold.date),
            Event::HoldPromoted { booking, .. } => Some(booking.date),
            Event::HoldRefreshed { date, .. }
            | Event::HoldReleased { date, .. }
            | Event::BookingStatusChanged { date, .. } => Some(*date),
        }
    }
}

/// Request to claim a window for one checkout attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub space_id: SpaceId,
    pub date: NaiveDate,
    pub start_time: Clock,
    pub end_time: Clock,
    /// Caller-chosen token; re-sending the same token replaces the hold.
    pub token: Ulid,
    pub user_id: String,
    #[serde(default = "one_seat")]
    pub seats: u32,
    /// Hold lifetime; the store default applies when absent.
    #[serde(default)]
    pub ttl_ms: Option<Ms>,
}

fn one_seat() -> u32 {
    1
}

/// Outcome of a lock attempt. A rejection is `valid: false` with the
/// claims that caused it, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    pub valid: bool,
    pub hold: Option<ReservationHold>,
    pub conflicts: Vec<Claim>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteRequest {
    pub token: Ulid,
    pub user_id: String,
    pub payment_required: bool,
}

/// Host and payment-provider events that move a booking along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingAction {
    Approve,
    Reject,
    PaymentCaptured,
}

impl fmt::Display for BookingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingAction::Approve => "approve",
            BookingAction::Reject => "reject",
            BookingAction::PaymentCaptured => "capture payment for",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConflictReport {
    pub has_conflict: bool,
    pub conflicting: Vec<Claim>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotAvailability {
    pub available_spots: u32,
    pub max_capacity: u32,
}

/// Public view of a registered space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub id: SpaceId,
    pub name: Option<String>,
    pub settings: SpaceSettings,
    pub availability: AvailabilityPayload,
}
