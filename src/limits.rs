use crate::model::Ms;

pub const MAX_SPACES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_AVAILABILITY_LEN: usize = 64 * 1024;
pub const MAX_CLAIMS_PER_SPACE: usize = 50_000;
pub const MAX_CAPACITY: u32 = 10_000;
pub const MAX_BATCH_SPACES: usize = 50;
pub const MAX_LINE_LEN: usize = 256 * 1024;

/// Furthest a date may lie ahead of today.
pub const MAX_HORIZON_DAYS: u32 = 365;

/// Slot interval bounds, in minutes.
pub const MIN_SLOT_INTERVAL: u16 = 5;
pub const MAX_SLOT_INTERVAL: u16 = 240;
pub const MAX_BUFFER_MINUTES: u16 = 240;

pub const DEFAULT_HOLD_TTL_MS: Ms = 15 * 60_000;
pub const MIN_HOLD_TTL_MS: Ms = 60_000;
pub const MAX_HOLD_TTL_MS: Ms = 60 * 60_000;

/// Time a host has to answer a booking request.
pub const APPROVAL_WINDOW_MS: Ms = 24 * 3_600_000;
/// Time a guest has to pay once the host approved.
pub const PAYMENT_WINDOW_MS: Ms = 2 * 3_600_000;

/// Bookings of at least this length are charged the day rate when one is set.
pub const DAY_RATE_THRESHOLD_MINUTES: u32 = 8 * 60;

/// Highest hourly or daily rate a space may charge, in cents.
pub const MAX_RATE_CENTS: i64 = 100_000_000;

/// Alternatives offered after a conflict.
pub const MAX_ALTERNATIVES: usize = 5;
