use serde::{Deserialize, Serialize};

use crate::limits::DAY_RATE_THRESHOLD_MINUTES;

/// Configured prices of a space, in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rates {
    pub per_hour_cents: Option<i64>,
    pub per_day_cents: Option<i64>,
}

impl Rates {
    /// Hourly rate, derived from the day rate (over an 8h day) when only
    /// the day rate is configured.
    pub fn hourly_cents(&self) -> i64 {
        match (self.per_hour_cents, self.per_day_cents) {
            (Some(hourly), _) => hourly,
            (None, Some(daily)) => daily / 8,
            (None, None) => 0,
        }
    }

    /// Whether every configured rate lies within `0..=max_cents`.
    pub fn within(&self, max_cents: i64) -> bool {
        [self.per_hour_cents, self.per_day_cents]
            .into_iter()
            .flatten()
            .all(|cents| (0..=max_cents).contains(&cents))
    }

    pub fn quote(&self, duration_minutes: u32) -> Option<Quote> {
        price(duration_minutes, self.hourly_cents(), self.per_day_cents)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub amount_cents: i64,
    pub is_day_rate: bool,
}

/// Charge for a range. From eight hours on, a configured day rate replaces
/// the hourly charge. The same function prices the client estimate and the
/// stored booking. `None` when the charge does not fit in an `i64`.
pub fn price(duration_minutes: u32, price_per_hour_cents: i64, price_per_day_cents: Option<i64>) -> Option<Quote> {
    if duration_minutes >= DAY_RATE_THRESHOLD_MINUTES
        && let Some(daily) = price_per_day_cents
    {
        return Some(Quote {
            amount_cents: daily,
            is_day_rate: true,
        });
    }
    // Round half up to the cent.
    let amount = price_per_hour_cents
        .checked_mul(i64::from(duration_minutes))?
        .checked_add(30)?
        / 60;
    Some(Quote {
        amount_cents: amount,
        is_day_rate: false,
    })
}
