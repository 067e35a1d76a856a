use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Claim, TimeRange};

/// Failures of the authoritative store. Serialized as-is on the wire, so
/// remote callers get the same variants back.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreError {
    #[error("not found: {id}")]
    NotFound { id: Ulid },
    #[error("already exists: {id}")]
    AlreadyExists { id: Ulid },
    #[error("conflicts with {} existing claim(s)", .conflicts.len())]
    Conflict { conflicts: Vec<Claim> },
    #[error("capacity {capacity} exceeded")]
    CapacityExceeded { capacity: u32, conflicts: Vec<Claim> },
    #[error("{range} on {date} is outside the space's opening hours")]
    OutsideAvailability { date: NaiveDate, range: TimeRange },
    #[error("invalid range: {reason}")]
    InvalidRange { reason: String },
    #[error("{id} expired")]
    Expired { id: Ulid },
    #[error("token {token} belongs to another claim or user")]
    TokenMismatch { token: Ulid },
    #[error("cannot {action} a {status} booking")]
    InvalidTransition { status: BookingStatus, action: String },
    #[error("space {id} still has active holds or bookings")]
    HasActiveClaims { id: Ulid },
    #[error("limit exceeded: {what}")]
    LimitExceeded { what: String },
    #[error("WAL error: {message}")]
    WalError { message: String },
}

impl StoreError {
    pub(crate) fn limit(what: &str) -> Self {
        StoreError::LimitExceeded { what: what.to_string() }
    }

    pub(crate) fn wal(message: impl ToString) -> Self {
        StoreError::WalError { message: message.to_string() }
    }

    pub(crate) fn invalid_range(reason: impl ToString) -> Self {
        StoreError::InvalidRange { reason: reason.to_string() }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::AlreadyExists { .. } => "already_exists",
            StoreError::Conflict { .. } => "conflict",
            StoreError::CapacityExceeded { .. } => "capacity_exceeded",
            StoreError::OutsideAvailability { .. } => "outside_availability",
            StoreError::InvalidRange { .. } => "invalid_range",
            StoreError::Expired { .. } => "expired",
            StoreError::TokenMismatch { .. } => "token_mismatch",
            StoreError::InvalidTransition { .. } => "invalid_transition",
            StoreError::HasActiveClaims { .. } => "has_active_claims",
            StoreError::LimitExceeded { .. } => "limit_exceeded",
            StoreError::WalError { .. } => "wal_error",
        }
    }

    /// Claims that caused a rejection, if this is one.
    pub fn conflicts(&self) -> Option<&[Claim]> {
        match self {
            StoreError::Conflict { conflicts } | StoreError::CapacityExceeded { conflicts, .. } => {
                Some(conflicts)
            }
            _ => None,
        }
    }
}
