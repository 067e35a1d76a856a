//! JSON-lines wire format: one request object per line in, one response
//! object per line out. A `watch` request turns the connection into a
//! stream of `{"event": ...}` lines for one space.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::model::*;
use crate::store::StoreError;

fn one_seat() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterSpace {
        id: SpaceId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        settings: SpaceSettings,
        /// Object, or a string holding one.
        availability: Value,
    },
    UpdateSpace {
        id: SpaceId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        settings: SpaceSettings,
        availability: Value,
    },
    RemoveSpace {
        id: SpaceId,
    },
    GetSpace {
        id: SpaceId,
    },
    GetAvailability {
        id: SpaceId,
    },
    CheckConflicts {
        space_id: SpaceId,
        date: NaiveDate,
        start_time: Clock,
        end_time: Clock,
        #[serde(default = "one_seat")]
        seats: u32,
    },
    AcquireLock(LockRequest),
    ReleaseHold {
        token: Ulid,
    },
    RefreshHold {
        token: Ulid,
        #[serde(default)]
        ttl_ms: Option<Ms>,
    },
    PromoteHold(PromoteRequest),
    TransitionBooking {
        id: Ulid,
        action: BookingAction,
    },
    CancelBooking {
        id: Ulid,
    },
    AlternativeSlots {
        space_id: SpaceId,
        date: NaiveDate,
        duration_minutes: u32,
    },
    BatchCheck {
        space_ids: Vec<SpaceId>,
        date: NaiveDate,
        start_time: Clock,
        end_time: Clock,
    },
    DaySlots {
        space_id: SpaceId,
        date: NaiveDate,
    },
    DayBookings {
        space_id: SpaceId,
        date: NaiveDate,
    },
    /// Stream the space's events, or only those of `date`.
    Watch {
        space_id: SpaceId,
        #[serde(default)]
        date: Option<NaiveDate>,
    },
}

/// Raw availability text as stored: strings pass through untouched so a
/// double-encoded payload is decoded the same way as on registration.
pub fn availability_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    /// The store's error when the store produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<StoreError>,
}

impl ErrorBody {
    pub fn bad_request(message: impl ToString) -> Self {
        Self {
            kind: "bad_request".into(),
            message: message.to_string(),
            detail: None,
        }
    }
}

impl From<StoreError> for ErrorBody {
    fn from(e: StoreError) -> Self {
        Self {
            kind: e.kind().into(),
            message: e.to_string(),
            detail: Some(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Value),
    Error(ErrorBody),
    Event(Event),
}

impl Response {
    pub fn ok(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Response::Ok(v),
            Err(e) => Response::Error(ErrorBody {
                kind: "internal".into(),
                message: format!("response encoding failed: {e}"),
                detail: None,
            }),
        }
    }

    /// One output line, without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"error":{{"kind":"internal","message":"{e}"}}}}"#)
        })
    }
}
