//! Advisory conflict checking for the selection a user is currently looking
//! at. Checks are debounced, time-boxed and superseded by newer selections;
//! a superseded result is dropped instead of being applied to stale state.
//! Nothing here reserves a window: only the reservation lock does.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::BookingStore;
use crate::config::BookingPolicy;
use crate::model::{Claim, SpaceId, TimeRange};
use crate::slots::TimeSlot;
use crate::store::StoreError;

/// What a check is about. Two checks with equal signatures ask the same
/// question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub space_id: SpaceId,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub seats: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    Clear,
    Conflict {
        conflicts: Vec<Claim>,
        /// Same-length start slots on that date, nearest first.
        alternatives: Vec<TimeSlot>,
    },
    /// The store answered with a verdict on the request itself, e.g. a
    /// range outside opening hours or an unknown space.
    Rejected(StoreError),
    /// The store could not answer. Never read as "no conflict".
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Completed(Advisory),
    /// A newer selection or a cancel arrived first; discard.
    Superseded,
}

pub struct ConflictDetector {
    store: Arc<dyn BookingStore>,
    debounce: Duration,
    timeout: Duration,
    max_alternatives: usize,
    /// Generation counter and the selection it belongs to.
    current: watch::Sender<(u64, Option<Signature>)>,
}

impl ConflictDetector {
    pub fn new(store: Arc<dyn BookingStore>, policy: &BookingPolicy) -> Self {
        Self {
            store,
            debounce: policy.debounce,
            timeout: policy.request_timeout,
            max_alternatives: policy.max_alternatives,
            current: watch::Sender::new((0, None)),
        }
    }

    /// Check `sig` once the selection has been quiet for the debounce
    /// period. Returns `Superseded` if another check or a cancel lands
    /// before the answer does.
    pub async fn check(&self, sig: Signature) -> CheckOutcome {
        let mut generation = 0;
        self.current.send_modify(|(g, s)| {
            *g += 1;
            generation = *g;
            *s = Some(sig.clone());
        });
        let mut rx = self.current.subscribe();
        if rx.borrow_and_update().0 != generation {
            return CheckOutcome::Superseded;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.debounce) => {}
            _ = rx.changed() => return CheckOutcome::Superseded,
        }

        let advisory = tokio::select! {
            result = tokio::time::timeout(self.timeout, self.ask(&sig)) => match result {
                Ok(advisory) => advisory,
                Err(_) => {
                    warn!(space = %sig.space_id, "conflict check timed out");
                    Advisory::Unknown(format!("no answer within {:?}", self.timeout))
                }
            },
            _ = rx.changed() => return CheckOutcome::Superseded,
        };

        let still_current = {
            let current = self.current.borrow();
            current.0 == generation && current.1.as_ref() == Some(&sig)
        };
        if !still_current {
            debug!(space = %sig.space_id, "dropping stale conflict check result");
            return CheckOutcome::Superseded;
        }
        CheckOutcome::Completed(advisory)
    }

    /// Abandon any in-flight check, e.g. when the selection is cleared.
    pub fn cancel(&self) {
        self.current.send_modify(|(g, s)| {
            *g += 1;
            *s = None;
        });
    }

    pub fn current(&self) -> Option<Signature> {
        self.current.borrow().1.clone()
    }

    /// One check without debounce or supersede guards.
    pub async fn check_now(&self, sig: &Signature) -> Advisory {
        match tokio::time::timeout(self.timeout, self.ask(sig)).await {
            Ok(advisory) => advisory,
            Err(_) => Advisory::Unknown(format!("no answer within {:?}", self.timeout)),
        }
    }

    async fn ask(&self, sig: &Signature) -> Advisory {
        let report = match self
            .store
            .check_conflicts(sig.space_id, sig.date, sig.range.start, sig.range.end, sig.seats)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(space = %sig.space_id, "conflict check failed: {e}");
                return match e.store_error() {
                    Some(verdict) if !e.is_unreachable() => Advisory::Rejected(verdict.clone()),
                    _ => Advisory::Unknown(e.to_string()),
                };
            }
        };
        if !report.has_conflict {
            return Advisory::Clear;
        }

        Advisory::Conflict {
            conflicts: report.conflicting,
            alternatives: self.alternatives(sig).await,
        }
    }

    /// Free windows of the same length on the same date, nearest first.
    /// Empty when the store cannot say.
    pub async fn alternatives(&self, sig: &Signature) -> Vec<TimeSlot> {
        let duration = u32::from(sig.range.duration_minutes());
        match self
            .store
            .get_alternative_slots(sig.space_id, sig.date, duration)
            .await
        {
            Ok(slots) => nearest(slots, sig.range, self.max_alternatives),
            Err(e) => {
                warn!(space = %sig.space_id, "alternative slots unavailable: {e}");
                Vec::new()
            }
        }
    }
}

/// Available starts closest to the requested one, excluding the requested
/// start itself.
fn nearest(mut slots: Vec<TimeSlot>, wanted: TimeRange, limit: usize) -> Vec<TimeSlot> {
    let start = i32::from(wanted.start.minutes());
    slots.retain(|s| s.available && s.time != wanted.start);
    slots.sort_by_key(|s| ((i32::from(s.time.minutes()) - start).abs(), s.time));
    slots.truncate(limit);
    slots
}
