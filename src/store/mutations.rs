use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_bookable, check_no_conflict, validate_range, validate_settings};
use super::{Store, StoreError, WalCommand};

/// What one reaper pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub holds: usize,
    pub bookings: usize,
}

/// Something past its deadline, found without holding write locks.
#[derive(Debug, Clone, Copy)]
enum Lapsed {
    Hold { token: Ulid, space_id: SpaceId, date: NaiveDate },
    Booking { id: Ulid },
}

fn validate_space_input(name: &Option<String>, settings: &SpaceSettings, availability: &str) -> Result<(), StoreError> {
    if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(StoreError::limit("space name too long"));
    }
    if availability.len() > MAX_AVAILABILITY_LEN {
        return Err(StoreError::limit("availability payload too large"));
    }
    validate_settings(settings)
}

fn warn_if_unparseable(id: SpaceId, ss: &SpaceState) {
    if let crate::availability::AvailabilityPayload::Unparseable(reason) = &ss.availability {
        warn!(space = %id, %reason, "availability payload could not be decoded");
    }
}

impl Store {
    pub async fn register_space(
        &self,
        id: SpaceId,
        name: Option<String>,
        settings: SpaceSettings,
        availability: String,
    ) -> Result<(), StoreError> {
        validate_space_input(&name, &settings, &availability)?;
        let _gate = self.compaction_gate.read().await;
        if self.spaces.len() >= MAX_SPACES {
            return Err(StoreError::limit("too many spaces"));
        }
        if self.spaces.contains_key(&id) {
            return Err(StoreError::AlreadyExists { id });
        }

        let event = Event::SpaceRegistered {
            id,
            name: name.clone(),
            settings: settings.clone(),
            availability: availability.clone(),
        };
        self.wal_append(&event).await?;
        let ss = SpaceState::new(id, name, settings, availability);
        warn_if_unparseable(id, &ss);
        self.spaces.insert(id, Arc::new(RwLock::new(ss)));
        self.notify.send(id, &event);
        info!(space = %id, "space registered");
        Ok(())
    }

    /// Replace a space's settings and availability. Existing claims stay;
    /// the new rules apply to later lock attempts.
    pub async fn update_space(
        &self,
        id: SpaceId,
        name: Option<String>,
        settings: SpaceSettings,
        availability: String,
    ) -> Result<(), StoreError> {
        validate_space_input(&name, &settings, &availability)?;
        let _gate = self.compaction_gate.read().await;
        let space = self.space_or_not_found(id)?;
        let mut guard = space.write().await;
        let event = Event::SpaceUpdated { id, name, settings, availability };
        self.persist_and_apply(&mut guard, &event).await?;
        warn_if_unparseable(id, &guard);
        Ok(())
    }

    pub async fn remove_space(&self, id: SpaceId, now: Ms) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.read().await;
        let space = self.space_or_not_found(id)?;
        let guard = space.write().await;
        if guard.days.values().flatten().any(|c| c.is_active(now)) {
            return Err(StoreError::HasActiveClaims { id });
        }
        let event = Event::SpaceRemoved { id };
        self.wal_append(&event).await?;
        self.notify.send(id, &event);
        drop(guard);
        self.forget_space(&id);
        self.notify.remove(&id);
        Ok(())
    }

    /// Atomically claim a window. Overlap is re-checked under the space's
    /// write lock, so of two concurrent overlapping attempts only the first
    /// to take the lock commits; the other gets `valid: false` listing it.
    pub async fn acquire_lock(&self, req: LockRequest, now: Ms) -> Result<LockResult, StoreError> {
        let range = validate_range(req.start_time, req.end_time)?;
        if req.user_id.is_empty() || req.user_id.len() > MAX_USER_ID_LEN {
            return Err(StoreError::limit("user id length"));
        }
        if req.seats == 0 {
            return Err(StoreError::invalid_range("a hold needs at least one seat"));
        }
        let ttl = req.ttl_ms.unwrap_or(self.hold_ttl_ms);
        if !(MIN_HOLD_TTL_MS..=MAX_HOLD_TTL_MS).contains(&ttl) {
            return Err(StoreError::limit("hold ttl out of range"));
        }

        let _gate = self.compaction_gate.read().await;
        let space = self.space_or_not_found(req.space_id)?;
        let mut guard = space.write().await;

        // Re-sending a token replaces the caller's own hold; anything else
        // holding that id is someone else's.
        let replacing = match guard.find_claim(req.token) {
            Some(Claim::Hold(h)) if h.user_id == req.user_id => true,
            Some(_) => return Err(StoreError::TokenMismatch { token: req.token }),
            None if self.claim_to_space.contains_key(&req.token) => {
                return Err(StoreError::TokenMismatch { token: req.token });
            }
            None => false,
        };
        if !replacing && guard.claim_count() >= MAX_CLAIMS_PER_SPACE {
            return Err(StoreError::limit("too many claims on space"));
        }

        check_bookable(&guard, req.date, &range, now)?;
        let ignore = replacing.then_some(req.token);
        if let Err(e) = check_no_conflict(&guard, req.date, &range, req.seats, now, ignore) {
            if let Some(conflicts) = e.conflicts() {
                metrics::counter!(observability::LOCKS_REJECTED_TOTAL).increment(1);
                debug!(space = %req.space_id, date = %req.date, %range, "lock rejected");
                return Ok(LockResult {
                    valid: false,
                    hold: None,
                    conflicts: conflicts.to_vec(),
                });
            }
            return Err(e);
        }

        let hold = ReservationHold {
            token: req.token,
            space_id: req.space_id,
            user_id: req.user_id,
            date: req.date,
            start_time: range.start,
            end_time: range.end,
            seats: req.seats,
            expires_at: now + ttl,
        };
        let event = Event::HoldPlaced { hold: hold.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::LOCKS_GRANTED_TOTAL).increment(1);
        Ok(LockResult {
            valid: true,
            hold: Some(hold),
            conflicts: Vec::new(),
        })
    }

    pub async fn release_hold(&self, token: Ulid) -> Result<SpaceId, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_claim_write(token).await?;
        let Some(Claim::Hold(hold)) = guard.find_claim(token) else {
            return Err(StoreError::TokenMismatch { token });
        };
        let event = Event::HoldReleased {
            token,
            space_id: hold.space_id,
            date: hold.date,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.id)
    }

    /// Extend a live hold. An expired hold cannot be revived; the caller
    /// must lock again.
    pub async fn refresh_hold(&self, token: Ulid, ttl_ms: Option<Ms>, now: Ms) -> Result<ReservationHold, StoreError> {
        let ttl = ttl_ms.unwrap_or(self.hold_ttl_ms);
        if !(MIN_HOLD_TTL_MS..=MAX_HOLD_TTL_MS).contains(&ttl) {
            return Err(StoreError::limit("hold ttl out of range"));
        }
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_claim_write(token).await?;
        let mut hold = match guard.find_claim(token) {
            Some(Claim::Hold(h)) => h.clone(),
            _ => return Err(StoreError::TokenMismatch { token }),
        };
        if hold.expires_at <= now {
            return Err(StoreError::Expired { id: token });
        }
        hold.expires_at = now + ttl;
        let event = Event::HoldRefreshed {
            token,
            space_id: hold.space_id,
            date: hold.date,
            expires_at: hold.expires_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(hold)
    }

    /// Turn a live hold into a booking. The initial status follows the
    /// space's confirmation mode and whether payment is still due.
    pub async fn promote_hold(&self, req: PromoteRequest, now: Ms) -> Result<Booking, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_claim_write(req.token).await?;
        let hold = match guard.find_claim(req.token) {
            Some(Claim::Hold(h)) if h.user_id == req.user_id => h.clone(),
            _ => return Err(StoreError::TokenMismatch { token: req.token }),
        };
        if hold.expires_at <= now {
            return Err(StoreError::Expired { id: req.token });
        }
        check_no_conflict(&guard, hold.date, &hold.range(), hold.seats, now, Some(hold.token))?;

        let (status, slot_reserved_until, approval_deadline) = match guard.settings.confirmation {
            ConfirmationMode::HostApproval => {
                (BookingStatus::PendingApproval, None, Some(now + APPROVAL_WINDOW_MS))
            }
            ConfirmationMode::Instant if req.payment_required => {
                (BookingStatus::Pending, Some(hold.expires_at), None)
            }
            ConfirmationMode::Instant => (BookingStatus::Confirmed, None, None),
        };
        let quote = guard
            .settings
            .rates
            .quote(u32::from(hold.range().duration_minutes()))
            .ok_or_else(|| StoreError::limit("price out of range"))?;
        let booking = Booking {
            id: Ulid::new(),
            space_id: hold.space_id,
            user_id: hold.user_id,
            date: hold.date,
            start_time: hold.start_time,
            end_time: hold.end_time,
            status,
            guests_count: hold.seats,
            reservation_token: Some(hold.token),
            slot_reserved_until,
            approval_deadline,
            payment_required: req.payment_required,
            total_cents: quote.amount_cents,
        };
        let event = Event::HoldPromoted { token: req.token, booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(booking = %booking.id, status = %booking.status, "hold promoted");
        Ok(booking)
    }

    /// Apply a host decision or payment confirmation.
    pub async fn transition_booking(&self, id: Ulid, action: BookingAction, now: Ms) -> Result<Booking, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_claim_write(id).await?;
        let mut booking = match guard.find_claim(id) {
            Some(Claim::Booking(b)) => b.clone(),
            _ => return Err(StoreError::NotFound { id }),
        };
        match (booking.status, action) {
            (BookingStatus::PendingApproval, BookingAction::Approve) => {
                if booking.approval_deadline.is_some_and(|t| t <= now) {
                    return Err(StoreError::Expired { id });
                }
                booking.approval_deadline = None;
                if booking.payment_required {
                    booking.status = BookingStatus::Pending;
                    booking.slot_reserved_until = Some(now + PAYMENT_WINDOW_MS);
                } else {
                    booking.status = BookingStatus::Confirmed;
                }
            }
            (BookingStatus::PendingApproval, BookingAction::Reject) => {
                booking.status = BookingStatus::Cancelled;
            }
            (BookingStatus::Pending, BookingAction::PaymentCaptured) => {
                if booking.slot_reserved_until.is_some_and(|t| t <= now) {
                    return Err(StoreError::Expired { id });
                }
                booking.status = BookingStatus::Confirmed;
                booking.slot_reserved_until = None;
            }
            (status, _) => {
                return Err(StoreError::InvalidTransition {
                    status,
                    action: action.to_string(),
                });
            }
        }

        self.write_status(&mut guard, &booking).await?;
        Ok(booking)
    }

    /// Cancel any booking that is not already cancelled.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_claim_write(id).await?;
        let mut booking = match guard.find_claim(id) {
            Some(Claim::Booking(b)) => b.clone(),
            _ => return Err(StoreError::NotFound { id }),
        };
        if booking.status == BookingStatus::Cancelled {
            return Err(StoreError::InvalidTransition {
                status: booking.status,
                action: "cancel".into(),
            });
        }
        booking.status = BookingStatus::Cancelled;
        self.write_status(&mut guard, &booking).await?;
        Ok(booking)
    }

    async fn write_status(&self, ss: &mut SpaceState, booking: &Booking) -> Result<(), StoreError> {
        let event = Event::BookingStatusChanged {
            id: booking.id,
            space_id: booking.space_id,
            date: booking.date,
            status: booking.status,
            slot_reserved_until: booking.slot_reserved_until,
            approval_deadline: booking.approval_deadline,
        };
        self.persist_and_apply(ss, &event).await
    }

    /// Holds, unpaid bookings and unanswered requests past their deadline.
    /// Spaces locked by a writer are skipped and picked up next pass.
    fn collect_lapsed(&self, now: Ms) -> Vec<Lapsed> {
        let mut lapsed = Vec::new();
        for entry in self.spaces.iter() {
            let Ok(guard) = entry.value().try_read() else {
                continue;
            };
            for claim in guard.days.values().flatten() {
                if claim.is_active(now) || claim.is_cancelled() {
                    continue;
                }
                lapsed.push(match claim {
                    Claim::Hold(h) => Lapsed::Hold {
                        token: h.token,
                        space_id: h.space_id,
                        date: h.date,
                    },
                    Claim::Booking(b) => Lapsed::Booking { id: b.id },
                });
            }
        }
        lapsed
    }

    /// Release expired holds and cancel lapsed bookings. Each claim is
    /// re-checked under the write lock, so a hold refreshed in between
    /// survives.
    pub async fn reap_expired(&self, now: Ms) -> ReapStats {
        let mut stats = ReapStats::default();
        for lapsed in self.collect_lapsed(now) {
            let id = match lapsed {
                Lapsed::Hold { token, .. } => token,
                Lapsed::Booking { id } => id,
            };
            let _gate = self.compaction_gate.read().await;
            let Ok(mut guard) = self.resolve_claim_write(id).await else {
                continue;
            };
            let still_lapsed = guard
                .find_claim(id)
                .is_some_and(|c| !c.is_active(now) && !c.is_cancelled());
            if !still_lapsed {
                debug!(claim = %id, "reaper skip: claim is live again");
                continue;
            }
            let result = match lapsed {
                Lapsed::Hold { token, space_id, date } => {
                    let event = Event::HoldReleased { token, space_id, date };
                    self.persist_and_apply(&mut guard, &event).await.map(|()| {
                        stats.holds += 1;
                    })
                }
                Lapsed::Booking { .. } => {
                    let Some(Claim::Booking(b)) = guard.find_claim(id) else {
                        continue;
                    };
                    let mut booking = b.clone();
                    booking.status = BookingStatus::Cancelled;
                    self.write_status(&mut guard, &booking).await.map(|()| {
                        stats.bookings += 1;
                    })
                }
            };
            match result {
                Ok(()) => info!(claim = %id, "reaped lapsed claim"),
                Err(e) => warn!(claim = %id, "reaper failed: {e}"),
            }
        }
        if stats.holds > 0 {
            metrics::counter!(observability::HOLDS_REAPED_TOTAL).increment(stats.holds as u64);
        }
        if stats.bookings > 0 {
            metrics::counter!(observability::BOOKINGS_EXPIRED_TOTAL).increment(stats.bookings as u64);
        }
        stats
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    /// Expired holds are left out; bookings are kept whatever their status.
    pub async fn compact(&self, now: Ms) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;
        let spaces: Vec<_> = self.spaces.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for space in spaces {
            let guard = space.read().await;
            events.push(Event::SpaceRegistered {
                id: guard.id,
                name: guard.name.clone(),
                settings: guard.settings.clone(),
                availability: guard.availability_raw.clone(),
            });
            for claim in guard.days.values().flatten().filter(|c| matches!(c, Claim::Booking(_)) || c.is_active(now)) {
                events.push(match claim {
                    Claim::Hold(hold) => Event::HoldPlaced { hold: hold.clone() },
                    Claim::Booking(booking) => Event::HoldPromoted {
                        token: booking.reservation_token.unwrap_or(booking.id),
                        booking: booking.clone(),
                    },
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_send(WalCommand::Compact { events, response: tx }).await?;
        rx.await
            .map_err(|_| StoreError::wal("WAL writer dropped response"))?
            .map_err(StoreError::wal)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
