//! Authoritative in-memory store of spaces and their claims, made durable by
//! the WAL. Every mutation takes the space's write lock, re-checks overlap
//! under it, appends to the WAL and only then applies the event, so two
//! overlapping lock attempts on one space serialize and at most one wins.

mod capacity;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use capacity::{peak_usage, peak_usage_within, saturated_spans};
pub use conflict::now_ms;
pub use error::StoreError;
pub use mutations::ReapStats;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<Pending> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} event(s): {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch does not
    // bleed into the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Store {
    pub(super) spaces: DashMap<SpaceId, SharedSpaceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Hold token or booking id → owning space.
    pub(super) claim_to_space: DashMap<Ulid, SpaceId>,
    pub(super) hold_ttl_ms: Ms,
    /// Mutations hold this shared, before any space lock; compaction holds
    /// it exclusively so no append lands between snapshot and swap.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply a claim-level event to its space. The caller holds the write lock.
fn apply_to_space(ss: &mut SpaceState, event: &Event, claim_index: &DashMap<Ulid, SpaceId>) {
    match event {
        Event::SpaceUpdated { name, settings, availability, .. } => {
            let fresh = SpaceState::new(ss.id, name.clone(), settings.clone(), availability.clone());
            ss.name = fresh.name;
            ss.settings = fresh.settings;
            ss.availability_raw = fresh.availability_raw;
            ss.availability = fresh.availability;
        }
        Event::HoldPlaced { hold } => {
            if let Some(old_date) = ss.find_claim(hold.token).map(Claim::date) {
                ss.remove_claim(old_date, hold.token);
            }
            ss.insert_claim(Claim::Hold(hold.clone()));
            claim_index.insert(hold.token, hold.space_id);
        }
        Event::HoldRefreshed { token, date, expires_at, .. } => {
            if let Some(Claim::Hold(hold)) = ss.claim_mut(*date, *token) {
                hold.expires_at = *expires_at;
            }
        }
        Event::HoldReleased { token, date, .. } => {
            ss.remove_claim(*date, *token);
            claim_index.remove(token);
        }
        Event::HoldPromoted { token, booking } => {
            ss.remove_claim(booking.date, *token);
            claim_index.remove(token);
            ss.insert_claim(Claim::Booking(booking.clone()));
            claim_index.insert(booking.id, booking.space_id);
        }
        Event::BookingStatusChanged {
            id,
            date,
            status,
            slot_reserved_until,
            approval_deadline,
            ..
        } => {
            // Cancelled bookings stay as records; `is_active` keeps them
            // out of every conflict and capacity check.
            if let Some(Claim::Booking(booking)) = ss.claim_mut(*date, *id) {
                booking.status = *status;
                booking.slot_reserved_until = *slot_reserved_until;
                booking.approval_deadline = *approval_deadline;
            }
        }
        // Registration and removal act on the space map itself.
        Event::SpaceRegistered { .. } | Event::SpaceRemoved { .. } => {}
    }
}

impl Store {
    /// Open the store, rebuilding state from the WAL at `wal_path`.
    /// Must be called inside a tokio runtime; it spawns the WAL writer.
    pub fn open(wal_path: &Path, notify: Arc<NotifyHub>, hold_ttl_ms: Ms) -> io::Result<Self> {
        let events = Wal::recover(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            spaces: DashMap::new(),
            wal_tx,
            notify,
            claim_to_space: DashMap::new(),
            hold_ttl_ms,
            compaction_gate: RwLock::new(()),
        };

        // Sole owner of every Arc here, so try_write never contends.
        for event in &events {
            match event {
                Event::SpaceRegistered { id, name, settings, availability } => {
                    let ss = SpaceState::new(*id, name.clone(), settings.clone(), availability.clone());
                    store.spaces.insert(*id, Arc::new(RwLock::new(ss)));
                }
                Event::SpaceRemoved { id } => {
                    store.forget_space(id);
                }
                other => {
                    let Some(space) = store.get_space_state(&other.space_id()) else {
                        continue;
                    };
                    if let Ok(mut guard) = space.try_write() {
                        apply_to_space(&mut guard, other, &store.claim_to_space);
                    }
                }
            }
        }

        tracing::info!(
            events = events.len(),
            spaces = store.spaces.len(),
            path = %wal_path.display(),
            "store replayed"
        );
        Ok(store)
    }

    async fn wal_send(&self, cmd: WalCommand) -> Result<(), StoreError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| StoreError::wal("WAL writer shut down"))
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_send(WalCommand::Append { event: event.clone(), response: tx })
            .await?;
        rx.await
            .map_err(|_| StoreError::wal("WAL writer dropped response"))?
            .map_err(StoreError::wal)
    }

    pub fn get_space_state(&self, id: &SpaceId) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub(super) fn space_or_not_found(&self, id: SpaceId) -> Result<SharedSpaceState, StoreError> {
        self.get_space_state(&id).ok_or(StoreError::NotFound { id })
    }

    pub fn space_for_claim(&self, claim_id: &Ulid) -> Option<SpaceId> {
        self.claim_to_space.get(claim_id).map(|e| *e.value())
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    /// WAL append, apply, notify.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut SpaceState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_space(ss, event, &self.claim_to_space);
        self.notify.send(ss.id, event);
        Ok(())
    }

    /// Look up a claim's space and take its write lock.
    pub(super) async fn resolve_claim_write(
        &self,
        claim_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<SpaceState>, StoreError> {
        let space_id = self
            .space_for_claim(&claim_id)
            .ok_or(StoreError::NotFound { id: claim_id })?;
        let space = self.space_or_not_found(space_id)?;
        Ok(space.write_owned().await)
    }

    fn forget_space(&self, id: &SpaceId) {
        if let Some((_, space)) = self.spaces.remove(id)
            && let Ok(guard) = space.try_read()
        {
            for claim in guard.days.values().flatten() {
                self.claim_to_space.remove(&claim.id());
            }
        }
    }
}
