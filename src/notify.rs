use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::model::{Event, SpaceId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-space broadcast of applied events, so watchers can regenerate slots.
/// One channel per watched space; day filtering happens on the receiving
/// side.
pub struct NotifyHub {
    channels: DashMap<SpaceId, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Watch a space, or only one of its days. Space-wide events (settings
    /// changes, removal) reach every subscription.
    pub fn subscribe(&self, space_id: SpaceId, date: Option<NaiveDate>) -> Subscription {
        let rx = self
            .channels
            .entry(space_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Subscription { rx, date }
    }

    /// No-op when nobody watches the space. The channel of a space whose
    /// last watcher went away is dropped here.
    pub fn send(&self, space_id: SpaceId, event: &Event) {
        let unwatched = match self.channels.get(&space_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => return,
        };
        if unwatched {
            self.channels
                .remove_if(&space_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    /// Drop the channel; open subscriptions see `Closed`.
    pub fn remove(&self, space_id: &SpaceId) {
        self.channels.remove(space_id);
    }

    pub fn watched_spaces(&self) -> usize {
        self.channels.len()
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    date: Option<NaiveDate>,
}

impl Subscription {
    /// Next event in scope. Lag counts every dropped event of the space,
    /// including ones for other days.
    pub async fn recv(&mut self) -> Result<Event, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.in_scope(&event) {
                return Ok(event);
            }
        }
    }

    fn in_scope(&self, event: &Event) -> bool {
        match (self.date, event.date()) {
            (Some(watched), Some(date)) => watched == date,
            _ => true,
        }
    }
}
