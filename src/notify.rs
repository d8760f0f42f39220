use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Broadcast hub for committed events, per entity (request or asset id) and
/// as a single firehose for the notification service.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
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
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to events touching one request or asset. Creates the channel if needed.
    pub fn subscribe(&self, entity_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(entity_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Publish a committed event to every entity it touches. No-op if nobody listens.
    pub fn publish(&self, event: &Event) {
        let _ = self.firehose.send(event.clone());
        let mut targets = event.asset_ids();
        if let Some(rid) = event.request_id().or_else(|| submitted_request_id(event)) {
            targets.push(rid);
        }
        for id in targets {
            if let Some(sender) = self.channels.get(&id) {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Drop channels nobody listens to any more.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

fn submitted_request_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RequestSubmitted { request } | Event::RequestRestored { request } => Some(request.id),
        Event::BorrowOverdue { request_id, .. } => Some(*request_id),
        _ => None,
    }
}
