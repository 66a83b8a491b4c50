use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::{EngineEvent, EngineSnapshot};

/// A live subscription handed to a dashboard client.
///
/// The first message on `receiver` is always the `metrics-init` snapshot.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Fan-out of engine events to attached subscribers.
///
/// Owned by the engine actor, so attach and publish are serialized with every
/// state mutation and no subscriber can observe an event before its snapshot.
/// Channels are unbounded: a burst from one large envelope never costs a
/// subscriber its stream. Pacing a stalled client is the consumer's job.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    subscribers: Vec<(Uuid, mpsc::UnboundedSender<EngineEvent>)>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber whose first message is `snapshot`.
    pub fn attach(&mut self, snapshot: EngineSnapshot) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        // The receiver is alive, so the snapshot is always queued.
        if tx.send(EngineEvent::Init(Box::new(snapshot))).is_ok() {
            self.subscribers.push((id, tx));
        }

        debug!(
            "Subscriber {} attached, {} active",
            id,
            self.subscribers.len()
        );
        Subscription { id, receiver: rx }
    }

    /// Deliver to every subscriber without blocking. Only subscribers whose
    /// receiver has been dropped are detached.
    pub fn publish(&mut self, event: &EngineEvent) {
        if self.subscribers.is_empty() {
            return;
        }

        self.subscribers.retain(|(id, sender)| {
            let delivered = sender.send(event.clone()).is_ok();
            if !delivered {
                debug!("Subscriber {} disconnected before {}", id, event.name());
            }
            delivered
        });
    }

    /// Idempotent; returns whether the subscriber was still attached.
    pub fn detach(&mut self, id: Uuid) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(subscriber, _)| *subscriber != id);
        let removed = self.subscribers.len() != before;
        if removed {
            debug!(
                "Subscriber {} detached, {} active",
                id,
                self.subscribers.len()
            );
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
