use log::trace;
use tokio::sync::broadcast;

/// Lifecycle events emitted by the reconciler and its sub-managers.
///
/// Subscribers hold a [`broadcast::Receiver`]; dropping the receiver
/// detaches exactly that subscription, which is what lets the cloud sync
/// engine remove its own listeners on shutdown without touching anyone
/// else's.
#[derive(Clone, Debug, PartialEq)]
pub enum ReconcilerEvent {
    TargetStateChanged { version: u64 },
    StateApplied,
    ConfigApplied,
    ReconciliationComplete { version: u64 },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ReconcilerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcilerEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget emission. An event with no live subscribers is
    /// simply dropped.
    pub fn emit(&self, event: ReconcilerEvent) {
        if self.tx.send(event.clone()).is_err() {
            trace!("No subscribers for event {event:?}");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(32)
    }
}
