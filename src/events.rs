use tokio::sync::broadcast;

use crate::error::ProblemCode;

/// Lifecycle events of protocol runs, published by the service.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// A genesis round completed; every participant holds the ledger.
    LedgerInitialized { ledger: String, thid: String },
    /// A commit round promoted a batch on this peer.
    BlockCommitted {
        ledger: String,
        thid: String,
        count: usize,
        root_hash: String,
    },
    /// A protocol run terminated through the abort path.
    Aborted {
        ledger: String,
        thid: String,
        code: ProblemCode,
        explain: String,
    },
}

/// Trait for broadcasting consensus events to subscribers.
///
/// Implement this to use your own event system (message queue, webhooks,
/// etc.). The default `BroadcastEventBus` uses Tokio's broadcast channel,
/// which works well for in-process event distribution.
pub trait ConsensusEventBus: Clone + Send + Sync + 'static {
    /// The type returned when subscribing to events.
    type Receiver;

    /// Subscribe to receive events from all protocol runs.
    fn subscribe(&self) -> Self::Receiver;
    /// Publish an event.
    fn publish(&self, event: ConsensusEvent);
}

/// Default event bus implementation using Tokio's broadcast channel.
///
/// Events reach all active subscribers within the same process; late
/// subscribers miss events published before they subscribed.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<ConsensusEvent>,
}

impl BroadcastEventBus {
    /// Create a bus with a custom queue size. The size bounds how many
    /// events can be pending before slow subscribers start missing
    /// events. Default is 1000.
    pub fn new(max_queued_events: usize) -> Self {
        let (sender, _) = broadcast::channel(max_queued_events);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ConsensusEventBus for BroadcastEventBus {
    type Receiver = broadcast::Receiver<ConsensusEvent>;

    fn subscribe(&self) -> Self::Receiver {
        self.sender.subscribe()
    }

    fn publish(&self, event: ConsensusEvent) {
        let _ = self.sender.send(event);
    }
}
