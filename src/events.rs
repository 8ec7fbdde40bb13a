//! Node-wide event notifications.
//!
//! Components publish on a shared broadcast bus: the writer announces saved
//! units and stability advancement, the consensus engine announces decisions.
//! Subscribers that fall behind lose the oldest events, never block the
//! publisher.

use tokio::sync::broadcast;

use crate::identity::Address;
use crate::ledger::unit::{PowType, UnitId};

/// Events published on the node bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// A unit was durably committed.
    UnitSaved { unit: UnitId, pow_type: PowType },
    /// The main-chain stability point advanced to `mci`.
    MciStable { mci: u64 },
    /// The BFT committee decided a proposal.
    Decision {
        height: u64,
        phase: u32,
        proposer: Address,
        unit: UnitId,
        approvals: usize,
    },
    /// The mining schedule moved to a new round.
    RoundAdvanced { round_index: u64 },
}

/// Cloneable handle to the node event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(crate::constants::EVENT_CHANNEL_CAPACITY);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
