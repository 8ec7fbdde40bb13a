//! Best-effort gossip among coordinator peers.
//!
//! Consensus traffic travels on three named channels, one per message kind.
//! [`GossipChannel`] is the seam a real transport would implement over
//! sockets; [`LocalGossipHub`] is the in-process loopback used by local
//! clusters and tests. Both sides of the seam speak the same wire codec, so
//! swapping the hub for a networked transport changes no consensus code.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::consensus::messages::{encode_message, ConsensusMessage, MessageError, MessageKind};
use crate::constants::EVENT_CHANNEL_CAPACITY;

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error(transparent)]
    Codec(#[from] MessageError),
}

/// Fan-out of consensus messages to whoever listens on the kind's channel.
///
/// Delivery is best effort: no acknowledgement, no retransmission, and slow
/// receivers lose the oldest traffic first. The consensus layer tolerates
/// all of that by construction.
#[async_trait]
pub trait GossipChannel: Send + Sync {
    /// Encode and publish a message on its kind's channel.
    async fn publish(&self, message: &ConsensusMessage) -> Result<(), GossipError>;

    /// Listen on one kind's channel. Only traffic published after the
    /// subscription is seen.
    fn subscribe(&self, kind: MessageKind) -> broadcast::Receiver<Vec<u8>>;
}

/// Loopback hub carrying gossip between engines in the same process.
pub struct LocalGossipHub {
    topics: HashMap<&'static str, broadcast::Sender<Vec<u8>>>,
}

impl LocalGossipHub {
    pub fn new(capacity: usize) -> Self {
        let topics = MessageKind::ALL
            .into_iter()
            .map(|kind| (kind.channel(), broadcast::channel(capacity).0))
            .collect();
        LocalGossipHub { topics }
    }
}

impl Default for LocalGossipHub {
    fn default() -> Self {
        LocalGossipHub::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl GossipChannel for LocalGossipHub {
    async fn publish(&self, message: &ConsensusMessage) -> Result<(), GossipError> {
        let payload = encode_message(message)?;
        if let Some(topic) = self.topics.get(message.kind().channel()) {
            // Zero subscribers just means nobody is listening yet.
            let _ = topic.send(payload);
        }
        Ok(())
    }

    fn subscribe(&self, kind: MessageKind) -> broadcast::Receiver<Vec<u8>> {
        match self.topics.get(kind.channel()) {
            Some(topic) => topic.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}
