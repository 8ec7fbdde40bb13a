//! Node assembly and lifecycle.
//!
//! `Node::start` brings the subsystems up in dependency order: committee
//! resolution, the sled store, the on-disk identity, definition seeding,
//! genesis bootstrap, and finally the consensus engine plus the pump tasks
//! that connect it to the gossip hub and the event bus. The returned handle
//! is the ingestion surface for everything outside consensus: externally
//! received units (`submit_unit`) and peer round reports (`report_round`).
//!
//! Startup is fatal-fast: a misconfigured committee or an ambiguous identity
//! row stops the node before it produces a single message. Once running,
//! failures stay inside the task that saw them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ArborConfig, Committee, ConfigError};
use crate::consensus::composer::TrustMeComposer;
use crate::consensus::engine::{ConsensusEngine, ConsensusError, EngineCommand};
use crate::consensus::messages::{decode_message, MessageKind};
use crate::events::{EventBus, NodeEvent};
use crate::gossip::GossipChannel;
use crate::identity::{Address, IdentityError, LocalIdentity, Signer};
use crate::ledger::main_chain::MainChainError;
use crate::ledger::storage::{LedgerStore, RoundRecord, SledLedgerStore, StorageError};
use crate::ledger::unit::{Author, Definition, Message, PowType, Unit};
use crate::ledger::writer::{CommitOutcome, UnitWriter, ValidationState, WriterError};
use crate::round::{RoundError, RoundOracle};

/// Payload of the one unit every ledger starts from.
const GENESIS_TEXT: &str = "arbor genesis";

/// Errors that can stop a node from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    MainChain(#[from] MainChainError),
    #[error(transparent)]
    Round(#[from] RoundError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error("identity tree holds {0} addresses, expected exactly one")]
    IdentityRows(usize),
    #[error("data directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running node: the ledger, its consensus engine, and the pump tasks
/// wiring them to the gossip hub.
pub struct Node {
    address: Address,
    store: Arc<SledLedgerStore>,
    writer: Arc<UnitWriter<SledLedgerStore>>,
    events: EventBus,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    engine_task: JoinHandle<Result<(), ConsensusError>>,
    _ready: watch::Sender<bool>,
}

impl Node {
    /// Start a node over the given gossip channel.
    ///
    /// Nodes of one local cluster share a single hub; a networked deployment
    /// substitutes its own `GossipChannel`. The consensus engine is spawned
    /// gated on a readiness flag that only flips once the identity row is
    /// registered and every pump is running, so no vote can leave the node
    /// half-wired.
    pub async fn start(
        config: &ArborConfig,
        gossip: Arc<dyn GossipChannel>,
    ) -> Result<Node, NodeError> {
        let committee = config.committee.resolve()?;

        let data_dir = PathBuf::from(&config.node.data_dir);
        std::fs::create_dir_all(&data_dir)?;
        let store = Arc::new(SledLedgerStore::open(&data_dir.join("ledger"))?);

        let identity: Arc<dyn Signer> = Arc::new(LocalIdentity::load_or_generate(&data_dir)?);
        let address = identity.address();
        store.register_identity(&address)?;
        let rows = store.identity_addresses()?;
        if rows.len() != 1 {
            return Err(NodeError::IdentityRows(rows.len()));
        }
        info!(%address, "coordinator identity ready");

        // Every committee key is on file before the first vote arrives, so
        // precommit signatures verify even for peers we never saw a unit
        // from.
        for seat in committee
            .witnesses
            .iter()
            .chain(std::iter::once(&committee.foundation))
        {
            store.put_definition(
                &seat.address,
                &Definition {
                    public_key: seat.public_key,
                },
            )?;
        }

        let events = EventBus::new();
        let writer = Arc::new(UnitWriter::new(Arc::clone(&store), events.clone()));

        match store.chain_meta()? {
            Some(meta) => {
                debug!(
                    last_stable_mci = meta.last_stable_mci,
                    "ledger already bootstrapped"
                );
            }
            None => {
                let outcome = writer
                    .commit(genesis_unit(&committee), ValidationState::default())
                    .await?;
                store.put_round(&RoundRecord {
                    round_index: 1,
                    anchor_mci: 0,
                })?;
                info!(unit = %outcome.unit, "genesis unit committed");
            }
        }

        let oracle = RoundOracle::new(
            Arc::clone(&store),
            committee.witness_addresses(),
            committee.foundation.address,
        )?;
        let composer = TrustMeComposer::new(Arc::clone(&store), Arc::clone(&identity));

        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (outgoing_tx, mut outgoing_rx) =
            mpsc::channel(crate::constants::ENGINE_INBOX_CAPACITY);
        let (engine, commands) = ConsensusEngine::new(
            Arc::clone(&store),
            Arc::clone(&writer),
            composer,
            oracle,
            Arc::clone(&identity),
            events.clone(),
            outgoing_tx,
            ready_rx,
            shutdown.clone(),
        );
        let engine_task = tokio::spawn(engine.run());

        let mut tasks = Vec::new();

        // Outgoing consensus traffic to the hub.
        {
            let hub = Arc::clone(&gossip);
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = token.cancelled() => break,
                        received = outgoing_rx.recv() => match received {
                            Some(message) => message,
                            None => break,
                        },
                    };
                    if let Err(error) = hub.publish(&message).await {
                        warn!(%error, "failed to publish a consensus message");
                    }
                }
            }));
        }

        // One intake pump per topic. The hub loops our own traffic back;
        // dropping it here saves the engine a redundant signature check.
        for kind in MessageKind::ALL {
            let mut topic = gossip.subscribe(kind);
            let inbox = commands.clone();
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let payload = tokio::select! {
                        _ = token.cancelled() => break,
                        received = topic.recv() => match received {
                            Ok(payload) => payload,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, topic = kind.channel(), "gossip intake lagging");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    };
                    let message = match decode_message(&payload) {
                        Ok(message) => message,
                        Err(error) => {
                            warn!(%error, topic = kind.channel(), "dropping undecodable gossip");
                            continue;
                        }
                    };
                    if message.sender() == address {
                        continue;
                    }
                    if inbox.send(EngineCommand::Gossip(message)).await.is_err() {
                        break;
                    }
                }
            }));
        }

        // Ledger events feed back into consensus: a stability advance starts
        // the next height, a new round row unblocks a deferred one.
        {
            let mut bus = events.subscribe();
            let inbox = commands;
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = token.cancelled() => break,
                        received = bus.recv() => match received {
                            Ok(event) => event,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "event intake lagging");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    };
                    let command = match event {
                        NodeEvent::MciStable { mci } => EngineCommand::MciStable { mci },
                        NodeEvent::RoundAdvanced { round_index } => {
                            EngineCommand::RoundAdvanced { round_index }
                        }
                        _ => continue,
                    };
                    if inbox.send(command).await.is_err() {
                        break;
                    }
                }
            }));
        }

        let _ = ready_tx.send(true);
        info!(%address, witnesses = committee.witnesses.len(), "node started");

        Ok(Node {
            address,
            store,
            writer,
            events,
            shutdown,
            tasks,
            engine_task,
            _ready: ready_tx,
        })
    }

    /// The local coordinator address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Read access to the ledger.
    pub fn store(&self) -> &Arc<SledLedgerStore> {
        &self.store
    }

    /// Subscribe to ledger and consensus events.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Commit an externally received unit.
    ///
    /// The chain view is derived from the unit's parents, so a unit whose
    /// parents are not all known yet fails here and should be resubmitted
    /// once they are.
    pub async fn submit_unit(&self, unit: Unit) -> Result<CommitOutcome, NodeError> {
        let validation = ValidationState::derived(self.store.as_ref(), &unit.parent_units)?;
        let outcome = self.writer.commit(unit, validation).await?;
        Ok(outcome)
    }

    /// Record a peer-reported mining round.
    ///
    /// Proof-of-work runs outside this node; peers report each round opening
    /// as `(round_index, anchor_mci)`. Reports at or below the latest
    /// recorded round are ignored. Returns whether a row was appended.
    pub fn report_round(&self, round_index: u64, anchor_mci: u64) -> Result<bool, NodeError> {
        let latest = self.store.latest_round()?.map_or(0, |r| r.round_index);
        if round_index <= latest {
            debug!(round_index, latest, "stale round report");
            return Ok(false);
        }
        self.store.put_round(&RoundRecord {
            round_index,
            anchor_mci,
        })?;
        info!(round_index, anchor_mci, "round recorded from peer report");
        self.events.emit(NodeEvent::RoundAdvanced { round_index });
        Ok(true)
    }

    /// Stop every task and flush the store.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        let engine_result = match self.engine_task.await {
            Ok(result) => result.map_err(NodeError::from),
            Err(join_error) => {
                warn!(%join_error, "consensus task did not exit cleanly");
                Ok(())
            }
        };
        self.store.flush()?;
        engine_result
    }
}

/// The unit every ledger starts from. Deterministic, so every node derives
/// the same genesis id from the same committee; carrying no signatures, it
/// is the one unit nobody needs to author.
fn genesis_unit(committee: &Committee) -> Unit {
    Unit {
        version: Unit::VERSION,
        parent_units: Vec::new(),
        authors: vec![Author {
            address: committee.foundation.address,
            definition: Some(Definition {
                public_key: committee.foundation.public_key,
            }),
            authentifiers: BTreeMap::new(),
        }],
        messages: vec![Message::Text(GENESIS_TEXT.to_string())],
        round_index: 1,
        pow_type: PowType::TrustMe,
        timestamp: 0,
        trustme: None,
    }
}
