//! The node actor: the registry of live channel actors and the hub every
//! other subsystem is wired through.
//!
//! The embedding transport injects peer wire messages as commands and
//! subscribes to an [`OutputPort`] for outbound ones; channel actors report
//! their transitions as events, which the node fans out to the switch (HTLC
//! settlement), the chain actor (broadcasts and watches) and the embedder
//! (node events). The switch and chain actors are spawned as children of
//! the node, so one supervision tree covers the whole subsystem.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitcoin::{OutPoint, Transaction};
use ractor::{
    async_trait as rasync_trait, Actor, ActorProcessingErr, ActorRef, OutputPort, RpcReplyPort,
    SupervisionEvent,
};
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::backup::ClosedChannelStore;
use crate::chain::{ChainActor, ChainActorMessage, ChainActorStartArguments, ChainBackend};
use crate::channel::{
    AcceptChannelParameter, AddHtlcInfo, ChannelActor, ChannelActorMessage,
    ChannelActorStateStore, ChannelCommandWithId, ChannelConstraints, ChannelEvent,
    ChannelInitializationParameter, CloseFlags, OpenChannelParameter,
};
use crate::config::{ChainConfig, NodeConfig};
use crate::invoice::InvoiceStore;
use crate::now_timestamp_as_millis_u64;
use crate::switch::{CircuitStore, SwitchActor, SwitchActorMessage, SwitchActorStartArguments};
use crate::types::{
    ChannelFlags, Hash256, OpenChannel, PcnMessage, Privkey, Pubkey, RemoveHtlcReason,
};
use crate::{backup::ClosedChannelRecord, chain::ContractStateStore};
use crate::{Error, Result};

/// A wire message together with the peer it came from or goes to.
#[derive(Debug, Clone)]
pub struct PcnMessageWithPeerId {
    pub peer_id: Pubkey,
    pub message: PcnMessage,
}

impl PcnMessageWithPeerId {
    pub fn new(peer_id: Pubkey, message: PcnMessage) -> Self {
        Self { peer_id, message }
    }
}

#[derive(Debug)]
pub struct OpenChannelCommand {
    pub peer_id: Pubkey,
    pub funding_amount: u64,
    /// Whether the channel may be announced beyond the two parties.
    pub public: bool,
}

#[derive(Debug)]
pub enum NodeActorCommand {
    /// A peer wire message the embedding transport received for us.
    ProcessPcnMessage(PcnMessageWithPeerId),
    /// A wire message one of our actors wants delivered; published on the
    /// outbound port for the transport to pick up.
    SendPcnMessage(PcnMessageWithPeerId),
    /// Open a channel towards a connected peer, funded by us.
    OpenChannel(OpenChannelCommand, RpcReplyPort<Result<Hash256>>),
    /// Accept a pending incoming channel open that auto accept skipped.
    AcceptChannel(Hash256, RpcReplyPort<Result<Hash256>>),
    /// Route a command to a live channel actor by channel id.
    ControlPcnChannel(ChannelCommandWithId),
    /// The transport established a connection to this peer.
    PeerConnected(Pubkey),
    PeerDisconnected(Pubkey),
    /// Hands out the chain actor so the embedder can feed blocks to it.
    GetChainActor(RpcReplyPort<ActorRef<ChainActorMessage>>),
}

/// Transitions the channel and chain layers report back to the node.
#[derive(Debug)]
pub enum NodeActorEvent {
    /// An inbound HTLC became irrevocably committed; the switch takes over.
    HtlcAddConfirmed(AddHtlcInfo),
    /// An HTLC removal became final on both ledgers.
    HtlcRemoveConfirmed {
        channel_id: Hash256,
        htlc_id: u64,
        /// True when the removed HTLC was one we offered.
        offered: bool,
        reason: RemoveHtlcReason,
    },
    /// The open handshake completed; the embedder's wallet must now create
    /// the funding output of this amount and assign its outpoint.
    FundingNegotiated(Hash256, Pubkey, u64),
    /// The funding outpoint fixed the final channel id.
    ChannelIdChanged {
        peer_id: Pubkey,
        old_channel_id: Hash256,
        new_channel_id: Hash256,
        funding_outpoint: OutPoint,
    },
    /// Our state is stale (or restored from backup); we wait for the peer
    /// to close with its newer commitment.
    WaitingPeerClose(Hash256, Pubkey),
    /// The peer reestablished with revoked commitment numbers.
    PeerFellBehind(Hash256, Pubkey),
    /// A closing transaction is ready; the chain actor broadcasts it and
    /// rebroadcasts until it confirms.
    ClosingTransactionPending(Hash256, Pubkey, Transaction),
    ChannelClosed(Hash256, Pubkey, CloseFlags),
    ChannelReady(Hash256, Pubkey),
    /// From the chain actor: the funding transaction reached its
    /// confirmation depth at this height.
    FundingTransactionConfirmed(Hash256, u32),
    /// From the chain actor: a transaction spending the funding outpoint
    /// reached its confirmation depth.
    ClosingTransactionConfirmed(Hash256, Hash256),
    /// From the chain actor: every output of a closed channel is swept and
    /// confirmed.
    ContractResolved(Hash256),
}

#[derive(Debug)]
pub enum NodeActorMessage {
    Command(NodeActorCommand),
    Event(NodeActorEvent),
}

impl NodeActorMessage {
    pub fn new_command(command: NodeActorCommand) -> Self {
        NodeActorMessage::Command(command)
    }

    pub fn new_event(event: NodeActorEvent) -> Self {
        NodeActorMessage::Event(event)
    }
}

/// What the node reports to its embedder.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// An incoming channel open waits for an explicit accept command.
    ChannelPendingAccept(Hash256, Pubkey, u64),
    FundingNegotiated(Hash256, Pubkey, u64),
    ChannelReady(Hash256, Pubkey),
    ChannelClosed(Hash256, Pubkey, CloseFlags),
    WaitingPeerClose(Hash256, Pubkey),
    PeerFellBehind(Hash256, Pubkey),
    ContractResolved(Hash256),
}

pub struct NodeActorStartArguments {
    pub config: NodeConfig,
    pub chain_config: ChainConfig,
    pub node_key: Privkey,
    pub backend: Arc<dyn ChainBackend>,
}

pub struct NodeActorState {
    config: NodeConfig,
    local_pubkey: Pubkey,
    channels: HashMap<Hash256, ActorRef<ChannelActorMessage>>,
    peers: HashSet<Pubkey>,
    /// Incoming opens waiting for an operator accept, by temporary id.
    pending_open_channels: HashMap<Hash256, (Pubkey, OpenChannel)>,
    switch: ActorRef<SwitchActorMessage>,
    chain: ActorRef<ChainActorMessage>,
}

pub struct NodeActor<S> {
    store: S,
    outbound: Arc<OutputPort<PcnMessageWithPeerId>>,
    events: Arc<OutputPort<NodeEvent>>,
}

fn gen_channel_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill(&mut seed[..]);
    seed
}

impl<S> NodeActor<S>
where
    S: ChannelActorStateStore
        + InvoiceStore
        + CircuitStore
        + ContractStateStore
        + ClosedChannelStore
        + Clone
        + Send
        + Sync
        + 'static,
{
    pub fn new(
        store: S,
        outbound: Arc<OutputPort<PcnMessageWithPeerId>>,
        events: Arc<OutputPort<NodeEvent>>,
    ) -> Self {
        Self {
            store,
            outbound,
            events,
        }
    }

    async fn spawn_channel_actor(
        &self,
        myself: &ActorRef<NodeActorMessage>,
        state: &mut NodeActorState,
        peer_id: Pubkey,
        channel_id: Hash256,
        init: ChannelInitializationParameter,
    ) -> Result<ActorRef<ChannelActorMessage>> {
        let (actor, _) = Actor::spawn_linked(
            None,
            ChannelActor::new(
                state.local_pubkey,
                peer_id,
                myself.clone(),
                self.store.clone(),
            ),
            init,
            myself.get_cell(),
        )
        .await?;
        state.channels.insert(channel_id, actor.clone());
        Ok(actor)
    }

    async fn handle_open_channel_command(
        &self,
        myself: &ActorRef<NodeActorMessage>,
        state: &mut NodeActorState,
        command: OpenChannelCommand,
    ) -> Result<Hash256> {
        if !state.peers.contains(&command.peer_id) {
            return Err(Error::PeerNotFound(command.peer_id));
        }
        let config = &state.config;
        let (channel_id_sender, channel_id_receiver) = oneshot::channel();
        let params = OpenChannelParameter {
            funding_amount: command.funding_amount,
            seed: gen_channel_seed(),
            reserved_amount: config.reserve_sats,
            commitment_fee: config.commitment_fee_sats,
            second_stage_fee: config.second_stage_fee_sats,
            dust_limit: config.dust_limit_sats,
            commitment_delay: config.commitment_delay_blocks,
            constraints: ChannelConstraints::new(
                config.max_htlc_value_in_flight_sats,
                config.max_htlc_number_in_flight,
                config.min_htlc_value_sats,
            ),
            policy: config.channel_policy(),
            channel_flags: if command.public {
                ChannelFlags::PUBLIC
            } else {
                ChannelFlags::empty()
            },
            channel_id_sender,
        };
        let (actor, _) = Actor::spawn_linked(
            None,
            ChannelActor::new(
                state.local_pubkey,
                command.peer_id,
                myself.clone(),
                self.store.clone(),
            ),
            ChannelInitializationParameter::OpenChannel(params),
            myself.get_cell(),
        )
        .await?;
        let channel_id = channel_id_receiver.await.map_err(|_| {
            Error::InternalError(anyhow::anyhow!(
                "channel actor stopped before reporting its id"
            ))
        })?;
        state.channels.insert(channel_id, actor);
        Ok(channel_id)
    }

    async fn accept_channel(
        &self,
        myself: &ActorRef<NodeActorMessage>,
        state: &mut NodeActorState,
        peer_id: Pubkey,
        open_channel: OpenChannel,
    ) -> Result<Hash256> {
        let channel_id = open_channel.channel_id;
        let policy = state.config.channel_policy();
        self.spawn_channel_actor(
            myself,
            state,
            peer_id,
            channel_id,
            ChannelInitializationParameter::AcceptChannel(AcceptChannelParameter {
                open_channel,
                seed: gen_channel_seed(),
                policy,
            }),
        )
        .await?;
        Ok(channel_id)
    }

    async fn handle_incoming_open_channel(
        &self,
        myself: &ActorRef<NodeActorMessage>,
        state: &mut NodeActorState,
        peer_id: Pubkey,
        open_channel: OpenChannel,
    ) -> Result<()> {
        let channel_id = open_channel.channel_id;
        if state.channels.contains_key(&channel_id)
            || state.pending_open_channels.contains_key(&channel_id)
        {
            debug!(?channel_id, "ignoring repeated OpenChannel");
            return Ok(());
        }
        let auto_accept = state.config.auto_accept_channels
            && open_channel.funding_amount >= state.config.auto_accept_min_funding_sats;
        if auto_accept {
            self.accept_channel(myself, state, peer_id, open_channel)
                .await?;
        } else {
            info!(
                ?channel_id,
                peer = ?peer_id,
                funding = open_channel.funding_amount,
                "incoming channel open waits for an operator accept"
            );
            let funding_amount = open_channel.funding_amount;
            state
                .pending_open_channels
                .insert(channel_id, (peer_id, open_channel));
            self.events.send(NodeEvent::ChannelPendingAccept(
                channel_id,
                peer_id,
                funding_amount,
            ));
        }
        Ok(())
    }

    /// A `ReestablishChannel` for a channel with no live actor: either the
    /// channel is in the store and gets revived, or it closed while the
    /// peer was away and the stored record answers for it.
    async fn handle_reestablish_for_inactive_channel(
        &self,
        myself: &ActorRef<NodeActorMessage>,
        state: &mut NodeActorState,
        peer_id: Pubkey,
        message: PcnMessage,
    ) -> Result<()> {
        let channel_id = message.channel_id();
        match self.store.get_channel_actor_state(&channel_id) {
            Some(channel) if !channel.state.is_closed() => {
                let actor = self
                    .spawn_channel_actor(
                        myself,
                        state,
                        peer_id,
                        channel_id,
                        ChannelInitializationParameter::ReestablishChannel(channel_id),
                    )
                    .await?;
                actor.send_message(ChannelActorMessage::PeerMessage(message))?;
            }
            _ => match self.store.get_closed_channel_record(&channel_id) {
                Some(record) => {
                    // A restored peer reconnecting after the close still
                    // learns where the channel ended up.
                    info!(
                        ?channel_id,
                        peer = ?peer_id,
                        "peer reestablished a closed channel, replaying the final positions"
                    );
                    self.outbound.send(PcnMessageWithPeerId::new(
                        peer_id,
                        PcnMessage::ReestablishChannel(record.reestablish),
                    ));
                }
                None => {
                    warn!(?channel_id, peer = ?peer_id, "reestablish for an unknown channel");
                }
            },
        }
        Ok(())
    }

    async fn handle_peer_message(
        &self,
        myself: &ActorRef<NodeActorMessage>,
        state: &mut NodeActorState,
        peer_id: Pubkey,
        message: PcnMessage,
    ) -> Result<()> {
        match message {
            PcnMessage::OpenChannel(open_channel) => {
                self.handle_incoming_open_channel(myself, state, peer_id, open_channel)
                    .await
            }
            message => {
                let channel_id = message.channel_id();
                if let Some(actor) = state.channels.get(&channel_id) {
                    actor.send_message(ChannelActorMessage::PeerMessage(message))?;
                    Ok(())
                } else if matches!(message, PcnMessage::ReestablishChannel(_)) {
                    self.handle_reestablish_for_inactive_channel(myself, state, peer_id, message)
                        .await
                } else {
                    debug!(
                        ?channel_id,
                        message = message.as_ref(),
                        "dropping peer message for a channel with no live actor"
                    );
                    Ok(())
                }
            }
        }
    }

    /// Revives every non-closed persisted channel with this peer.
    async fn handle_peer_connected(
        &self,
        myself: &ActorRef<NodeActorMessage>,
        state: &mut NodeActorState,
        peer_id: Pubkey,
    ) -> Result<()> {
        state.peers.insert(peer_id);
        for (_, channel_id, channel_state) in self.store.get_channel_states(Some(peer_id)) {
            if channel_state.is_closed() || state.channels.contains_key(&channel_id) {
                continue;
            }
            if let Err(error) = self
                .spawn_channel_actor(
                    myself,
                    state,
                    peer_id,
                    channel_id,
                    ChannelInitializationParameter::ReestablishChannel(channel_id),
                )
                .await
            {
                error!(?channel_id, ?error, "failed to reestablish channel");
            }
        }
        Ok(())
    }

    fn handle_peer_disconnected(&self, state: &mut NodeActorState, peer_id: Pubkey) {
        state.peers.remove(&peer_id);
        for channel_id in self.store.get_channel_ids_by_peer(&peer_id) {
            if let Some(actor) = state.channels.get(&channel_id) {
                let _ = actor.send_message(ChannelActorMessage::Event(
                    ChannelEvent::PeerDisconnected,
                ));
            }
        }
        state
            .pending_open_channels
            .retain(|_, (pending_peer, _)| *pending_peer != peer_id);
    }

    async fn handle_command(
        &self,
        myself: &ActorRef<NodeActorMessage>,
        state: &mut NodeActorState,
        command: NodeActorCommand,
    ) -> Result<()> {
        match command {
            NodeActorCommand::ProcessPcnMessage(PcnMessageWithPeerId { peer_id, message }) => {
                self.handle_peer_message(myself, state, peer_id, message)
                    .await
            }
            NodeActorCommand::SendPcnMessage(message) => {
                self.outbound.send(message);
                Ok(())
            }
            NodeActorCommand::OpenChannel(command, reply) => {
                let result = self.handle_open_channel_command(myself, state, command).await;
                let _ = reply.send(result);
                Ok(())
            }
            NodeActorCommand::AcceptChannel(channel_id, reply) => {
                let result = match state.pending_open_channels.remove(&channel_id) {
                    Some((peer_id, open_channel)) => {
                        self.accept_channel(myself, state, peer_id, open_channel).await
                    }
                    None => Err(Error::ChannelNotFound(channel_id)),
                };
                let _ = reply.send(result);
                Ok(())
            }
            NodeActorCommand::ControlPcnChannel(ChannelCommandWithId {
                channel_id,
                command,
            }) => match state.channels.get(&channel_id) {
                Some(actor) => {
                    actor.send_message(ChannelActorMessage::Command(command))?;
                    Ok(())
                }
                None => {
                    // Dropping the command also drops any reply port inside
                    // it, which signals the caller.
                    warn!(?channel_id, "channel command for a channel with no live actor");
                    Ok(())
                }
            },
            NodeActorCommand::PeerConnected(peer_id) => {
                self.handle_peer_connected(myself, state, peer_id).await
            }
            NodeActorCommand::PeerDisconnected(peer_id) => {
                self.handle_peer_disconnected(state, peer_id);
                Ok(())
            }
            NodeActorCommand::GetChainActor(reply) => {
                let _ = reply.send(state.chain.clone());
                Ok(())
            }
        }
    }

    /// Channels that reached the chain leave a record behind, so a peer
    /// restoring from a static backup can still be told how they ended.
    fn record_closed_channel(&self, channel_id: Hash256, peer_id: Pubkey, flags: CloseFlags) {
        let Some(channel) = self.store.get_channel_actor_state(&channel_id) else {
            return;
        };
        if channel.funding_outpoint.is_none() {
            return;
        }
        self.store.insert_closed_channel_record(ClosedChannelRecord {
            channel_id,
            remote_pubkey: peer_id,
            close_flags: flags,
            closing_txid: channel.closing_txid,
            reestablish: channel.build_reestablish_channel_message(),
            closed_at: now_timestamp_as_millis_u64(),
        });
    }

    fn handle_event(&self, state: &mut NodeActorState, event: NodeActorEvent) -> Result<()> {
        match event {
            NodeActorEvent::HtlcAddConfirmed(info) => {
                state
                    .switch
                    .send_message(SwitchActorMessage::AddConfirmed(info))?;
            }
            NodeActorEvent::HtlcRemoveConfirmed {
                channel_id,
                htlc_id,
                offered,
                reason,
            } => {
                state
                    .switch
                    .send_message(SwitchActorMessage::RemoveConfirmed {
                        channel_id,
                        htlc_id,
                        offered,
                        reason,
                    })?;
            }
            NodeActorEvent::FundingNegotiated(channel_id, peer_id, amount) => {
                self.events
                    .send(NodeEvent::FundingNegotiated(channel_id, peer_id, amount));
            }
            NodeActorEvent::ChannelIdChanged {
                peer_id,
                old_channel_id,
                new_channel_id,
                funding_outpoint,
            } => {
                if let Some(actor) = state.channels.remove(&old_channel_id) {
                    state.channels.insert(new_channel_id, actor);
                }
                debug!(
                    ?old_channel_id,
                    ?new_channel_id,
                    peer = ?peer_id,
                    "channel id finalized"
                );
                state.chain.send_message(ChainActorMessage::WatchChannel {
                    channel_id: new_channel_id,
                    funding_outpoint,
                })?;
            }
            NodeActorEvent::WaitingPeerClose(channel_id, peer_id) => {
                self.events
                    .send(NodeEvent::WaitingPeerClose(channel_id, peer_id));
            }
            NodeActorEvent::PeerFellBehind(channel_id, peer_id) => {
                self.events
                    .send(NodeEvent::PeerFellBehind(channel_id, peer_id));
            }
            NodeActorEvent::ClosingTransactionPending(channel_id, _, tx) => {
                state
                    .chain
                    .send_message(ChainActorMessage::TrackClosing { channel_id, tx })?;
            }
            NodeActorEvent::ChannelClosed(channel_id, peer_id, flags) => {
                self.record_closed_channel(channel_id, peer_id, flags);
                state.channels.remove(&channel_id);
                self.events
                    .send(NodeEvent::ChannelClosed(channel_id, peer_id, flags));
            }
            NodeActorEvent::ChannelReady(channel_id, peer_id) => {
                self.events.send(NodeEvent::ChannelReady(channel_id, peer_id));
            }
            NodeActorEvent::FundingTransactionConfirmed(channel_id, height) => {
                if let Some(actor) = state.channels.get(&channel_id) {
                    actor.send_message(ChannelActorMessage::Event(
                        ChannelEvent::FundingTransactionConfirmed(height),
                    ))?;
                }
            }
            NodeActorEvent::ClosingTransactionConfirmed(channel_id, txid) => {
                if let Some(actor) = state.channels.get(&channel_id) {
                    actor.send_message(ChannelActorMessage::Event(
                        ChannelEvent::ClosingTransactionConfirmed(txid),
                    ))?;
                }
            }
            NodeActorEvent::ContractResolved(channel_id) => {
                self.events.send(NodeEvent::ContractResolved(channel_id));
            }
        }
        Ok(())
    }
}

#[rasync_trait]
impl<S> Actor for NodeActor<S>
where
    S: ChannelActorStateStore
        + InvoiceStore
        + CircuitStore
        + ContractStateStore
        + ClosedChannelStore
        + Clone
        + Send
        + Sync
        + 'static,
{
    type Msg = NodeActorMessage;
    type State = NodeActorState;
    type Arguments = NodeActorStartArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        let (switch, _) = Actor::spawn_linked(
            None,
            SwitchActor::new(self.store.clone()),
            SwitchActorStartArguments {
                node: myself.clone(),
            },
            myself.get_cell(),
        )
        .await?;
        let (chain, _) = Actor::spawn_linked(
            None,
            ChainActor::new(self.store.clone()),
            ChainActorStartArguments {
                config: args.chain_config,
                backend: args.backend,
                node: myself.clone(),
                switch: switch.clone(),
            },
            myself.get_cell(),
        )
        .await?;

        // Funding outpoints of persisted channels go back under watch
        // before any block is processed; the channel actors themselves only
        // come alive when their peer reconnects.
        for (_, channel_id, channel_state) in self.store.get_channel_states(None) {
            if channel_state.is_closed() {
                continue;
            }
            if let Some(channel) = self.store.get_channel_actor_state(&channel_id) {
                if let Some(funding_outpoint) = channel.funding_outpoint {
                    chain.send_message(ChainActorMessage::WatchChannel {
                        channel_id,
                        funding_outpoint,
                    })?;
                }
            }
        }

        let local_pubkey = args.node_key.pubkey();
        info!(local = ?local_pubkey, "node actor started");
        Ok(NodeActorState {
            config: args.config,
            local_pubkey,
            channels: HashMap::new(),
            peers: HashSet::new(),
            pending_open_channels: HashMap::new(),
            switch,
            chain,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        let result = match message {
            NodeActorMessage::Command(command) => {
                self.handle_command(&myself, state, command).await
            }
            NodeActorMessage::Event(event) => self.handle_event(state, event),
        };
        if let Err(error) = result {
            error!(?error, "error while processing a node message");
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        let (who, panicked) = match message {
            SupervisionEvent::ActorTerminated(who, _, _) => (who, false),
            SupervisionEvent::ActorFailed(who, _) => (who, true),
            _ => return Ok(()),
        };
        if who.get_id() == state.switch.get_cell().get_id()
            || who.get_id() == state.chain.get_cell().get_id()
        {
            error!(
                actor = ?who.get_id(),
                "a core child actor is gone, stopping the node"
            );
            myself.stop(Some("core child actor died".to_string()));
            return Ok(());
        }
        state.channels.retain(|channel_id, actor| {
            let gone = actor.get_id() == who.get_id();
            if gone && panicked {
                error!(?channel_id, "channel actor panicked");
            } else if gone {
                debug!(?channel_id, "channel actor stopped");
            }
            !gone
        });
        Ok(())
    }
}
