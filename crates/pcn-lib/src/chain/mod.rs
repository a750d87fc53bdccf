//! Watches the chain on behalf of every channel: confirms funding outputs,
//! detects and classifies spends of them, and drives each closed channel
//! through output resolution, including justice on revoked commitments.
//!
//! The actor holds no chain connection of its own. The embedder feeds it
//! connected and disconnected blocks in order and hands it a
//! [`ChainBackend`] for broadcasting; all durable progress lives in the
//! channel and contract stores, so after a restart the embedder replays
//! blocks from the last height it delivered.

mod contract;
mod store;

pub use contract::{
    BreachRecord, CloseKind, ContractState, LimboOutput, OutputKind, ResolutionError,
};
pub use store::{ContractStateStore, ContractStateStoreDeref};

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{OutPoint, Transaction};
use ractor::{async_trait as rasync_trait, Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelActorState, ChannelActorStateStore};
use crate::config::ChainConfig;
use crate::invoice::InvoiceStore;
use crate::node::{NodeActorEvent, NodeActorMessage};
use crate::now_timestamp_as_millis_u64;
use crate::switch::SwitchActorMessage;
use crate::types::Hash256;

use contract::{
    build_justice_transaction, build_output_claim, extract_preimage, own_second_stage_script,
    resolve_close, revoked_second_stage_script, txid_hash,
};

/// The embedder's bridge to a bitcoin node. Blocks flow into the actor as
/// messages; transactions flow out through here.
pub trait ChainBackend: Send + Sync {
    fn broadcast_transaction(&self, tx: &Transaction) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub enum ChainActorMessage {
    /// The next block at the tip. Blocks must arrive in order, starting no
    /// later than the earliest height any stored channel still cares about.
    BlockConnected { height: u32, txs: Vec<Transaction> },
    /// The block at this height was reorged away, together with everything
    /// above it.
    BlockDisconnected { height: u32 },
    /// Puts a funding outpoint under watch for confirmation and spends.
    WatchChannel {
        channel_id: Hash256,
        funding_outpoint: OutPoint,
    },
    /// A close transaction left the channel layer; broadcast it and keep
    /// rebroadcasting until it appears in a block.
    TrackClosing { channel_id: Hash256, tx: Transaction },
    GetTipHeight(RpcReplyPort<u32>),
}

struct ChannelWatch {
    funding_outpoint: OutPoint,
    funding_seen_at: Option<u32>,
    /// The confirmed spend of the funding outpoint, gathering depth.
    spend: Option<(Transaction, u32)>,
}

pub struct ChainActorStartArguments {
    pub config: ChainConfig,
    pub backend: Arc<dyn ChainBackend>,
    pub node: ActorRef<NodeActorMessage>,
    pub switch: ActorRef<SwitchActorMessage>,
}

pub struct ChainActorState {
    config: ChainConfig,
    backend: Arc<dyn ChainBackend>,
    node: ActorRef<NodeActorMessage>,
    switch: ActorRef<SwitchActorMessage>,
    tip_height: u32,
    watches: HashMap<Hash256, ChannelWatch>,
    /// Closes we broadcast ourselves, rebroadcast until seen in a block.
    pending_closings: HashMap<Hash256, Transaction>,
    /// Unresolved contracts, mirrored in the store.
    contracts: HashMap<Hash256, ContractState>,
}

pub struct ChainActor<S> {
    store: S,
}

impl<S> ChainActor<S>
where
    S: ChannelActorStateStore + InvoiceStore + ContractStateStore + Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn broadcast(backend: &dyn ChainBackend, tx: &Transaction) {
        if let Err(error) = backend.broadcast_transaction(tx) {
            warn!(txid = ?tx.txid(), ?error, "broadcast failed, retrying next block");
        }
    }

    fn handle_block_connected(
        &self,
        state: &mut ChainActorState,
        height: u32,
        txs: Vec<Transaction>,
    ) {
        state.tip_height = height;
        let _ = state
            .switch
            .send_message(SwitchActorMessage::TipHeight(height));
        self.scan_watches(state, height, &txs);
        self.scan_contracts(state, height, &txs);
        self.process_watches(state, height);
        self.process_contracts(state, height);
        self.rebroadcast_closings(state);
    }

    fn handle_block_disconnected(&self, state: &mut ChainActorState, height: u32) {
        state.tip_height = height.saturating_sub(1);
        for watch in state.watches.values_mut() {
            if watch.funding_seen_at.map_or(false, |seen| seen >= height) {
                watch.funding_seen_at = None;
            }
            if watch.spend.as_ref().map_or(false, |(_, seen)| *seen >= height) {
                watch.spend = None;
            }
        }
        for contract in state.contracts.values_mut() {
            let mut dirty = false;
            for output in contract.outputs.iter_mut() {
                if output.resolved_at.map_or(false, |seen| seen >= height) {
                    output.resolved_at = None;
                    dirty = true;
                }
            }
            if dirty {
                self.store.insert_contract_state(contract.clone());
            }
        }
        debug!(height, "block disconnected");
    }

    /// Marks sightings of funding transactions and funding spends.
    fn scan_watches(&self, state: &mut ChainActorState, height: u32, txs: &[Transaction]) {
        for tx in txs {
            let txid = tx.txid();
            for watch in state.watches.values_mut() {
                if watch.funding_seen_at.is_none()
                    && txid == watch.funding_outpoint.txid
                    && (watch.funding_outpoint.vout as usize) < tx.output.len()
                {
                    watch.funding_seen_at = Some(height);
                }
                if watch.spend.is_none()
                    && tx
                        .input
                        .iter()
                        .any(|input| input.previous_output == watch.funding_outpoint)
                {
                    watch.spend = Some((tx.clone(), height));
                }
            }
        }
    }

    /// Marks spends of limbo outputs and reacts to what the spender reveals.
    fn scan_contracts(&self, state: &mut ChainActorState, height: u32, txs: &[Transaction]) {
        let mut spends: Vec<(Hash256, usize, Transaction)> = Vec::new();
        for tx in txs {
            for contract in state.contracts.values() {
                for (index, output) in contract.outputs.iter().enumerate() {
                    if output.resolved_at.is_some() {
                        continue;
                    }
                    if tx
                        .input
                        .iter()
                        .any(|input| input.previous_output == output.outpoint)
                    {
                        spends.push((contract.channel_id, index, tx.clone()));
                    }
                }
            }
        }
        for (channel_id, index, spender) in spends {
            self.handle_limbo_spend(state, channel_id, index, spender, height);
        }
    }

    fn handle_limbo_spend(
        &self,
        state: &mut ChainActorState,
        channel_id: Hash256,
        index: usize,
        spender: Transaction,
        height: u32,
    ) {
        let switch = state.switch.clone();
        let Some(contract) = state.contracts.get_mut(&channel_id) else {
            return;
        };
        let commitment_number = contract.commitment_number;
        let Some(output) = contract.outputs.get_mut(index) else {
            return;
        };
        output.resolved_at = Some(height);
        let spender_txid = txid_hash(&spender);
        let ours = output.claim_txid == Some(spender_txid);
        let kind = output.kind.clone();
        debug!(?channel_id, outpoint = ?output.outpoint, ours, "limbo output spent");
        match kind {
            OutputKind::OwnHtlc {
                offered,
                payment_hash,
                ..
            } => {
                if ours {
                    // our second stage confirmed; its revokeable output
                    // matures like a balance output
                    if let Some(channel) = self.store.get_channel_actor_state(&channel_id) {
                        match own_second_stage_script(&channel, commitment_number) {
                            Ok(script) => {
                                let amount =
                                    spender.output.first().map(|txout| txout.value).unwrap_or(0);
                                contract.outputs.push(LimboOutput {
                                    outpoint: OutPoint {
                                        txid: spender.txid(),
                                        vout: 0,
                                    },
                                    amount,
                                    kind: OutputKind::Delayed,
                                    witness_script: Some(script),
                                    maturity_height: height
                                        .saturating_add(channel.commitment_delay as u32),
                                    claim_txid: None,
                                    resolved_at: None,
                                });
                            }
                            Err(error) => {
                                error!(?channel_id, ?error, "second stage script underivable")
                            }
                        }
                    }
                    if offered {
                        // the timeout path won; the incoming leg fails now
                        if let Err(error) = switch.send_message(
                            SwitchActorMessage::HtlcFailedOnChain {
                                channel_id,
                                payment_hash,
                            },
                        ) {
                            error!(?channel_id, ?error, "failed to report an on-chain HTLC timeout to the switch");
                        }
                    }
                } else if let Some(preimage) = extract_preimage(&spender, &payment_hash) {
                    // the peer beat our timeout with the preimage
                    if let Err(error) = switch.send_message(
                        SwitchActorMessage::PreimageDiscovered {
                            payment_hash,
                            preimage,
                        },
                    ) {
                        error!(?channel_id, ?error, "failed to report a discovered preimage to the switch");
                    }
                }
            }
            OutputKind::RemoteHtlc {
                offered,
                payment_hash,
                ..
            } => {
                if ours {
                    if offered {
                        if let Err(error) = switch.send_message(
                            SwitchActorMessage::HtlcFailedOnChain {
                                channel_id,
                                payment_hash,
                            },
                        ) {
                            error!(?channel_id, ?error, "failed to report an on-chain HTLC timeout to the switch");
                        }
                    }
                } else if let Some(preimage) = extract_preimage(&spender, &payment_hash) {
                    if let Err(error) = switch.send_message(
                        SwitchActorMessage::PreimageDiscovered {
                            payment_hash,
                            preimage,
                        },
                    ) {
                        error!(?channel_id, ?error, "failed to report a discovered preimage to the switch");
                    }
                }
            }
            OutputKind::Revoked => {
                if !ours {
                    // the cheater moved it through a second stage; the new
                    // output is a revokeable script we hold the key for
                    self.chase_revoked_second_stage(contract, commitment_number, &spender, height);
                }
            }
            OutputKind::Delayed => {
                if !ours {
                    warn!(?channel_id, txid = ?spender.txid(), "delayed output spent by a foreign transaction");
                }
            }
        }
        self.store.insert_contract_state(contract.clone());
    }

    fn chase_revoked_second_stage(
        &self,
        contract: &mut ContractState,
        commitment_number: u64,
        spender: &Transaction,
        height: u32,
    ) {
        let Some(channel) = self.store.get_channel_actor_state(&contract.channel_id) else {
            return;
        };
        let script = match revoked_second_stage_script(&channel, commitment_number) {
            Ok(script) => script,
            Err(error) => {
                error!(channel_id = ?contract.channel_id, ?error, "revoked second stage script underivable");
                return;
            }
        };
        let expected = script.to_v0_p2wsh();
        for (vout, txout) in spender.output.iter().enumerate() {
            if txout.script_pubkey != expected {
                continue;
            }
            warn!(channel_id = ?contract.channel_id, txid = ?spender.txid(), vout, "chasing a revoked output through its second stage");
            contract.outputs.push(LimboOutput {
                outpoint: OutPoint {
                    txid: spender.txid(),
                    vout: vout as u32,
                },
                amount: txout.value,
                kind: OutputKind::Revoked,
                witness_script: Some(script.clone()),
                maturity_height: height,
                claim_txid: None,
                resolved_at: None,
            });
        }
    }

    /// Confirmation accounting for funding outputs and their spends.
    fn process_watches(&self, state: &mut ChainActorState, height: u32) {
        let conf = state.config.funding_confirmations;
        let mut to_resolve = Vec::new();
        for (channel_id, watch) in &state.watches {
            if let Some((tx, seen)) = &watch.spend {
                if height + 1 >= *seen + conf {
                    to_resolve.push((*channel_id, watch.funding_outpoint, tx.clone(), *seen));
                }
                continue;
            }
            if let Some(seen) = watch.funding_seen_at {
                if height + 1 >= seen + conf {
                    // re-announced every block until the channel records it;
                    // repeats are no-ops on the channel side
                    if let Some(channel) = self.store.get_channel_actor_state(channel_id) {
                        if channel.funding_confirmed_at.is_none() && !channel.state.is_closed() {
                            let _ = state.node.send_message(NodeActorMessage::new_event(
                                NodeActorEvent::FundingTransactionConfirmed(*channel_id, seen),
                            ));
                        }
                    }
                }
            }
        }
        for (channel_id, funding_outpoint, tx, seen) in to_resolve {
            self.begin_resolution(state, channel_id, funding_outpoint, tx, seen);
        }
    }

    /// A funding spend reached its depth: classify it and set up the
    /// contract that tracks its outputs to resolution.
    fn begin_resolution(
        &self,
        state: &mut ChainActorState,
        channel_id: Hash256,
        funding_outpoint: OutPoint,
        spend: Transaction,
        confirm_height: u32,
    ) {
        state.watches.remove(&channel_id);
        state.pending_closings.remove(&channel_id);
        let closing_txid = txid_hash(&spend);
        info!(?channel_id, txid = ?closing_txid, "funding spend reached its confirmation depth");
        let _ = state.node.send_message(NodeActorMessage::new_event(
            NodeActorEvent::ClosingTransactionConfirmed(channel_id, closing_txid),
        ));
        if state.contracts.contains_key(&channel_id) {
            return;
        }
        if let Some(contract) = self.store.get_contract_state(&channel_id) {
            // a restart between persisting the contract and finishing it
            if !contract.resolved {
                state.contracts.insert(channel_id, contract);
            }
            return;
        }
        let Some(channel) = self.store.get_channel_actor_state(&channel_id) else {
            warn!(?channel_id, "confirmed close of an unknown channel");
            return;
        };
        match resolve_close(&channel, &spend, confirm_height) {
            Ok((kind, number, outputs)) => {
                info!(
                    ?channel_id,
                    ?kind,
                    commitment_number = number,
                    outputs = outputs.len(),
                    "close classified"
                );
                let contract = ContractState {
                    channel_id,
                    funding_outpoint,
                    closing_txid,
                    kind,
                    commitment_number: number,
                    outputs,
                    resolved: false,
                };
                if kind == CloseKind::Breach {
                    self.record_breach(state, &channel, &contract);
                }
                self.store.insert_contract_state(contract.clone());
                state.contracts.insert(channel_id, contract);
            }
            Err(error) => {
                error!(?channel_id, ?error, "failed to classify the confirmed close")
            }
        }
    }

    fn record_breach(
        &self,
        state: &ChainActorState,
        channel: &ChannelActorState,
        contract: &ContractState,
    ) {
        let outputs: Vec<&LimboOutput> = contract
            .outputs
            .iter()
            .filter(|output| output.witness_script.is_some())
            .collect();
        let amount: u64 = outputs.iter().map(|output| output.amount).sum();
        match build_justice_transaction(
            channel,
            contract.commitment_number,
            &outputs,
            channel.commitment_fee,
        ) {
            Ok(Some(justice)) => {
                warn!(
                    channel_id = ?contract.channel_id,
                    commitment_number = contract.commitment_number,
                    amount,
                    "revoked commitment confirmed, claiming everything"
                );
                // the record hits disk before the justice transaction leaves
                self.store.insert_breach_record(BreachRecord {
                    channel_id: contract.channel_id,
                    breach_txid: contract.closing_txid,
                    commitment_number: contract.commitment_number,
                    justice_txid: txid_hash(&justice),
                    amount,
                    created_at: now_timestamp_as_millis_u64(),
                });
                Self::broadcast(state.backend.as_ref(), &justice);
            }
            Ok(None) => {
                warn!(channel_id = ?contract.channel_id, "no claimable outputs on the revoked commitment")
            }
            Err(error) => {
                error!(channel_id = ?contract.channel_id, ?error, "failed to build the justice transaction")
            }
        }
    }

    /// Per-block pass over the unresolved contracts: build and rebroadcast
    /// claims, and retire contracts whose outputs are all settled deep
    /// enough.
    fn process_contracts(&self, state: &mut ChainActorState, height: u32) {
        let node = state.node.clone();
        let backend = state.backend.clone();
        let resolution_conf = state.config.resolution_confirmations;
        let mut retired = Vec::new();
        for contract in state.contracts.values_mut() {
            let Some(channel) = self.store.get_channel_actor_state(&contract.channel_id) else {
                continue;
            };
            // a channel actor that was offline when the close confirmed
            // learns of it on the next block after it revives
            if !channel.state.is_closed() {
                let _ = node.send_message(NodeActorMessage::new_event(
                    NodeActorEvent::ClosingTransactionConfirmed(
                        contract.channel_id,
                        contract.closing_txid,
                    ),
                ));
            }
            let mut dirty = false;

            if contract.kind == CloseKind::Breach {
                // one justice transaction for everything still claimable
                let indices: Vec<usize> = contract
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, output)| {
                        output.resolved_at.is_none()
                            && output.witness_script.is_some()
                            && matches!(output.kind, OutputKind::Revoked)
                    })
                    .map(|(index, _)| index)
                    .collect();
                if !indices.is_empty() {
                    let selected: Vec<LimboOutput> = indices
                        .iter()
                        .map(|index| contract.outputs[*index].clone())
                        .collect();
                    let refs: Vec<&LimboOutput> = selected.iter().collect();
                    match build_justice_transaction(
                        &channel,
                        contract.commitment_number,
                        &refs,
                        channel.commitment_fee,
                    ) {
                        Ok(Some(justice)) => {
                            let justice_txid = txid_hash(&justice);
                            for index in &indices {
                                if contract.outputs[*index].claim_txid != Some(justice_txid) {
                                    contract.outputs[*index].claim_txid = Some(justice_txid);
                                    dirty = true;
                                }
                            }
                            Self::broadcast(backend.as_ref(), &justice);
                        }
                        Ok(None) => {}
                        Err(error) => error!(
                            channel_id = ?contract.channel_id,
                            ?error,
                            "failed to rebuild the justice transaction"
                        ),
                    }
                }
            }

            for output in contract.outputs.iter_mut() {
                if output.resolved_at.is_some() || matches!(output.kind, OutputKind::Revoked) {
                    continue;
                }
                let preimage = match &output.kind {
                    OutputKind::OwnHtlc {
                        offered: false,
                        payment_hash,
                        ..
                    }
                    | OutputKind::RemoteHtlc {
                        offered: false,
                        payment_hash,
                        ..
                    } => self.store.get_payment_preimage(payment_hash),
                    _ => None,
                };
                match build_output_claim(
                    &channel,
                    contract.commitment_number,
                    output,
                    preimage,
                    height,
                ) {
                    Ok(Some(claim)) => {
                        let claim_txid = txid_hash(&claim);
                        if output.claim_txid != Some(claim_txid) {
                            output.claim_txid = Some(claim_txid);
                            dirty = true;
                        }
                        Self::broadcast(backend.as_ref(), &claim);
                    }
                    Ok(None) => {}
                    Err(error) => error!(
                        channel_id = ?contract.channel_id,
                        outpoint = ?output.outpoint,
                        ?error,
                        "failed to build a claim"
                    ),
                }
            }

            let settled = contract.outputs.iter().all(|output| {
                matches!(output.resolved_at, Some(seen) if height + 1 >= seen + resolution_conf)
            });
            if !contract.resolved && settled {
                contract.resolved = true;
                dirty = true;
                info!(channel_id = ?contract.channel_id, "contract fully resolved");
                let _ = node.send_message(NodeActorMessage::new_event(
                    NodeActorEvent::ContractResolved(contract.channel_id),
                ));
                retired.push(contract.channel_id);
            }
            if dirty {
                self.store.insert_contract_state(contract.clone());
            }
        }
        for channel_id in retired {
            state.contracts.remove(&channel_id);
        }
    }

    fn rebroadcast_closings(&self, state: &ChainActorState) {
        for (channel_id, tx) in &state.pending_closings {
            let seen = state
                .watches
                .get(channel_id)
                .map(|watch| watch.spend.is_some())
                .unwrap_or(false);
            if !seen {
                Self::broadcast(state.backend.as_ref(), tx);
            }
        }
    }
}

#[rasync_trait]
impl<S> Actor for ChainActor<S>
where
    S: ChannelActorStateStore + InvoiceStore + ContractStateStore + Send + Sync + 'static,
{
    type Msg = ChainActorMessage;
    type State = ChainActorState;
    type Arguments = ChainActorStartArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        let mut contracts = HashMap::new();
        for contract in self.store.get_contract_states() {
            if contract.resolved {
                continue;
            }
            info!(
                channel_id = ?contract.channel_id,
                kind = ?contract.kind,
                "resuming contract resolution"
            );
            contracts.insert(contract.channel_id, contract);
        }
        Ok(ChainActorState {
            config: args.config,
            backend: args.backend,
            node: args.node,
            switch: args.switch,
            tip_height: 0,
            watches: HashMap::new(),
            pending_closings: HashMap::new(),
            contracts,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match message {
            ChainActorMessage::BlockConnected { height, txs } => {
                self.handle_block_connected(state, height, txs);
            }
            ChainActorMessage::BlockDisconnected { height } => {
                self.handle_block_disconnected(state, height);
            }
            ChainActorMessage::WatchChannel {
                channel_id,
                funding_outpoint,
            } => {
                debug!(?channel_id, ?funding_outpoint, "watching funding outpoint");
                state.watches.entry(channel_id).or_insert(ChannelWatch {
                    funding_outpoint,
                    funding_seen_at: None,
                    spend: None,
                });
            }
            ChainActorMessage::TrackClosing { channel_id, tx } => {
                info!(?channel_id, txid = ?tx.txid(), "broadcasting close transaction");
                Self::broadcast(state.backend.as_ref(), &tx);
                state.pending_closings.insert(channel_id, tx);
            }
            ChainActorMessage::GetTipHeight(reply) => {
                let _ = reply.send(state.tip_height);
            }
        }
        Ok(())
    }
}
