//! The HTLC switch: takes HTLCs that became irrevocably committed on an
//! incoming channel and either forwards them over the next channel or
//! settles them against a local invoice.
//!
//! Every incoming HTLC the switch acts on gets a persistent [`Circuit`]
//! before any message leaves the actor. Channel actors replay their
//! committed HTLCs on reestablish, so after a crash the switch resumes each
//! circuit from its persisted state instead of forwarding twice or losing a
//! settlement.

mod circuit;
mod store;

pub use circuit::{Circuit, CircuitKey, CircuitState};
pub use store::{CircuitStore, CircuitStoreDeref};

#[cfg(test)]
mod tests;

use ractor::rpc::CallResult;
use ractor::{async_trait as rasync_trait, Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::channel::{
    AddHtlcCommand, AddHtlcInfo, AddHtlcResponse, ChannelActorStateStore, ChannelCommand,
    ChannelCommandWithId, ChannelState, HtlcId, RemoveHtlcCommand,
};
use crate::config::MIN_HTLC_EXPIRY_DELTA_BLOCKS;
use crate::invoice::{Invoice, InvoiceError, InvoiceStatus, InvoiceStore, SettlementPolicy};
use crate::node::{NodeActorCommand, NodeActorMessage};
use crate::types::{
    sha256_hash, ChannelPolicy, FailureCode, FailureReason, ForwardingInfo, Hash256,
    RemoveHtlcFail, RemoveHtlcFulfill, RemoveHtlcReason,
};

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("invoice error: {0}")]
    InvoiceError(#[from] InvoiceError),
    #[error("no invoice with payment hash {0}")]
    InvoiceNotFound(Hash256),
    #[error("invoice {0} does not allow this in status {1}")]
    UnexpectedInvoiceStatus(Hash256, InvoiceStatus),
    #[error("the preimage does not match the payment hash")]
    PreimageMismatch,
}

#[derive(Debug)]
pub enum SwitchActorMessage {
    /// From a channel actor via the node: an inbound HTLC became
    /// irrevocably committed on the incoming channel.
    AddConfirmed(AddHtlcInfo),
    /// From a channel actor via the node: an HTLC removal became final on
    /// both ledgers.
    RemoveConfirmed {
        channel_id: Hash256,
        htlc_id: u64,
        /// True when the removed HTLC was one we offered.
        offered: bool,
        reason: RemoveHtlcReason,
    },
    /// From the resolver: a preimage showed up in an on-chain witness.
    PreimageDiscovered {
        payment_hash: Hash256,
        preimage: Hash256,
    },
    /// From the resolver: an HTLC we offered on this channel timed out on
    /// chain and its sweep is final; the incoming leg fails upstream.
    HtlcFailedOnChain {
        channel_id: Hash256,
        payment_hash: Hash256,
    },
    /// The chain tip moved; final hop expiry checks measure against this.
    TipHeight(u32),
    AddInvoice {
        invoice: Invoice,
        preimage: Option<Hash256>,
        reply: RpcReplyPort<Result<(), SwitchError>>,
    },
    /// Settle the held HTLCs of a hold invoice with its preimage.
    SettleInvoice {
        payment_hash: Hash256,
        preimage: Hash256,
        reply: RpcReplyPort<Result<(), SwitchError>>,
    },
    CancelInvoice {
        payment_hash: Hash256,
        reply: RpcReplyPort<Result<(), SwitchError>>,
    },
}

pub struct SwitchActorStartArguments {
    pub node: ActorRef<NodeActorMessage>,
}

pub struct SwitchActorState {
    node: ActorRef<NodeActorMessage>,
    tip_height: u32,
}

pub struct SwitchActor<S> {
    store: S,
}

fn fail_reason(code: FailureCode) -> RemoveHtlcReason {
    RemoveHtlcReason::Fail(RemoveHtlcFail {
        reason: FailureReason::new(code),
    })
}

fn fulfill_reason(preimage: Hash256) -> RemoveHtlcReason {
    RemoveHtlcReason::Fulfill(RemoveHtlcFulfill {
        payment_preimage: preimage,
    })
}

/// Checks an incoming HTLC against the outgoing channel's policy before
/// anything is committed to. Returns the failure reported upstream, if any.
fn forward_policy_failure(
    policy: &ChannelPolicy,
    outgoing_ready: bool,
    outgoing_balance: u64,
    incoming_amount: u64,
    incoming_expiry: u64,
    forward: &ForwardingInfo,
) -> Option<FailureCode> {
    if !outgoing_ready {
        return Some(FailureCode::TemporaryChannelFailure);
    }
    if forward.amount < policy.min_htlc_value {
        return Some(FailureCode::AmountBelowMinimum);
    }
    let fee =
        (forward.amount as u128 * policy.fee_proportional_millionths as u128 / 1_000_000) as u64;
    if incoming_amount < forward.amount.saturating_add(fee) {
        return Some(FailureCode::FeeInsufficient);
    }
    if incoming_expiry < forward.expiry.saturating_add(policy.expiry_delta) {
        return Some(FailureCode::ExpiryTooSoon);
    }
    if forward.amount > outgoing_balance {
        return Some(FailureCode::TemporaryChannelFailure);
    }
    None
}

/// Checks an incoming HTLC against the invoice it pays. Returns the failure
/// reported upstream, if any.
fn invoice_acceptance_failure(
    invoice: &Invoice,
    status: InvoiceStatus,
    amount: u64,
    expiry: u64,
    tip_height: u32,
) -> Option<FailureCode> {
    match status {
        InvoiceStatus::Cancelled => return Some(FailureCode::InvoiceCancelled),
        InvoiceStatus::Expired => return Some(FailureCode::InvoiceExpired),
        // a settled invoice answers repeat payments like an unknown one,
        // revealing nothing
        InvoiceStatus::Settled => return Some(FailureCode::UnknownPaymentHash),
        InvoiceStatus::Open | InvoiceStatus::Held => {}
    }
    if invoice.is_expired() {
        return Some(FailureCode::InvoiceExpired);
    }
    if !invoice.accepts_amount(amount) {
        return Some(FailureCode::IncorrectPaymentAmount);
    }
    if expiry < (tip_height as u64).saturating_add(MIN_HTLC_EXPIRY_DELTA_BLOCKS) {
        return Some(FailureCode::FinalExpiryTooSoon);
    }
    None
}

impl<S> SwitchActor<S>
where
    S: ChannelActorStateStore + InvoiceStore + CircuitStore + Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Routes an `AddHtlc` through the node to the outgoing channel and
    /// waits for its answer. A channel with no live actor drops the command,
    /// which surfaces here as a sender error.
    async fn add_outgoing_htlc(
        &self,
        state: &SwitchActorState,
        channel_id: Hash256,
        command: AddHtlcCommand,
    ) -> Result<AddHtlcResponse, FailureCode> {
        let result = state
            .node
            .call(
                |reply| {
                    NodeActorMessage::new_command(NodeActorCommand::ControlPcnChannel(
                        ChannelCommandWithId {
                            channel_id,
                            command: ChannelCommand::AddHtlc(command, reply),
                        },
                    ))
                },
                None,
            )
            .await;
        match result {
            Ok(CallResult::Success(Ok(response))) => Ok(response),
            Ok(CallResult::Success(Err(error))) => {
                debug!(?channel_id, ?error, "outgoing channel rejected the HTLC");
                Err(FailureCode::TemporaryChannelFailure)
            }
            _ => {
                debug!(?channel_id, "no live actor for the outgoing channel");
                Err(FailureCode::TemporaryChannelFailure)
            }
        }
    }

    /// Asks the incoming channel to remove its HTLC. A failure is not
    /// final: the circuit stays in `Closing` and the removal is reissued
    /// when the channel replays the HTLC on reestablish.
    async fn remove_incoming_htlc(
        &self,
        state: &SwitchActorState,
        key: CircuitKey,
        reason: RemoveHtlcReason,
    ) {
        let command = RemoveHtlcCommand {
            htlc_id: key.htlc_id,
            reason,
        };
        let result = state
            .node
            .call(
                |reply| {
                    NodeActorMessage::new_command(NodeActorCommand::ControlPcnChannel(
                        ChannelCommandWithId {
                            channel_id: key.channel_id,
                            command: ChannelCommand::RemoveHtlc(command, reply),
                        },
                    ))
                },
                None,
            )
            .await;
        match result {
            Ok(CallResult::Success(Ok(()))) => {}
            Ok(CallResult::Success(Err(error))) => {
                debug!(
                    channel_id = ?key.channel_id,
                    htlc_id = key.htlc_id,
                    ?error,
                    "failed to remove the incoming HTLC"
                );
            }
            _ => {
                debug!(
                    channel_id = ?key.channel_id,
                    htlc_id = key.htlc_id,
                    "no live actor for the incoming channel, removal deferred"
                );
            }
        }
    }

    /// Records the decided outcome, then starts removing the incoming HTLC.
    async fn close_circuit(
        &self,
        state: &SwitchActorState,
        mut circuit: Circuit,
        reason: RemoveHtlcReason,
    ) {
        circuit.state = CircuitState::Closing(reason.clone());
        self.store.insert_circuit(circuit.clone());
        self.remove_incoming_htlc(state, circuit.incoming, reason)
            .await;
    }

    async fn handle_add_confirmed(&self, state: &mut SwitchActorState, info: AddHtlcInfo) {
        let incoming = CircuitKey::new(info.channel_id, info.htlc_id);
        if let Some(circuit) = self.store.get_circuit(&incoming) {
            // a replay after a restart or reestablish; pick up where the
            // persisted circuit left off
            match circuit.state.clone() {
                CircuitState::Opened => match circuit.forwarding.clone() {
                    Some(forward) => self.dispatch_forward(state, circuit, forward).await,
                    None => {
                        warn!(?incoming, "dropping a circuit with no destination");
                        self.store.delete_circuit(&incoming);
                    }
                },
                CircuitState::Closing(reason) => {
                    self.remove_incoming_htlc(state, incoming, reason).await;
                }
                CircuitState::Forwarded | CircuitState::Held => {}
            }
            return;
        }
        match info.forwarding.clone() {
            Some(forward) => self.forward_htlc(state, info, forward).await,
            None => self.receive_htlc(state, info).await,
        }
    }

    async fn forward_htlc(
        &self,
        state: &mut SwitchActorState,
        info: AddHtlcInfo,
        forward: ForwardingInfo,
    ) {
        let incoming = CircuitKey::new(info.channel_id, info.htlc_id);
        let failure = match self.store.get_channel_actor_state(&forward.channel_id) {
            Some(channel) => forward_policy_failure(
                &channel.policy,
                matches!(channel.state, ChannelState::ChannelReady),
                channel.local_balance_available(),
                info.amount,
                info.expiry,
                &forward,
            ),
            None => Some(FailureCode::UnknownNextHop),
        };
        if let Some(code) = failure {
            debug!(?incoming, next = ?forward.channel_id, %code, "refusing to forward");
            self.remove_incoming_htlc(state, incoming, fail_reason(code))
                .await;
            return;
        }
        // the circuit hits the store before the outgoing add goes out, so a
        // crash in between cannot lose track of the incoming HTLC
        let circuit = Circuit {
            incoming,
            outgoing: None,
            payment_hash: info.payment_hash,
            amount: info.amount,
            expiry: info.expiry,
            forwarding: Some(forward.clone()),
            state: CircuitState::Opened,
        };
        self.store.insert_circuit(circuit.clone());
        self.dispatch_forward(state, circuit, forward).await;
    }

    async fn dispatch_forward(
        &self,
        state: &mut SwitchActorState,
        mut circuit: Circuit,
        forward: ForwardingInfo,
    ) {
        // a crash between issuing the add and recording its id leaves the
        // HTLC offered in the outgoing channel; adopt it instead of adding
        // a second one
        if let Some(existing) = self.find_outgoing_htlc(&forward, circuit.payment_hash) {
            debug!(
                incoming = ?circuit.incoming,
                outgoing = ?existing,
                "adopting an HTLC already offered downstream"
            );
            circuit.outgoing = Some(existing);
            circuit.state = CircuitState::Forwarded;
            self.store.insert_circuit(circuit);
            return;
        }
        let command = AddHtlcCommand {
            amount: forward.amount,
            payment_hash: circuit.payment_hash,
            expiry: forward.expiry,
            forwarding: None,
        };
        match self
            .add_outgoing_htlc(state, forward.channel_id, command)
            .await
        {
            Ok(response) => {
                info!(
                    incoming = ?circuit.incoming,
                    next = ?forward.channel_id,
                    htlc_id = response.htlc_id,
                    amount = forward.amount,
                    "HTLC forwarded"
                );
                circuit.outgoing = Some(CircuitKey::new(forward.channel_id, response.htlc_id));
                circuit.state = CircuitState::Forwarded;
                self.store.insert_circuit(circuit);
            }
            Err(code) => self.close_circuit(state, circuit, fail_reason(code)).await,
        }
    }

    /// Scans the outgoing channel for an HTLC we already offered for this
    /// circuit and no other circuit claims.
    fn find_outgoing_htlc(
        &self,
        forward: &ForwardingInfo,
        payment_hash: Hash256,
    ) -> Option<CircuitKey> {
        let channel = self.store.get_channel_actor_state(&forward.channel_id)?;
        for htlc in channel.htlc_state.get_offered_htlcs() {
            if htlc.payment_hash != payment_hash
                || htlc.amount != forward.amount
                || htlc.expiry != forward.expiry
            {
                continue;
            }
            let key = CircuitKey::new(forward.channel_id, u64::from(htlc.htlc_id));
            if self.store.get_circuit_by_outgoing(&key).is_none() {
                return Some(key);
            }
        }
        None
    }

    async fn receive_htlc(&self, state: &mut SwitchActorState, info: AddHtlcInfo) {
        let incoming = CircuitKey::new(info.channel_id, info.htlc_id);
        let Some(invoice) = self.store.get_invoice(&info.payment_hash) else {
            debug!(
                payment_hash = ?info.payment_hash,
                "received an HTLC for an unknown payment hash"
            );
            self.remove_incoming_htlc(state, incoming, fail_reason(FailureCode::UnknownPaymentHash))
                .await;
            return;
        };
        let status = self
            .store
            .get_invoice_status(&info.payment_hash)
            .unwrap_or(InvoiceStatus::Open);
        if let Some(code) =
            invoice_acceptance_failure(&invoice, status, info.amount, info.expiry, state.tip_height)
        {
            if code == FailureCode::InvoiceExpired && !status.is_final() {
                let _ = self
                    .store
                    .update_invoice_status(&info.payment_hash, InvoiceStatus::Expired);
            }
            debug!(payment_hash = ?info.payment_hash, %code, "refusing an incoming payment");
            self.remove_incoming_htlc(state, incoming, fail_reason(code))
                .await;
            return;
        }
        let circuit = Circuit {
            incoming,
            outgoing: None,
            payment_hash: info.payment_hash,
            amount: info.amount,
            expiry: info.expiry,
            forwarding: None,
            state: CircuitState::Held,
        };
        match invoice.policy {
            SettlementPolicy::Immediate => {
                match self.store.get_payment_preimage(&info.payment_hash) {
                    Some(preimage) => {
                        info!(
                            payment_hash = ?info.payment_hash,
                            amount = info.amount,
                            "settling an incoming payment"
                        );
                        self.close_circuit(state, circuit, fulfill_reason(preimage))
                            .await;
                    }
                    None => {
                        // an invoice built from a bare hash must be a hold
                        // invoice; without the preimage there is no way to
                        // settle
                        warn!(
                            payment_hash = ?info.payment_hash,
                            "no preimage stored for an immediate invoice"
                        );
                        self.remove_incoming_htlc(
                            state,
                            incoming,
                            fail_reason(FailureCode::UnknownPaymentHash),
                        )
                        .await;
                    }
                }
            }
            SettlementPolicy::HoldUntilSignal => {
                info!(
                    payment_hash = ?info.payment_hash,
                    amount = info.amount,
                    "holding an incoming payment"
                );
                self.store.insert_circuit(circuit);
                if let Err(error) = self
                    .store
                    .update_invoice_status(&info.payment_hash, InvoiceStatus::Held)
                {
                    error!(
                        payment_hash = ?info.payment_hash,
                        ?error,
                        "failed to mark the invoice held"
                    );
                }
            }
        }
    }

    async fn handle_remove_confirmed(
        &self,
        state: &mut SwitchActorState,
        channel_id: Hash256,
        htlc_id: u64,
        offered: bool,
        reason: RemoveHtlcReason,
    ) {
        let key = CircuitKey::new(channel_id, htlc_id);
        if offered {
            // the downstream leg resolved; carry the outcome back upstream
            let Some(circuit) = self.store.get_circuit_by_outgoing(&key) else {
                debug!(?key, "removal confirmed for an HTLC with no circuit");
                return;
            };
            if let RemoveHtlcReason::Fulfill(fulfill) = &reason {
                self.store
                    .insert_payment_preimage(circuit.payment_hash, fulfill.payment_preimage);
            }
            info!(
                incoming = ?circuit.incoming,
                outgoing = ?key,
                fulfilled = reason.is_fulfill(),
                "forwarded HTLC resolved downstream"
            );
            self.close_circuit(state, circuit, reason).await;
        } else {
            // our removal of the incoming HTLC is final; the circuit is done
            let Some(circuit) = self.store.get_circuit(&key) else {
                return;
            };
            if circuit.forwarding.is_none() {
                self.finalize_invoice(&circuit.payment_hash, &reason);
            }
            self.store.delete_circuit(&key);
            debug!(?key, fulfilled = reason.is_fulfill(), "circuit closed");
        }
    }

    fn finalize_invoice(&self, payment_hash: &Hash256, reason: &RemoveHtlcReason) {
        let status = self.store.get_invoice_status(payment_hash);
        let next = match (reason.is_fulfill(), status) {
            (true, _) => Some(InvoiceStatus::Settled),
            // a held HTLC failed without a settle; the invoice takes
            // payments again
            (false, Some(InvoiceStatus::Held)) => Some(InvoiceStatus::Open),
            (false, _) => None,
        };
        if let Some(next) = next {
            if let Err(error) = self.store.update_invoice_status(payment_hash, next) {
                error!(?payment_hash, ?error, "failed to update the invoice status");
            }
        }
    }

    fn held_circuits(&self, payment_hash: &Hash256) -> Vec<Circuit> {
        self.store
            .get_circuits()
            .into_iter()
            .filter(|circuit| {
                circuit.payment_hash == *payment_hash && circuit.state == CircuitState::Held
            })
            .collect()
    }

    fn forwarded_circuits(&self, payment_hash: &Hash256) -> Vec<Circuit> {
        self.store
            .get_circuits()
            .into_iter()
            .filter(|circuit| {
                circuit.payment_hash == *payment_hash && circuit.state == CircuitState::Forwarded
            })
            .collect()
    }

    async fn settle_invoice(
        &self,
        state: &mut SwitchActorState,
        payment_hash: Hash256,
        preimage: Hash256,
    ) -> Result<(), SwitchError> {
        if self.store.get_invoice(&payment_hash).is_none() {
            return Err(SwitchError::InvoiceNotFound(payment_hash));
        }
        if sha256_hash(preimage.as_ref()) != payment_hash {
            return Err(SwitchError::PreimageMismatch);
        }
        let status = self
            .store
            .get_invoice_status(&payment_hash)
            .unwrap_or(InvoiceStatus::Open);
        if status != InvoiceStatus::Held {
            return Err(SwitchError::UnexpectedInvoiceStatus(payment_hash, status));
        }
        self.store.insert_payment_preimage(payment_hash, preimage);
        for circuit in self.held_circuits(&payment_hash) {
            self.close_circuit(state, circuit, fulfill_reason(preimage))
                .await;
        }
        Ok(())
    }

    async fn cancel_invoice(
        &self,
        state: &mut SwitchActorState,
        payment_hash: Hash256,
    ) -> Result<(), SwitchError> {
        if self.store.get_invoice(&payment_hash).is_none() {
            return Err(SwitchError::InvoiceNotFound(payment_hash));
        }
        let status = self
            .store
            .get_invoice_status(&payment_hash)
            .unwrap_or(InvoiceStatus::Open);
        match status {
            InvoiceStatus::Cancelled => return Ok(()),
            InvoiceStatus::Settled | InvoiceStatus::Expired => {
                return Err(SwitchError::UnexpectedInvoiceStatus(payment_hash, status));
            }
            InvoiceStatus::Open | InvoiceStatus::Held => {}
        }
        self.store
            .update_invoice_status(&payment_hash, InvoiceStatus::Cancelled)?;
        // an unrevealed preimage must not settle a later HTLC
        self.store.remove_payment_preimage(&payment_hash);
        for circuit in self.held_circuits(&payment_hash) {
            self.close_circuit(state, circuit, fail_reason(FailureCode::InvoiceCancelled))
                .await;
        }
        Ok(())
    }

    async fn handle_preimage_discovered(
        &self,
        state: &mut SwitchActorState,
        payment_hash: Hash256,
        preimage: Hash256,
    ) {
        if sha256_hash(preimage.as_ref()) != payment_hash {
            warn!(
                ?payment_hash,
                "discarding a preimage that does not match its payment hash"
            );
            return;
        }
        self.store.insert_payment_preimage(payment_hash, preimage);
        // a forwarded HTLC whose downstream leg settled on chain never
        // comes back through RemoveConfirmed; settle the incoming leg here
        for circuit in self.forwarded_circuits(&payment_hash) {
            info!(
                incoming = ?circuit.incoming,
                ?payment_hash,
                "settling upstream with an on-chain preimage"
            );
            self.close_circuit(state, circuit, fulfill_reason(preimage))
                .await;
        }
    }

    async fn handle_htlc_failed_on_chain(
        &self,
        state: &mut SwitchActorState,
        channel_id: Hash256,
        payment_hash: Hash256,
    ) {
        for circuit in self.forwarded_circuits(&payment_hash) {
            if circuit.outgoing.map(|key| key.channel_id) != Some(channel_id) {
                continue;
            }
            info!(
                incoming = ?circuit.incoming,
                ?payment_hash,
                "failing upstream after an on-chain timeout"
            );
            self.close_circuit(
                state,
                circuit,
                fail_reason(FailureCode::PermanentChannelFailure),
            )
            .await;
        }
    }
}

#[rasync_trait]
impl<S> Actor for SwitchActor<S>
where
    S: ChannelActorStateStore + InvoiceStore + CircuitStore + Send + Sync + 'static,
{
    type Msg = SwitchActorMessage;
    type State = SwitchActorState;
    type Arguments = SwitchActorStartArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let circuits = self.store.get_circuits();
        for circuit in &circuits {
            let CircuitState::Closing(reason) = &circuit.state else {
                continue;
            };
            // the removal may have become final while we were down; if the
            // incoming channel no longer carries the HTLC, the circuit is
            // done
            let gone = match self
                .store
                .get_channel_actor_state(&circuit.incoming.channel_id)
            {
                Some(channel) => channel
                    .htlc_state
                    .get(&HtlcId::Received(circuit.incoming.htlc_id))
                    .is_none(),
                None => true,
            };
            if gone {
                if circuit.forwarding.is_none() {
                    self.finalize_invoice(&circuit.payment_hash, reason);
                }
                self.store.delete_circuit(&circuit.incoming);
                debug!(key = ?circuit.incoming, "circuit resolved while offline");
            }
        }
        if !circuits.is_empty() {
            info!(
                count = circuits.len(),
                "carried over persisted circuits; channels replay their HTLCs on reestablish"
            );
        }
        Ok(SwitchActorState {
            node: args.node,
            tip_height: 0,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SwitchActorMessage::AddConfirmed(info) => {
                self.handle_add_confirmed(state, info).await;
            }
            SwitchActorMessage::RemoveConfirmed {
                channel_id,
                htlc_id,
                offered,
                reason,
            } => {
                self.handle_remove_confirmed(state, channel_id, htlc_id, offered, reason)
                    .await;
            }
            SwitchActorMessage::PreimageDiscovered {
                payment_hash,
                preimage,
            } => {
                self.handle_preimage_discovered(state, payment_hash, preimage)
                    .await;
            }
            SwitchActorMessage::HtlcFailedOnChain {
                channel_id,
                payment_hash,
            } => {
                self.handle_htlc_failed_on_chain(state, channel_id, payment_hash)
                    .await;
            }
            SwitchActorMessage::TipHeight(height) => {
                state.tip_height = height;
            }
            SwitchActorMessage::AddInvoice {
                invoice,
                preimage,
                reply,
            } => {
                let result = self
                    .store
                    .insert_invoice(invoice, preimage)
                    .map_err(SwitchError::from);
                let _ = reply.send(result);
            }
            SwitchActorMessage::SettleInvoice {
                payment_hash,
                preimage,
                reply,
            } => {
                let result = self.settle_invoice(state, payment_hash, preimage).await;
                let _ = reply.send(result);
            }
            SwitchActorMessage::CancelInvoice {
                payment_hash,
                reply,
            } => {
                let result = self.cancel_invoice(state, payment_hash).await;
                let _ = reply.send(result);
            }
        }
        Ok(())
    }
}
