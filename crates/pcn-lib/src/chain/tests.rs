use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use ractor::{async_trait, Actor, ActorProcessingErr, ActorRef};
use tempfile::tempdir;

use crate::channel::commitment::p2wpkh_script_pubkey;
use crate::channel::{
    ChannelActorState, ChannelActorStateStore, ChannelConstraints, ChannelState, CommitmentHtlc,
    CommitmentOutline, InMemorySigner, RevocationData,
};
use crate::config::ChainConfig;
use crate::node::{NodeActorEvent, NodeActorMessage};
use crate::store::Store;
use crate::switch::SwitchActorMessage;
use crate::types::{sha256_hash, ChannelFlags, ChannelPolicy, Hash256, Privkey};

use super::contract::{
    build_justice_transaction, build_output_claim, extract_preimage, resolve_close,
    revoked_second_stage_script, txid_hash, CloseKind, ContractState, LimboOutput, OutputKind,
};
use super::{ChainActor, ChainActorState, ChainBackend, ContractStateStore};

fn remote_signer() -> InMemorySigner {
    InMemorySigner::generate_from_seed(b"peer seed")
}

/// A ready channel as seen from our side, capacity 1_000_000, with the
/// peer's base keys and first per-commitment point in place.
fn channel_fixture() -> ChannelActorState {
    let remote = remote_signer();
    let mut channel = ChannelActorState::new_outbound(
        &[7u8; 32],
        Privkey::from(&[42u8; 32]).pubkey(),
        1_000_000,
        10_000,
        1_000,
        500,
        546,
        144,
        ChannelConstraints {
            max_htlc_value_in_flight: 900_000,
            max_htlc_number_in_flight: 30,
            min_htlc_value: 1_000,
        },
        ChannelPolicy {
            min_htlc_value: 1_000,
            expiry_delta: 6,
            fee_proportional_millionths: 1_000,
        },
        ChannelFlags::empty(),
    );
    channel.remote_base_pubkeys = Some(remote.base_public_keys());
    channel.funding_outpoint = Some(OutPoint {
        txid: Txid::all_zeros(),
        vout: 0,
    });
    channel.state = ChannelState::ChannelReady;
    channel.remote_commitment_points = vec![(0, remote.get_commitment_point(0))];
    channel
}

/// Three HTLCs of 10_000 each, offered by the peer (the broadcaster of the
/// remote commitment), already in output order.
fn remote_htlcs() -> Vec<CommitmentHtlc> {
    (0u64..3)
        .map(|i| CommitmentHtlc {
            offered: true,
            amount: 10_000,
            expiry: 500 + i * 100,
            payment_hash: sha256_hash(&[i as u8; 32]),
        })
        .collect()
}

fn remote_outline(commitment_number: u64) -> CommitmentOutline {
    CommitmentOutline {
        commitment_number,
        htlcs: remote_htlcs(),
        to_broadcaster_value: 470_000,
        to_countersignatory_value: 500_000,
    }
}

#[test]
fn test_cooperative_close_resolves_without_limbo() {
    let channel = channel_fixture();
    let coop = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: channel.funding_outpoint.unwrap(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: 999_000,
            script_pubkey: p2wpkh_script_pubkey(&channel.local_base_pubkeys().payment_basepoint),
        }],
    };
    let (kind, number, outputs) = resolve_close(&channel, &coop, 100).unwrap();
    assert_eq!(kind, CloseKind::Cooperative);
    assert_eq!(number, 0);
    assert!(outputs.is_empty());
}

#[test]
fn test_local_close_delays_own_balance() {
    let mut channel = channel_fixture();
    channel.own_commitment_outline = Some(CommitmentOutline {
        commitment_number: 0,
        htlcs: vec![],
        to_broadcaster_value: 480_000,
        to_countersignatory_value: 500_000,
    });
    let built = channel.rebuild_own_commitment().unwrap();
    let (kind, _, outputs) = resolve_close(&channel, &built.tx, 100).unwrap();
    assert_eq!(kind, CloseKind::ForceLocal);
    assert_eq!(outputs.len(), 1);
    assert!(matches!(outputs[0].kind, OutputKind::Delayed));
    assert_eq!(outputs[0].maturity_height, 100 + 144);

    // not claimable before the CSV delay matures
    assert!(build_output_claim(&channel, 0, &outputs[0], None, 243)
        .unwrap()
        .is_none());
    let claim = build_output_claim(&channel, 0, &outputs[0], None, 244)
        .unwrap()
        .unwrap();
    assert_eq!(claim.input[0].previous_output, outputs[0].outpoint);
    assert_eq!(claim.input[0].sequence, Sequence::from_height(144));
    assert_eq!(
        claim.output[0].value,
        outputs[0].amount - channel.commitment_fee
    );
    assert_eq!(
        claim.output[0].script_pubkey,
        p2wpkh_script_pubkey(&channel.signer.payment_key.pubkey())
    );
}

#[test]
fn test_remote_close_lays_out_htlc_outputs() {
    let mut channel = channel_fixture();
    let remote = remote_signer();
    let outline = remote_outline(0);
    channel.remote_commitment_outline = Some(outline.clone());
    let point = remote.get_commitment_point(0);
    let built = channel.rebuild_remote_commitment(&outline, &point).unwrap();

    let (kind, number, outputs) = resolve_close(&channel, &built.tx, 100).unwrap();
    assert_eq!(kind, CloseKind::ForceRemote);
    assert_eq!(number, 0);
    // our direct balance is final; only the three HTLCs go into limbo
    assert_eq!(outputs.len(), 3);
    for output in &outputs {
        match &output.kind {
            OutputKind::RemoteHtlc { offered, .. } => {
                // the peer offered them, so we claim with preimages at will
                assert!(!*offered);
                assert_eq!(output.maturity_height, 0);
            }
            other => panic!("unexpected output kind {:?}", other),
        }
        let script = output.witness_script.as_ref().unwrap();
        assert_eq!(
            script.to_v0_p2wsh(),
            built.tx.output[output.outpoint.vout as usize].script_pubkey
        );
    }

    // without a preimage there is nothing to do yet
    assert!(build_output_claim(&channel, 0, &outputs[0], None, 100)
        .unwrap()
        .is_none());
    let preimage: Hash256 = [0u8; 32].into();
    let claim = build_output_claim(&channel, 0, &outputs[0], Some(preimage), 100)
        .unwrap()
        .unwrap();
    assert_eq!(claim.input[0].previous_output, outputs[0].outpoint);
    // [sig, preimage, 1, <>, script]
    let witness: Vec<_> = claim.input[0].witness.iter().collect();
    assert_eq!(witness.len(), 5);
    assert_eq!(witness[1], preimage.as_ref());
}

#[test]
fn test_breach_claims_everything_through_one_justice_transaction() {
    let mut channel = channel_fixture();
    let remote = remote_signer();
    let outline = remote_outline(0);
    let secret = remote.get_commitment_secret(0);
    let point = remote.get_commitment_point(0);
    // commitment 0 was revoked; its secret and outline are on file
    channel.commitment_numbers.increment_remote();
    channel
        .remote_commitment_secrets
        .provide_secret(0, secret)
        .unwrap();
    channel.latest_revocation = Some(RevocationData {
        commitment_number: 0,
        revocation_secret: Privkey::from(&secret),
        per_commitment_point: point,
        outline: outline.clone(),
    });
    let breach = channel.rebuild_remote_commitment(&outline, &point).unwrap();

    let (kind, number, outputs) = resolve_close(&channel, &breach.tx, 100).unwrap();
    assert_eq!(kind, CloseKind::Breach);
    assert_eq!(number, 0);
    // the cheater's balance and all three HTLCs; our direct balance needs
    // no action
    assert_eq!(outputs.len(), breach.tx.output.len() - 1);
    assert!(outputs
        .iter()
        .all(|output| matches!(output.kind, OutputKind::Revoked)));
    assert!(outputs.iter().all(|output| output.witness_script.is_some()));
    // the revocation branch has no delay
    assert!(outputs.iter().all(|output| output.maturity_height == 100));

    let refs: Vec<&LimboOutput> = outputs.iter().collect();
    let justice = build_justice_transaction(&channel, 0, &refs, channel.commitment_fee)
        .unwrap()
        .unwrap();
    assert_eq!(justice.input.len(), outputs.len());
    assert_eq!(justice.output.len(), 1);
    let total: u64 = outputs.iter().map(|output| output.amount).sum();
    assert_eq!(justice.output[0].value, total - channel.commitment_fee);
    assert_eq!(
        justice.output[0].script_pubkey,
        p2wpkh_script_pubkey(&channel.signer.payment_key.pubkey())
    );
    for input in &justice.input {
        let witness: Vec<_> = input.witness.iter().collect();
        assert_eq!(witness.len(), 3);
        // the `1` selects the revocation branch
        assert_eq!(witness[1], &[1u8]);
    }
}

#[test]
fn test_breach_htlc_outputs_without_material_are_watch_only() {
    let mut channel = channel_fixture();
    let remote = remote_signer();
    let outline = remote_outline(0);
    let secret = remote.get_commitment_secret(0);
    let point = remote.get_commitment_point(0);
    channel.commitment_numbers.increment_remote();
    channel
        .remote_commitment_secrets
        .provide_secret(0, secret)
        .unwrap();
    // the HTLC layout of the revoked commitment was lost; only the balance
    // script is derivable
    channel.latest_revocation = None;
    let breach = channel.rebuild_remote_commitment(&outline, &point).unwrap();

    let (kind, _, outputs) = resolve_close(&channel, &breach.tx, 100).unwrap();
    assert_eq!(kind, CloseKind::Breach);
    let with_script = outputs
        .iter()
        .filter(|output| output.witness_script.is_some())
        .count();
    assert_eq!(with_script, 1);

    let refs: Vec<&LimboOutput> = outputs.iter().collect();
    let justice = build_justice_transaction(&channel, 0, &refs, channel.commitment_fee)
        .unwrap()
        .unwrap();
    assert_eq!(justice.input.len(), 1);
}

#[test]
fn test_justice_transaction_is_stable_across_rebuilds() {
    let mut channel = channel_fixture();
    let remote = remote_signer();
    let outline = remote_outline(0);
    let secret = remote.get_commitment_secret(0);
    let point = remote.get_commitment_point(0);
    channel.commitment_numbers.increment_remote();
    channel
        .remote_commitment_secrets
        .provide_secret(0, secret)
        .unwrap();
    channel.latest_revocation = Some(RevocationData {
        commitment_number: 0,
        revocation_secret: Privkey::from(&secret),
        per_commitment_point: point,
        outline: outline.clone(),
    });
    let breach = channel.rebuild_remote_commitment(&outline, &point).unwrap();
    let (_, _, outputs) = resolve_close(&channel, &breach.tx, 100).unwrap();

    // input order is normalized, so a rebuild after a restart (or with the
    // outputs discovered in a different order) rebroadcasts the same txid
    let forward: Vec<&LimboOutput> = outputs.iter().collect();
    let mut reversed = forward.clone();
    reversed.reverse();
    let first = build_justice_transaction(&channel, 0, &forward, channel.commitment_fee)
        .unwrap()
        .unwrap();
    let second = build_justice_transaction(&channel, 0, &reversed, channel.commitment_fee)
        .unwrap()
        .unwrap();
    assert_eq!(first.txid(), second.txid());
}

#[test]
fn test_justice_chases_revoked_output_through_second_stage() {
    let mut channel = channel_fixture();
    let remote = remote_signer();
    let outline = remote_outline(0);
    let secret = remote.get_commitment_secret(0);
    let point = remote.get_commitment_point(0);
    channel.commitment_numbers.increment_remote();
    channel
        .remote_commitment_secrets
        .provide_secret(0, secret)
        .unwrap();
    channel.latest_revocation = Some(RevocationData {
        commitment_number: 0,
        revocation_secret: Privkey::from(&secret),
        per_commitment_point: point,
        outline,
    });

    // the cheater confirmed a second stage transaction for one HTLC; its
    // output is the revokeable script we hold the revocation key for
    let script = revoked_second_stage_script(&channel, 0).unwrap();
    let second_stage = Transaction {
        version: 2,
        lock_time: LockTime::from_consensus(500),
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: 9_500,
            script_pubkey: script.to_v0_p2wsh(),
        }],
    };
    let chased = LimboOutput {
        outpoint: OutPoint {
            txid: second_stage.txid(),
            vout: 0,
        },
        amount: 9_500,
        kind: OutputKind::Revoked,
        witness_script: Some(script),
        maturity_height: 101,
        claim_txid: None,
        resolved_at: None,
    };
    let refs = vec![&chased];
    let justice = build_justice_transaction(&channel, 0, &refs, channel.commitment_fee)
        .unwrap()
        .unwrap();
    assert_eq!(justice.input[0].previous_output, chased.outpoint);
    let witness: Vec<_> = justice.input[0].witness.iter().collect();
    assert_eq!(witness.len(), 3);
    assert_eq!(witness[1], &[1u8]);
}

/// Collects everything sent to it, standing in for the switch or node.
struct Collect<M>(PhantomData<fn(M)>);

#[async_trait]
impl<M: ractor::Message> Actor for Collect<M> {
    type Msg = M;
    type State = Arc<Mutex<Vec<M>>>;
    type Arguments = Arc<Mutex<Vec<M>>>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(args)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.lock().unwrap().push(message);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBackend {
    txs: Mutex<Vec<Transaction>>,
}

impl ChainBackend for RecordingBackend {
    fn broadcast_transaction(&self, tx: &Transaction) -> anyhow::Result<()> {
        self.txs.lock().unwrap().push(tx.clone());
        Ok(())
    }
}

async fn wait_until<M>(sink: &Arc<Mutex<Vec<M>>>, check: impl Fn(&[M]) -> bool) {
    for _ in 0..200 {
        if check(&sink.lock().unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected message did not arrive");
}

/// A fully signed channel pair at commitment number one, carrying one HTLC
/// we offered. Unlike [`channel_fixture`], our own commitment here is
/// backed by real peer signatures, so its second stage transactions build.
fn signed_channel_pair(
    payment_hash: Hash256,
    expiry: u64,
) -> (ChannelActorState, ChannelActorState) {
    let mut ours = ChannelActorState::new_outbound(
        &[21u8; 32],
        Privkey::from(&[12u8; 32]).pubkey(),
        1_000_000,
        10_000,
        1_000,
        500,
        546,
        6,
        ChannelConstraints {
            max_htlc_value_in_flight: 900_000,
            max_htlc_number_in_flight: 30,
            min_htlc_value: 1_000,
        },
        ChannelPolicy {
            min_htlc_value: 1_000,
            expiry_delta: 6,
            fee_proportional_millionths: 1_000,
        },
        ChannelFlags::empty(),
    );
    let mut theirs = ChannelActorState::new_outbound(
        &[22u8; 32],
        Privkey::from(&[11u8; 32]).pubkey(),
        1_000_000,
        10_000,
        1_000,
        500,
        546,
        6,
        ChannelConstraints {
            max_htlc_value_in_flight: 900_000,
            max_htlc_number_in_flight: 30,
            min_htlc_value: 1_000,
        },
        ChannelPolicy {
            min_htlc_value: 1_000,
            expiry_delta: 6,
            fee_proportional_millionths: 1_000,
        },
        ChannelFlags::empty(),
    );
    theirs.is_funder = false;
    theirs.to_local_amount = 0;
    theirs.to_remote_amount = 1_000_000;
    ours.remote_base_pubkeys = Some(theirs.signer.base_public_keys());
    theirs.remote_base_pubkeys = Some(ours.signer.base_public_keys());
    for n in 0..3u64 {
        ours.append_remote_commitment_point(n, theirs.signer.get_commitment_point(n));
        ours.append_remote_nonce(n, theirs.signer.derive_commitment_nonce(n).public_nonce());
        theirs.append_remote_commitment_point(n, ours.signer.get_commitment_point(n));
        theirs.append_remote_nonce(n, ours.signer.derive_commitment_nonce(n).public_nonce());
    }
    let outpoint = OutPoint {
        txid: Txid::from_byte_array([0x51; 32]),
        vout: 0,
    };
    ours.apply_funding_outpoint(outpoint);
    theirs.apply_funding_outpoint(outpoint);
    ours.state = ChannelState::ChannelReady;
    theirs.state = ChannelState::ChannelReady;

    ours.htlc_state
        .add_offered_htlc(10_000, payment_hash, expiry, None, ours.commitment_numbers);
    theirs
        .htlc_state
        .add_received_htlc(10_000, payment_hash, expiry, None, theirs.commitment_numbers);
    // We propose first; the peer's answering proposal signs our ledger with
    // the HTLC and hands us the second stage signature.
    let message = ours.propose_commitment_signed().unwrap();
    let revoke = theirs.process_commitment_signed(&message).unwrap();
    ours.process_revoke_and_ack(&revoke).unwrap();
    let message = theirs.propose_commitment_signed().unwrap();
    let revoke = ours.process_commitment_signed(&message).unwrap();
    theirs.process_revoke_and_ack(&revoke).unwrap();
    (ours, theirs)
}

#[tokio::test]
async fn test_offered_htlc_timeout_fails_upstream_only_after_the_claim_confirms() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();
    let payment_hash = sha256_hash(&[0x61u8; 32]);
    let (ours, _theirs) = signed_channel_pair(payment_hash, 120);

    let commitment = ours.rebuild_own_commitment().unwrap();
    let (kind, number, outputs) = resolve_close(&ours, &commitment.tx, 100).unwrap();
    assert_eq!(kind, CloseKind::ForceLocal);
    let htlc_outpoint = outputs
        .iter()
        .find(|output| matches!(output.kind, OutputKind::OwnHtlc { offered: true, .. }))
        .unwrap()
        .outpoint;
    let balance_outpoint = outputs
        .iter()
        .find(|output| matches!(output.kind, OutputKind::Delayed))
        .unwrap()
        .outpoint;

    let channel_id = ours.id;
    let contract = ContractState {
        channel_id,
        funding_outpoint: ours.funding_outpoint.unwrap(),
        closing_txid: txid_hash(&commitment.tx),
        kind,
        commitment_number: number,
        outputs,
        resolved: false,
    };
    store.insert_channel_actor_state(ours);
    store.insert_contract_state(contract.clone());

    let switch_sink: Arc<Mutex<Vec<SwitchActorMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let node_sink: Arc<Mutex<Vec<NodeActorMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let (switch, _switch_handle) = Actor::spawn(None, Collect(PhantomData), switch_sink.clone())
        .await
        .unwrap();
    let (node, _node_handle) = Actor::spawn(None, Collect(PhantomData), node_sink.clone())
        .await
        .unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let actor = ChainActor::new(store.clone());
    let mut state = ChainActorState {
        config: ChainConfig {
            funding_confirmations: 1,
            resolution_confirmations: 3,
        },
        backend: backend.clone() as Arc<dyn ChainBackend>,
        node,
        switch,
        tip_height: 100,
        watches: HashMap::new(),
        pending_closings: HashMap::new(),
        contracts: HashMap::from([(channel_id, contract)]),
    };

    // Before expiry the timeout claim must not even be broadcast.
    actor.handle_block_connected(&mut state, 119, vec![]);
    assert!(backend
        .txs
        .lock()
        .unwrap()
        .iter()
        .all(|tx| tx.input[0].previous_output != htlc_outpoint));

    // At expiry the second stage transaction goes out, but broadcast alone
    // must not fail the incoming leg.
    actor.handle_block_connected(&mut state, 120, vec![]);
    let second_stage = backend
        .txs
        .lock()
        .unwrap()
        .iter()
        .find(|tx| tx.input[0].previous_output == htlc_outpoint)
        .cloned()
        .unwrap();
    wait_until(&switch_sink, |messages| {
        messages
            .iter()
            .any(|message| matches!(message, SwitchActorMessage::TipHeight(120)))
    })
    .await;
    assert!(switch_sink
        .lock()
        .unwrap()
        .iter()
        .all(|message| !matches!(message, SwitchActorMessage::HtlcFailedOnChain { .. })));

    // The claim confirms: now the upstream failure flows, and the second
    // stage output re-enters limbo as a CSV-delayed balance.
    actor.handle_block_connected(&mut state, 121, vec![second_stage.clone()]);
    wait_until(&switch_sink, |messages| {
        messages.iter().any(|message| {
            matches!(
                message,
                SwitchActorMessage::HtlcFailedOnChain { channel_id: id, payment_hash: hash }
                    if *id == channel_id && *hash == payment_hash
            )
        })
    })
    .await;
    let revived = state
        .contracts
        .get(&channel_id)
        .unwrap()
        .outputs
        .iter()
        .find(|output| output.outpoint.txid == second_stage.txid())
        .cloned()
        .unwrap();
    assert!(matches!(revived.kind, OutputKind::Delayed));
    assert_eq!(revived.maturity_height, 121 + 6);

    // Confirm the balance sweep, let the revived output mature, sweep it
    // and give everything its resolution depth.
    let balance_sweep = backend
        .txs
        .lock()
        .unwrap()
        .iter()
        .find(|tx| tx.input[0].previous_output == balance_outpoint)
        .cloned()
        .unwrap();
    actor.handle_block_connected(&mut state, 122, vec![balance_sweep]);
    actor.handle_block_connected(&mut state, 127, vec![]);
    let stage_sweep = backend
        .txs
        .lock()
        .unwrap()
        .iter()
        .find(|tx| tx.input[0].previous_output == revived.outpoint)
        .cloned()
        .unwrap();
    actor.handle_block_connected(&mut state, 128, vec![stage_sweep]);
    actor.handle_block_connected(&mut state, 130, vec![]);
    assert!(state.contracts.is_empty());
    wait_until(&node_sink, |messages| {
        messages.iter().any(|message| {
            matches!(
                message,
                NodeActorMessage::Event(NodeActorEvent::ContractResolved(id)) if *id == channel_id
            )
        })
    })
    .await;

    // Exactly one upstream failure over the whole resolution.
    let failures = switch_sink
        .lock()
        .unwrap()
        .iter()
        .filter(|message| matches!(message, SwitchActorMessage::HtlcFailedOnChain { .. }))
        .count();
    assert_eq!(failures, 1);
}

#[test]
fn test_preimage_extraction_from_claim_witness() {
    let preimage: Hash256 = [9u8; 32].into();
    let payment_hash = sha256_hash(preimage.as_ref());
    let tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::from_slice(&[
                vec![0u8; 72],
                preimage.as_ref().to_vec(),
                vec![1u8],
            ]),
        }],
        output: vec![],
    };
    assert_eq!(extract_preimage(&tx, &payment_hash), Some(preimage));
    assert_eq!(extract_preimage(&tx, &sha256_hash(&[1u8])), None);
}
