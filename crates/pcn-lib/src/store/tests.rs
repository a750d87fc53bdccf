use bitcoin::hashes::Hash as _;
use bitcoin::{OutPoint, Txid};
use tempfile::tempdir;

use crate::backup::{ClosedChannelRecord, ClosedChannelStore};
use crate::chain::{BreachRecord, CloseKind, ContractState, ContractStateStore};
use crate::channel::{
    ChannelActorState, ChannelActorStateStore, ChannelConstraints, ChannelState, CloseFlags,
    InMemorySigner,
};
use crate::invoice::{Invoice, InvoiceError, InvoiceStatus, InvoiceStore, SettlementPolicy};
use crate::switch::{Circuit, CircuitKey, CircuitState, CircuitStore};
use crate::types::{
    ChannelFlags, ChannelPolicy, ForwardingInfo, Hash256, Privkey, Pubkey, ReestablishChannel,
};
use crate::{gen_rand_sha256_hash, now_timestamp_as_millis_u64};

use super::db::SCHEMA_VERSION;
use super::schema::SCHEMA_VERSION_KEY;
use super::Store;

fn channel_fixture(seed: u8) -> ChannelActorState {
    let remote = InMemorySigner::generate_from_seed(&[seed ^ 0xff; 32]);
    let mut channel = ChannelActorState::new_outbound(
        &[seed; 32],
        Privkey::from(&[seed | 1; 32]).pubkey(),
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
        vout: seed as u32,
    });
    channel.state = ChannelState::ChannelReady;
    channel
}

fn invoice_fixture(payment_hash: Hash256) -> Invoice {
    Invoice {
        payment_hash,
        amount: Some(10_000),
        description: None,
        created_at: now_timestamp_as_millis_u64(),
        expiry: None,
        policy: SettlementPolicy::Immediate,
    }
}

fn circuit_fixture(incoming: CircuitKey, outgoing: Option<CircuitKey>) -> Circuit {
    Circuit {
        incoming,
        outgoing,
        payment_hash: gen_rand_sha256_hash(),
        amount: 10_000,
        expiry: 500,
        forwarding: outgoing.map(|key| ForwardingInfo {
            channel_id: key.channel_id,
            amount: 9_990,
            expiry: 494,
        }),
        state: if outgoing.is_some() {
            CircuitState::Forwarded
        } else {
            CircuitState::Opened
        },
    }
}

fn dummy_pubkey(seed: u8) -> Pubkey {
    Privkey::from(&[seed | 1; 32]).pubkey()
}

#[test]
fn test_channel_actor_state_indexes() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();

    let channel = channel_fixture(1);
    let channel_id = channel.id;
    let peer = channel.remote_pubkey;
    let outpoint = channel.funding_outpoint.unwrap();
    store.insert_channel_actor_state(channel);

    assert_eq!(
        store.get_channel_actor_state(&channel_id).map(|c| c.id),
        Some(channel_id)
    );
    assert_eq!(
        store
            .get_channel_state_by_outpoint(&outpoint)
            .map(|c| c.id),
        Some(channel_id)
    );
    assert_eq!(store.get_channel_ids_by_peer(&peer), vec![channel_id]);
    let states = store.get_channel_states(Some(peer));
    assert_eq!(states, vec![(peer, channel_id, ChannelState::ChannelReady)]);
    // other peers see nothing
    assert!(store.get_channel_states(Some(dummy_pubkey(9))).is_empty());

    store.delete_channel_actor_state(&channel_id);
    assert!(store.get_channel_actor_state(&channel_id).is_none());
    assert!(store.get_channel_state_by_outpoint(&outpoint).is_none());
    assert!(store.get_channel_ids_by_peer(&peer).is_empty());
}

#[test]
fn test_invoice_store() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();

    let preimage = gen_rand_sha256_hash();
    let payment_hash = crate::types::sha256_hash(preimage.as_ref());
    let invoice = invoice_fixture(payment_hash);

    store.insert_invoice(invoice.clone(), Some(preimage)).unwrap();
    assert_eq!(store.get_invoice(&payment_hash), Some(invoice.clone()));
    assert_eq!(store.get_invoice_status(&payment_hash), Some(InvoiceStatus::Open));
    assert_eq!(store.get_payment_preimage(&payment_hash), Some(preimage));

    // a second insert under the same hash is refused
    assert!(matches!(
        store.insert_invoice(invoice, None),
        Err(InvoiceError::DuplicatedInvoice(_))
    ));

    store
        .update_invoice_status(&payment_hash, InvoiceStatus::Settled)
        .unwrap();
    assert_eq!(
        store.get_invoice_status(&payment_hash),
        Some(InvoiceStatus::Settled)
    );
    assert!(matches!(
        store.update_invoice_status(&gen_rand_sha256_hash(), InvoiceStatus::Settled),
        Err(InvoiceError::InvoiceNotFound(_))
    ));

    store.remove_payment_preimage(&payment_hash);
    assert!(store.get_payment_preimage(&payment_hash).is_none());
}

#[test]
fn test_circuit_outgoing_index() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();

    let incoming = CircuitKey::new(gen_rand_sha256_hash(), 0);
    let outgoing = CircuitKey::new(gen_rand_sha256_hash(), 7);
    let terminating = circuit_fixture(CircuitKey::new(gen_rand_sha256_hash(), 1), None);
    let forwarded = circuit_fixture(incoming, Some(outgoing));

    store.insert_circuit(terminating.clone());
    store.insert_circuit(forwarded.clone());

    assert_eq!(store.get_circuit(&incoming), Some(forwarded.clone()));
    // the settle path on the outgoing channel finds the circuit by its
    // outgoing key
    assert_eq!(store.get_circuit_by_outgoing(&outgoing), Some(forwarded));
    assert!(store.get_circuit_by_outgoing(&terminating.incoming).is_none());
    assert_eq!(store.get_circuits().len(), 2);

    store.delete_circuit(&incoming);
    assert!(store.get_circuit(&incoming).is_none());
    assert!(store.get_circuit_by_outgoing(&outgoing).is_none());
    assert_eq!(store.get_circuits().len(), 1);
}

#[test]
fn test_contract_state_and_breach_record() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();

    let channel_id = gen_rand_sha256_hash();
    let contract = ContractState {
        channel_id,
        funding_outpoint: OutPoint {
            txid: Txid::all_zeros(),
            vout: 0,
        },
        closing_txid: gen_rand_sha256_hash(),
        kind: CloseKind::Breach,
        commitment_number: 3,
        outputs: vec![],
        resolved: false,
    };
    store.insert_contract_state(contract.clone());
    assert_eq!(
        store
            .get_contract_state(&channel_id)
            .map(|c| c.closing_txid),
        Some(contract.closing_txid)
    );
    assert_eq!(store.get_contract_states().len(), 1);

    let record = BreachRecord {
        channel_id,
        breach_txid: contract.closing_txid,
        commitment_number: 3,
        justice_txid: gen_rand_sha256_hash(),
        amount: 530_000,
        created_at: now_timestamp_as_millis_u64(),
    };
    store.insert_breach_record(record.clone());
    assert_eq!(
        store
            .get_breach_record(&channel_id)
            .map(|r| r.justice_txid),
        Some(record.justice_txid)
    );

    store.delete_contract_state(&channel_id);
    assert!(store.get_contract_state(&channel_id).is_none());
    // the breach record outlives the contract state
    assert!(store.get_breach_record(&channel_id).is_some());
}

#[test]
fn test_closed_channel_records() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();

    let channel_id = gen_rand_sha256_hash();
    let record = ClosedChannelRecord {
        channel_id,
        remote_pubkey: dummy_pubkey(2),
        close_flags: CloseFlags::COOPERATIVE,
        closing_txid: Some(gen_rand_sha256_hash()),
        reestablish: ReestablishChannel {
            channel_id,
            next_local_commitment_number: 5,
            next_remote_commitment_number: 5,
            your_last_per_commitment_secret: gen_rand_sha256_hash(),
            my_current_per_commitment_point: dummy_pubkey(3),
        },
        closed_at: now_timestamp_as_millis_u64(),
    };
    store.insert_closed_channel_record(record.clone());
    assert_eq!(
        store
            .get_closed_channel_record(&channel_id)
            .map(|r| r.close_flags),
        Some(CloseFlags::COOPERATIVE)
    );
    assert_eq!(store.get_closed_channel_records().len(), 1);
    assert!(store
        .get_closed_channel_record(&gen_rand_sha256_hash())
        .is_none());
}

#[test]
fn test_snapshot_restores_point_in_time() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();

    let channel = channel_fixture(4);
    let channel_id = channel.id;
    store.insert_channel_actor_state(channel);
    let preimage = gen_rand_sha256_hash();
    let payment_hash = crate::types::sha256_hash(preimage.as_ref());
    store
        .insert_invoice(invoice_fixture(payment_hash), Some(preimage))
        .unwrap();

    let snapshot = store.export_snapshot();
    assert!(!snapshot.is_empty());

    // writes after the snapshot
    store.delete_channel_actor_state(&channel_id);
    store.remove_payment_preimage(&payment_hash);
    let incoming = CircuitKey::new(gen_rand_sha256_hash(), 0);
    store.insert_circuit(circuit_fixture(incoming, None));
    assert!(store.get_channel_actor_state(&channel_id).is_none());

    store.import_snapshot(snapshot);

    // everything is back as of the snapshot, including rows that were
    // deleted and minus rows that were added
    assert!(store.get_channel_actor_state(&channel_id).is_some());
    assert_eq!(store.get_payment_preimage(&payment_hash), Some(preimage));
    assert!(store.get_circuit(&incoming).is_none());
    store.check_validate().unwrap();
}

#[test]
fn test_schema_version_gate() {
    let dir = tempdir().unwrap();
    {
        let store = Store::new(dir.path()).unwrap();
        assert_eq!(
            store.get(SCHEMA_VERSION_KEY),
            Some(SCHEMA_VERSION.to_be_bytes().to_vec())
        );
    }
    {
        let store = Store::open_db(dir.path()).unwrap();
        store.put(SCHEMA_VERSION_KEY, (SCHEMA_VERSION + 1).to_be_bytes());
    }
    assert!(Store::new(dir.path()).is_err());
}
