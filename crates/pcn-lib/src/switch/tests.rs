use bitcoin::hashes::Hash as _;
use bitcoin::{OutPoint, Txid};
use tempfile::tempdir;

use crate::channel::{
    ChannelActorState, ChannelActorStateStore, ChannelConstraints, ChannelState, InMemorySigner,
};
use crate::gen_rand_sha256_hash;
use crate::invoice::{Invoice, InvoiceStatus, SettlementPolicy};
use crate::now_timestamp_as_millis_u64;
use crate::store::Store;
use crate::types::{ChannelFlags, ChannelPolicy, FailureCode, ForwardingInfo, Hash256, Privkey};

use super::{
    forward_policy_failure, invoice_acceptance_failure, Circuit, CircuitKey, CircuitState,
    CircuitStore, SwitchActor,
};

fn policy() -> ChannelPolicy {
    ChannelPolicy {
        min_htlc_value: 1_000,
        expiry_delta: 6,
        // 0.1%
        fee_proportional_millionths: 1_000,
    }
}

fn forward(amount: u64, expiry: u64) -> ForwardingInfo {
    ForwardingInfo {
        channel_id: gen_rand_sha256_hash(),
        amount,
        expiry,
    }
}

fn invoice(amount: Option<u64>) -> Invoice {
    Invoice {
        payment_hash: gen_rand_sha256_hash(),
        amount,
        description: None,
        created_at: now_timestamp_as_millis_u64(),
        expiry: None,
        policy: SettlementPolicy::Immediate,
    }
}

#[test]
fn test_circuit_key_bytes_layout() {
    let channel_id: Hash256 = [7u8; 32].into();
    let key = CircuitKey::new(channel_id, 0x0102030405060708);
    let bytes = key.to_bytes();
    assert_eq!(&bytes[..32], &[7u8; 32]);
    assert_eq!(&bytes[32..], &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_forward_requires_ready_channel() {
    assert_eq!(
        forward_policy_failure(&policy(), false, 1_000_000, 200_000, 200, &forward(100_000, 100)),
        Some(FailureCode::TemporaryChannelFailure)
    );
}

#[test]
fn test_forward_rejects_amount_below_minimum() {
    assert_eq!(
        forward_policy_failure(&policy(), true, 1_000_000, 2_000, 200, &forward(999, 100)),
        Some(FailureCode::AmountBelowMinimum)
    );
    assert_eq!(
        forward_policy_failure(&policy(), true, 1_000_000, 2_000, 200, &forward(1_000, 100)),
        None
    );
}

#[test]
fn test_forward_fee_boundary() {
    // 0.1% of 100_000 is 100; the incoming HTLC must cover amount plus fee
    let out = forward(100_000, 100);
    assert_eq!(
        forward_policy_failure(&policy(), true, 1_000_000, 100_100, 200, &out),
        None
    );
    assert_eq!(
        forward_policy_failure(&policy(), true, 1_000_000, 100_099, 200, &out),
        Some(FailureCode::FeeInsufficient)
    );
}

#[test]
fn test_forward_requires_expiry_delta() {
    let out = forward(100_000, 100);
    assert_eq!(
        forward_policy_failure(&policy(), true, 1_000_000, 200_000, 106, &out),
        None
    );
    assert_eq!(
        forward_policy_failure(&policy(), true, 1_000_000, 200_000, 105, &out),
        Some(FailureCode::ExpiryTooSoon)
    );
}

#[test]
fn test_forward_requires_outgoing_balance() {
    assert_eq!(
        forward_policy_failure(&policy(), true, 99_999, 200_000, 200, &forward(100_000, 100)),
        Some(FailureCode::TemporaryChannelFailure)
    );
}

#[test]
fn test_invoice_rejects_underpayment_but_accepts_overpayment() {
    let invoice = invoice(Some(50_000));
    assert_eq!(
        invoice_acceptance_failure(&invoice, InvoiceStatus::Open, 49_999, 1_000, 100),
        Some(FailureCode::IncorrectPaymentAmount)
    );
    assert_eq!(
        invoice_acceptance_failure(&invoice, InvoiceStatus::Open, 50_000, 1_000, 100),
        None
    );
    assert_eq!(
        invoice_acceptance_failure(&invoice, InvoiceStatus::Open, 60_000, 1_000, 100),
        None
    );
}

#[test]
fn test_invoice_without_amount_accepts_anything() {
    assert_eq!(
        invoice_acceptance_failure(&invoice(None), InvoiceStatus::Open, 1, 1_000, 100),
        None
    );
}

#[test]
fn test_invoice_final_expiry_too_soon() {
    let invoice = invoice(None);
    // the HTLC must outlive the tip by the minimum expiry delta of 6
    assert_eq!(
        invoice_acceptance_failure(&invoice, InvoiceStatus::Open, 1_000, 106, 100),
        None
    );
    assert_eq!(
        invoice_acceptance_failure(&invoice, InvoiceStatus::Open, 1_000, 105, 100),
        Some(FailureCode::FinalExpiryTooSoon)
    );
}

#[test]
fn test_invoice_final_statuses_fail_payments() {
    let invoice = invoice(None);
    assert_eq!(
        invoice_acceptance_failure(&invoice, InvoiceStatus::Cancelled, 1_000, 1_000, 100),
        Some(FailureCode::InvoiceCancelled)
    );
    assert_eq!(
        invoice_acceptance_failure(&invoice, InvoiceStatus::Expired, 1_000, 1_000, 100),
        Some(FailureCode::InvoiceExpired)
    );
    assert_eq!(
        invoice_acceptance_failure(&invoice, InvoiceStatus::Settled, 1_000, 1_000, 100),
        Some(FailureCode::UnknownPaymentHash)
    );
    assert_eq!(
        invoice_acceptance_failure(&invoice, InvoiceStatus::Held, 1_000, 1_000, 100),
        None
    );
}

#[test]
fn test_invoice_past_expiry_fails_payments() {
    let mut expired = invoice(None);
    expired.created_at = now_timestamp_as_millis_u64() - 10_000;
    expired.expiry = Some(1);
    assert_eq!(
        invoice_acceptance_failure(&expired, InvoiceStatus::Open, 1_000, 1_000, 100),
        Some(FailureCode::InvoiceExpired)
    );
}

fn ready_channel() -> ChannelActorState {
    let remote = InMemorySigner::generate_from_seed(&[0xaa; 32]);
    let mut channel = ChannelActorState::new_outbound(
        &[3u8; 32],
        Privkey::from(&[5u8; 32]).pubkey(),
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
        policy(),
        ChannelFlags::empty(),
    );
    channel.remote_base_pubkeys = Some(remote.base_public_keys());
    channel.funding_outpoint = Some(OutPoint {
        txid: Txid::all_zeros(),
        vout: 0,
    });
    channel.state = ChannelState::ChannelReady;
    channel
}

#[test]
fn test_replayed_forward_adopts_existing_downstream_htlc() {
    let dir = tempdir().unwrap();
    let store = Store::new(dir.path()).unwrap();

    // the outgoing channel already carries the HTLC from before a crash
    let mut channel = ready_channel();
    let payment_hash = gen_rand_sha256_hash();
    let htlc_id = channel.htlc_state.add_offered_htlc(
        9_990,
        payment_hash,
        494,
        None,
        channel.commitment_numbers,
    );
    let channel_id = channel.id;
    store.insert_channel_actor_state(channel);

    let switch = SwitchActor::new(store.clone());
    let forward = ForwardingInfo {
        channel_id,
        amount: 9_990,
        expiry: 494,
    };
    let adopted = switch.find_outgoing_htlc(&forward, payment_hash).unwrap();
    assert_eq!(adopted, CircuitKey::new(channel_id, htlc_id));
    // amount or expiry mismatches mean it belongs to some other payment
    assert!(switch
        .find_outgoing_htlc(
            &ForwardingInfo {
                channel_id,
                amount: 9_991,
                expiry: 494,
            },
            payment_hash,
        )
        .is_none());

    // once a circuit claims the HTLC, a second replay must not adopt it
    // again and offer a duplicate downstream
    store.insert_circuit(Circuit {
        incoming: CircuitKey::new(gen_rand_sha256_hash(), 0),
        outgoing: Some(adopted),
        payment_hash,
        amount: 10_000,
        expiry: 500,
        forwarding: Some(forward.clone()),
        state: CircuitState::Forwarded,
    });
    assert!(switch.find_outgoing_htlc(&forward, payment_hash).is_none());
}
