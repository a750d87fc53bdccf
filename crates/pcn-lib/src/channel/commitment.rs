//! Commitment transaction construction.
//!
//! Both parties must derive byte-identical transactions from the shared
//! channel state, so everything here is deterministic: balance outputs come
//! first, HTLC outputs follow sorted by (expiry, payment hash), and outputs
//! below the dust limit are trimmed into the fee.

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::opcodes::all as opcodes;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::{hash160, sha256, Hash as _};
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{
    OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, WPubkeyHash, Witness,
};
use musig2::secp::Point;
use musig2::{CompactSignature, KeyAggContext};
use serde::{Deserialize, Serialize};

use crate::types::{EcdsaSignature, Hash256, Pubkey};

/// Upper 8 bits of the commitment locktime marking it as a channel
/// transaction rather than a plain height locked spend.
const LOCKTIME_MARKER: u32 = 0x2000_0000;
/// Top bit of the commitment input sequence. Setting it also disables BIP68
/// relative locktime interpretation of the remaining bits.
const SEQUENCE_MARKER: u32 = 0x8000_0000;
const LOW_24_MASK: u32 = 0x00ff_ffff;

/// Commitment numbers are XORed with a 48 bit factor derived from both
/// payment basepoints before being embedded, so outsiders cannot count
/// channel updates from a broadcast commitment.
pub fn commitment_obscuring_factor(
    funder_payment_basepoint: &Pubkey,
    acceptor_payment_basepoint: &Pubkey,
) -> u64 {
    let mut data = funder_payment_basepoint.serialize().to_vec();
    data.extend_from_slice(&acceptor_payment_basepoint.serialize());
    let hash = sha256::Hash::hash(&data).to_byte_array();
    let mut factor = 0u64;
    for byte in &hash[26..32] {
        factor = (factor << 8) | *byte as u64;
    }
    factor
}

fn embed_commitment_number(commitment_number: u64, obscuring_factor: u64) -> (u32, u32) {
    let obscured = commitment_number ^ obscuring_factor;
    let locktime = LOCKTIME_MARKER | (obscured as u32 & LOW_24_MASK);
    let sequence = SEQUENCE_MARKER | ((obscured >> 24) as u32 & LOW_24_MASK);
    (locktime, sequence)
}

/// Recovers the commitment number embedded in a commitment transaction, or
/// None if the transaction does not carry the channel markers.
pub fn extract_commitment_number(tx: &Transaction, obscuring_factor: u64) -> Option<u64> {
    let input = tx.input.first()?;
    let locktime = tx.lock_time.to_consensus_u32();
    let sequence = input.sequence.0;
    if locktime & !LOW_24_MASK != LOCKTIME_MARKER || sequence & !LOW_24_MASK != SEQUENCE_MARKER {
        return None;
    }
    let obscured = ((sequence & LOW_24_MASK) as u64) << 24 | (locktime & LOW_24_MASK) as u64;
    Some(obscured ^ obscuring_factor)
}

/// The funding output is a taproot key spend of the musig2 aggregated key,
/// funder key first.
pub fn funding_script_pubkey(key_agg_ctx: &KeyAggContext) -> ScriptBuf {
    let xonly = key_agg_ctx.aggregated_pubkey::<Point>().serialize_xonly();
    let output_key = XOnlyPublicKey::from_slice(&xonly).expect("valid aggregated pubkey");
    ScriptBuf::new_v1_p2tr_tweaked(bitcoin::key::TweakedPublicKey::dangerous_assume_tweaked(
        output_key,
    ))
}

pub fn p2wpkh_script_pubkey(pubkey: &Pubkey) -> ScriptBuf {
    let hash = hash160::Hash::hash(&pubkey.serialize());
    ScriptBuf::new_v0_p2wpkh(&WPubkeyHash::from_raw_hash(hash))
}

/// Script of the broadcaster's balance output and of all second stage HTLC
/// outputs: immediately claimable with the revocation key, otherwise
/// claimable by the broadcaster after the CSV delay.
pub fn revokeable_script(
    revocation_pubkey: &Pubkey,
    delay: u16,
    delayed_pubkey: &Pubkey,
) -> ScriptBuf {
    Builder::new()
        .push_opcode(opcodes::OP_IF)
        .push_slice(revocation_pubkey.serialize())
        .push_opcode(opcodes::OP_ELSE)
        .push_int(delay as i64)
        .push_opcode(opcodes::OP_CSV)
        .push_opcode(opcodes::OP_DROP)
        .push_slice(delayed_pubkey.serialize())
        .push_opcode(opcodes::OP_ENDIF)
        .push_opcode(opcodes::OP_CHECKSIG)
        .into_script()
}

/// Script of an HTLC the broadcaster offered. The remote side claims with
/// the payment preimage, the broadcaster times out through the pre-signed
/// 2-of-2 second stage transaction after expiry, and the revocation key
/// overrides both.
pub fn offered_htlc_script(
    revocation_pubkey: &Pubkey,
    broadcaster_htlc_pubkey: &Pubkey,
    countersignatory_htlc_pubkey: &Pubkey,
    payment_hash: &Hash256,
    expiry: u64,
) -> ScriptBuf {
    let payment_hash: [u8; 32] = (*payment_hash).into();
    Builder::new()
        .push_opcode(opcodes::OP_IF)
        .push_slice(revocation_pubkey.serialize())
        .push_opcode(opcodes::OP_CHECKSIG)
        .push_opcode(opcodes::OP_ELSE)
        .push_opcode(opcodes::OP_IF)
        .push_opcode(opcodes::OP_SHA256)
        .push_slice(payment_hash)
        .push_opcode(opcodes::OP_EQUALVERIFY)
        .push_slice(countersignatory_htlc_pubkey.serialize())
        .push_opcode(opcodes::OP_CHECKSIG)
        .push_opcode(opcodes::OP_ELSE)
        .push_int(expiry as i64)
        .push_opcode(opcodes::OP_CLTV)
        .push_opcode(opcodes::OP_DROP)
        .push_opcode(opcodes::OP_PUSHNUM_2)
        .push_slice(broadcaster_htlc_pubkey.serialize())
        .push_slice(countersignatory_htlc_pubkey.serialize())
        .push_opcode(opcodes::OP_PUSHNUM_2)
        .push_opcode(opcodes::OP_CHECKMULTISIG)
        .push_opcode(opcodes::OP_ENDIF)
        .push_opcode(opcodes::OP_ENDIF)
        .into_script()
}

/// Script of an HTLC the broadcaster received. The broadcaster claims with
/// the preimage through the pre-signed 2-of-2 second stage transaction, the
/// remote side sweeps directly after expiry, and the revocation key
/// overrides both.
pub fn received_htlc_script(
    revocation_pubkey: &Pubkey,
    broadcaster_htlc_pubkey: &Pubkey,
    countersignatory_htlc_pubkey: &Pubkey,
    payment_hash: &Hash256,
    expiry: u64,
) -> ScriptBuf {
    let payment_hash: [u8; 32] = (*payment_hash).into();
    Builder::new()
        .push_opcode(opcodes::OP_IF)
        .push_slice(revocation_pubkey.serialize())
        .push_opcode(opcodes::OP_CHECKSIG)
        .push_opcode(opcodes::OP_ELSE)
        .push_opcode(opcodes::OP_IF)
        .push_opcode(opcodes::OP_SHA256)
        .push_slice(payment_hash)
        .push_opcode(opcodes::OP_EQUALVERIFY)
        .push_opcode(opcodes::OP_PUSHNUM_2)
        .push_slice(broadcaster_htlc_pubkey.serialize())
        .push_slice(countersignatory_htlc_pubkey.serialize())
        .push_opcode(opcodes::OP_PUSHNUM_2)
        .push_opcode(opcodes::OP_CHECKMULTISIG)
        .push_opcode(opcodes::OP_ELSE)
        .push_int(expiry as i64)
        .push_opcode(opcodes::OP_CLTV)
        .push_opcode(opcodes::OP_DROP)
        .push_slice(countersignatory_htlc_pubkey.serialize())
        .push_opcode(opcodes::OP_CHECKSIG)
        .push_opcode(opcodes::OP_ENDIF)
        .push_opcode(opcodes::OP_ENDIF)
        .into_script()
}

/// An HTLC as it appears in a commitment being built. `offered` is from the
/// broadcaster's point of view.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommitmentHtlc {
    pub offered: bool,
    pub amount: u64,
    pub expiry: u64,
    pub payment_hash: Hash256,
}

/// Key material and balances fixed for one commitment, all from the
/// broadcaster's point of view.
#[derive(Debug, Clone)]
pub struct CommitmentParams {
    pub funding_outpoint: OutPoint,
    pub obscuring_factor: u64,
    pub commitment_number: u64,
    /// Belongs to the countersignatory once the matching secret is known.
    pub revocation_pubkey: Pubkey,
    pub broadcaster_delayed_pubkey: Pubkey,
    pub countersignatory_payment_pubkey: Pubkey,
    pub broadcaster_htlc_pubkey: Pubkey,
    pub countersignatory_htlc_pubkey: Pubkey,
    pub to_broadcaster_value: u64,
    pub to_countersignatory_value: u64,
    pub commitment_delay: u16,
    pub dust_limit: u64,
    pub second_stage_fee: u64,
}

/// A built commitment transaction plus the metadata needed to sign and later
/// claim its outputs.
#[derive(Debug, Clone)]
pub struct CommitmentTransaction {
    pub tx: Transaction,
    pub to_broadcaster_output: Option<(u32, ScriptBuf)>,
    pub to_countersignatory_output: Option<u32>,
    /// Untrimmed HTLCs with their output index and witness script, in output
    /// order.
    pub htlc_outputs: Vec<(CommitmentHtlc, u32, ScriptBuf)>,
}

/// An HTLC survives trimming only if its second stage transaction would
/// still have an output above the dust limit after paying its fee.
pub fn is_htlc_trimmed(amount: u64, dust_limit: u64, second_stage_fee: u64) -> bool {
    amount < dust_limit + second_stage_fee
}

/// Sorts HTLCs the way they are laid out in the commitment: ascending
/// expiry, ties broken by payment hash.
pub fn sort_htlcs(htlcs: &mut [CommitmentHtlc]) {
    htlcs.sort_by(|a, b| {
        a.expiry
            .cmp(&b.expiry)
            .then_with(|| a.payment_hash.cmp(&b.payment_hash))
            .then_with(|| a.amount.cmp(&b.amount))
            .then_with(|| a.offered.cmp(&b.offered))
    });
}

pub fn build_commitment_transaction(
    params: &CommitmentParams,
    htlcs: &[CommitmentHtlc],
) -> CommitmentTransaction {
    let (locktime, sequence) =
        embed_commitment_number(params.commitment_number, params.obscuring_factor);

    let mut outputs = Vec::new();

    let to_broadcaster_script = revokeable_script(
        &params.revocation_pubkey,
        params.commitment_delay,
        &params.broadcaster_delayed_pubkey,
    );
    let to_broadcaster_output = if params.to_broadcaster_value >= params.dust_limit {
        outputs.push(TxOut {
            value: params.to_broadcaster_value,
            script_pubkey: to_broadcaster_script.to_v0_p2wsh(),
        });
        Some((outputs.len() as u32 - 1, to_broadcaster_script))
    } else {
        None
    };

    let to_countersignatory_output = if params.to_countersignatory_value >= params.dust_limit {
        outputs.push(TxOut {
            value: params.to_countersignatory_value,
            script_pubkey: p2wpkh_script_pubkey(&params.countersignatory_payment_pubkey),
        });
        Some(outputs.len() as u32 - 1)
    } else {
        None
    };

    let mut untrimmed: Vec<CommitmentHtlc> = htlcs
        .iter()
        .filter(|htlc| !is_htlc_trimmed(htlc.amount, params.dust_limit, params.second_stage_fee))
        .cloned()
        .collect();
    sort_htlcs(&mut untrimmed);

    let mut htlc_outputs = Vec::with_capacity(untrimmed.len());
    for htlc in untrimmed {
        let witness_script = if htlc.offered {
            offered_htlc_script(
                &params.revocation_pubkey,
                &params.broadcaster_htlc_pubkey,
                &params.countersignatory_htlc_pubkey,
                &htlc.payment_hash,
                htlc.expiry,
            )
        } else {
            received_htlc_script(
                &params.revocation_pubkey,
                &params.broadcaster_htlc_pubkey,
                &params.countersignatory_htlc_pubkey,
                &htlc.payment_hash,
                htlc.expiry,
            )
        };
        outputs.push(TxOut {
            value: htlc.amount,
            script_pubkey: witness_script.to_v0_p2wsh(),
        });
        htlc_outputs.push((htlc, outputs.len() as u32 - 1, witness_script));
    }

    let tx = Transaction {
        version: 2,
        lock_time: LockTime::from_consensus(locktime),
        input: vec![TxIn {
            previous_output: params.funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(sequence),
            witness: Witness::new(),
        }],
        output: outputs,
    };

    CommitmentTransaction {
        tx,
        to_broadcaster_output,
        to_countersignatory_output,
        htlc_outputs,
    }
}

/// Builds the second stage transaction for one commitment HTLC output. For
/// an offered HTLC this is the timeout spend (locktime at expiry), for a
/// received HTLC the success spend (no locktime, preimage in the witness).
/// Either way the output is the broadcaster's revokeable script, so a
/// revoked commitment's second stage outputs stay punishable.
pub fn build_second_stage_transaction(
    commitment_txid: bitcoin::Txid,
    htlc: &CommitmentHtlc,
    output_index: u32,
    revocation_pubkey: &Pubkey,
    broadcaster_delayed_pubkey: &Pubkey,
    commitment_delay: u16,
    second_stage_fee: u64,
) -> Transaction {
    let locktime = if htlc.offered { htlc.expiry as u32 } else { 0 };
    let script = revokeable_script(revocation_pubkey, commitment_delay, broadcaster_delayed_pubkey);
    Transaction {
        version: 2,
        lock_time: LockTime::from_consensus(locktime),
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: commitment_txid,
                vout: output_index,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: htlc.amount.saturating_sub(second_stage_fee),
            script_pubkey: script.to_v0_p2wsh(),
        }],
    }
}

/// Builds the cooperative close transaction. Outputs below the dust limit
/// are dropped; ordering is by value then script so both sides agree.
pub fn build_closing_transaction(
    funding_outpoint: OutPoint,
    local_value: u64,
    local_script: ScriptBuf,
    remote_value: u64,
    remote_script: ScriptBuf,
    dust_limit: u64,
) -> Transaction {
    let mut outputs = Vec::new();
    if local_value >= dust_limit {
        outputs.push(TxOut {
            value: local_value,
            script_pubkey: local_script,
        });
    }
    if remote_value >= dust_limit {
        outputs.push(TxOut {
            value: remote_value,
            script_pubkey: remote_script,
        });
    }
    outputs.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
    });
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

/// Message both parties co-sign for a transaction spending the funding
/// output: the taproot key spend sighash of its only input.
pub fn funding_spend_sighash(tx: &Transaction, funding_output: &TxOut) -> [u8; 32] {
    let prevouts = [funding_output.clone()];
    SighashCache::new(tx)
        .taproot_key_spend_signature_hash(0, &Prevouts::All(&prevouts), TapSighashType::Default)
        .expect("valid funding sighash")
        .to_byte_array()
}

/// Sighash of a segwit v0 input spending a P2WSH output with the given
/// witness script.
pub fn p2wsh_sighash(
    tx: &Transaction,
    input_index: usize,
    witness_script: &ScriptBuf,
    value: u64,
) -> [u8; 32] {
    SighashCache::new(tx)
        .segwit_signature_hash(input_index, witness_script, value, EcdsaSighashType::All)
        .expect("valid p2wsh sighash")
        .to_byte_array()
}

/// Sighash of a segwit v0 input spending a P2WPKH output held by `pubkey`.
pub fn p2wpkh_sighash(tx: &Transaction, input_index: usize, pubkey: &Pubkey, value: u64) -> [u8; 32] {
    let script_pubkey = p2wpkh_script_pubkey(pubkey);
    let script_code = script_pubkey
        .p2wpkh_script_code()
        .expect("p2wpkh script code");
    SighashCache::new(tx)
        .segwit_signature_hash(input_index, &script_code, value, EcdsaSighashType::All)
        .expect("valid p2wpkh sighash")
        .to_byte_array()
}

fn witness_signature_bytes(signature: &EcdsaSignature) -> Vec<u8> {
    let mut bytes = signature.serialize_der();
    bytes.push(EcdsaSighashType::All as u8);
    bytes
}

/// Witness spending the funding output with the aggregated signature.
pub fn funding_spend_witness(aggregated_signature: CompactSignature) -> Witness {
    Witness::from_slice(&[aggregated_signature.serialize().to_vec()])
}

/// Witness claiming a revokeable output through its revocation branch.
pub fn revocation_claim_witness(
    signature: &EcdsaSignature,
    witness_script: &ScriptBuf,
) -> Witness {
    Witness::from_slice(&[
        witness_signature_bytes(signature),
        vec![1u8],
        witness_script.to_bytes(),
    ])
}

/// Witness claiming a revokeable output through its delayed branch, after
/// the CSV delay has passed.
pub fn delayed_claim_witness(signature: &EcdsaSignature, witness_script: &ScriptBuf) -> Witness {
    Witness::from_slice(&[
        witness_signature_bytes(signature),
        Vec::new(),
        witness_script.to_bytes(),
    ])
}

/// Witness claiming an offered HTLC output with the payment preimage.
pub fn offered_htlc_preimage_witness(
    signature: &EcdsaSignature,
    preimage: &Hash256,
    witness_script: &ScriptBuf,
) -> Witness {
    Witness::from_slice(&[
        witness_signature_bytes(signature),
        preimage.as_ref().to_vec(),
        vec![1u8],
        Vec::new(),
        witness_script.to_bytes(),
    ])
}

/// Witness of the second stage timeout spend of an offered HTLC output.
pub fn offered_htlc_timeout_witness(
    broadcaster_signature: &EcdsaSignature,
    countersignatory_signature: &EcdsaSignature,
    witness_script: &ScriptBuf,
) -> Witness {
    Witness::from_slice(&[
        Vec::new(),
        witness_signature_bytes(broadcaster_signature),
        witness_signature_bytes(countersignatory_signature),
        Vec::new(),
        Vec::new(),
        witness_script.to_bytes(),
    ])
}

/// Witness of the second stage success spend of a received HTLC output.
pub fn received_htlc_success_witness(
    broadcaster_signature: &EcdsaSignature,
    countersignatory_signature: &EcdsaSignature,
    preimage: &Hash256,
    witness_script: &ScriptBuf,
) -> Witness {
    Witness::from_slice(&[
        Vec::new(),
        witness_signature_bytes(broadcaster_signature),
        witness_signature_bytes(countersignatory_signature),
        preimage.as_ref().to_vec(),
        vec![1u8],
        Vec::new(),
        witness_script.to_bytes(),
    ])
}

/// Witness of the direct timeout sweep of a received HTLC output.
pub fn received_htlc_timeout_witness(
    signature: &EcdsaSignature,
    witness_script: &ScriptBuf,
) -> Witness {
    Witness::from_slice(&[
        witness_signature_bytes(signature),
        Vec::new(),
        Vec::new(),
        witness_script.to_bytes(),
    ])
}

/// Witness spending a P2WPKH output.
pub fn p2wpkh_spend_witness(signature: &EcdsaSignature, pubkey: &Pubkey) -> Witness {
    Witness::from_slice(&[
        witness_signature_bytes(signature),
        pubkey.serialize().to_vec(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Privkey;
    use bitcoin::hashes::Hash as _;

    fn pubkey(seed: u8) -> Pubkey {
        Privkey::from([seed; 32]).pubkey()
    }

    fn params() -> CommitmentParams {
        CommitmentParams {
            funding_outpoint: OutPoint {
                txid: bitcoin::Txid::all_zeros(),
                vout: 0,
            },
            obscuring_factor: 0x0000_dead_beef_cafe,
            commitment_number: 42,
            revocation_pubkey: pubkey(1),
            broadcaster_delayed_pubkey: pubkey(2),
            countersignatory_payment_pubkey: pubkey(3),
            broadcaster_htlc_pubkey: pubkey(4),
            countersignatory_htlc_pubkey: pubkey(5),
            to_broadcaster_value: 500_000,
            to_countersignatory_value: 400_000,
            commitment_delay: 6,
            dust_limit: 546,
            second_stage_fee: 300,
        }
    }

    fn htlc(offered: bool, amount: u64, expiry: u64, hash_seed: u8) -> CommitmentHtlc {
        CommitmentHtlc {
            offered,
            amount,
            expiry,
            payment_hash: Hash256::from([hash_seed; 32]),
        }
    }

    #[test]
    fn test_commitment_number_embedding_roundtrip() {
        let params = params();
        for number in [0u64, 1, 42, 0xffff_ffff_ffff] {
            let mut p = params.clone();
            p.commitment_number = number;
            let built = build_commitment_transaction(&p, &[]);
            assert_eq!(
                extract_commitment_number(&built.tx, p.obscuring_factor),
                Some(number & 0xffff_ffff_ffff)
            );
        }
    }

    #[test]
    fn test_unrelated_transaction_carries_no_commitment_number() {
        let tx = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: bitcoin::Txid::all_zeros(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![],
        };
        assert_eq!(extract_commitment_number(&tx, 0), None);
    }

    #[test]
    fn test_htlc_outputs_sorted_by_expiry_then_hash() {
        let p = params();
        let htlcs = vec![
            htlc(true, 10_000, 200, 9),
            htlc(false, 11_000, 100, 7),
            htlc(true, 12_000, 100, 3),
        ];
        let built = build_commitment_transaction(&p, &htlcs);
        let order: Vec<(u64, Hash256)> = built
            .htlc_outputs
            .iter()
            .map(|(h, _, _)| (h.expiry, h.payment_hash))
            .collect();
        assert_eq!(
            order,
            vec![
                (100, Hash256::from([3u8; 32])),
                (100, Hash256::from([7u8; 32])),
                (200, Hash256::from([9u8; 32])),
            ]
        );
        // Balance outputs occupy the first two slots.
        assert_eq!(built.htlc_outputs[0].1, 2);
        assert_eq!(built.to_broadcaster_output.as_ref().map(|o| o.0), Some(0));
        assert_eq!(built.to_countersignatory_output, Some(1));
    }

    #[test]
    fn test_both_sides_build_identical_htlc_order() {
        let p = params();
        let forward = vec![
            htlc(true, 10_000, 50, 1),
            htlc(false, 20_000, 40, 2),
            htlc(true, 30_000, 40, 1),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();
        let a = build_commitment_transaction(&p, &forward);
        let b = build_commitment_transaction(&p, &reversed);
        assert_eq!(a.tx, b.tx);
    }

    #[test]
    fn test_dust_htlcs_are_trimmed() {
        let p = params();
        // 546 + 300 is the smallest untrimmed amount.
        let htlcs = vec![htlc(true, 845, 100, 1), htlc(true, 846, 100, 2)];
        let built = build_commitment_transaction(&p, &htlcs);
        assert_eq!(built.htlc_outputs.len(), 1);
        assert_eq!(built.htlc_outputs[0].0.payment_hash, Hash256::from([2u8; 32]));
        let total: u64 = built.tx.output.iter().map(|o| o.value).sum();
        // The trimmed amount goes to fee, not to either balance.
        assert_eq!(total, 500_000 + 400_000 + 846);
    }

    #[test]
    fn test_dust_balance_output_is_dropped() {
        let mut p = params();
        p.to_countersignatory_value = 200;
        let built = build_commitment_transaction(&p, &[]);
        assert_eq!(built.to_countersignatory_output, None);
        assert_eq!(built.tx.output.len(), 1);
    }

    #[test]
    fn test_second_stage_locktime_only_for_offered() {
        let p = params();
        let offered = htlc(true, 10_000, 123, 1);
        let received = htlc(false, 10_000, 123, 1);
        let timeout_tx = build_second_stage_transaction(
            bitcoin::Txid::all_zeros(),
            &offered,
            2,
            &p.revocation_pubkey,
            &p.broadcaster_delayed_pubkey,
            p.commitment_delay,
            p.second_stage_fee,
        );
        let success_tx = build_second_stage_transaction(
            bitcoin::Txid::all_zeros(),
            &received,
            2,
            &p.revocation_pubkey,
            &p.broadcaster_delayed_pubkey,
            p.commitment_delay,
            p.second_stage_fee,
        );
        assert_eq!(timeout_tx.lock_time.to_consensus_u32(), 123);
        assert_eq!(success_tx.lock_time.to_consensus_u32(), 0);
        assert_eq!(timeout_tx.output[0].value, 10_000 - 300);
        // Both pay into the revokeable script so breaches stay punishable.
        assert_eq!(
            timeout_tx.output[0].script_pubkey,
            revokeable_script(&p.revocation_pubkey, p.commitment_delay, &p.broadcaster_delayed_pubkey)
                .to_v0_p2wsh()
        );
        assert_eq!(
            timeout_tx.output[0].script_pubkey,
            success_tx.output[0].script_pubkey
        );
    }

    #[test]
    fn test_closing_outputs_deterministic() {
        let outpoint = OutPoint {
            txid: bitcoin::Txid::all_zeros(),
            vout: 1,
        };
        let a = build_closing_transaction(
            outpoint,
            300_000,
            p2wpkh_script_pubkey(&pubkey(1)),
            700_000,
            p2wpkh_script_pubkey(&pubkey(2)),
            546,
        );
        let b = build_closing_transaction(
            outpoint,
            700_000,
            p2wpkh_script_pubkey(&pubkey(2)),
            300_000,
            p2wpkh_script_pubkey(&pubkey(1)),
            546,
        );
        assert_eq!(a, b);
        assert_eq!(a.output[0].value, 300_000);
    }

    #[test]
    fn test_closing_drops_dust_output() {
        let outpoint = OutPoint {
            txid: bitcoin::Txid::all_zeros(),
            vout: 1,
        };
        let tx = build_closing_transaction(
            outpoint,
            100,
            p2wpkh_script_pubkey(&pubkey(1)),
            900_000,
            p2wpkh_script_pubkey(&pubkey(2)),
            546,
        );
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, 900_000);
    }

    #[test]
    fn test_offered_and_received_scripts_differ() {
        let p = params();
        let hash = Hash256::from([8u8; 32]);
        let offered = offered_htlc_script(
            &p.revocation_pubkey,
            &p.broadcaster_htlc_pubkey,
            &p.countersignatory_htlc_pubkey,
            &hash,
            100,
        );
        let received = received_htlc_script(
            &p.revocation_pubkey,
            &p.broadcaster_htlc_pubkey,
            &p.countersignatory_htlc_pubkey,
            &hash,
            100,
        );
        assert_ne!(offered, received);
    }

    #[test]
    fn test_obscuring_factor_is_48_bits_and_asymmetric() {
        let factor = commitment_obscuring_factor(&pubkey(1), &pubkey(2));
        assert!(factor <= 0xffff_ffff_ffff);
        assert_ne!(factor, commitment_obscuring_factor(&pubkey(2), &pubkey(1)));
    }
}
