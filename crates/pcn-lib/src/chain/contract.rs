//! Classification of confirmed funding spends and construction of the
//! transactions that resolve their outputs.
//!
//! Everything here is pure: the actor in the parent module feeds in channel
//! state and confirmed transactions and broadcasts whatever comes back.

use bitcoin::absolute::LockTime;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::commitment::{
    build_second_stage_transaction, delayed_claim_witness, extract_commitment_number,
    offered_htlc_preimage_witness, offered_htlc_script, offered_htlc_timeout_witness,
    p2wpkh_script_pubkey, p2wsh_sighash, received_htlc_script, received_htlc_success_witness,
    received_htlc_timeout_witness, revocation_claim_witness, revokeable_script, CommitmentHtlc,
};
use crate::channel::signer::derive_public_key;
use crate::channel::{
    derive_revocation_privkey, derive_revocation_pubkey, ChannelActorState,
    ProcessingChannelError,
};
use crate::types::{sha256_hash, Hash256, Privkey};

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("no channel state stored for {0}")]
    ChannelNotFound(Hash256),
    #[error("channel error: {0}")]
    ChannelError(#[from] ProcessingChannelError),
    #[error("no commitment outline stored for remote commitment {0}")]
    MissingOutline(u64),
    #[error("no revocation secret known for commitment {0}")]
    MissingRevocationSecret(u64),
    #[error("no peer signatures stored for the latest local commitment")]
    MissingCommitmentSignatures,
}

/// What the confirmed spend of the funding outpoint turned out to be.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CloseKind {
    Cooperative,
    /// Our own latest commitment.
    ForceLocal,
    /// The peer's commitment currently in force.
    ForceRemote,
    /// A revoked remote commitment.
    Breach,
}

/// How a limbo output eventually gets claimed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OutputKind {
    /// A revokeable output we broadcast ourselves, swept through the delayed
    /// branch once the CSV delay matures.
    Delayed,
    /// An HTLC output on our own confirmed commitment, resolved by
    /// broadcasting its pre-signed second stage transaction.
    OwnHtlc {
        offered: bool,
        payment_hash: Hash256,
        expiry: u64,
        /// Position in the commitment's HTLC output list, which is also the
        /// position of the peer's second stage signature.
        signature_index: usize,
    },
    /// An HTLC output on the peer's confirmed commitment, spent directly.
    /// `offered` is from our point of view here.
    RemoteHtlc {
        offered: bool,
        payment_hash: Hash256,
        expiry: u64,
    },
    /// An output of a revoked commitment, claimable at once through the
    /// revocation branch. Without a witness script it cannot be spent
    /// directly; we chase whatever the cheater moves it to instead.
    Revoked,
}

/// An output of a confirmed close that still needs on-chain action, or at
/// least watching, before the contract is fully resolved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimboOutput {
    pub outpoint: OutPoint,
    pub amount: u64,
    pub kind: OutputKind,
    /// P2WSH witness script of the output, `None` when we cannot
    /// reconstruct it and only watch.
    pub witness_script: Option<ScriptBuf>,
    /// Height from which the claim may be broadcast.
    pub maturity_height: u32,
    /// Txid of the claim we broadcast, rebroadcast every block until a
    /// spend confirms.
    pub claim_txid: Option<Hash256>,
    /// Height at which a spend of this output confirmed.
    pub resolved_at: Option<u32>,
}

/// Persistent record of one channel's journey from confirmed close to full
/// resolution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContractState {
    pub channel_id: Hash256,
    pub funding_outpoint: OutPoint,
    pub closing_txid: Hash256,
    pub kind: CloseKind,
    /// Number of the confirmed commitment, zero for cooperative closes.
    pub commitment_number: u64,
    pub outputs: Vec<LimboOutput>,
    pub resolved: bool,
}

/// Written before the justice transaction is first broadcast, so a crash
/// cannot lose the fact that punishment is owed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreachRecord {
    pub channel_id: Hash256,
    pub breach_txid: Hash256,
    pub commitment_number: u64,
    pub justice_txid: Hash256,
    /// Total value under claim by the justice transaction.
    pub amount: u64,
    pub created_at: u64,
}

pub(crate) fn txid_hash(tx: &Transaction) -> Hash256 {
    use bitcoin::hashes::Hash as _;
    tx.txid().to_byte_array().into()
}

/// Decides what kind of close a confirmed funding spend is. A transaction
/// without the commitment number markers can only be the mutually signed
/// closing transaction; anything else is some commitment, told apart by
/// txid and by comparing its number against the revocation horizon.
pub(crate) fn classify_close(
    channel: &ChannelActorState,
    spend: &Transaction,
) -> Result<(CloseKind, u64), ResolutionError> {
    let obscuring_factor = channel.get_obscuring_factor()?;
    let Some(number) = extract_commitment_number(spend, obscuring_factor) else {
        return Ok((CloseKind::Cooperative, 0));
    };
    let own_txid = channel
        .rebuild_own_commitment()
        .ok()
        .map(|built| built.tx.txid());
    if own_txid == Some(spend.txid()) {
        return Ok((CloseKind::ForceLocal, number));
    }
    if number < channel.commitment_numbers.get_remote() {
        return Ok((CloseKind::Breach, number));
    }
    Ok((CloseKind::ForceRemote, number))
}

/// Classifies a confirmed close and lays out the outputs that need further
/// action. Cooperative closes have none.
pub(crate) fn resolve_close(
    channel: &ChannelActorState,
    spend: &Transaction,
    confirm_height: u32,
) -> Result<(CloseKind, u64, Vec<LimboOutput>), ResolutionError> {
    let (kind, number) = classify_close(channel, spend)?;
    let outputs = match kind {
        CloseKind::Cooperative => Vec::new(),
        CloseKind::ForceLocal => local_close_outputs(channel, spend, confirm_height)?,
        CloseKind::ForceRemote => remote_close_outputs(channel, spend, number)?,
        CloseKind::Breach => breach_outputs(channel, spend, number, confirm_height)?,
    };
    Ok((kind, number, outputs))
}

fn local_close_outputs(
    channel: &ChannelActorState,
    spend: &Transaction,
    confirm_height: u32,
) -> Result<Vec<LimboOutput>, ResolutionError> {
    let built = channel.rebuild_own_commitment()?;
    let txid = spend.txid();
    let mut outputs = Vec::new();
    if let Some((index, script)) = &built.to_broadcaster_output {
        outputs.push(LimboOutput {
            outpoint: OutPoint { txid, vout: *index },
            amount: built.tx.output[*index as usize].value,
            kind: OutputKind::Delayed,
            witness_script: Some(script.clone()),
            maturity_height: confirm_height.saturating_add(channel.commitment_delay as u32),
            claim_txid: None,
            resolved_at: None,
        });
    }
    for (signature_index, (htlc, index, script)) in built.htlc_outputs.iter().enumerate() {
        outputs.push(LimboOutput {
            outpoint: OutPoint {
                txid,
                vout: *index,
            },
            amount: htlc.amount,
            kind: OutputKind::OwnHtlc {
                offered: htlc.offered,
                payment_hash: htlc.payment_hash,
                expiry: htlc.expiry,
                signature_index,
            },
            witness_script: Some(script.clone()),
            // the timeout spend is locktimed at expiry; the success spend
            // only waits for a preimage
            maturity_height: if htlc.offered { htlc.expiry as u32 } else { 0 },
            claim_txid: None,
            resolved_at: None,
        });
    }
    Ok(outputs)
}

fn remote_close_outputs(
    channel: &ChannelActorState,
    spend: &Transaction,
    number: u64,
) -> Result<Vec<LimboOutput>, ResolutionError> {
    let outline = [
        channel.remote_commitment_outline.as_ref(),
        channel.proposed_remote_outline.as_ref(),
    ]
    .into_iter()
    .flatten()
    .find(|outline| outline.commitment_number == number)
    .ok_or(ResolutionError::MissingOutline(number))?;
    let point = channel.get_remote_commitment_point(number)?;
    let built = channel.rebuild_remote_commitment(outline, &point)?;
    let txid = spend.txid();
    if built.tx.txid() != txid {
        // the stored outline does not reproduce what confirmed
        return Err(ResolutionError::MissingOutline(number));
    }
    // Our balance output pays the static payment key directly and needs no
    // further action; only the HTLC outputs go into limbo.
    let mut outputs = Vec::new();
    for (htlc, index, script) in built.htlc_outputs.iter() {
        // the outline is from the peer's point of view; flip `offered`
        let offered = !htlc.offered;
        outputs.push(LimboOutput {
            outpoint: OutPoint {
                txid,
                vout: *index,
            },
            amount: htlc.amount,
            kind: OutputKind::RemoteHtlc {
                offered,
                payment_hash: htlc.payment_hash,
                expiry: htlc.expiry,
            },
            witness_script: Some(script.clone()),
            maturity_height: if offered { htlc.expiry as u32 } else { 0 },
            claim_txid: None,
            resolved_at: None,
        });
    }
    Ok(outputs)
}

fn breach_outputs(
    channel: &ChannelActorState,
    spend: &Transaction,
    number: u64,
    confirm_height: u32,
) -> Result<Vec<LimboOutput>, ResolutionError> {
    let secret = channel
        .remote_commitment_secrets
        .get_secret(number)
        .ok_or(ResolutionError::MissingRevocationSecret(number))?;
    let point = Privkey::from(&secret).pubkey();
    let local_base = channel.local_base_pubkeys();
    let remote_base = channel.get_remote_base_pubkeys()?;
    let revocation_pubkey = derive_revocation_pubkey(&local_base.revocation_basepoint, &point);
    let their_delayed = derive_public_key(&remote_base.delayed_payment_basepoint, &point);
    let their_htlc = derive_public_key(&remote_base.htlc_basepoint, &point);
    let our_htlc = derive_public_key(&local_base.htlc_basepoint, &point);
    let balance_script =
        revokeable_script(&revocation_pubkey, channel.commitment_delay, &their_delayed);
    let our_direct = p2wpkh_script_pubkey(&local_base.payment_basepoint);

    // HTLC scripts are only reconstructable when the punishment material
    // captured at revocation time is for this very commitment.
    let mut htlc_scripts: Vec<ScriptBuf> = Vec::new();
    if let Some(revocation) = channel.latest_revocation.as_ref() {
        if revocation.commitment_number == number {
            for htlc in &revocation.outline.htlcs {
                let script = if htlc.offered {
                    offered_htlc_script(
                        &revocation_pubkey,
                        &their_htlc,
                        &our_htlc,
                        &htlc.payment_hash,
                        htlc.expiry,
                    )
                } else {
                    received_htlc_script(
                        &revocation_pubkey,
                        &their_htlc,
                        &our_htlc,
                        &htlc.payment_hash,
                        htlc.expiry,
                    )
                };
                htlc_scripts.push(script);
            }
        }
    }

    let txid = spend.txid();
    let mut outputs = Vec::new();
    for (vout, txout) in spend.output.iter().enumerate() {
        if txout.script_pubkey == our_direct {
            // our own balance, already on the static payment key
            continue;
        }
        let witness_script = if txout.script_pubkey == balance_script.to_v0_p2wsh() {
            Some(balance_script.clone())
        } else {
            htlc_scripts
                .iter()
                .find(|script| script.to_v0_p2wsh() == txout.script_pubkey)
                .cloned()
        };
        outputs.push(LimboOutput {
            outpoint: OutPoint {
                txid,
                vout: vout as u32,
            },
            amount: txout.value,
            kind: OutputKind::Revoked,
            witness_script,
            // the revocation branch has no delay
            maturity_height: confirm_height,
            claim_txid: None,
            resolved_at: None,
        });
    }
    Ok(outputs)
}

/// The destination every sweep pays: the static payment key, which the
/// static channel backup preserves.
pub(crate) fn sweep_destination(channel: &ChannelActorState) -> ScriptBuf {
    p2wpkh_script_pubkey(&channel.signer.payment_key.pubkey())
}

fn sweep_transaction(
    outpoint: OutPoint,
    value: u64,
    destination: ScriptBuf,
    locktime: u32,
    sequence: Sequence,
) -> Transaction {
    Transaction {
        version: 2,
        lock_time: LockTime::from_consensus(locktime),
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: destination,
        }],
    }
}

fn claim_value(amount: u64, fee: u64, dust_limit: u64) -> Option<u64> {
    amount.checked_sub(fee).filter(|value| *value >= dust_limit)
}

pub(crate) fn revocation_privkey_for(
    channel: &ChannelActorState,
    commitment_number: u64,
) -> Result<Privkey, ResolutionError> {
    let secret = channel
        .remote_commitment_secrets
        .get_secret(commitment_number)
        .ok_or(ResolutionError::MissingRevocationSecret(commitment_number))?;
    Ok(derive_revocation_privkey(
        &channel.signer.revocation_base_key,
        &Privkey::from(&secret),
    ))
}

/// One transaction claiming every spendable revoked output through the
/// revocation branch. Deterministic in its inputs, so the same claimable
/// set rebuilds the same transaction on every block and after restarts.
///
/// Returns `None` when nothing is claimable or the claim would not pay for
/// itself.
pub(crate) fn build_justice_transaction(
    channel: &ChannelActorState,
    commitment_number: u64,
    outputs: &[&LimboOutput],
    fee: u64,
) -> Result<Option<Transaction>, ResolutionError> {
    let mut claimable: Vec<(&LimboOutput, &ScriptBuf)> = outputs
        .iter()
        .filter_map(|output| {
            output
                .witness_script
                .as_ref()
                .map(|script| (*output, script))
        })
        .collect();
    if claimable.is_empty() {
        return Ok(None);
    }
    claimable.sort_by_key(|(output, _)| (output.outpoint.txid, output.outpoint.vout));
    let total: u64 = claimable.iter().map(|(output, _)| output.amount).sum();
    let Some(value) = claim_value(total, fee, channel.dust_limit) else {
        return Ok(None);
    };
    let key = revocation_privkey_for(channel, commitment_number)?;
    let mut tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: claimable
            .iter()
            .map(|(output, _)| TxIn {
                previous_output: output.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ZERO,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut {
            value,
            script_pubkey: sweep_destination(channel),
        }],
    };
    // witnesses do not feed back into segwit sighashes, so signing in place
    // is fine
    for (index, (output, script)) in claimable.iter().enumerate() {
        let sighash = p2wsh_sighash(&tx, index, script, output.amount);
        tx.input[index].witness = revocation_claim_witness(&key.sign_ecdsa(&sighash), script);
    }
    Ok(Some(tx))
}

/// Builds the claim for a limbo output, if its preconditions are met.
/// Returns `None` when the output cannot be claimed yet, or at all: not
/// matured, no preimage, or not worth more than the fee.
pub(crate) fn build_output_claim(
    channel: &ChannelActorState,
    commitment_number: u64,
    output: &LimboOutput,
    preimage: Option<Hash256>,
    tip_height: u32,
) -> Result<Option<Transaction>, ResolutionError> {
    let Some(script) = output.witness_script.as_ref() else {
        return Ok(None);
    };
    match &output.kind {
        OutputKind::Delayed => {
            if tip_height < output.maturity_height {
                return Ok(None);
            }
            let Some(value) = claim_value(output.amount, channel.commitment_fee, channel.dust_limit)
            else {
                return Ok(None);
            };
            let point = channel.signer.get_commitment_point(commitment_number);
            let key = channel.signer.derive_delayed_payment_key(&point);
            let mut tx = sweep_transaction(
                output.outpoint,
                value,
                sweep_destination(channel),
                0,
                Sequence::from_height(channel.commitment_delay),
            );
            let sighash = p2wsh_sighash(&tx, 0, script, output.amount);
            tx.input[0].witness = delayed_claim_witness(&key.sign_ecdsa(&sighash), script);
            Ok(Some(tx))
        }
        OutputKind::OwnHtlc {
            offered,
            payment_hash,
            expiry,
            signature_index,
        } => {
            if *offered && (tip_height as u64) < *expiry {
                return Ok(None);
            }
            let preimage = match (*offered, preimage) {
                (true, _) => None,
                (false, Some(preimage)) => Some(preimage),
                (false, None) => return Ok(None),
            };
            let signed = channel
                .latest_local_commitment_signed
                .as_ref()
                .ok_or(ResolutionError::MissingCommitmentSignatures)?;
            let peer_signature = signed
                .htlc_signatures
                .get(*signature_index)
                .ok_or(ResolutionError::MissingCommitmentSignatures)?;
            let point = channel.signer.get_commitment_point(commitment_number);
            let remote_base = channel.get_remote_base_pubkeys()?;
            let revocation_pubkey =
                derive_revocation_pubkey(&remote_base.revocation_basepoint, &point);
            let delayed_pubkey = derive_public_key(
                &channel.local_base_pubkeys().delayed_payment_basepoint,
                &point,
            );
            let htlc = CommitmentHtlc {
                offered: *offered,
                amount: output.amount,
                expiry: *expiry,
                payment_hash: *payment_hash,
            };
            let mut tx = build_second_stage_transaction(
                output.outpoint.txid,
                &htlc,
                output.outpoint.vout,
                &revocation_pubkey,
                &delayed_pubkey,
                channel.commitment_delay,
                channel.second_stage_fee,
            );
            let sighash = p2wsh_sighash(&tx, 0, script, output.amount);
            let our_signature = channel.signer.derive_htlc_key(&point).sign_ecdsa(&sighash);
            tx.input[0].witness = match preimage {
                None => offered_htlc_timeout_witness(&our_signature, peer_signature, script),
                Some(preimage) => received_htlc_success_witness(
                    &our_signature,
                    peer_signature,
                    &preimage,
                    script,
                ),
            };
            Ok(Some(tx))
        }
        OutputKind::RemoteHtlc {
            offered, expiry, ..
        } => {
            let Some(value) = claim_value(output.amount, channel.commitment_fee, channel.dust_limit)
            else {
                return Ok(None);
            };
            let point = channel.get_remote_commitment_point(commitment_number)?;
            let key = channel.signer.derive_htlc_key(&point);
            if *offered {
                // we are the countersignatory of the peer's received HTLC
                // output; our timeout branch carries the script's CLTV
                if (tip_height as u64) < *expiry {
                    return Ok(None);
                }
                let mut tx = sweep_transaction(
                    output.outpoint,
                    value,
                    sweep_destination(channel),
                    *expiry as u32,
                    Sequence::ENABLE_LOCKTIME_NO_RBF,
                );
                let sighash = p2wsh_sighash(&tx, 0, script, output.amount);
                tx.input[0].witness =
                    received_htlc_timeout_witness(&key.sign_ecdsa(&sighash), script);
                Ok(Some(tx))
            } else {
                let Some(preimage) = preimage else {
                    return Ok(None);
                };
                let mut tx = sweep_transaction(
                    output.outpoint,
                    value,
                    sweep_destination(channel),
                    0,
                    Sequence::ZERO,
                );
                let sighash = p2wsh_sighash(&tx, 0, script, output.amount);
                tx.input[0].witness =
                    offered_htlc_preimage_witness(&key.sign_ecdsa(&sighash), &preimage, script);
                Ok(Some(tx))
            }
        }
        // revoked outputs are claimed in bulk by the justice transaction
        OutputKind::Revoked => Ok(None),
    }
}

/// The revokeable script our own second stage outputs pay to at this
/// commitment number. Used to put a confirmed second stage output back into
/// limbo as a delayed sweep.
pub(crate) fn own_second_stage_script(
    channel: &ChannelActorState,
    commitment_number: u64,
) -> Result<ScriptBuf, ResolutionError> {
    let point = channel.signer.get_commitment_point(commitment_number);
    let remote_base = channel.get_remote_base_pubkeys()?;
    let revocation_pubkey = derive_revocation_pubkey(&remote_base.revocation_basepoint, &point);
    let delayed_pubkey = derive_public_key(
        &channel.local_base_pubkeys().delayed_payment_basepoint,
        &point,
    );
    Ok(revokeable_script(
        &revocation_pubkey,
        channel.commitment_delay,
        &delayed_pubkey,
    ))
}

/// The revokeable script a cheater's second stage transactions pay to on a
/// revoked commitment. We hold the revocation key for it, so moving a
/// revoked output through its second stage only shifts where justice
/// strikes.
pub(crate) fn revoked_second_stage_script(
    channel: &ChannelActorState,
    commitment_number: u64,
) -> Result<ScriptBuf, ResolutionError> {
    let secret = channel
        .remote_commitment_secrets
        .get_secret(commitment_number)
        .ok_or(ResolutionError::MissingRevocationSecret(commitment_number))?;
    let point = Privkey::from(&secret).pubkey();
    let local_base = channel.local_base_pubkeys();
    let remote_base = channel.get_remote_base_pubkeys()?;
    let revocation_pubkey = derive_revocation_pubkey(&local_base.revocation_basepoint, &point);
    let their_delayed = derive_public_key(&remote_base.delayed_payment_basepoint, &point);
    Ok(revokeable_script(
        &revocation_pubkey,
        channel.commitment_delay,
        &their_delayed,
    ))
}

/// Pulls a payment preimage out of a confirmed spend by hashing every
/// 32 byte witness element against the wanted payment hash.
pub(crate) fn extract_preimage(tx: &Transaction, payment_hash: &Hash256) -> Option<Hash256> {
    for input in &tx.input {
        for element in input.witness.iter() {
            if let Ok(bytes) = <[u8; 32]>::try_from(element) {
                let candidate: Hash256 = bytes.into();
                if sha256_hash(candidate.as_ref()) == *payment_hash {
                    return Some(candidate);
                }
            }
        }
    }
    None
}
