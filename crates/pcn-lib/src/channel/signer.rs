use bitcoin::hashes::{sha256, Hash as _};
use musig2::{
    aggregate_partial_signatures, errors::SigningError, errors::VerifyError, sign_partial,
    verify_partial, AggNonce, CompactSignature, KeyAggContext, PartialSignature, PubNonce,
    SecNonce, SecNonceBuilder,
};
use musig2::secp::Point;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::revocation::{get_commitment_point, get_commitment_secret};
use crate::types::{secp256k1_instance, Privkey, Pubkey};

fn hash_two(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut data = a.to_vec();
    data.extend_from_slice(b);
    sha256::Hash::hash(&data).to_byte_array()
}

/// The tweak binding a per-commitment key to its basepoint.
pub(crate) fn derive_key_tweak(per_commitment_point: &Pubkey, basepoint: &Pubkey) -> [u8; 32] {
    hash_two(&per_commitment_point.serialize(), &basepoint.serialize())
}

pub(crate) fn derive_private_key(base: &Privkey, per_commitment_point: &Pubkey) -> Privkey {
    base.tweak(derive_key_tweak(per_commitment_point, &base.pubkey()))
}

pub(crate) fn derive_public_key(basepoint: &Pubkey, per_commitment_point: &Pubkey) -> Pubkey {
    basepoint.tweak(derive_key_tweak(per_commitment_point, basepoint))
}

/// The revocation key is blinded with both parties' material: neither side
/// alone knows its private key until the broadcaster discloses the matching
/// per-commitment secret.
pub fn derive_revocation_pubkey(
    countersignatory_basepoint: &Pubkey,
    per_commitment_point: &Pubkey,
) -> Pubkey {
    let h1 = hash_two(
        &countersignatory_basepoint.serialize(),
        &per_commitment_point.serialize(),
    );
    let h2 = hash_two(
        &per_commitment_point.serialize(),
        &countersignatory_basepoint.serialize(),
    );
    let secp = secp256k1_instance();
    let blinded_base = countersignatory_basepoint
        .0
        .mul_tweak(secp, &scalar_from_hash(h1))
        .expect("valid tweaked revocation basepoint");
    let blinded_point = per_commitment_point
        .0
        .mul_tweak(secp, &scalar_from_hash(h2))
        .expect("valid tweaked per commitment point");
    blinded_base
        .combine(&blinded_point)
        .expect("valid revocation pubkey")
        .into()
}

pub fn derive_revocation_privkey(
    countersignatory_base_secret: &Privkey,
    per_commitment_secret: &Privkey,
) -> Privkey {
    let basepoint = countersignatory_base_secret.pubkey();
    let per_commitment_point = per_commitment_secret.pubkey();
    let h1 = hash_two(&basepoint.serialize(), &per_commitment_point.serialize());
    let h2 = hash_two(&per_commitment_point.serialize(), &basepoint.serialize());
    let blinded_base = countersignatory_base_secret
        .0
        .mul_tweak(&scalar_from_hash(h1))
        .expect("valid tweaked revocation base secret");
    let blinded_secret = per_commitment_secret
        .0
        .mul_tweak(&scalar_from_hash(h2))
        .expect("valid tweaked per commitment secret");
    blinded_base
        .add_tweak(&secp256k1::Scalar::from(blinded_secret))
        .expect("valid revocation privkey")
        .into()
}

fn scalar_from_hash(hash: [u8; 32]) -> secp256k1::Scalar {
    secp256k1::Scalar::from_be_bytes(hash)
        .expect("hash output must be within secp256k1 scalar range")
}

/// The static basepoints one side contributes to a channel.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelBasePublicKeys {
    pub funding_pubkey: Pubkey,
    pub payment_basepoint: Pubkey,
    pub delayed_payment_basepoint: Pubkey,
    pub htlc_basepoint: Pubkey,
    pub revocation_basepoint: Pubkey,
}

/// Holds a channel's private keys in memory. Performs no policy checks and
/// is insufficient by itself as a secure external signer.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct InMemorySigner {
    /// Holder secret key in the 2-of-2 aggregated funding output.
    pub funding_key: Privkey,
    /// Key for the holder's plain balance output on the counterparty's
    /// commitment, and the key sweeps pay to.
    pub payment_key: Privkey,
    /// Base key for the CSV delayed balance output on the holder's own
    /// commitment.
    pub delayed_payment_base_key: Privkey,
    /// Base key for HTLC outputs and second stage HTLC transactions.
    pub htlc_base_key: Privkey,
    /// Base key blinding the counterparty's revocation keys.
    pub revocation_base_key: Privkey,
    /// Seed for deterministic musig2 completion nonces.
    pub musig2_base_nonce: Privkey,
    /// Seed of the per-commitment secret chain.
    pub commitment_seed: [u8; 32],
}

impl std::fmt::Debug for InMemorySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "InMemorySigner(funding {:?})", self.funding_key.pubkey())
    }
}

impl InMemorySigner {
    pub fn generate_from_seed(params: &[u8]) -> Self {
        let seed = sha256::Hash::hash(params).to_byte_array();

        let commitment_seed = hash_two(&seed, b"commitment seed");

        let key_derive = |prev: &[u8], info: &[u8]| Privkey::from(&hash_two(prev, info));

        let funding_key = key_derive(&seed, b"funding key");
        let payment_key = key_derive(funding_key.as_ref(), b"payment key");
        let delayed_payment_base_key = key_derive(payment_key.as_ref(), b"delayed payment key");
        let htlc_base_key = key_derive(delayed_payment_base_key.as_ref(), b"HTLC base key");
        let revocation_base_key = key_derive(htlc_base_key.as_ref(), b"revocation base key");
        let musig2_base_nonce = key_derive(revocation_base_key.as_ref(), b"musig nonce");

        Self {
            funding_key,
            payment_key,
            delayed_payment_base_key,
            htlc_base_key,
            revocation_base_key,
            musig2_base_nonce,
            commitment_seed,
        }
    }

    pub fn base_public_keys(&self) -> ChannelBasePublicKeys {
        ChannelBasePublicKeys {
            funding_pubkey: self.funding_key.pubkey(),
            payment_basepoint: self.payment_key.pubkey(),
            delayed_payment_basepoint: self.delayed_payment_base_key.pubkey(),
            htlc_basepoint: self.htlc_base_key.pubkey(),
            revocation_basepoint: self.revocation_base_key.pubkey(),
        }
    }

    pub fn get_commitment_point(&self, commitment_number: u64) -> Pubkey {
        get_commitment_point(&self.commitment_seed, commitment_number)
    }

    pub fn get_commitment_secret(&self, commitment_number: u64) -> [u8; 32] {
        get_commitment_secret(&self.commitment_seed, commitment_number)
    }

    pub fn derive_htlc_key(&self, per_commitment_point: &Pubkey) -> Privkey {
        derive_private_key(&self.htlc_base_key, per_commitment_point)
    }

    pub fn derive_delayed_payment_key(&self, per_commitment_point: &Pubkey) -> Privkey {
        derive_private_key(&self.delayed_payment_base_key, per_commitment_point)
    }

    /// Deterministic completion nonce for co-signing our own commitment at
    /// the given number. The peer learns its public half ahead of time and
    /// the secret half is re-derivable after a restart. It is only ever used
    /// over the single transaction the peer signed for that number.
    pub fn derive_commitment_nonce(&self, commitment_number: u64) -> SecNonce {
        let per_commitment_point = self.get_commitment_point(commitment_number);
        let seckey = derive_private_key(&self.musig2_base_nonce, &per_commitment_point);
        SecNonceBuilder::new(seckey.as_ref())
            .with_extra_input(&format!("COMMITMENT {}", commitment_number))
            .build()
    }

    /// Deterministic nonce for co-signing the cooperative close transaction.
    pub fn derive_closing_nonce(&self) -> SecNonce {
        SecNonceBuilder::new(self.musig2_base_nonce.as_ref())
            .with_extra_input(&"CLOSING".to_string())
            .build()
    }
}

/// A throwaway nonce for signing the peer's ledger. Never reused: a fresh
/// one is drawn per proposal and its public half travels in the message.
pub fn generate_partial_nonce() -> SecNonce {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    SecNonceBuilder::new(seed).build()
}

pub(crate) fn funding_key_agg_ctx(funder: &Pubkey, acceptor: &Pubkey) -> KeyAggContext {
    // Keys are ordered funder first so both sides aggregate identically.
    KeyAggContext::new([*funder, *acceptor]).expect("Valid pubkeys")
}

pub(crate) struct Musig2CommonContext {
    pub local_first: bool,
    pub key_agg_ctx: KeyAggContext,
    pub agg_nonce: AggNonce,
}

impl Musig2CommonContext {
    pub fn aggregate_partial_signatures_for_msg(
        &self,
        local_signature: PartialSignature,
        remote_signature: PartialSignature,
        message: &[u8],
    ) -> Result<CompactSignature, VerifyError> {
        let partial_signatures = if self.local_first {
            [local_signature, remote_signature]
        } else {
            [remote_signature, local_signature]
        };
        aggregate_partial_signatures(
            &self.key_agg_ctx,
            &self.agg_nonce,
            partial_signatures,
            message,
        )
    }

    pub fn x_only_aggregated_pubkey(&self) -> [u8; 32] {
        self.key_agg_ctx
            .aggregated_pubkey::<Point>()
            .serialize_xonly()
    }
}

pub(crate) struct Musig2VerifyContext {
    pub common_ctx: Musig2CommonContext,
    pub pubkey: Pubkey,
    pub pubnonce: PubNonce,
}

impl Musig2VerifyContext {
    pub fn verify(&self, signature: PartialSignature, message: &[u8]) -> Result<(), VerifyError> {
        verify_partial(
            &self.common_ctx.key_agg_ctx,
            signature,
            &self.common_ctx.agg_nonce,
            self.pubkey,
            &self.pubnonce,
            message,
        )
    }
}

pub(crate) struct Musig2SignContext {
    pub common_ctx: Musig2CommonContext,
    pub seckey: Privkey,
    pub secnonce: SecNonce,
}

impl Musig2SignContext {
    pub fn sign(&self, message: &[u8]) -> Result<PartialSignature, SigningError> {
        sign_partial(
            &self.common_ctx.key_agg_ctx,
            self.seckey.clone(),
            self.secnonce.clone(),
            &self.common_ctx.agg_nonce,
            message,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_keys_are_deterministic() {
        let a = InMemorySigner::generate_from_seed(b"a test seed");
        let b = InMemorySigner::generate_from_seed(b"a test seed");
        assert_eq!(a, b);
        let c = InMemorySigner::generate_from_seed(b"another seed");
        assert_ne!(a.funding_key, c.funding_key);
    }

    #[test]
    fn test_private_and_public_derivation_agree() {
        let signer = InMemorySigner::generate_from_seed(b"derive");
        let point = signer.get_commitment_point(5);
        let privkey = derive_private_key(&signer.htlc_base_key, &point);
        let pubkey = derive_public_key(&signer.htlc_base_key.pubkey(), &point);
        assert_eq!(privkey.pubkey(), pubkey);
    }

    #[test]
    fn test_revocation_key_derivation_agree() {
        let base_secret = Privkey::from([11u8; 32]);
        let per_commitment_secret = Privkey::from([22u8; 32]);
        let pubkey =
            derive_revocation_pubkey(&base_secret.pubkey(), &per_commitment_secret.pubkey());
        let privkey = derive_revocation_privkey(&base_secret, &per_commitment_secret);
        assert_eq!(privkey.pubkey(), pubkey);
    }

    #[test]
    fn test_commitment_nonce_is_stable_across_restarts() {
        let signer = InMemorySigner::generate_from_seed(b"nonce");
        let again = InMemorySigner::generate_from_seed(b"nonce");
        assert_eq!(
            signer.derive_commitment_nonce(3).public_nonce(),
            again.derive_commitment_nonce(3).public_nonce()
        );
        assert_ne!(
            signer.derive_commitment_nonce(3).public_nonce(),
            signer.derive_commitment_nonce(4).public_nonce()
        );
    }
}
