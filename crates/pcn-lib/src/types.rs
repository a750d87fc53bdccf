use crate::serde_utils::{PartialSignatureAsBytes, PubNonceAsBytes, SliceHex};
use bitcoin::hashes::{sha256, Hash as _};
use bitcoin::{OutPoint, ScriptBuf};
use musig2::secp::{Point, Scalar};
use musig2::{PartialSignature, PubNonce};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use once_cell::sync::OnceCell;
use secp256k1::{
    ecdsa::Signature as Secp256k1Signature, All, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::str::FromStr;
use strum::AsRefStr;
use thiserror::Error;

pub fn secp256k1_instance() -> &'static Secp256k1<All> {
    static INSTANCE: OnceCell<Secp256k1<All>> = OnceCell::new();
    INSTANCE.get_or_init(Secp256k1::new)
}

/// The error type for ser/de and key handling failures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Secp error: {0}")]
    Secp(#[from] secp256k1::Error),
    #[error("Musig2 error: {0}")]
    Musig2(String),
    #[error("Error: {0}")]
    AnyHow(#[from] anyhow::Error),
}

impl From<musig2::errors::DecodeError<PubNonce>> for Error {
    fn from(e: musig2::errors::DecodeError<PubNonce>) -> Self {
        Error::Musig2(format!("{e}"))
    }
}

#[serde_as]
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct Hash256(#[serde_as(as = "SliceHex")] [u8; 32]);

impl From<[u8; 32]> for Hash256 {
    fn from(data: [u8; 32]) -> Self {
        Hash256(data)
    }
}

impl From<Hash256> for [u8; 32] {
    fn from(hash: Hash256) -> Self {
        hash.0
    }
}

impl TryFrom<Vec<u8>> for Hash256 {
    type Error = Vec<u8>;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let data: [u8; 32] = value.try_into()?;
        Ok(Hash256(data))
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl ::core::fmt::LowerHex for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        if f.alternate() {
            write!(f, "0x")?;
        }
        for i in &self.0 {
            write!(f, "{:02x}", i)?;
        }
        Ok(())
    }
}

impl ::core::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "Hash256({:#x})", self)
    }
}

impl ::core::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "{:#x}", self)
    }
}

impl FromStr for Hash256 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|err| err.to_string())?;
        let data: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "expected 32 bytes".to_string())?;
        Ok(Hash256(data))
    }
}

/// Computes the sha256 digest of arbitrary data as a [`Hash256`].
pub fn sha256_hash(data: &[u8]) -> Hash256 {
    sha256::Hash::hash(data).to_byte_array().into()
}

/// The channel id is derived from the funding outpoint, so both parties agree
/// on it as soon as the funding transaction is known.
pub fn derive_channel_id(funding_outpoint: &OutPoint) -> Hash256 {
    let mut preimage = funding_outpoint.txid.to_byte_array().to_vec();
    preimage.extend_from_slice(&funding_outpoint.vout.to_le_bytes());
    sha256_hash(&preimage)
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Privkey(pub SecretKey);

impl From<Privkey> for Scalar {
    fn from(pk: Privkey) -> Self {
        pk.0.into()
    }
}

impl From<&Privkey> for Scalar {
    fn from(pk: &Privkey) -> Self {
        pk.0.into()
    }
}

impl From<[u8; 32]> for Privkey {
    fn from(k: [u8; 32]) -> Self {
        Privkey(SecretKey::from_slice(&k).expect("Invalid secret key"))
    }
}

impl From<&[u8; 32]> for Privkey {
    fn from(k: &[u8; 32]) -> Self {
        Self::from_slice(k)
    }
}

impl From<Scalar> for Privkey {
    fn from(scalar: Scalar) -> Self {
        scalar.serialize().into()
    }
}

impl From<Hash256> for Privkey {
    fn from(hash: Hash256) -> Self {
        let bytes: [u8; 32] = hash.into();
        Privkey::from_slice(&bytes)
    }
}

impl From<Privkey> for SecretKey {
    fn from(pk: Privkey) -> Self {
        pk.0
    }
}

impl From<SecretKey> for Privkey {
    fn from(sk: SecretKey) -> Self {
        Self(sk)
    }
}

impl AsRef<[u8; 32]> for Privkey {
    fn as_ref(&self) -> &[u8; 32] {
        self.0.as_ref()
    }
}

impl ::core::fmt::Debug for Privkey {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "Privkey(...)")
    }
}

impl Privkey {
    pub fn from_slice(key: &[u8]) -> Self {
        SecretKey::from_slice(key)
            .expect("Invalid secret key")
            .into()
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey::from(self.0.public_key(secp256k1_instance()))
    }

    /// Adds a scalar (usually derived from a hash) to this key.
    pub fn tweak<I: Into<[u8; 32]>>(&self, scalar: I) -> Self {
        let scalar = scalar.into();
        let scalar = Scalar::from_slice(&scalar)
            .expect(format!("Value {:?} must be within secp256k1 scalar range. If you generated this value from hash function, then your hash function is busted.", &scalar).as_str());
        let sk = Scalar::from(self);
        (scalar + sk)
            .not_zero()
            .expect("valid secp256k1 scalar addition")
            .into()
    }

    pub fn sign_ecdsa(&self, message: &[u8; 32]) -> EcdsaSignature {
        let message = Message::from_digest(*message);
        secp256k1_instance()
            .sign_ecdsa(&message, &self.0)
            .into()
    }
}

#[derive(Copy, Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pubkey(pub PublicKey);

impl From<Pubkey> for Point {
    fn from(val: Pubkey) -> Self {
        PublicKey::from(val).into()
    }
}

impl From<&Pubkey> for Point {
    fn from(val: &Pubkey) -> Self {
        (*val).into()
    }
}

impl From<&Pubkey> for PublicKey {
    fn from(val: &Pubkey) -> Self {
        val.0
    }
}

impl From<Pubkey> for PublicKey {
    fn from(pk: Pubkey) -> Self {
        pk.0
    }
}

impl From<PublicKey> for Pubkey {
    fn from(pk: PublicKey) -> Pubkey {
        Pubkey(pk)
    }
}

impl From<Point> for Pubkey {
    fn from(point: Point) -> Self {
        PublicKey::from(point).into()
    }
}

impl Pubkey {
    pub fn serialize(&self) -> [u8; 33] {
        PublicKey::from(self).serialize()
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        Ok(PublicKey::from_slice(data)?.into())
    }

    pub fn tweak<I: Into<[u8; 32]>>(&self, scalar: I) -> Self {
        let scalar = scalar.into();
        let scalar = Scalar::from_slice(&scalar)
            .expect(format!("Value {:?} must be within secp256k1 scalar range. If you generated this value from hash function, then your hash function is busted.", &scalar).as_str());
        let result = Point::from(self) + scalar.base_point_mul();
        PublicKey::from(result.not_inf().expect("valid public key")).into()
    }
}

#[derive(Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct EcdsaSignature(pub Secp256k1Signature);

impl EcdsaSignature {
    pub fn verify(&self, pubkey: &Pubkey, message: &[u8; 32]) -> bool {
        let message = Message::from_digest(*message);
        secp256k1_instance()
            .verify_ecdsa(&message, &self.0, &pubkey.0)
            .is_ok()
    }

    pub fn serialize_der(&self) -> Vec<u8> {
        self.0.serialize_der().to_vec()
    }
}

impl From<EcdsaSignature> for Secp256k1Signature {
    fn from(sig: EcdsaSignature) -> Self {
        sig.0
    }
}

impl From<Secp256k1Signature> for EcdsaSignature {
    fn from(sig: Secp256k1Signature) -> Self {
        Self(sig)
    }
}

/// Structured failure codes attached to failed HTLC forwards. The upper bits
/// classify the failure the way BOLT error codes do: 0x1000 for amount and
/// expiry policy failures, 0x2000 for channel level failures, 0x4000 for
/// failures only the final node can report.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
    AsRefStr,
)]
#[repr(u16)]
pub enum FailureCode {
    AmountBelowMinimum = 0x1001,
    FeeInsufficient = 0x1002,
    ExpiryTooSoon = 0x1003,
    TemporaryChannelFailure = 0x2001,
    PermanentChannelFailure = 0x2002,
    UnknownNextHop = 0x2003,
    UnknownPaymentHash = 0x4001,
    IncorrectPaymentAmount = 0x4002,
    FinalExpiryTooSoon = 0x4003,
    InvoiceExpired = 0x4004,
    InvoiceCancelled = 0x4005,
}

impl ::core::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// The reason reported upstream when an HTLC is failed instead of settled.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: FailureCode,
}

impl FailureReason {
    pub fn new(code: FailureCode) -> Self {
        Self { code }
    }
}

impl ::core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "{}", self.code)
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ChannelFlags: u8 {
        const PUBLIC = 1;
    }
}

/// Per-channel forwarding policy advertised to the switch. Amounts are in
/// satoshis, the expiry delta in blocks, the fee rate in millionths of the
/// forwarded amount.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub min_htlc_value: u64,
    pub expiry_delta: u64,
    pub fee_proportional_millionths: u64,
}

/// The instruction telling the switch where an incoming HTLC goes next.
/// Absent for HTLCs that terminate at this node. Route selection and onion
/// encoding happen outside this crate, so the instruction travels in clear.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ForwardingInfo {
    pub channel_id: Hash256,
    pub amount: u64,
    pub expiry: u64,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct OpenChannel {
    pub channel_id: Hash256,
    pub funding_amount: u64,
    pub reserved_amount: u64,
    pub commitment_fee: u64,
    pub second_stage_fee: u64,
    pub dust_limit: u64,
    pub commitment_delay: u16,
    pub max_htlc_value_in_flight: u64,
    pub max_htlc_number_in_flight: u64,
    pub min_htlc_value: u64,
    pub funding_pubkey: Pubkey,
    pub payment_basepoint: Pubkey,
    pub delayed_payment_basepoint: Pubkey,
    pub htlc_basepoint: Pubkey,
    pub revocation_basepoint: Pubkey,
    pub first_per_commitment_point: Pubkey,
    pub second_per_commitment_point: Pubkey,
    #[serde(with = "nonce_pair_serde")]
    pub commitment_nonces: (PubNonce, PubNonce),
    pub channel_flags: ChannelFlags,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AcceptChannel {
    pub channel_id: Hash256,
    pub funding_pubkey: Pubkey,
    pub payment_basepoint: Pubkey,
    pub delayed_payment_basepoint: Pubkey,
    pub htlc_basepoint: Pubkey,
    pub revocation_basepoint: Pubkey,
    pub first_per_commitment_point: Pubkey,
    pub second_per_commitment_point: Pubkey,
    #[serde(with = "nonce_pair_serde")]
    pub commitment_nonces: (PubNonce, PubNonce),
}

mod nonce_pair_serde {
    use musig2::{BinaryEncoding, PubNonce};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        nonces: &(PubNonce, PubNonce),
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        (nonces.0.to_bytes().to_vec(), nonces.1.to_bytes().to_vec()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<(PubNonce, PubNonce), D::Error> {
        let (first, second): (Vec<u8>, Vec<u8>) = Deserialize::deserialize(deserializer)?;
        Ok((
            PubNonce::from_bytes(&first).map_err(serde::de::Error::custom)?,
            PubNonce::from_bytes(&second).map_err(serde::de::Error::custom)?,
        ))
    }
}

/// Sent by the funder once the funding transaction is assembled. The channel
/// id inside is still the temporary one from `OpenChannel`; both sides switch
/// to the id derived from the outpoint when they process this message.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FundingCreated {
    pub channel_id: Hash256,
    pub funding_outpoint: OutPoint,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelReady {
    pub channel_id: Hash256,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AddHtlc {
    pub channel_id: Hash256,
    pub htlc_id: u64,
    pub amount: u64,
    pub payment_hash: Hash256,
    pub expiry: u64,
    pub forwarding: Option<ForwardingInfo>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoveHtlcFulfill {
    pub payment_preimage: Hash256,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoveHtlcFail {
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum RemoveHtlcReason {
    Fulfill(RemoveHtlcFulfill),
    Fail(RemoveHtlcFail),
}

impl RemoveHtlcReason {
    pub fn is_fulfill(&self) -> bool {
        matches!(self, RemoveHtlcReason::Fulfill(_))
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoveHtlc {
    pub channel_id: Hash256,
    pub htlc_id: u64,
    pub reason: RemoveHtlcReason,
}

/// A signature over the receiver's next commitment transaction, together with
/// one ECDSA signature per untrimmed HTLC output for the matching second
/// stage transactions, in commitment output order.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentSigned {
    pub channel_id: Hash256,
    pub commitment_number: u64,
    #[serde_as(as = "PartialSignatureAsBytes")]
    pub partial_signature: PartialSignature,
    #[serde_as(as = "PubNonceAsBytes")]
    pub partial_nonce: PubNonce,
    pub htlc_signatures: Vec<EcdsaSignature>,
}

/// Discloses the per-commitment secret of the commitment being revoked and
/// commits to the point and completion nonce used two commitments ahead.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeAndAck {
    pub channel_id: Hash256,
    pub revoked_commitment_number: u64,
    pub per_commitment_secret: Hash256,
    pub next_per_commitment_point: Pubkey,
    #[serde_as(as = "PubNonceAsBytes")]
    pub next_commitment_nonce: PubNonce,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shutdown {
    pub channel_id: Hash256,
    pub close_script: ScriptBuf,
    #[serde_as(as = "PubNonceAsBytes")]
    pub closing_nonce: PubNonce,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingSigned {
    pub channel_id: Hash256,
    #[serde_as(as = "PartialSignatureAsBytes")]
    pub partial_signature: PartialSignature,
}

/// Exchanged on reconnection. The two commitment numbers tell the peer which
/// updates were lost in flight; the last secret and current point carry the
/// proof material for detecting a peer (or ourselves) restoring from an
/// outdated backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReestablishChannel {
    pub channel_id: Hash256,
    pub next_local_commitment_number: u64,
    pub next_remote_commitment_number: u64,
    pub your_last_per_commitment_secret: Hash256,
    pub my_current_per_commitment_point: Pubkey,
}

#[derive(Debug, Clone, Serialize, Deserialize, AsRefStr)]
pub enum PcnMessage {
    OpenChannel(OpenChannel),
    AcceptChannel(AcceptChannel),
    FundingCreated(FundingCreated),
    ChannelReady(ChannelReady),
    AddHtlc(AddHtlc),
    RemoveHtlc(RemoveHtlc),
    CommitmentSigned(CommitmentSigned),
    RevokeAndAck(RevokeAndAck),
    Shutdown(Shutdown),
    ClosingSigned(ClosingSigned),
    ReestablishChannel(ReestablishChannel),
}

impl PcnMessage {
    pub fn channel_id(&self) -> Hash256 {
        match self {
            PcnMessage::OpenChannel(m) => m.channel_id,
            PcnMessage::AcceptChannel(m) => m.channel_id,
            PcnMessage::FundingCreated(m) => m.channel_id,
            PcnMessage::ChannelReady(m) => m.channel_id,
            PcnMessage::AddHtlc(m) => m.channel_id,
            PcnMessage::RemoveHtlc(m) => m.channel_id,
            PcnMessage::CommitmentSigned(m) => m.channel_id,
            PcnMessage::RevokeAndAck(m) => m.channel_id,
            PcnMessage::Shutdown(m) => m.channel_id,
            PcnMessage::ClosingSigned(m) => m.channel_id,
            PcnMessage::ReestablishChannel(m) => m.channel_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash as _;

    #[test]
    fn test_hash256_hex_roundtrip() {
        let hash: Hash256 = [42u8; 32].into();
        let hex = format!("{:#x}", hash);
        assert!(hex.starts_with("0x"));
        assert_eq!(Hash256::from_str(&hex).unwrap(), hash);
    }

    #[test]
    fn test_channel_id_derivation_is_stable() {
        let outpoint = OutPoint {
            txid: bitcoin::Txid::all_zeros(),
            vout: 7,
        };
        assert_eq!(derive_channel_id(&outpoint), derive_channel_id(&outpoint));
        let other = OutPoint {
            txid: bitcoin::Txid::all_zeros(),
            vout: 8,
        };
        assert_ne!(derive_channel_id(&outpoint), derive_channel_id(&other));
    }

    #[test]
    fn test_privkey_tweak_matches_pubkey_tweak() {
        let sk = Privkey::from([7u8; 32]);
        let tweak = [3u8; 32];
        assert_eq!(sk.tweak(tweak).pubkey(), sk.pubkey().tweak(tweak));
    }

    #[test]
    fn test_failure_code_roundtrip() {
        let code = FailureCode::UnknownPaymentHash;
        let raw: u16 = code.into();
        assert_eq!(FailureCode::try_from(raw).unwrap(), code);
    }
}
