//! Static channel backups: per channel, exactly the data needed to
//! rederive sweep keys and be told how the channel ended, none of the
//! commitment history (history is discarded on restore by design).

use std::fs;
use std::path::Path;

use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bitcoin::OutPoint;
use rand::RngCore;
use scrypt::{scrypt, Params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{
    ChannelActorState, ChannelBasePublicKeys, ChannelConstraints, ChannelState, CommitmentNumbers,
    HtlcState, InMemorySigner, RevocationStore,
};
use crate::types::{ChannelFlags, ChannelPolicy, Hash256, Pubkey};

const VERSION: u8 = 0;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("encryption or decryption failed, likely a wrong password")]
    Crypto,
    #[error("backup blob is truncated or from an unknown version")]
    Malformed,
}

/// The static slice of one channel. Everything in here is fixed at funding
/// time, so a backup taken once stays valid for the channel's lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticChannelBackup {
    pub channel_id: Hash256,
    pub funding_outpoint: OutPoint,
    pub funding_amount: u64,
    pub is_funder: bool,
    pub remote_pubkey: Pubkey,
    pub remote_base_pubkeys: ChannelBasePublicKeys,
    pub commitment_delay: u16,
    pub commitment_fee: u64,
    pub second_stage_fee: u64,
    pub dust_limit: u64,
    pub reserved_amount: u64,
    pub constraints: ChannelConstraints,
    pub policy: ChannelPolicy,
    pub channel_flags: ChannelFlags,
    pub signer: InMemorySigner,
    pub created_at: u64,
}

impl StaticChannelBackup {
    /// `None` until the channel has a funding outpoint and the peer's base
    /// keys; before that there is nothing on chain to recover.
    pub fn from_state(channel: &ChannelActorState) -> Option<Self> {
        let funding_outpoint = channel.funding_outpoint?;
        let remote_base_pubkeys = channel.remote_base_pubkeys.clone()?;
        Some(Self {
            channel_id: channel.id,
            funding_outpoint,
            funding_amount: channel.funding_amount,
            is_funder: channel.is_funder,
            remote_pubkey: channel.remote_pubkey,
            remote_base_pubkeys,
            commitment_delay: channel.commitment_delay,
            commitment_fee: channel.commitment_fee,
            second_stage_fee: channel.second_stage_fee,
            dust_limit: channel.dust_limit,
            reserved_amount: channel.reserved_amount,
            constraints: channel.constraints.clone(),
            policy: channel.policy,
            channel_flags: channel.channel_flags,
            signer: channel.signer.clone(),
            created_at: channel.created_at,
        })
    }

    /// Rebuilds a channel state from the static data alone. Balances and
    /// commitment history are unknown; the state is marked so it never
    /// signs or broadcasts and only waits for the peer to close.
    pub fn restore(&self) -> ChannelActorState {
        ChannelActorState {
            state: ChannelState::ChannelReady,
            id: self.channel_id,
            funding_outpoint: Some(self.funding_outpoint),
            is_funder: self.is_funder,
            funding_amount: self.funding_amount,
            to_local_amount: 0,
            to_remote_amount: 0,
            commitment_fee: self.commitment_fee,
            second_stage_fee: self.second_stage_fee,
            dust_limit: self.dust_limit,
            commitment_delay: self.commitment_delay,
            reserved_amount: self.reserved_amount,
            signer: self.signer.clone(),
            remote_pubkey: self.remote_pubkey,
            remote_base_pubkeys: Some(self.remote_base_pubkeys.clone()),
            commitment_numbers: CommitmentNumbers::new(),
            htlc_state: HtlcState::default(),
            constraints: self.constraints.clone(),
            policy: self.policy,
            channel_flags: self.channel_flags,
            remote_commitment_points: Vec::new(),
            remote_nonces: Vec::new(),
            remote_commitment_secrets: RevocationStore::new(),
            latest_revocation: None,
            remote_commitment_outline: None,
            proposed_remote_outline: None,
            own_commitment_outline: None,
            latest_local_commitment_signed: None,
            last_commitment_signed_msg: None,
            last_revoke_and_ack_msg: None,
            local_shutdown_info: None,
            remote_shutdown_info: None,
            remote_closing_nonce: None,
            closing_txid: None,
            funding_confirmed_at: None,
            created_at: self.created_at,
            reestablishing: false,
            restored_from_backup: true,
        }
    }
}

/// All channels worth backing up, in channel id order so repeated exports
/// of the same store produce the same plaintext.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelBackupSet {
    pub channels: Vec<StaticChannelBackup>,
}

impl ChannelBackupSet {
    pub fn encode(&self) -> Result<Vec<u8>, BackupError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BackupError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn derive_key(password: &[u8], salt: &[u8]) -> Key<Aes256Gcm> {
    let mut key = [0u8; 32];
    let params = Params::recommended();
    scrypt(password, salt, &params, &mut key).expect("checked output key length");
    *Key::<Aes256Gcm>::from_slice(&key)
}

/// `VERSION || salt || nonce || ciphertext`, key derived from the password
/// with scrypt.
pub fn encrypt_backup(plain: &[u8], password: &[u8]) -> Result<Vec<u8>, BackupError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(&derive_key(password, &salt));
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plain)
        .map_err(|_| BackupError::Crypto)?;

    let mut bytes = vec![VERSION];
    bytes.extend_from_slice(&salt);
    bytes.extend_from_slice(&nonce);
    bytes.extend_from_slice(&ciphertext);
    Ok(bytes)
}

pub fn decrypt_backup(bytes: &[u8], password: &[u8]) -> Result<Vec<u8>, BackupError> {
    if bytes.len() < 1 + SALT_LEN + NONCE_LEN || bytes[0] != VERSION {
        return Err(BackupError::Malformed);
    }
    let salt = &bytes[1..SALT_LEN + 1];
    let nonce = &bytes[SALT_LEN + 1..SALT_LEN + NONCE_LEN + 1];
    let ciphertext = &bytes[SALT_LEN + NONCE_LEN + 1..];

    let cipher = Aes256Gcm::new(&derive_key(password, salt));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| BackupError::Crypto)
}

/// Writes the encrypted backup and returns the bytes that went to disk.
pub fn write_backup_file<P: AsRef<Path>>(
    path: P,
    set: &ChannelBackupSet,
    password: &[u8],
) -> Result<Vec<u8>, BackupError> {
    let bytes = encrypt_backup(&set.encode()?, password)?;
    fs::write(path, &bytes)?;
    Ok(bytes)
}

pub fn read_backup_file<P: AsRef<Path>>(
    path: P,
    password: &[u8],
) -> Result<ChannelBackupSet, BackupError> {
    let bytes = fs::read(path)?;
    ChannelBackupSet::decode(&decrypt_backup(&bytes, password)?)
}

/// Channel states rebuilt from an encrypted backup file. The caller inserts
/// them into the store; on the next peer connection they reestablish in
/// waiting mode and recover through the peer's force close.
pub fn restore_backup_file<P: AsRef<Path>>(
    path: P,
    password: &[u8],
) -> Result<Vec<ChannelActorState>, BackupError> {
    Ok(read_backup_file(path, password)?
        .channels
        .iter()
        .map(StaticChannelBackup::restore)
        .collect())
}
