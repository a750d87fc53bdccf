use bitcoin::hashes::Hash as _;
use bitcoin::{OutPoint, Txid};
use tempfile::NamedTempFile;

use crate::channel::{
    ChannelActorState, ChannelConstraints, ChannelState, InMemorySigner,
};
use crate::types::{ChannelFlags, ChannelPolicy, Hash256, Privkey};

use super::{
    decrypt_backup, encrypt_backup, read_backup_file, restore_backup_file, write_backup_file,
    BackupError, ChannelBackupSet, StaticChannelBackup,
};

fn funded_channel(seed: u8) -> ChannelActorState {
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

#[test]
fn test_encrypt_decrypt_roundtrip() {
    let blob = encrypt_backup(b"static channel data", b"password").unwrap();
    assert_eq!(
        decrypt_backup(&blob, b"password").unwrap(),
        b"static channel data"
    );
    assert!(matches!(
        decrypt_backup(&blob, b"wrong password"),
        Err(BackupError::Crypto)
    ));
}

#[test]
fn test_truncated_blob_is_rejected() {
    assert!(matches!(
        decrypt_backup(&[0u8; 10], b"password"),
        Err(BackupError::Malformed)
    ));
    assert!(matches!(
        decrypt_backup(&[1u8; 64], b"password"),
        Err(BackupError::Malformed)
    ));
}

#[test]
fn test_backup_needs_funding_and_peer_keys() {
    let mut channel = funded_channel(3);
    assert!(StaticChannelBackup::from_state(&channel).is_some());
    channel.funding_outpoint = None;
    assert!(StaticChannelBackup::from_state(&channel).is_none());
}

#[test]
fn test_restored_state_only_waits() {
    let channel = funded_channel(5);
    let backup = StaticChannelBackup::from_state(&channel).unwrap();
    let restored = backup.restore();

    assert!(restored.restored_from_backup);
    assert_eq!(restored.id, channel.id);
    assert_eq!(restored.funding_outpoint, channel.funding_outpoint);
    assert_eq!(restored.signer, channel.signer);
    assert_eq!(restored.remote_base_pubkeys, channel.remote_base_pubkeys);
    // no history survives
    assert_eq!(restored.commitment_numbers.get_local(), 0);
    assert_eq!(restored.commitment_numbers.get_remote(), 0);
    assert!(restored.latest_revocation.is_none());

    // the reestablish it sends admits to holding nothing
    let reestablish = restored.build_reestablish_channel_message();
    assert_eq!(reestablish.next_local_commitment_number, 0);
    assert_eq!(reestablish.next_remote_commitment_number, 0);
    assert_eq!(
        reestablish.your_last_per_commitment_secret,
        Hash256::default()
    );
}

#[test]
fn test_backup_file_roundtrip() {
    let set = ChannelBackupSet {
        channels: vec![
            StaticChannelBackup::from_state(&funded_channel(1)).unwrap(),
            StaticChannelBackup::from_state(&funded_channel(2)).unwrap(),
        ],
    };
    let file = NamedTempFile::new().unwrap();

    write_backup_file(file.path(), &set, b"password").unwrap();
    let read = read_backup_file(file.path(), b"password").unwrap();
    assert_eq!(read.channels.len(), 2);
    assert_eq!(read.channels[0].channel_id, set.channels[0].channel_id);

    let restored = restore_backup_file(file.path(), b"password").unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored.iter().all(|state| state.restored_from_backup));

    assert!(read_backup_file(file.path(), b"nope").is_err());
}
