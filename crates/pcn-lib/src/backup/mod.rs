//! Channel backup export and data loss protection.
//!
//! The backup actor subscribes to the store's channel state notifications
//! and rewrites the encrypted static backup file on every change, so the
//! file on disk always covers every channel worth recovering. Restoring is
//! the inverse: [`restore_backup_file`] rebuilds waiting-mode channel
//! states the embedder inserts back into a fresh store.

mod scb;
mod store;

pub use scb::{
    decrypt_backup, encrypt_backup, read_backup_file, restore_backup_file, write_backup_file,
    BackupError, ChannelBackupSet, StaticChannelBackup,
};
pub use store::{ClosedChannelRecord, ClosedChannelStore, ClosedChannelStoreDeref};

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use ractor::{async_trait as rasync_trait, Actor, ActorProcessingErr, ActorRef, OutputPort};
use tracing::{debug, error, info};

use crate::channel::ChannelActorStateStore;
use crate::now_timestamp_as_millis_u64;
use crate::store::ChannelStateEvent;

/// The bytes of the latest backup written to disk, for embedders that
/// mirror the file somewhere off the local machine.
#[derive(Clone, Debug)]
pub struct EncryptedBackup {
    pub bytes: Vec<u8>,
    pub written_at: u64,
}

#[derive(Debug)]
pub enum BackupActorMessage {
    ChannelStateChanged(ChannelStateEvent),
}

impl From<ChannelStateEvent> for BackupActorMessage {
    fn from(event: ChannelStateEvent) -> Self {
        Self::ChannelStateChanged(event)
    }
}

pub struct BackupActorStartArguments {
    pub path: PathBuf,
    pub password: String,
}

pub struct BackupActorState {
    path: PathBuf,
    password: String,
}

pub struct BackupActor<S> {
    store: S,
    encrypted: Arc<OutputPort<EncryptedBackup>>,
}

impl<S> BackupActor<S>
where
    S: ChannelActorStateStore + Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            encrypted: Arc::new(OutputPort::default()),
        }
    }

    /// Every export is also published here.
    pub fn encrypted_output(&self) -> Arc<OutputPort<EncryptedBackup>> {
        self.encrypted.clone()
    }

    /// The static slice of every open channel, in channel id order.
    /// Channels that are themselves restorations carry no value worth
    /// backing up again.
    fn collect(&self) -> ChannelBackupSet {
        let mut channels: Vec<StaticChannelBackup> = self
            .store
            .get_channel_states(None)
            .into_iter()
            .filter(|(_, _, state)| !state.is_closed())
            .filter_map(|(_, channel_id, _)| self.store.get_channel_actor_state(&channel_id))
            .filter(|channel| !channel.restored_from_backup)
            .filter_map(|channel| StaticChannelBackup::from_state(&channel))
            .collect();
        channels.sort_by_key(|backup| backup.channel_id);
        ChannelBackupSet { channels }
    }

    fn export(&self, state: &BackupActorState) {
        let set = self.collect();
        match write_backup_file(&state.path, &set, state.password.as_bytes()) {
            Ok(bytes) => {
                debug!(
                    channels = set.channels.len(),
                    path = ?state.path,
                    "channel backup written"
                );
                self.encrypted.send(EncryptedBackup {
                    bytes,
                    written_at: now_timestamp_as_millis_u64(),
                });
            }
            Err(error) => {
                error!(?error, path = ?state.path, "failed to write the channel backup")
            }
        }
    }
}

#[rasync_trait]
impl<S> Actor for BackupActor<S>
where
    S: ChannelActorStateStore + Send + Sync + 'static,
{
    type Msg = BackupActorMessage;
    type State = BackupActorState;
    type Arguments = BackupActorStartArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        let state = BackupActorState {
            path: args.path,
            password: args.password,
        };
        // the file reflects the store from the first moment, not from the
        // first change after startup
        self.export(&state);
        info!(path = ?state.path, "backup actor started");
        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match message {
            BackupActorMessage::ChannelStateChanged(event) => {
                match &event {
                    ChannelStateEvent::Committed(channel) => {
                        debug!(channel_id = ?channel.id, "channel state committed, re-exporting backup")
                    }
                    ChannelStateEvent::Deleted(channel_id) => {
                        debug!(?channel_id, "channel state deleted, re-exporting backup")
                    }
                }
                self.export(state);
            }
        }
        Ok(())
    }
}
