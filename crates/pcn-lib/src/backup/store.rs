use serde::{Deserialize, Serialize};

use crate::channel::CloseFlags;
use crate::types::{Hash256, Pubkey, ReestablishChannel};

/// The final positions of a channel that reached the chain, kept after the
/// channel state itself is gone. A peer restoring from a static backup and
/// reconnecting long after the close is answered from this record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClosedChannelRecord {
    pub channel_id: Hash256,
    pub remote_pubkey: Pubkey,
    pub close_flags: CloseFlags,
    pub closing_txid: Option<Hash256>,
    /// Replayed verbatim when the peer reestablishes the closed channel.
    pub reestablish: ReestablishChannel,
    pub closed_at: u64,
}

pub trait ClosedChannelStore {
    fn get_closed_channel_record(&self, channel_id: &Hash256) -> Option<ClosedChannelRecord>;
    fn insert_closed_channel_record(&self, record: ClosedChannelRecord);
    fn get_closed_channel_records(&self) -> Vec<ClosedChannelRecord>;
}

/// Used for delegating the store trait
pub trait ClosedChannelStoreDeref {
    type Target: ClosedChannelStore;
    fn closed_channel_store_deref(&self) -> &Self::Target;
}

impl<T: ClosedChannelStoreDeref> ClosedChannelStore for T {
    fn get_closed_channel_record(&self, channel_id: &Hash256) -> Option<ClosedChannelRecord> {
        self.closed_channel_store_deref()
            .get_closed_channel_record(channel_id)
    }

    fn insert_closed_channel_record(&self, record: ClosedChannelRecord) {
        self.closed_channel_store_deref()
            .insert_closed_channel_record(record);
    }

    fn get_closed_channel_records(&self) -> Vec<ClosedChannelRecord> {
        self.closed_channel_store_deref().get_closed_channel_records()
    }
}
