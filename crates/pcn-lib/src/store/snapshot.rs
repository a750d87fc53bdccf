//! Point-in-time export/import of the whole key space.
//!
//! A snapshot taken before a set of writes and imported afterwards restores
//! the store to exactly the earlier state, which is how tests model a node
//! coming back from a stale backup.

use serde::{Deserialize, Serialize};

use super::db::Store;
use super::schema::SCHEMA_VERSION_KEY;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Store {
    /// Exports every row except the schema version key.
    pub fn export_snapshot(&self) -> StoreSnapshot {
        let entries = self
            .prefix_iterator(&[])
            .filter(|(key, _)| key.as_ref() != SCHEMA_VERSION_KEY)
            .map(|(key, value)| (key.to_vec(), value.to_vec()))
            .collect();
        StoreSnapshot { entries }
    }

    /// Replaces the current contents with the snapshot's rows. Existing rows
    /// not present in the snapshot are deleted; the schema version key is
    /// left untouched.
    pub fn import_snapshot(&self, snapshot: StoreSnapshot) {
        let mut batch = self.batch();
        for (key, _) in self.prefix_iterator(&[]) {
            if key.as_ref() != SCHEMA_VERSION_KEY {
                batch.delete(key.to_vec());
            }
        }
        for (key, value) in snapshot.entries {
            batch.put(key, value);
        }
        batch.commit();
    }
}
