use super::schema::SCHEMA_VERSION_KEY;
use super::{KeyValue, StoreKeyValue};

pub use rocksdb::Direction as DbDirection;
pub use rocksdb::IteratorMode;
use rocksdb::{DBCompressionType, Options, ReadOptions, WriteBatch, DB};
use std::{path::Path, sync::Arc};

/// The version the open gate expects. Bumping it invalidates existing
/// stores; there is no migration machinery yet because no released schema
/// precedes this one.
pub(crate) const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) db: Arc<DB>,
}

impl Store {
    /// Open a store, with schema version check
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let store = Self::open_db(path.as_ref())?;
        store.check_version()?;
        Ok(store)
    }

    /// Open a store, without version check
    pub fn open_db(path: &Path) -> Result<Self, String> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.set_compression_type(DBCompressionType::Lz4);
        let db = Arc::new(DB::open(&options, path).map_err(|e| e.to_string())?);
        Ok(Self { db })
    }

    fn check_version(&self) -> Result<(), String> {
        match self.get(SCHEMA_VERSION_KEY) {
            None => {
                self.put(SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_be_bytes());
                Ok(())
            }
            Some(raw) => {
                let stored: [u8; 4] = raw
                    .try_into()
                    .map_err(|_| "malformed schema version".to_string())?;
                let stored = u32::from_be_bytes(stored);
                if stored == SCHEMA_VERSION {
                    Ok(())
                } else {
                    Err(format!(
                        "store schema version {} does not match expected {}",
                        stored, SCHEMA_VERSION
                    ))
                }
            }
        }
    }

    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Vec<u8>> {
        self.db.get(key.as_ref()).expect("get should be OK")
    }

    pub fn delete<K: AsRef<[u8]>>(&self, key: K) {
        self.db.delete(key).expect("delete should be ok");
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, value: V) {
        self.db.put(key, value).expect("put should be ok");
    }

    pub fn batch(&self) -> Batch {
        Batch {
            db: Arc::clone(&self.db),
            wb: WriteBatch::default(),
        }
    }

    /// Returns an iterator over items prefixed with `prefix`, starting from
    /// mode `mode`.
    pub fn prefix_iterator_from<'a>(
        &'a self,
        prefix: &'a [u8],
        mode: IteratorMode<'a>,
    ) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a {
        let mut opts = ReadOptions::default();
        opts.set_prefix_same_as_start(true);
        self.db
            .iterator_opt(mode, opts)
            .map(|item| item.expect("iterator should be ok"))
            .take_while(move |(key, _)| key.starts_with(prefix))
    }

    pub fn prefix_iterator<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a {
        self.prefix_iterator_from(prefix, IteratorMode::From(prefix, DbDirection::Forward))
    }
}

pub struct Batch {
    db: Arc<DB>,
    wb: WriteBatch,
}

impl Batch {
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<Vec<u8>> {
        self.db.get(key.as_ref()).expect("get should be OK")
    }

    pub fn put_kv(&mut self, key_value: KeyValue) {
        self.put(key_value.key(), key_value.value());
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.wb.put(key, value);
    }

    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.wb.delete(key);
    }

    pub fn commit(self) {
        self.db.write(self.wb).expect("batch commit should be ok");
    }
}
