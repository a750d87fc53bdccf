mod db;
mod pub_sub;
mod schema;
mod snapshot;
mod store_impl;

pub use db::{Batch, DbDirection, IteratorMode, Store};
pub use pub_sub::{ChannelStateEvent, StorePublisher, StoreWithPubSub};
pub use snapshot::StoreSnapshot;
pub use store_impl::{KeyValue, StoreKeyValue};

#[cfg(test)]
mod tests;
