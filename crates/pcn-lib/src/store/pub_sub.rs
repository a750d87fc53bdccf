//! Publish-subscribe notifications for the store.
//!
//! Channel state writes are the one mutation other subsystems need to watch
//! (the backup actor snapshots every committed state), so the wrapper
//! republishes them on an [`OutputPort`] while delegating everything else
//! to the wrapped store.

use std::sync::Arc;

use bitcoin::OutPoint;
use ractor::{port::OutputPortSubscriber, OutputPort};

use crate::{
    backup::{ClosedChannelStore, ClosedChannelStoreDeref},
    chain::{ContractStateStore, ContractStateStoreDeref},
    channel::{ChannelActorState, ChannelActorStateStore, ChannelState},
    invoice::{InvoiceStore, InvoiceStoreDeref},
    switch::{CircuitStore, CircuitStoreDeref},
    types::{Hash256, Pubkey},
};

/// Message sent from the store to subscribers on every channel state write.
#[derive(Clone, Debug)]
pub enum ChannelStateEvent {
    /// A channel actor state was persisted (new or updated).
    Committed(Box<ChannelActorState>),
    /// A channel actor state was removed.
    Deleted(Hash256),
}

#[derive(Default, Clone, Debug)]
pub struct StorePublisher(Arc<OutputPort<ChannelStateEvent>>);

impl StorePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, event: ChannelStateEvent) {
        self.0.send(event);
    }

    pub fn subscribe(&self, subscriber: OutputPortSubscriber<ChannelStateEvent>) {
        subscriber.subscribe_to_port(&self.0);
    }
}

#[derive(Clone, Debug)]
pub struct StoreWithPubSub<S> {
    pub(crate) inner: S,
    publisher: StorePublisher,
}

impl<S> StoreWithPubSub<S> {
    pub fn new(store: S) -> Self {
        Self::new_with_publisher(store, StorePublisher::default())
    }

    pub fn new_with_publisher(store: S, publisher: StorePublisher) -> Self {
        Self {
            inner: store,
            publisher,
        }
    }

    pub(crate) fn publish(&self, event: ChannelStateEvent) {
        self.publisher.publish(event);
    }

    pub fn subscribe(&self, subscriber: OutputPortSubscriber<ChannelStateEvent>) {
        self.publisher.subscribe(subscriber);
    }
}

impl<S> ChannelActorStateStore for StoreWithPubSub<S>
where
    S: ChannelActorStateStore,
{
    fn get_channel_actor_state(&self, id: &Hash256) -> Option<ChannelActorState> {
        self.inner.get_channel_actor_state(id)
    }

    fn insert_channel_actor_state(&self, state: ChannelActorState) {
        self.inner.insert_channel_actor_state(state.clone());
        self.publish(ChannelStateEvent::Committed(Box::new(state)));
    }

    fn delete_channel_actor_state(&self, id: &Hash256) {
        self.inner.delete_channel_actor_state(id);
        self.publish(ChannelStateEvent::Deleted(*id));
    }

    fn get_channel_ids_by_peer(&self, peer_id: &Pubkey) -> Vec<Hash256> {
        self.inner.get_channel_ids_by_peer(peer_id)
    }

    fn get_channel_states(&self, peer_id: Option<Pubkey>) -> Vec<(Pubkey, Hash256, ChannelState)> {
        self.inner.get_channel_states(peer_id)
    }

    fn get_channel_state_by_outpoint(&self, outpoint: &OutPoint) -> Option<ChannelActorState> {
        self.inner.get_channel_state_by_outpoint(outpoint)
    }
}

impl<T: InvoiceStore> InvoiceStoreDeref for StoreWithPubSub<T> {
    type Target = T;

    fn invoice_store_deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: CircuitStore> CircuitStoreDeref for StoreWithPubSub<T> {
    type Target = T;

    fn circuit_store_deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: ContractStateStore> ContractStateStoreDeref for StoreWithPubSub<T> {
    type Target = T;

    fn contract_state_store_deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: ClosedChannelStore> ClosedChannelStoreDeref for StoreWithPubSub<T> {
    type Target = T;

    fn closed_channel_store_deref(&self) -> &Self::Target {
        &self.inner
    }
}
