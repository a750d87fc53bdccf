use super::db::{Batch, Store};
use super::schema::*;
use crate::{
    backup::{ClosedChannelRecord, ClosedChannelStore},
    chain::{BreachRecord, ContractState, ContractStateStore},
    channel::{ChannelActorState, ChannelActorStateStore, ChannelState},
    invoice::{Invoice, InvoiceError, InvoiceStatus, InvoiceStore},
    switch::{Circuit, CircuitKey, CircuitStore},
    types::{Hash256, Pubkey},
};
use bitcoin::hashes::Hash as _;
use bitcoin::OutPoint;
use serde::Serialize;
use std::collections::HashSet;
use tracing::info;

pub(crate) fn serialize_to_vec<T: ?Sized + Serialize>(value: &T, field_name: &str) -> Vec<u8> {
    bincode::serialize(value)
        .unwrap_or_else(|e| panic!("serialization of {} failed: {}", field_name, e))
}

pub(crate) fn deserialize_from<'a, T>(slice: &'a [u8], field_name: &str) -> T
where
    T: serde::Deserialize<'a>,
{
    bincode::deserialize(slice)
        .unwrap_or_else(|e| panic!("deserialization of {} failed: {}", field_name, e))
}

fn outpoint_key_bytes(outpoint: &OutPoint) -> [u8; 36] {
    let mut bytes = [0u8; 36];
    bytes[..32].copy_from_slice(&outpoint.txid.to_byte_array());
    bytes[32..].copy_from_slice(&outpoint.vout.to_le_bytes());
    bytes
}

pub enum KeyValue {
    ChannelActorState(Hash256, ChannelActorState),
    PeerIdChannelId((Pubkey, Hash256), ChannelState),
    OutPointChannelId(OutPoint, Hash256),
    Invoice(Hash256, Invoice),
    Preimage(Hash256, Hash256),
    InvoiceStatus(Hash256, InvoiceStatus),
    Circuit(CircuitKey, Circuit),
    // Index of outgoing key -> incoming key, so a confirmed removal on the
    // outgoing channel finds its circuit without a scan.
    CircuitOutgoingIndex(CircuitKey, CircuitKey),
    ContractState(Hash256, ContractState),
    BreachRecord(Hash256, BreachRecord),
    ClosedChannelRecord(Hash256, ClosedChannelRecord),
}

pub trait StoreKeyValue {
    fn key(&self) -> Vec<u8>;
    fn value(&self) -> Vec<u8>;
}

impl StoreKeyValue for KeyValue {
    fn key(&self) -> Vec<u8> {
        match self {
            KeyValue::ChannelActorState(id, _) => {
                [&[CHANNEL_ACTOR_STATE_PREFIX], id.as_ref()].concat()
            }
            KeyValue::PeerIdChannelId((peer_id, channel_id), _) => [
                &[PEER_ID_CHANNEL_ID_PREFIX],
                peer_id.serialize().as_slice(),
                channel_id.as_ref(),
            ]
            .concat(),
            KeyValue::OutPointChannelId(outpoint, _) => [
                &[CHANNEL_OUTPOINT_CHANNEL_ID_PREFIX],
                outpoint_key_bytes(outpoint).as_slice(),
            ]
            .concat(),
            KeyValue::Invoice(payment_hash, _) => {
                [&[INVOICE_PREFIX], payment_hash.as_ref()].concat()
            }
            KeyValue::Preimage(payment_hash, _) => {
                [&[PREIMAGE_PREFIX], payment_hash.as_ref()].concat()
            }
            KeyValue::InvoiceStatus(payment_hash, _) => {
                [&[INVOICE_STATUS_PREFIX], payment_hash.as_ref()].concat()
            }
            KeyValue::Circuit(circuit_key, _) => {
                [&[CIRCUIT_PREFIX], circuit_key.to_bytes().as_slice()].concat()
            }
            KeyValue::CircuitOutgoingIndex(outgoing, _) => [
                &[CIRCUIT_OUTGOING_INDEX_PREFIX],
                outgoing.to_bytes().as_slice(),
            ]
            .concat(),
            KeyValue::ContractState(channel_id, _) => {
                [&[CONTRACT_STATE_PREFIX], channel_id.as_ref()].concat()
            }
            KeyValue::BreachRecord(channel_id, _) => {
                [&[BREACH_RECORD_PREFIX], channel_id.as_ref()].concat()
            }
            KeyValue::ClosedChannelRecord(channel_id, _) => {
                [&[CLOSED_CHANNEL_RECORD_PREFIX], channel_id.as_ref()].concat()
            }
        }
    }

    fn value(&self) -> Vec<u8> {
        match self {
            KeyValue::ChannelActorState(_, state) => serialize_to_vec(state, "ChannelActorState"),
            KeyValue::PeerIdChannelId(_, state) => serialize_to_vec(state, "ChannelState"),
            KeyValue::OutPointChannelId(_, channel_id) => serialize_to_vec(channel_id, "ChannelId"),
            KeyValue::Invoice(_, invoice) => serialize_to_vec(invoice, "Invoice"),
            KeyValue::Preimage(_, preimage) => serialize_to_vec(preimage, "Hash256"),
            KeyValue::InvoiceStatus(_, status) => serialize_to_vec(status, "InvoiceStatus"),
            KeyValue::Circuit(_, circuit) => serialize_to_vec(circuit, "Circuit"),
            KeyValue::CircuitOutgoingIndex(_, incoming) => {
                serialize_to_vec(incoming, "CircuitKey")
            }
            KeyValue::ContractState(_, state) => serialize_to_vec(state, "ContractState"),
            KeyValue::BreachRecord(_, record) => serialize_to_vec(record, "BreachRecord"),
            KeyValue::ClosedChannelRecord(_, record) => {
                serialize_to_vec(record, "ClosedChannelRecord")
            }
        }
    }
}

impl Store {
    /// Walks the whole key space and reports every value that no longer
    /// deserializes, plus a version mismatch if any.
    pub fn check_validate(&self) -> Result<(), String> {
        let mut errors = HashSet::new();

        fn check_deserialization<T: serde::de::DeserializeOwned>(
            value: &[u8],
            prefix_name: &str,
            errors: &mut HashSet<String>,
        ) {
            if let Err(e) = bincode::deserialize::<T>(value) {
                errors.insert(format!("Failed to deserialize {}: {:?}", prefix_name, e));
            }
        }

        for (key, value) in self.prefix_iterator(&[]) {
            if key.is_empty() {
                errors.insert("Encountered empty key".to_string());
                continue;
            }
            match key[0] {
                CHANNEL_ACTOR_STATE_PREFIX => check_deserialization::<ChannelActorState>(
                    &value,
                    "CHANNEL_ACTOR_STATE_PREFIX",
                    &mut errors,
                ),
                PEER_ID_CHANNEL_ID_PREFIX => check_deserialization::<ChannelState>(
                    &value,
                    "PEER_ID_CHANNEL_ID_PREFIX",
                    &mut errors,
                ),
                CHANNEL_OUTPOINT_CHANNEL_ID_PREFIX => check_deserialization::<Hash256>(
                    &value,
                    "CHANNEL_OUTPOINT_CHANNEL_ID_PREFIX",
                    &mut errors,
                ),
                INVOICE_PREFIX => {
                    check_deserialization::<Invoice>(&value, "INVOICE_PREFIX", &mut errors)
                }
                PREIMAGE_PREFIX => {
                    check_deserialization::<Hash256>(&value, "PREIMAGE_PREFIX", &mut errors)
                }
                INVOICE_STATUS_PREFIX => check_deserialization::<InvoiceStatus>(
                    &value,
                    "INVOICE_STATUS_PREFIX",
                    &mut errors,
                ),
                CIRCUIT_PREFIX => {
                    check_deserialization::<Circuit>(&value, "CIRCUIT_PREFIX", &mut errors)
                }
                CIRCUIT_OUTGOING_INDEX_PREFIX => check_deserialization::<CircuitKey>(
                    &value,
                    "CIRCUIT_OUTGOING_INDEX_PREFIX",
                    &mut errors,
                ),
                CONTRACT_STATE_PREFIX => check_deserialization::<ContractState>(
                    &value,
                    "CONTRACT_STATE_PREFIX",
                    &mut errors,
                ),
                BREACH_RECORD_PREFIX => {
                    check_deserialization::<BreachRecord>(&value, "BREACH_RECORD_PREFIX", &mut errors)
                }
                CLOSED_CHANNEL_RECORD_PREFIX => check_deserialization::<ClosedChannelRecord>(
                    &value,
                    "CLOSED_CHANNEL_RECORD_PREFIX",
                    &mut errors,
                ),
                _ => {}
            }
        }

        if errors.is_empty() {
            info!("All keys and values in the store are valid.");
            Ok(())
        } else {
            let errors: Vec<String> = errors.into_iter().collect();
            Err(errors.join("\n"))
        }
    }
}

impl ChannelActorStateStore for Store {
    fn get_channel_actor_state(&self, id: &Hash256) -> Option<ChannelActorState> {
        let key = [&[CHANNEL_ACTOR_STATE_PREFIX], id.as_ref()].concat();
        self.get(key)
            .map(|v| deserialize_from(v.as_ref(), "ChannelActorState"))
    }

    fn insert_channel_actor_state(&self, state: ChannelActorState) {
        let mut batch = self.batch();
        batch.put_kv(KeyValue::PeerIdChannelId(
            (state.remote_pubkey, state.id),
            state.state,
        ));
        if let Some(outpoint) = state.funding_outpoint {
            batch.put_kv(KeyValue::OutPointChannelId(outpoint, state.id));
        }
        batch.put_kv(KeyValue::ChannelActorState(state.id, state));
        batch.commit();
    }

    fn delete_channel_actor_state(&self, id: &Hash256) {
        if let Some(state) = self.get_channel_actor_state(id) {
            let mut batch = self.batch();
            batch.delete([&[CHANNEL_ACTOR_STATE_PREFIX], id.as_ref()].concat());
            batch.delete(
                [
                    &[PEER_ID_CHANNEL_ID_PREFIX],
                    state.remote_pubkey.serialize().as_slice(),
                    id.as_ref(),
                ]
                .concat(),
            );
            if let Some(outpoint) = state.funding_outpoint {
                batch.delete(
                    [
                        &[CHANNEL_OUTPOINT_CHANNEL_ID_PREFIX],
                        outpoint_key_bytes(&outpoint).as_slice(),
                    ]
                    .concat(),
                );
            }
            batch.commit();
        }
    }

    fn get_channel_ids_by_peer(&self, peer_id: &Pubkey) -> Vec<Hash256> {
        let prefix = [&[PEER_ID_CHANNEL_ID_PREFIX], peer_id.serialize().as_slice()].concat();
        self.prefix_iterator(&prefix)
            .map(|(key, _)| {
                let channel_id: [u8; 32] = key[prefix.len()..]
                    .try_into()
                    .expect("channel id should be 32 bytes");
                channel_id.into()
            })
            .collect()
    }

    fn get_channel_states(&self, peer_id: Option<Pubkey>) -> Vec<(Pubkey, Hash256, ChannelState)> {
        let prefix = match peer_id {
            Some(peer_id) => {
                [&[PEER_ID_CHANNEL_ID_PREFIX], peer_id.serialize().as_slice()].concat()
            }
            None => vec![PEER_ID_CHANNEL_ID_PREFIX],
        };
        self.prefix_iterator(&prefix)
            .map(|(key, value)| {
                let key_len = key.len();
                let peer_id = Pubkey::from_slice(&key[1..key_len - 32])
                    .expect("deserialize pubkey should be OK");
                let channel_id: [u8; 32] = key[key_len - 32..]
                    .try_into()
                    .expect("channel id should be 32 bytes");
                let state = deserialize_from(value.as_ref(), "ChannelState");
                (peer_id, channel_id.into(), state)
            })
            .collect()
    }

    fn get_channel_state_by_outpoint(&self, outpoint: &OutPoint) -> Option<ChannelActorState> {
        let key = [
            &[CHANNEL_OUTPOINT_CHANNEL_ID_PREFIX],
            outpoint_key_bytes(outpoint).as_slice(),
        ]
        .concat();
        self.get(key)
            .map(|v| deserialize_from::<Hash256>(v.as_ref(), "ChannelId"))
            .and_then(|id| self.get_channel_actor_state(&id))
    }
}

impl InvoiceStore for Store {
    fn get_invoice(&self, payment_hash: &Hash256) -> Option<Invoice> {
        let key = [&[INVOICE_PREFIX], payment_hash.as_ref()].concat();
        self.get(key)
            .map(|v| deserialize_from(v.as_ref(), "Invoice"))
    }

    fn insert_invoice(&self, invoice: Invoice, preimage: Option<Hash256>) -> Result<(), InvoiceError> {
        let payment_hash = invoice.payment_hash;
        if self.get_invoice(&payment_hash).is_some() {
            return Err(InvoiceError::DuplicatedInvoice(payment_hash.to_string()));
        }
        let mut batch = self.batch();
        if let Some(preimage) = preimage {
            batch.put_kv(KeyValue::Preimage(payment_hash, preimage));
        }
        batch.put_kv(KeyValue::Invoice(payment_hash, invoice));
        batch.put_kv(KeyValue::InvoiceStatus(payment_hash, InvoiceStatus::Open));
        batch.commit();
        Ok(())
    }

    fn update_invoice_status(
        &self,
        payment_hash: &Hash256,
        status: InvoiceStatus,
    ) -> Result<(), InvoiceError> {
        if self.get_invoice(payment_hash).is_none() {
            return Err(InvoiceError::InvoiceNotFound(*payment_hash));
        }
        let mut batch = self.batch();
        batch.put_kv(KeyValue::InvoiceStatus(*payment_hash, status));
        batch.commit();
        Ok(())
    }

    fn get_invoice_status(&self, payment_hash: &Hash256) -> Option<InvoiceStatus> {
        let key = [&[INVOICE_STATUS_PREFIX], payment_hash.as_ref()].concat();
        self.get(key)
            .map(|v| deserialize_from(v.as_ref(), "InvoiceStatus"))
    }

    fn insert_payment_preimage(&self, payment_hash: Hash256, preimage: Hash256) {
        let mut batch = self.batch();
        batch.put_kv(KeyValue::Preimage(payment_hash, preimage));
        batch.commit();
    }

    fn get_payment_preimage(&self, payment_hash: &Hash256) -> Option<Hash256> {
        let key = [&[PREIMAGE_PREFIX], payment_hash.as_ref()].concat();
        self.get(key)
            .map(|v| deserialize_from(v.as_ref(), "Hash256"))
    }

    fn remove_payment_preimage(&self, payment_hash: &Hash256) {
        self.delete([&[PREIMAGE_PREFIX], payment_hash.as_ref()].concat());
    }
}

impl CircuitStore for Store {
    fn get_circuit(&self, key: &CircuitKey) -> Option<Circuit> {
        let key = [&[CIRCUIT_PREFIX], key.to_bytes().as_slice()].concat();
        self.get(key)
            .map(|v| deserialize_from(v.as_ref(), "Circuit"))
    }

    fn insert_circuit(&self, circuit: Circuit) {
        let mut batch = self.batch();
        if let Some(outgoing) = circuit.outgoing {
            batch.put_kv(KeyValue::CircuitOutgoingIndex(outgoing, circuit.incoming));
        }
        batch.put_kv(KeyValue::Circuit(circuit.incoming, circuit));
        batch.commit();
    }

    fn delete_circuit(&self, key: &CircuitKey) {
        if let Some(circuit) = self.get_circuit(key) {
            let mut batch = self.batch();
            batch.delete([&[CIRCUIT_PREFIX], key.to_bytes().as_slice()].concat());
            if let Some(outgoing) = circuit.outgoing {
                batch.delete(
                    [
                        &[CIRCUIT_OUTGOING_INDEX_PREFIX],
                        outgoing.to_bytes().as_slice(),
                    ]
                    .concat(),
                );
            }
            batch.commit();
        }
    }

    fn get_circuits(&self) -> Vec<Circuit> {
        self.prefix_iterator(&[CIRCUIT_PREFIX])
            .map(|(_, value)| deserialize_from(value.as_ref(), "Circuit"))
            .collect()
    }

    fn get_circuit_by_outgoing(&self, outgoing: &CircuitKey) -> Option<Circuit> {
        let key = [
            &[CIRCUIT_OUTGOING_INDEX_PREFIX],
            outgoing.to_bytes().as_slice(),
        ]
        .concat();
        self.get(key)
            .map(|v| deserialize_from::<CircuitKey>(v.as_ref(), "CircuitKey"))
            .and_then(|incoming| self.get_circuit(&incoming))
    }
}

impl ContractStateStore for Store {
    fn get_contract_state(&self, channel_id: &Hash256) -> Option<ContractState> {
        let key = [&[CONTRACT_STATE_PREFIX], channel_id.as_ref()].concat();
        self.get(key)
            .map(|v| deserialize_from(v.as_ref(), "ContractState"))
    }

    fn insert_contract_state(&self, state: ContractState) {
        let mut batch = self.batch();
        batch.put_kv(KeyValue::ContractState(state.channel_id, state));
        batch.commit();
    }

    fn delete_contract_state(&self, channel_id: &Hash256) {
        self.delete([&[CONTRACT_STATE_PREFIX], channel_id.as_ref()].concat());
    }

    fn get_contract_states(&self) -> Vec<ContractState> {
        self.prefix_iterator(&[CONTRACT_STATE_PREFIX])
            .map(|(_, value)| deserialize_from(value.as_ref(), "ContractState"))
            .collect()
    }

    fn get_breach_record(&self, channel_id: &Hash256) -> Option<BreachRecord> {
        let key = [&[BREACH_RECORD_PREFIX], channel_id.as_ref()].concat();
        self.get(key)
            .map(|v| deserialize_from(v.as_ref(), "BreachRecord"))
    }

    fn insert_breach_record(&self, record: BreachRecord) {
        let mut batch = self.batch();
        batch.put_kv(KeyValue::BreachRecord(record.channel_id, record));
        batch.commit();
    }
}

impl ClosedChannelStore for Store {
    fn get_closed_channel_record(&self, channel_id: &Hash256) -> Option<ClosedChannelRecord> {
        let key = [&[CLOSED_CHANNEL_RECORD_PREFIX], channel_id.as_ref()].concat();
        self.get(key)
            .map(|v| deserialize_from(v.as_ref(), "ClosedChannelRecord"))
    }

    fn insert_closed_channel_record(&self, record: ClosedChannelRecord) {
        let mut batch = self.batch();
        batch.put_kv(KeyValue::ClosedChannelRecord(record.channel_id, record));
        batch.commit();
    }

    fn get_closed_channel_records(&self) -> Vec<ClosedChannelRecord> {
        self.prefix_iterator(&[CLOSED_CHANNEL_RECORD_PREFIX])
            .map(|(_, value)| deserialize_from(value.as_ref(), "ClosedChannelRecord"))
            .collect()
    }
}

/// Used by [`Batch`] consumers that assemble multi-row updates themselves.
impl Batch {
    pub fn put_channel_actor_state(&mut self, state: ChannelActorState) {
        self.put_kv(KeyValue::PeerIdChannelId(
            (state.remote_pubkey, state.id),
            state.state,
        ));
        if let Some(outpoint) = state.funding_outpoint {
            self.put_kv(KeyValue::OutPointChannelId(outpoint, state.id));
        }
        self.put_kv(KeyValue::ChannelActorState(state.id, state));
    }
}
