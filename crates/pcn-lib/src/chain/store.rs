use super::{BreachRecord, ContractState};
use crate::types::Hash256;

pub trait ContractStateStore {
    fn get_contract_state(&self, channel_id: &Hash256) -> Option<ContractState>;
    /// Inserts or overwrites the contract keyed by its channel id.
    fn insert_contract_state(&self, state: ContractState);
    fn delete_contract_state(&self, channel_id: &Hash256);
    fn get_contract_states(&self) -> Vec<ContractState>;
    fn get_breach_record(&self, channel_id: &Hash256) -> Option<BreachRecord>;
    fn insert_breach_record(&self, record: BreachRecord);
}

/// Used for delegating the store trait
pub trait ContractStateStoreDeref {
    type Target: ContractStateStore;
    fn contract_state_store_deref(&self) -> &Self::Target;
}

impl<T: ContractStateStoreDeref> ContractStateStore for T {
    fn get_contract_state(&self, channel_id: &Hash256) -> Option<ContractState> {
        self.contract_state_store_deref().get_contract_state(channel_id)
    }

    fn insert_contract_state(&self, state: ContractState) {
        self.contract_state_store_deref().insert_contract_state(state);
    }

    fn delete_contract_state(&self, channel_id: &Hash256) {
        self.contract_state_store_deref().delete_contract_state(channel_id);
    }

    fn get_contract_states(&self) -> Vec<ContractState> {
        self.contract_state_store_deref().get_contract_states()
    }

    fn get_breach_record(&self, channel_id: &Hash256) -> Option<BreachRecord> {
        self.contract_state_store_deref().get_breach_record(channel_id)
    }

    fn insert_breach_record(&self, record: BreachRecord) {
        self.contract_state_store_deref().insert_breach_record(record);
    }
}
