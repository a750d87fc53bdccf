use super::{Circuit, CircuitKey};

pub trait CircuitStore {
    fn get_circuit(&self, key: &CircuitKey) -> Option<Circuit>;
    /// Inserts or overwrites the circuit keyed by its incoming HTLC, keeping
    /// the outgoing index in step.
    fn insert_circuit(&self, circuit: Circuit);
    fn delete_circuit(&self, key: &CircuitKey);
    fn get_circuits(&self) -> Vec<Circuit>;
    /// Looks a circuit up by the HTLC it offered downstream.
    fn get_circuit_by_outgoing(&self, outgoing: &CircuitKey) -> Option<Circuit>;
}

/// Used for delegating the store trait
pub trait CircuitStoreDeref {
    type Target: CircuitStore;
    fn circuit_store_deref(&self) -> &Self::Target;
}

impl<T: CircuitStoreDeref> CircuitStore for T {
    fn get_circuit(&self, key: &CircuitKey) -> Option<Circuit> {
        self.circuit_store_deref().get_circuit(key)
    }

    fn insert_circuit(&self, circuit: Circuit) {
        self.circuit_store_deref().insert_circuit(circuit);
    }

    fn delete_circuit(&self, key: &CircuitKey) {
        self.circuit_store_deref().delete_circuit(key);
    }

    fn get_circuits(&self) -> Vec<Circuit> {
        self.circuit_store_deref().get_circuits()
    }

    fn get_circuit_by_outgoing(&self, outgoing: &CircuitKey) -> Option<Circuit> {
        self.circuit_store_deref().get_circuit_by_outgoing(outgoing)
    }
}
