use serde::{Deserialize, Serialize};

use crate::types::{ForwardingInfo, Hash256, RemoveHtlcReason};

/// Identifies one HTLC on one channel ledger.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CircuitKey {
    pub channel_id: Hash256,
    pub htlc_id: u64,
}

impl CircuitKey {
    pub fn new(channel_id: Hash256, htlc_id: u64) -> Self {
        Self {
            channel_id,
            htlc_id,
        }
    }

    /// Store key: the channel id followed by the big endian HTLC id, so the
    /// circuits of one channel sort together.
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut bytes = [0u8; 40];
        bytes[..32].copy_from_slice(self.channel_id.as_ref());
        bytes[32..].copy_from_slice(&self.htlc_id.to_be_bytes());
        bytes
    }
}

/// Progress of a circuit. Every transition hits the store before the message
/// acting on it goes out, so a replayed `AddHtlc` after a restart finds the
/// circuit exactly where it left off.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Recorded, outgoing `AddHtlc` not yet acknowledged.
    Opened,
    /// The outgoing channel accepted the HTLC; `outgoing` is set.
    Forwarded,
    /// Terminates locally against a hold invoice, parked until a settle or
    /// cancel signal.
    Held,
    /// The outcome is decided; the incoming HTLC is being removed with this
    /// reason, and the circuit is deleted when the removal becomes final.
    Closing(RemoveHtlcReason),
}

/// The link between an HTLC committed on an incoming channel and whatever
/// resolves it: the matching HTLC offered downstream, or a local invoice.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Circuit {
    pub incoming: CircuitKey,
    /// The HTLC offered on the outgoing channel, once it is acknowledged.
    pub outgoing: Option<CircuitKey>,
    pub payment_hash: Hash256,
    /// Amount and expiry of the incoming HTLC.
    pub amount: u64,
    pub expiry: u64,
    /// Where the HTLC goes next; `None` terminates it at this node.
    pub forwarding: Option<ForwardingInfo>,
    pub state: CircuitState,
}
