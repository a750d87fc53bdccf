//!
//! +--------------+--------------------------+--------------------------+
//! | KeyPrefix::  | Key::                    | Value::                  |
//! +--------------+--------------------------+--------------------------+
//! | 0            | Hash256                  | ChannelActorState        |
//! | 16           | Pubkey | Hash256         | ChannelState             |
//! | 17           | OutPoint                 | ChannelId                |
//! | 32           | Payment_hash             | Invoice                  |
//! | 33           | Payment_hash             | Preimage                 |
//! | 34           | Payment_hash             | InvoiceStatus            |
//! | 64           | CircuitKey               | Circuit                  |
//! | 65           | CircuitKey (outgoing)    | CircuitKey (incoming)    |
//! | 96           | Hash256                  | ContractState            |
//! | 97           | Hash256                  | BreachRecord             |
//! | 128          | Hash256                  | ClosedChannelRecord      |
//! | 255          | -                        | schema version           |
//! +--------------+--------------------------+--------------------------+

pub const CHANNEL_ACTOR_STATE_PREFIX: u8 = 0;
pub const PEER_ID_CHANNEL_ID_PREFIX: u8 = 16;
pub const CHANNEL_OUTPOINT_CHANNEL_ID_PREFIX: u8 = 17;
pub const INVOICE_PREFIX: u8 = 32;
pub const PREIMAGE_PREFIX: u8 = 33;
pub const INVOICE_STATUS_PREFIX: u8 = 34;
pub const CIRCUIT_PREFIX: u8 = 64;
pub const CIRCUIT_OUTGOING_INDEX_PREFIX: u8 = 65;
pub const CONTRACT_STATE_PREFIX: u8 = 96;
pub const BREACH_RECORD_PREFIX: u8 = 97;
pub const CLOSED_CHANNEL_RECORD_PREFIX: u8 = 128;
pub const SCHEMA_VERSION_KEY: [u8; 1] = [255];
