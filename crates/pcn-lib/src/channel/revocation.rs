use bitcoin::hashes::{sha256, Hash as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Privkey, Pubkey};

/// Commitment numbers start at zero and increase by one with every signed
/// update. The secret index walks the 48 bit derivation tree in the other
/// direction so that disclosed secrets compress: a secret whose index has k
/// trailing zeroes derives all 2^k secrets above it.
pub const INITIAL_COMMITMENT_NUMBER: u64 = 0;

const SECRET_INDEX_BASE: u64 = (1 << 48) - 1;

fn secret_index(commitment_number: u64) -> u64 {
    SECRET_INDEX_BASE - (commitment_number & SECRET_INDEX_BASE)
}

fn derive_from_index(seed: &[u8; 32], bits: u8, index: u64) -> [u8; 32] {
    let mut res = *seed;
    for i in 0..bits {
        let bitpos = bits - 1 - i;
        if index & (1 << bitpos) == (1 << bitpos) {
            res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
            res = sha256::Hash::hash(&res).to_byte_array();
        }
    }
    res
}

pub fn get_commitment_secret(commitment_seed: &[u8; 32], commitment_number: u64) -> [u8; 32] {
    derive_from_index(commitment_seed, 48, secret_index(commitment_number))
}

pub fn get_commitment_point(commitment_seed: &[u8; 32], commitment_number: u64) -> Pubkey {
    Privkey::from(&get_commitment_secret(commitment_seed, commitment_number)).pubkey()
}

#[derive(Error, Debug)]
#[error("revocation secret for commitment {commitment_number} does not extend the known chain")]
pub struct InconsistentSecret {
    pub commitment_number: u64,
}

/// Compact storage for the counterparty's disclosed per-commitment secrets.
/// At most 49 (secret, index) pairs are kept; older secrets are re-derived
/// on demand. Inserting a secret cross-checks every stored secret it should
/// be able to derive, which is what catches a peer disclosing garbage.
#[serde_with::serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevocationStore {
    #[serde_as(as = "[_; 49]")]
    old_secrets: [([u8; 32], u64); 49],
}

impl PartialEq for RevocationStore {
    fn eq(&self, other: &Self) -> bool {
        self.old_secrets
            .iter()
            .zip(other.old_secrets.iter())
            .all(|(a, b)| a == b)
    }
}

impl Eq for RevocationStore {}

impl Default for RevocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationStore {
    pub fn new() -> Self {
        Self {
            old_secrets: [([0; 32], 1 << 48); 49],
        }
    }

    fn place_secret(index: u64) -> u8 {
        for i in 0..48 {
            if index & (1 << i) == (1 << i) {
                return i;
            }
        }
        48
    }

    fn min_seen_index(&self) -> u64 {
        self.old_secrets
            .iter()
            .map(|&(_, index)| index)
            .min()
            .unwrap_or(1 << 48)
    }

    /// The number of secrets disclosed so far. Zero when nothing has been
    /// revoked yet.
    pub fn provided_count(&self) -> u64 {
        let min = self.min_seen_index();
        if min > SECRET_INDEX_BASE {
            0
        } else {
            SECRET_INDEX_BASE - min + 1
        }
    }

    pub fn provide_secret(
        &mut self,
        commitment_number: u64,
        secret: [u8; 32],
    ) -> Result<(), InconsistentSecret> {
        let index = secret_index(commitment_number);
        let pos = Self::place_secret(index);
        for i in 0..pos {
            let (old_secret, old_index) = self.old_secrets[i as usize];
            if derive_from_index(&secret, pos, old_index) != old_secret {
                return Err(InconsistentSecret { commitment_number });
            }
        }
        if self.min_seen_index() <= index {
            return Ok(());
        }
        self.old_secrets[pos as usize] = (secret, index);
        Ok(())
    }

    pub fn get_secret(&self, commitment_number: u64) -> Option<[u8; 32]> {
        let index = secret_index(commitment_number);
        for (i, &(secret, stored_index)) in self.old_secrets.iter().enumerate() {
            if (index & !((1 << i) - 1)) == stored_index {
                return Some(derive_from_index(&secret, i as u8, index));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn test_secret_chain_provides_and_recovers() {
        let commitment_seed = seed(0x17);
        let mut store = RevocationStore::new();
        for number in 0..64u64 {
            store
                .provide_secret(number, get_commitment_secret(&commitment_seed, number))
                .expect("secrets from one seed are consistent");
        }
        assert_eq!(store.provided_count(), 64);
        for number in 0..64u64 {
            assert_eq!(
                store.get_secret(number),
                Some(get_commitment_secret(&commitment_seed, number)),
                "commitment {} should be recoverable",
                number
            );
        }
        assert_eq!(store.get_secret(64), None);
    }

    #[test]
    fn test_inconsistent_secret_is_rejected() {
        let commitment_seed = seed(0x42);
        let mut store = RevocationStore::new();
        for number in 0..7u64 {
            store
                .provide_secret(number, get_commitment_secret(&commitment_seed, number))
                .expect("valid chain");
        }
        // A secret from a different seed cannot derive the stored ones.
        let bogus = get_commitment_secret(&seed(0x43), 7);
        assert!(store.provide_secret(7, bogus).is_err());
        // The store is still intact afterwards.
        assert_eq!(
            store.get_secret(3),
            Some(get_commitment_secret(&commitment_seed, 3))
        );
    }

    #[test]
    fn test_secret_and_point_derivation_agree() {
        let commitment_seed = seed(0x99);
        for number in [0u64, 1, 2, 47, 48, 12345] {
            let secret = get_commitment_secret(&commitment_seed, number);
            assert_eq!(
                Privkey::from(&secret).pubkey(),
                get_commitment_point(&commitment_seed, number)
            );
        }
    }

    #[test]
    fn test_distinct_numbers_give_distinct_secrets() {
        let commitment_seed = seed(0x01);
        let a = get_commitment_secret(&commitment_seed, 0);
        let b = get_commitment_secret(&commitment_seed, 1);
        let c = get_commitment_secret(&commitment_seed, 2);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }
}
