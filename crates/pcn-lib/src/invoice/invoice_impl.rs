use serde::{Deserialize, Serialize};

use crate::now_timestamp_as_millis_u64;
use crate::types::{sha256_hash, Hash256};

use super::InvoiceError;

pub const MAX_DESCRIPTION_LENGTH: usize = 639;

/// How an accepted HTLC paying this invoice is settled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SettlementPolicy {
    /// Settle with the stored preimage as soon as the HTLC is irrevocably
    /// committed on the incoming channel.
    Immediate,
    /// Keep the HTLC pending until an explicit settle or cancel command,
    /// failing it upstream if the command never arrives before the HTLC
    /// deadline forces the channel closed.
    HoldUntilSignal,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, strum::Display)]
pub enum InvoiceStatus {
    /// Accepting payments.
    Open,
    /// An HTLC is committed and held, waiting for a settle/cancel signal.
    Held,
    /// Settled with the preimage.
    Settled,
    /// Cancelled before settlement.
    Cancelled,
    /// Expired before settlement.
    Expired,
}

impl InvoiceStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Settled | InvoiceStatus::Cancelled | InvoiceStatus::Expired
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub payment_hash: Hash256,
    /// None accepts any amount.
    pub amount: Option<u64>,
    pub description: Option<String>,
    /// Milliseconds since the unix epoch.
    pub created_at: u64,
    /// Seconds from `created_at` after which the invoice no longer accepts
    /// payments. None never expires.
    pub expiry: Option<u64>,
    pub policy: SettlementPolicy,
}

impl Invoice {
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => {
                now_timestamp_as_millis_u64()
                    > self.created_at.saturating_add(expiry.saturating_mul(1000))
            }
            None => false,
        }
    }

    /// Underpaying a fixed-amount invoice is rejected; overpaying is the
    /// payer's prerogative.
    pub fn accepts_amount(&self, paid: u64) -> bool {
        match self.amount {
            Some(amount) => paid >= amount,
            None => true,
        }
    }
}

pub struct InvoiceBuilder {
    amount: Option<u64>,
    payment_hash: Option<Hash256>,
    payment_preimage: Option<Hash256>,
    description: Option<String>,
    expiry: Option<u64>,
    policy: SettlementPolicy,
}

impl Default for InvoiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InvoiceBuilder {
    pub fn new() -> Self {
        Self {
            amount: None,
            payment_hash: None,
            payment_preimage: None,
            description: None,
            expiry: None,
            policy: SettlementPolicy::Immediate,
        }
    }

    pub fn amount(mut self, amount: Option<u64>) -> Self {
        self.amount = amount;
        self
    }

    /// The hash of the preimage. If the hash is set, the preimage must be
    /// absent; this is the shape of a hold invoice whose preimage only
    /// becomes known out of band.
    pub fn payment_hash(mut self, payment_hash: Hash256) -> Self {
        self.payment_hash = Some(payment_hash);
        self
    }

    /// The preimage to settle an incoming HTLC payable to this invoice.
    /// If the preimage is set, the hash must be absent and is derived.
    pub fn payment_preimage(mut self, payment_preimage: Hash256) -> Self {
        self.payment_preimage = Some(payment_preimage);
        self
    }

    pub fn description(mut self, description: String) -> Self {
        self.description = Some(description);
        self
    }

    pub fn expiry_seconds(mut self, expiry: u64) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn settlement_policy(mut self, policy: SettlementPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<Invoice, InvoiceError> {
        let payment_hash = match (self.payment_hash, self.payment_preimage) {
            (Some(_), Some(_)) => return Err(InvoiceError::BothPaymenthashAndPreimage),
            (None, None) => return Err(InvoiceError::NeitherPaymenthashNorPreimage),
            (Some(hash), None) => hash,
            (None, Some(preimage)) => sha256_hash(preimage.as_ref()),
        };
        if let Some(description) = &self.description {
            if description.len() > MAX_DESCRIPTION_LENGTH {
                return Err(InvoiceError::DescriptionTooLong(
                    description.len(),
                    MAX_DESCRIPTION_LENGTH,
                ));
            }
        }
        Ok(Invoice {
            payment_hash,
            amount: self.amount,
            description: self.description,
            created_at: now_timestamp_as_millis_u64(),
            expiry: self.expiry,
            policy: self.policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gen_rand_sha256_hash;

    #[test]
    fn test_build_derives_payment_hash_from_preimage() {
        let preimage = gen_rand_sha256_hash();
        let invoice = InvoiceBuilder::new()
            .payment_preimage(preimage)
            .amount(Some(1000))
            .build()
            .unwrap();
        assert_eq!(invoice.payment_hash, sha256_hash(preimage.as_ref()));
        assert_eq!(invoice.policy, SettlementPolicy::Immediate);
    }

    #[test]
    fn test_build_rejects_hash_and_preimage_conflicts() {
        assert!(matches!(
            InvoiceBuilder::new().build(),
            Err(InvoiceError::NeitherPaymenthashNorPreimage)
        ));
        assert!(matches!(
            InvoiceBuilder::new()
                .payment_hash(gen_rand_sha256_hash())
                .payment_preimage(gen_rand_sha256_hash())
                .build(),
            Err(InvoiceError::BothPaymenthashAndPreimage)
        ));
    }

    #[test]
    fn test_build_rejects_overlong_description() {
        let result = InvoiceBuilder::new()
            .payment_hash(gen_rand_sha256_hash())
            .description("x".repeat(MAX_DESCRIPTION_LENGTH + 1))
            .build();
        assert!(matches!(result, Err(InvoiceError::DescriptionTooLong(_, _))));
    }

    #[test]
    fn test_huge_expiry_never_expires() {
        // an operator passing u64::MAX means "never"; the deadline must
        // saturate instead of wrapping past the creation time
        let invoice = InvoiceBuilder::new()
            .payment_preimage(gen_rand_sha256_hash())
            .expiry_seconds(u64::MAX)
            .build()
            .unwrap();
        assert!(!invoice.is_expired());
    }

    #[test]
    fn test_amount_acceptance() {
        let invoice = InvoiceBuilder::new()
            .payment_preimage(gen_rand_sha256_hash())
            .amount(Some(1000))
            .build()
            .unwrap();
        assert!(!invoice.accepts_amount(999));
        assert!(invoice.accepts_amount(1000));
        assert!(invoice.accepts_amount(2000));

        let any_amount = InvoiceBuilder::new()
            .payment_preimage(gen_rand_sha256_hash())
            .build()
            .unwrap();
        assert!(any_amount.accepts_amount(1));
    }
}
