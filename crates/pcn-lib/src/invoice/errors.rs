use thiserror::Error;

use crate::types::Hash256;

use super::InvoiceStatus;

#[derive(Error, Debug)]
pub enum InvoiceError {
    #[error("Duplicated invoice found: {0}")]
    DuplicatedInvoice(String),
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(Hash256),
    #[error("Description with length {0} is too long, max {1}")]
    DescriptionTooLong(usize, usize),
    #[error("Both payment_hash and payment_preimage are provided")]
    BothPaymenthashAndPreimage,
    #[error("Neither payment_hash nor payment_preimage is provided")]
    NeitherPaymenthashNorPreimage,
    #[error("Preimage does not hash to the payment hash {0}")]
    HashMismatch(Hash256),
    #[error("No preimage known for invoice {0}")]
    PreimageNotFound(Hash256),
    #[error("Invoice {0} is already in final status {1}")]
    AlreadyFinalized(Hash256, InvoiceStatus),
}
