mod errors;
mod invoice_impl;
mod store;

pub use errors::InvoiceError;
pub use invoice_impl::{
    Invoice, InvoiceBuilder, InvoiceStatus, SettlementPolicy, MAX_DESCRIPTION_LENGTH,
};
pub use store::{InvoiceStore, InvoiceStoreDeref};
