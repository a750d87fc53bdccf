use crate::types::Hash256;

use super::{Invoice, InvoiceError, InvoiceStatus};

pub trait InvoiceStore {
    fn get_invoice(&self, payment_hash: &Hash256) -> Option<Invoice>;
    fn insert_invoice(&self, invoice: Invoice, preimage: Option<Hash256>)
        -> Result<(), InvoiceError>;
    fn update_invoice_status(
        &self,
        payment_hash: &Hash256,
        status: InvoiceStatus,
    ) -> Result<(), InvoiceError>;
    fn get_invoice_status(&self, payment_hash: &Hash256) -> Option<InvoiceStatus>;
    /// Preimages live in their own table: invoice preimages are written at
    /// invoice creation, and the resolver adds preimages it extracts from
    /// on-chain witnesses.
    fn insert_payment_preimage(&self, payment_hash: Hash256, preimage: Hash256);
    fn get_payment_preimage(&self, payment_hash: &Hash256) -> Option<Hash256>;
    fn remove_payment_preimage(&self, payment_hash: &Hash256);
}

/// Used for delegating the store trait
pub trait InvoiceStoreDeref {
    type Target: InvoiceStore;
    fn invoice_store_deref(&self) -> &Self::Target;
}

impl<T: InvoiceStoreDeref> InvoiceStore for T {
    fn get_invoice(&self, payment_hash: &Hash256) -> Option<Invoice> {
        self.invoice_store_deref().get_invoice(payment_hash)
    }

    fn insert_invoice(
        &self,
        invoice: Invoice,
        preimage: Option<Hash256>,
    ) -> Result<(), InvoiceError> {
        self.invoice_store_deref().insert_invoice(invoice, preimage)
    }

    fn update_invoice_status(
        &self,
        payment_hash: &Hash256,
        status: InvoiceStatus,
    ) -> Result<(), InvoiceError> {
        self.invoice_store_deref()
            .update_invoice_status(payment_hash, status)
    }

    fn get_invoice_status(&self, payment_hash: &Hash256) -> Option<InvoiceStatus> {
        self.invoice_store_deref().get_invoice_status(payment_hash)
    }

    fn insert_payment_preimage(&self, payment_hash: Hash256, preimage: Hash256) {
        self.invoice_store_deref()
            .insert_payment_preimage(payment_hash, preimage);
    }

    fn get_payment_preimage(&self, payment_hash: &Hash256) -> Option<Hash256> {
        self.invoice_store_deref().get_payment_preimage(payment_hash)
    }

    fn remove_payment_preimage(&self, payment_hash: &Hash256) {
        self.invoice_store_deref()
            .remove_payment_preimage(payment_hash);
    }
}
