//! Ownership-checked invoice persistence.
//!
//! Every operation takes the caller's user id and compares it with the stored
//! owner. A missing record is reported as absent (or `NotFound` for writes);
//! a record owned by someone else always fails loudly with `Unauthorized`.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::clock::Clock;
use crate::customers::CustomerStore;
use crate::error::{ensure_owner, CoreError, Result};
use crate::models::{Invoice, InvoicePatch, NewInvoice};
use crate::numbering::NumberingAssigner;
use crate::store::{
    collections, select_fields, to_fields, Direction, Document, DocumentStore, Precondition,
    Query,
};

pub(crate) const ENTITY: &str = "invoice";

/// Fields that only change when the items or rates do.
const DERIVED_FIELDS: [&str; 4] = ["subtotal", "tax_amount", "discount_amount", "total"];

/// Patch fields that feed the totals calculation.
const TOTALS_INPUTS: [&str; 3] = ["items", "tax_rate", "discount"];

/// Record adapter for invoices.
///
/// Owns the numbering assigner and the customer store because invoice
/// creation and deletion drive both.
#[derive(Clone)]
pub struct InvoiceStore {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) clock: Arc<dyn Clock>,
    numbering: NumberingAssigner,
    customers: CustomerStore,
}

impl InvoiceStore {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            numbering: NumberingAssigner::new(store.clone(), clock.clone()),
            customers: CustomerStore::new(store.clone(), clock.clone()),
            store,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn numbering(&self) -> &NumberingAssigner {
        &self.numbering
    }

    pub fn customers(&self) -> &CustomerStore {
        &self.customers
    }

    /// Creates an invoice owned by `owner`.
    ///
    /// The invoice number is taken from the input when present (it must not
    /// already be used by this owner) and assigned from the owner's sequence
    /// otherwise. A sequence number is only drawn once the rest of the input
    /// and the customer link have been accepted. Totals are computed here; any
    /// totals the client sent were dropped at deserialization. A linked
    /// customer's aggregates are bumped afterwards on a best-effort basis.
    ///
    /// # Arguments
    ///
    /// * `input` - the invoice fields supplied by the caller
    /// * `owner` - user id that will own the invoice
    ///
    /// # Returns
    ///
    /// The stored invoice, with its id, number and totals filled in.
    ///
    /// # Errors
    ///
    /// * `Validation` for malformed input, totals out of range or a reused
    ///   invoice number
    /// * `Unauthorized` if the linked customer belongs to another user
    /// * `OperationFailed` if the store rejects the write
    #[instrument(skip(self, input))]
    pub async fn create(&self, mut input: NewInvoice, owner: &str) -> Result<Invoice> {
        let requested = input
            .invoice_number
            .take()
            .map(|number| number.trim().to_string())
            .filter(|number| !number.is_empty());

        let mut invoice = input.into_invoice(owner, String::new(), self.clock.now());
        invoice.validate_content()?;
        if let Some(customer_id) = &invoice.customer_id {
            self.ensure_customer_link(customer_id, owner).await?;
        }

        invoice.invoice_number = match requested {
            Some(number) => {
                self.ensure_number_free(owner, &number, None).await?;
                number
            }
            None => self.numbering.next_number(owner).await.number,
        };
        invoice.recompute_totals()?;

        let fields = to_fields(&invoice).map_err(|e| CoreError::store("create invoice", e))?;
        let doc = self
            .store
            .create(collections::INVOICES, fields)
            .await
            .map_err(|e| CoreError::store("create invoice", e))?;
        let created = decode(&doc, "create invoice")?;

        info!(
            invoice_id = %doc.id,
            invoice_number = %created.invoice_number,
            total = %created.total,
            "Invoice created"
        );

        self.customers
            .record_invoice_effect(created.customer_id.as_deref(), owner, created.total, true)
            .await;

        Ok(created)
    }

    /// Returns `Ok(None)` if the invoice does not exist.
    ///
    /// # Errors
    ///
    /// `Unauthorized` if it exists but belongs to another user.
    pub async fn get(&self, id: &str, owner: &str) -> Result<Option<Invoice>> {
        let Some(doc) = self
            .store
            .get(collections::INVOICES, id)
            .await
            .map_err(|e| CoreError::store("get invoice", e))?
        else {
            return Ok(None);
        };

        let invoice = decode(&doc, "get invoice")?;
        ensure_owner(ENTITY, id, &invoice.owner_id, owner)?;
        Ok(Some(invoice))
    }

    /// Invoices of `owner`, newest first.
    ///
    /// # Returns
    ///
    /// Every invoice `owner` holds, with totals recomputed. Empty if there
    /// are none.
    pub async fn list_by_owner(&self, owner: &str) -> Result<Vec<Invoice>> {
        let query = Query::new()
            .filter_eq("owner_id", owner)
            .order_by("created_at", Direction::Descending);
        self.list(&query, "list invoices").await
    }

    /// Every invoice regardless of owner, newest first. Callers must restrict
    /// this to administrators.
    pub async fn list_all(&self) -> Result<Vec<Invoice>> {
        let query = Query::new().order_by("created_at", Direction::Descending);
        self.list(&query, "list all invoices").await
    }

    /// Applies a partial update.
    ///
    /// Only the fields present in the patch are written, plus `updated_at`,
    /// the derived totals when items or rates changed, and `sent_at` /
    /// `paid_at` when the patch moves the status into `sent` / `paid` for the
    /// first time. Concurrent writers touching other fields do not clobber
    /// each other.
    ///
    /// When the customer link or the total changes, the customer aggregates
    /// follow (best effort): a relink moves the invoice between customers and
    /// a new total shifts the linked customer's amount.
    ///
    /// # Arguments
    ///
    /// * `id` - invoice to change
    /// * `patch` - fields to set; absent fields are left alone
    /// * `owner` - calling user; must own the invoice
    ///
    /// # Errors
    ///
    /// `NotFound`, `Unauthorized`, `Validation` (including totals out of
    /// range) or `OperationFailed`.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, patch: InvoicePatch, owner: &str) -> Result<Invoice> {
        let (_, mut invoice) = self.fetch_owned(id, owner).await?;
        let previous_number = invoice.invoice_number.clone();
        let previous_customer = invoice.customer_id.clone();
        let previous_total = invoice.total;

        let mut touched = patch.apply(&mut invoice);
        if invoice.invoice_number != previous_number {
            invoice.invoice_number = invoice.invoice_number.trim().to_string();
            self.ensure_number_free(owner, &invoice.invoice_number, Some(id))
                .await?;
        }
        if touched.contains(&"customer_id") {
            if let Some(customer_id) = &invoice.customer_id {
                self.ensure_customer_link(customer_id, owner).await?;
            }
        }
        invoice.validate()?;

        let now = self.clock.now();
        invoice.updated_at = now;
        touched.push("updated_at");
        if let Some(stamped) = invoice.stamp_status(now) {
            touched.push(stamped);
        }
        if touched.iter().any(|field| TOTALS_INPUTS.contains(field)) {
            invoice.recompute_totals()?;
            touched.extend(DERIVED_FIELDS);
        }

        let fields = select_fields(&invoice, touched.iter().copied())
            .map_err(|e| CoreError::store("update invoice", e))?;
        let doc = self
            .store
            .update(collections::INVOICES, id, fields, Precondition::None)
            .await
            .map_err(|e| CoreError::store("update invoice", e))?;

        info!(invoice_id = %id, fields = ?touched, "Invoice updated");
        let updated = decode(&doc, "update invoice")?;

        self.customers
            .record_invoice_change(
                owner,
                (previous_customer.as_deref(), previous_total),
                (updated.customer_id.as_deref(), updated.total),
            )
            .await;

        Ok(updated)
    }

    /// Deletes the invoice together with its line items, then takes it off
    /// the linked customer's aggregates (best effort).
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str, owner: &str) -> Result<()> {
        let (_, invoice) = self.fetch_owned(id, owner).await?;

        self.store
            .delete(collections::INVOICES, id)
            .await
            .map_err(|e| CoreError::store("delete invoice", e))?;

        info!(invoice_id = %id, invoice_number = %invoice.invoice_number, "Invoice deleted");

        self.customers
            .record_invoice_effect(invoice.customer_id.as_deref(), owner, invoice.total, false)
            .await;
        Ok(())
    }

    /// Loads an invoice for a write: `NotFound` if absent, `Unauthorized` if
    /// owned by someone else.
    pub(crate) async fn fetch_owned(&self, id: &str, owner: &str) -> Result<(Document, Invoice)> {
        let doc = self
            .store
            .get(collections::INVOICES, id)
            .await
            .map_err(|e| CoreError::store("get invoice", e))?
            .ok_or_else(|| CoreError::NotFound {
                entity: ENTITY,
                id: id.to_string(),
            })?;

        let invoice = decode(&doc, "get invoice")?;
        ensure_owner(ENTITY, id, &invoice.owner_id, owner)?;
        Ok((doc, invoice))
    }

    async fn list(&self, query: &Query, operation: &'static str) -> Result<Vec<Invoice>> {
        let docs = self
            .store
            .query(collections::INVOICES, query)
            .await
            .map_err(|e| CoreError::store(operation, e))?;

        docs.iter().map(|doc| decode(doc, operation)).collect()
    }

    async fn ensure_number_free(&self, owner: &str, number: &str, except: Option<&str>) -> Result<()> {
        let query = Query::new()
            .filter_eq("owner_id", owner)
            .filter_eq("invoice_number", number);
        let clashes = self
            .store
            .query(collections::INVOICES, &query)
            .await
            .map_err(|e| CoreError::store("check invoice number", e))?;

        if clashes.iter().any(|doc| Some(doc.id.as_str()) != except) {
            return Err(CoreError::validation(format!(
                "invoice number {} is already in use",
                number
            )));
        }
        Ok(())
    }

    async fn ensure_customer_link(&self, customer_id: &str, owner: &str) -> Result<()> {
        match self.customers.get(customer_id, owner).await? {
            Some(_) => Ok(()),
            None => Err(CoreError::validation(format!(
                "customer {} does not exist",
                customer_id
            ))),
        }
    }
}

pub(crate) fn decode(doc: &Document, operation: &'static str) -> Result<Invoice> {
    Invoice::from_document(doc).map_err(|e| CoreError::store(operation, e))
}
