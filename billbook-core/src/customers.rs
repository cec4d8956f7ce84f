//! Ownership-checked customer records and their invoice aggregates.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::error::{ensure_owner, CoreError, Result};
use crate::models::{Customer, CustomerPatch, NewCustomer};
use crate::store::{
    collections, select_fields, to_fields, Direction, Document, DocumentStore, Precondition,
    Query, StoreError,
};
use crate::totals::TotalsOverflow;

const ENTITY: &str = "customer";

/// Attempts before an aggregate update gives up on a contended customer.
const MAX_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct CustomerStore {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl CustomerStore {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Stores a new customer for `owner` with zeroed aggregates.
    ///
    /// # Arguments
    ///
    /// * `input` - name, contact details and address
    /// * `owner` - user id that will own the customer
    ///
    /// # Errors
    ///
    /// `Validation` for an empty name, `OperationFailed` if the store rejects
    /// the write.
    #[instrument(skip(self, input))]
    pub async fn create(&self, input: NewCustomer, owner: &str) -> Result<Customer> {
        let customer = input.into_customer(owner, self.clock.now());
        customer.validate()?;

        let fields =
            to_fields(&customer).map_err(|e| CoreError::store("create customer", e))?;
        let doc = self
            .store
            .create(collections::CUSTOMERS, fields)
            .await
            .map_err(|e| CoreError::store("create customer", e))?;

        info!(customer_id = %doc.id, "Customer created");
        decode(&doc, "create customer")
    }

    /// Returns `Ok(None)` when the customer does not exist and
    /// [`CoreError::Unauthorized`] when it belongs to someone else.
    pub async fn get(&self, id: &str, owner: &str) -> Result<Option<Customer>> {
        let Some(doc) = self
            .store
            .get(collections::CUSTOMERS, id)
            .await
            .map_err(|e| CoreError::store("get customer", e))?
        else {
            return Ok(None);
        };

        let customer = decode(&doc, "get customer")?;
        ensure_owner(ENTITY, id, &customer.owner_id, owner)?;
        Ok(Some(customer))
    }

    /// Customers of `owner`, newest first.
    pub async fn list_by_owner(&self, owner: &str) -> Result<Vec<Customer>> {
        let query = Query::new()
            .filter_eq("owner_id", owner)
            .order_by("created_at", Direction::Descending);
        let docs = self
            .store
            .query(collections::CUSTOMERS, &query)
            .await
            .map_err(|e| CoreError::store("list customers", e))?;

        docs.iter()
            .map(|doc| decode(doc, "list customers"))
            .collect()
    }

    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, patch: CustomerPatch, owner: &str) -> Result<Customer> {
        let (_, mut customer) = self.fetch_owned(id, owner).await?;
        let touched = patch.apply(&mut customer);
        customer.validate()?;
        customer.updated_at = self.clock.now();

        let fields = select_fields(&customer, touched.iter().copied().chain(["updated_at"]))
            .map_err(|e| CoreError::store("update customer", e))?;
        let doc = self
            .store
            .update(collections::CUSTOMERS, id, fields, Precondition::None)
            .await
            .map_err(|e| CoreError::store("update customer", e))?;

        info!(customer_id = %id, fields = ?touched, "Customer updated");
        decode(&doc, "update customer")
    }

    /// Deletes the customer. Invoices that reference it keep their link.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str, owner: &str) -> Result<()> {
        self.fetch_owned(id, owner).await?;
        self.store
            .delete(collections::CUSTOMERS, id)
            .await
            .map_err(|e| CoreError::store("delete customer", e))?;

        info!(customer_id = %id, "Customer deleted");
        Ok(())
    }

    /// Adds (or removes) one invoice worth `amount` to the customer's
    /// aggregates.
    ///
    /// The read-modify-write is guarded by the document revision and retried
    /// on contention. The invoice count never drops below zero.
    ///
    /// # Arguments
    ///
    /// * `customer_id` - customer whose aggregates change
    /// * `owner` - calling user; must own the customer
    /// * `amount` - invoice total to add or remove
    /// * `is_increment` - `true` when an invoice starts counting, `false` when
    ///   it stops
    ///
    /// # Returns
    ///
    /// The customer as written.
    ///
    /// # Errors
    ///
    /// `NotFound` / `Unauthorized` from the ownership check, `Validation` if
    /// the running total leaves the `Decimal` range, or `OperationFailed` if
    /// the store is unavailable or contention persists.
    pub async fn adjust_stats(
        &self,
        customer_id: &str,
        owner: &str,
        amount: Decimal,
        is_increment: bool,
    ) -> Result<Customer> {
        let delta = if is_increment {
            StatsDelta::added(amount)
        } else {
            StatsDelta::removed(amount)
        };
        self.apply_delta(customer_id, owner, delta).await
    }

    #[instrument(skip(self))]
    async fn apply_delta(
        &self,
        customer_id: &str,
        owner: &str,
        delta: StatsDelta,
    ) -> Result<Customer> {
        for _ in 0..MAX_ATTEMPTS {
            let (doc, mut customer) = self.fetch_owned(customer_id, owner).await?;

            customer.total_invoices = if delta.invoices >= 0 {
                customer.total_invoices.saturating_add(delta.invoices.unsigned_abs())
            } else {
                customer.total_invoices.saturating_sub(delta.invoices.unsigned_abs())
            };
            customer.total_amount = customer
                .total_amount
                .checked_add(delta.amount)
                .ok_or(TotalsOverflow)?;
            customer.updated_at = self.clock.now();

            let fields = select_fields(
                &customer,
                ["total_invoices", "total_amount", "updated_at"],
            )
            .map_err(|e| CoreError::store("adjust customer stats", e))?;

            match self
                .store
                .update(
                    collections::CUSTOMERS,
                    customer_id,
                    fields,
                    Precondition::Revision(doc.revision),
                )
                .await
            {
                Ok(doc) => return decode(&doc, "adjust customer stats"),
                Err(StoreError::RevisionMismatch { .. }) => continue,
                Err(e) => return Err(CoreError::store("adjust customer stats", e)),
            }
        }

        Err(CoreError::store(
            "adjust customer stats",
            StoreError::revision_mismatch(collections::CUSTOMERS, customer_id),
        ))
    }

    /// Best-effort aggregate update following an invoice create or delete.
    /// Failures are logged and otherwise ignored; the invoice write stands.
    pub(crate) async fn record_invoice_effect(
        &self,
        customer_id: Option<&str>,
        owner: &str,
        amount: Decimal,
        is_increment: bool,
    ) {
        let Some(customer_id) = customer_id else {
            return;
        };
        let delta = if is_increment {
            StatsDelta::added(amount)
        } else {
            StatsDelta::removed(amount)
        };
        self.apply_best_effort(customer_id, owner, delta).await;
    }

    /// Best-effort aggregate update following an invoice edit that changed
    /// its customer link, its total, or both.
    ///
    /// A relink moves the invoice from one customer to the other. A new total
    /// under the same customer only shifts `total_amount`.
    pub(crate) async fn record_invoice_change(
        &self,
        owner: &str,
        before: (Option<&str>, Decimal),
        after: (Option<&str>, Decimal),
    ) {
        let ((old_customer, old_total), (new_customer, new_total)) = (before, after);

        if old_customer != new_customer {
            self.record_invoice_effect(old_customer, owner, old_total, false)
                .await;
            self.record_invoice_effect(new_customer, owner, new_total, true)
                .await;
            return;
        }

        let Some(customer_id) = new_customer else {
            return;
        };
        if old_total == new_total {
            return;
        }
        match new_total.checked_sub(old_total) {
            Some(amount) => {
                let delta = StatsDelta { invoices: 0, amount };
                self.apply_best_effort(customer_id, owner, delta).await;
            }
            None => warn!(
                customer_id,
                owner,
                "Invoice total change out of range; customer aggregates will drift"
            ),
        }
    }

    async fn apply_best_effort(&self, customer_id: &str, owner: &str, delta: StatsDelta) {
        if let Err(e) = self.apply_delta(customer_id, owner, delta).await {
            warn!(
                customer_id,
                owner,
                error = %e,
                "Customer aggregates not updated; they will drift until reconciled"
            );
        }
    }

    async fn fetch_owned(&self, id: &str, owner: &str) -> Result<(Document, Customer)> {
        let doc = self
            .store
            .get(collections::CUSTOMERS, id)
            .await
            .map_err(|e| CoreError::store("get customer", e))?
            .ok_or_else(|| CoreError::NotFound {
                entity: ENTITY,
                id: id.to_string(),
            })?;

        let customer = decode(&doc, "get customer")?;
        ensure_owner(ENTITY, id, &customer.owner_id, owner)?;
        Ok((doc, customer))
    }
}

/// Change to a customer's aggregates, applied in one guarded write.
#[derive(Debug, Clone, Copy)]
struct StatsDelta {
    invoices: i64,
    amount: Decimal,
}

impl StatsDelta {
    fn added(amount: Decimal) -> Self {
        Self { invoices: 1, amount }
    }

    fn removed(amount: Decimal) -> Self {
        Self {
            invoices: -1,
            amount: -amount,
        }
    }
}

fn decode(doc: &Document, operation: &'static str) -> Result<Customer> {
    Customer::from_document(doc).map_err(|e| CoreError::store(operation, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn customers() -> CustomerStore {
        CustomerStore::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    fn acme() -> NewCustomer {
        NewCustomer {
            name: "Acme".into(),
            email: "billing@acme.test".into(),
            ..NewCustomer::default()
        }
    }

    #[tokio::test]
    async fn test_adjust_stats_round_trip() {
        let customers = customers();
        let customer = customers.create(acme(), "u1").await.unwrap();
        let id = customer.id.unwrap();

        customers.adjust_stats(&id, "u1", dec!(210), true).await.unwrap();
        let after = customers.adjust_stats(&id, "u1", dec!(90), true).await.unwrap();
        assert_eq!(after.total_invoices, 2);
        assert_eq!(after.total_amount, dec!(300));

        let after = customers.adjust_stats(&id, "u1", dec!(210), false).await.unwrap();
        assert_eq!(after.total_invoices, 1);
        assert_eq!(after.total_amount, dec!(90));
    }

    #[tokio::test]
    async fn test_count_never_goes_negative() {
        let customers = customers();
        let id = customers.create(acme(), "u1").await.unwrap().id.unwrap();

        let after = customers.adjust_stats(&id, "u1", dec!(5), false).await.unwrap();
        assert_eq!(after.total_invoices, 0);
    }

    #[tokio::test]
    async fn test_adjust_stats_checks_owner() {
        let customers = customers();
        let id = customers.create(acme(), "u1").await.unwrap().id.unwrap();

        let result = customers.adjust_stats(&id, "u2", dec!(5), true).await;
        assert!(matches!(result, Err(CoreError::Unauthorized { .. })));

        let untouched = customers.get(&id, "u1").await.unwrap().unwrap();
        assert_eq!(untouched.total_invoices, 0);
    }

    #[tokio::test]
    async fn test_patch_cannot_rename_to_empty() {
        let customers = customers();
        let id = customers.create(acme(), "u1").await.unwrap().id.unwrap();

        let patch = CustomerPatch {
            name: Some("  ".into()),
            ..CustomerPatch::default()
        };
        let result = customers.update(&id, patch, "u1").await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_invoice_change_moves_or_shifts_aggregates() {
        let customers = customers();
        let a = customers.create(acme(), "u1").await.unwrap().id.unwrap();
        let b = customers.create(acme(), "u1").await.unwrap().id.unwrap();
        customers.adjust_stats(&a, "u1", dec!(210), true).await.unwrap();

        let a_ref = Some(a.as_str());
        customers
            .record_invoice_change("u1", (a_ref, dec!(210)), (a_ref, dec!(180)))
            .await;
        let after = customers.get(&a, "u1").await.unwrap().unwrap();
        assert_eq!(after.total_invoices, 1);
        assert_eq!(after.total_amount, dec!(180));

        customers
            .record_invoice_change("u1", (a_ref, dec!(180)), (Some(b.as_str()), dec!(180)))
            .await;
        let a_after = customers.get(&a, "u1").await.unwrap().unwrap();
        let b_after = customers.get(&b, "u1").await.unwrap().unwrap();
        assert_eq!((a_after.total_invoices, a_after.total_amount), (0, dec!(0)));
        assert_eq!((b_after.total_invoices, b_after.total_amount), (1, dec!(180)));
    }
}
