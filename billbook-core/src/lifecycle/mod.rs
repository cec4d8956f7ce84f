//! Invoice status transitions and the overdue sweep.

pub mod state_machine;

pub use state_machine::{is_past_due, InvoiceStateMachine, LifecycleEvent, Transition};

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::invoices::{decode, InvoiceStore};
use crate::models::{Invoice, InvoiceStatus};
use crate::store::{collections, select_fields, Precondition, Query, StoreError};

/// Attempts before a transition gives up on a concurrently modified invoice.
const MAX_ATTEMPTS: usize = 4;

/// Outcome of [`InvoiceStore::sweep_overdue`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Invoices in `sent` or `overdue` that were looked at.
    pub examined: usize,
    /// Ids moved to `overdue` by this sweep.
    pub transitioned: Vec<String>,
    pub failed: Vec<SweepFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepFailure {
    pub invoice_id: String,
    pub error: String,
}

impl InvoiceStore {
    /// Marks the invoice as sent. Calling it again keeps the original
    /// `sent_at`.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the invoice is already paid or overdue.
    #[instrument(skip(self))]
    pub async fn mark_sent(&self, id: &str, owner: &str) -> Result<Invoice> {
        self.apply_event(id, owner, LifecycleEvent::Send).await
    }

    /// Marks the invoice as paid. `paid_at` is set on the first call only.
    #[instrument(skip(self))]
    pub async fn mark_paid(&self, id: &str, owner: &str) -> Result<Invoice> {
        self.apply_event(id, owner, LifecycleEvent::Pay).await
    }

    /// Moves the owner's sent invoices whose due date has passed to `overdue`.
    ///
    /// Best effort: every candidate is attempted, failures are collected in
    /// the report instead of aborting the sweep. Each write is conditional on
    /// the revision that was examined, so an invoice paid in the meantime is
    /// left alone (and shows up as a failure).
    ///
    /// # Errors
    ///
    /// Only if the candidate list itself cannot be loaded.
    #[instrument(skip(self))]
    pub async fn sweep_overdue(&self, owner: &str) -> Result<SweepReport> {
        let today = self.clock.today();
        let query = Query::new()
            .filter_eq("owner_id", owner)
            .filter_in(
                "status",
                vec![
                    json!(InvoiceStatus::Sent.as_str()),
                    json!(InvoiceStatus::Overdue.as_str()),
                ],
            );
        let docs = self
            .store
            .query(collections::INVOICES, &query)
            .await
            .map_err(|e| CoreError::store("sweep overdue invoices", e))?;

        let mut report = SweepReport::default();
        for doc in docs {
            report.examined += 1;

            let invoice = match decode(&doc, "sweep overdue invoices") {
                Ok(invoice) => invoice,
                Err(e) => {
                    report.failed.push(SweepFailure {
                        invoice_id: doc.id.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            if invoice.status != InvoiceStatus::Sent || !is_past_due(invoice.due_date, today) {
                continue;
            }

            match self
                .write_transition(
                    &doc.id,
                    &invoice,
                    LifecycleEvent::DueDatePassed,
                    doc.revision,
                )
                .await
            {
                Ok(_) => report.transitioned.push(doc.id.clone()),
                Err(e) => {
                    warn!(invoice_id = %doc.id, error = %e, "Overdue transition failed");
                    report.failed.push(SweepFailure {
                        invoice_id: doc.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            examined = report.examined,
            transitioned = report.transitioned.len(),
            failed = report.failed.len(),
            "Overdue sweep finished"
        );
        Ok(report)
    }

    /// Distinct owners that currently hold at least one `sent` invoice.
    pub async fn owners_with_open_invoices(&self) -> Result<Vec<String>> {
        let query = Query::new().filter_eq("status", InvoiceStatus::Sent.as_str());
        let docs = self
            .store
            .query(collections::INVOICES, &query)
            .await
            .map_err(|e| CoreError::store("list open invoices", e))?;

        let owners: BTreeSet<String> = docs
            .iter()
            .filter_map(|doc| doc.field("owner_id").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect();
        Ok(owners.into_iter().collect())
    }

    async fn apply_event(&self, id: &str, owner: &str, event: LifecycleEvent) -> Result<Invoice> {
        let mut attempt = 1;
        loop {
            let (doc, invoice) = self.fetch_owned(id, owner).await?;
            match self.write_transition(id, &invoice, event, doc.revision).await {
                Err(CoreError::OperationFailed {
                    source: StoreError::RevisionMismatch { .. },
                    ..
                }) if attempt < MAX_ATTEMPTS => {
                    debug!(invoice_id = %id, attempt, "Invoice changed during transition, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Writes `event`'s transition for an invoice read at `revision`.
    async fn write_transition(
        &self,
        id: &str,
        invoice: &Invoice,
        event: LifecycleEvent,
        revision: i64,
    ) -> Result<Invoice> {
        let next = InvoiceStateMachine::transition(invoice.status, event).ok_or(
            CoreError::InvalidTransition {
                from: invoice.status,
                to: event.target(),
            },
        )?;

        let now = self.clock.now();
        let mut updated = invoice.clone();
        updated.status = next;
        updated.updated_at = now;

        let mut fields = vec!["status", "updated_at"];
        if let Some(stamped) = updated.stamp_status(now) {
            fields.push(stamped);
        }

        let fields = select_fields(&updated, fields)
            .map_err(|e| CoreError::store("transition invoice", e))?;
        let doc = self
            .store
            .update(
                collections::INVOICES,
                id,
                fields,
                Precondition::Revision(revision),
            )
            .await
            .map_err(|e| CoreError::store("transition invoice", e))?;

        info!(
            invoice_id = %id,
            from = %invoice.status,
            to = %next,
            event = %event,
            "Invoice status changed"
        );
        decode(&doc, "transition invoice")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::models::{InvoicePatch, NewInvoice};
    use crate::store::MemoryStore;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use std::sync::Arc;

    fn invoices() -> (InvoiceStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        (
            InvoiceStore::new(Arc::new(MemoryStore::new()), clock.clone()),
            clock,
        )
    }

    fn due(day: u32) -> NewInvoice {
        NewInvoice {
            issue_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            due_date: NaiveDate::from_ymd_opt(2024, 3, day),
            ..NewInvoice::default()
        }
    }

    #[tokio::test]
    async fn test_mark_sent_keeps_first_timestamp() {
        let (invoices, clock) = invoices();
        let id = invoices.create(due(31), "u1").await.unwrap().id.unwrap();

        let first = invoices.mark_sent(&id, "u1").await.unwrap();
        assert_eq!(first.status, InvoiceStatus::Sent);
        assert_eq!(first.sent_at, Some(clock.now()));

        clock.advance(Duration::hours(1));
        let again = invoices.mark_sent(&id, "u1").await.unwrap();
        assert_eq!(again.sent_at, first.sent_at);
        assert!(again.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn test_paid_invoice_cannot_be_resent() {
        let (invoices, _) = invoices();
        let id = invoices.create(due(31), "u1").await.unwrap().id.unwrap();

        let paid = invoices.mark_paid(&id, "u1").await.unwrap();
        assert!(paid.paid_at.is_some());

        let result = invoices.mark_sent(&id, "u1").await;
        assert!(matches!(
            result,
            Err(CoreError::InvalidTransition {
                from: InvoiceStatus::Paid,
                to: InvoiceStatus::Sent
            })
        ));
    }

    #[tokio::test]
    async fn test_transitions_check_owner() {
        let (invoices, _) = invoices();
        let id = invoices.create(due(31), "u1").await.unwrap().id.unwrap();

        assert!(matches!(
            invoices.mark_paid(&id, "u2").await,
            Err(CoreError::Unauthorized { .. })
        ));
        assert!(matches!(
            invoices.mark_sent("missing", "u1").await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sweep_moves_only_past_due_sent_invoices() {
        let (invoices, clock) = invoices();
        let late = invoices.create(due(5), "u1").await.unwrap().id.unwrap();
        let on_time = invoices.create(due(20), "u1").await.unwrap().id.unwrap();
        let draft = invoices.create(due(5), "u1").await.unwrap().id.unwrap();
        let paid = invoices.create(due(5), "u1").await.unwrap().id.unwrap();
        invoices.mark_sent(&late, "u1").await.unwrap();
        invoices.mark_sent(&on_time, "u1").await.unwrap();
        invoices.mark_sent(&paid, "u1").await.unwrap();
        invoices.mark_paid(&paid, "u1").await.unwrap();

        clock.set(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap());
        let report = invoices.sweep_overdue("u1").await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.transitioned, vec![late.clone()]);
        assert!(report.failed.is_empty());

        let status = |id: String| {
            let invoices = invoices.clone();
            async move { invoices.get(&id, "u1").await.unwrap().unwrap().status }
        };
        assert_eq!(status(late).await, InvoiceStatus::Overdue);
        assert_eq!(status(on_time).await, InvoiceStatus::Sent);
        assert_eq!(status(draft).await, InvoiceStatus::Draft);
        assert_eq!(status(paid).await, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn test_sweep_is_a_no_op_on_the_due_date() {
        let (invoices, clock) = invoices();
        let id = invoices.create(due(10), "u1").await.unwrap().id.unwrap();
        invoices.mark_sent(&id, "u1").await.unwrap();

        clock.set(Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 0).unwrap());
        let report = invoices.sweep_overdue("u1").await.unwrap();
        assert!(report.transitioned.is_empty());

        // Second sweep the next day transitions it, a third finds nothing new.
        clock.advance(Duration::days(1));
        assert_eq!(invoices.sweep_overdue("u1").await.unwrap().transitioned.len(), 1);
        let third = invoices.sweep_overdue("u1").await.unwrap();
        assert_eq!(third.examined, 1);
        assert!(third.transitioned.is_empty());
    }

    #[tokio::test]
    async fn test_overdue_invoice_can_still_be_paid() {
        let (invoices, clock) = invoices();
        let id = invoices.create(due(2), "u1").await.unwrap().id.unwrap();
        invoices.mark_sent(&id, "u1").await.unwrap();
        clock.advance(Duration::days(5));
        invoices.sweep_overdue("u1").await.unwrap();

        let paid = invoices.mark_paid(&id, "u1").await.unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert!(paid.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_owners_with_open_invoices() {
        let (invoices, _) = invoices();
        let a = invoices.create(due(5), "alice").await.unwrap().id.unwrap();
        invoices.create(due(5), "bob").await.unwrap();
        let c = invoices.create(due(5), "carol").await.unwrap().id.unwrap();
        invoices.mark_sent(&a, "alice").await.unwrap();
        invoices.mark_sent(&c, "carol").await.unwrap();

        // A patch that sets status directly still counts.
        let patch = InvoicePatch {
            status: Some(InvoiceStatus::Sent),
            ..InvoicePatch::default()
        };
        invoices.update(&a, patch, "alice").await.unwrap();

        let owners = invoices.owners_with_open_invoices().await.unwrap();
        assert_eq!(owners, vec!["alice".to_string(), "carol".to_string()]);
    }
}
