use std::collections::HashSet;
use std::fmt;

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{double_option, BankingDetails, LineItem, Party};
use crate::error::{CoreError, Result};
use crate::lifecycle::{InvoiceStateMachine, Transition};
use crate::store::{Document, StoreError};
use crate::totals::{self, Totals, TotalsOverflow};

/// Upper bound for quantities, unit prices and fixed discounts.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// Upper bound for the tax rate percentage.
pub const MAX_TAX_RATE: Decimal = Decimal::from_parts(1_000, 0, 0, false, 0);

pub const MAX_LINE_ITEMS: usize = 500;

const ONE_HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Invoice status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Sent,
    Paid,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often the invoice is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentCadence {
    #[default]
    OnceOff,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    Percentage,
    #[default]
    Fixed,
}

/// Discount applied after tax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Discount {
    #[serde(rename = "type", default)]
    pub kind: DiscountKind,
    #[serde(default)]
    pub value: Decimal,
}

impl Discount {
    pub fn fixed(value: Decimal) -> Self {
        Self {
            kind: DiscountKind::Fixed,
            value,
        }
    }

    pub fn percentage(value: Decimal) -> Self {
        Self {
            kind: DiscountKind::Percentage,
            value,
        }
    }
}

/// Invoice document as stored in the `invoices` collection.
///
/// Every field carries a serde default so that documents written by older
/// versions (or partially written ones) still decode: a missing `tax_rate`
/// reads as 0, a missing `status` as `draft`, and so on. The four monetary
/// fields are derived and are recomputed whenever a document is decoded or
/// about to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Store-assigned id; `None` until persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Owning user. Never changes after creation.
    #[serde(default)]
    pub owner_id: String,

    #[serde(default)]
    pub invoice_number: String,

    #[serde(default)]
    pub issue_date: Option<NaiveDate>,

    #[serde(default)]
    pub due_date: Option<NaiveDate>,

    #[serde(default)]
    pub sender: Party,

    #[serde(default)]
    pub recipient: Party,

    #[serde(default)]
    pub items: Vec<LineItem>,

    #[serde(default)]
    pub notes: String,

    #[serde(default)]
    pub payment_cadence: PaymentCadence,

    /// Percentage, e.g. `15` for 15 %.
    #[serde(default)]
    pub tax_rate: Decimal,

    #[serde(default)]
    pub discount: Discount,

    #[serde(default)]
    pub subtotal: Decimal,

    #[serde(default)]
    pub tax_amount: Decimal,

    #[serde(default)]
    pub discount_amount: Decimal,

    #[serde(default)]
    pub total: Decimal,

    #[serde(default)]
    pub status: InvoiceStatus,

    #[serde(default)]
    pub banking: Option<BankingDetails>,

    /// Customer whose aggregates track this invoice.
    #[serde(default)]
    pub customer_id: Option<String>,

    #[serde(default, with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(default, with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,

    #[serde(default, with = "ts_milliseconds_option")]
    pub sent_at: Option<DateTime<Utc>>,

    #[serde(default, with = "ts_milliseconds_option")]
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Decodes a stored document, applying field defaults and recomputing the
    /// derived totals from the stored items and rates.
    ///
    /// A document whose figures overflow the totals is reported as a
    /// serialization error rather than decoded with bogus totals.
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut invoice: Invoice = doc.decode()?;
        invoice.id = Some(doc.id.clone());
        invoice
            .recompute_totals()
            .map_err(|e| StoreError::Serialization(serde::de::Error::custom(e)))?;
        Ok(invoice)
    }

    pub fn totals(&self) -> Totals {
        Totals {
            subtotal: self.subtotal,
            tax_amount: self.tax_amount,
            discount_amount: self.discount_amount,
            total: self.total,
        }
    }

    /// Overwrites the derived fields with values computed from the current
    /// items, tax rate and discount. On overflow the invoice is left as it
    /// was.
    pub fn recompute_totals(&mut self) -> Result<(), TotalsOverflow> {
        let computed = totals::compute(&self.items, self.tax_rate, &self.discount)?;
        self.subtotal = computed.subtotal;
        self.tax_amount = computed.tax_amount;
        self.discount_amount = computed.discount_amount;
        self.total = computed.total;
        Ok(())
    }

    /// Checks the user-editable fields.
    pub fn validate(&self) -> Result<()> {
        if self.invoice_number.trim().is_empty() {
            return Err(CoreError::validation("invoice number must not be empty"));
        }
        self.validate_content()
    }

    /// Everything [`validate`](Self::validate) checks except the invoice
    /// number, including that the totals can be computed at all.
    pub fn validate_content(&self) -> Result<()> {
        validate_items(&self.items)?;
        validate_rates(self.tax_rate, &self.discount)?;

        if let (Some(issue), Some(due)) = (self.issue_date, self.due_date) {
            if due < issue {
                return Err(CoreError::validation(format!(
                    "due date {} is before issue date {}",
                    due, issue
                )));
            }
        }

        totals::compute(&self.items, self.tax_rate, &self.discount)?;
        Ok(())
    }

    /// Sets `sent_at` / `paid_at` the first time the status reaches `sent` /
    /// `paid`. Existing stamps are never moved or cleared.
    ///
    /// Returns the name of the field it stamped, if any.
    pub fn stamp_status(&mut self, now: DateTime<Utc>) -> Option<&'static str> {
        match self.status {
            InvoiceStatus::Sent if self.sent_at.is_none() => {
                self.sent_at = Some(now);
                Some("sent_at")
            }
            InvoiceStatus::Paid if self.paid_at.is_none() => {
                self.paid_at = Some(now);
                Some("paid_at")
            }
            _ => None,
        }
    }
}

fn validate_items(items: &[LineItem]) -> Result<()> {
    if items.len() > MAX_LINE_ITEMS {
        return Err(CoreError::validation(format!(
            "an invoice holds at most {} line items",
            MAX_LINE_ITEMS
        )));
    }

    let mut seen = HashSet::new();
    for item in items {
        if item.id.trim().is_empty() {
            return Err(CoreError::validation("line item id must not be empty"));
        }
        if !seen.insert(item.id.as_str()) {
            return Err(CoreError::validation(format!(
                "duplicate line item id {}",
                item.id
            )));
        }
        if item.quantity < Decimal::ZERO {
            return Err(CoreError::validation(format!(
                "line item {} has a negative quantity",
                item.id
            )));
        }
        if item.unit_price < Decimal::ZERO {
            return Err(CoreError::validation(format!(
                "line item {} has a negative unit price",
                item.id
            )));
        }
        if item.quantity > MAX_AMOUNT || item.unit_price > MAX_AMOUNT {
            return Err(CoreError::validation(format!(
                "line item {} exceeds {}",
                item.id, MAX_AMOUNT
            )));
        }
    }
    Ok(())
}

fn validate_rates(tax_rate: Decimal, discount: &Discount) -> Result<()> {
    if tax_rate < Decimal::ZERO || tax_rate > MAX_TAX_RATE {
        return Err(CoreError::validation(format!(
            "tax rate must be between 0 and {}",
            MAX_TAX_RATE
        )));
    }
    if discount.value < Decimal::ZERO {
        return Err(CoreError::validation("discount must not be negative"));
    }
    let ceiling = match discount.kind {
        DiscountKind::Percentage => ONE_HUNDRED,
        DiscountKind::Fixed => MAX_AMOUNT,
    };
    if discount.value > ceiling {
        return Err(CoreError::validation(format!(
            "discount must not exceed {}",
            ceiling
        )));
    }
    Ok(())
}

/// Invoice creation request.
///
/// Derived totals, ownership and timestamps are not part of the input; any
/// such keys sent by a client are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewInvoice {
    /// Assigned by the numbering sequence when absent.
    pub invoice_number: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub sender: Party,
    pub recipient: Party,
    pub items: Vec<LineItem>,
    pub notes: String,
    pub payment_cadence: PaymentCadence,
    pub tax_rate: Decimal,
    pub discount: Discount,
    /// Defaults to `draft`.
    pub status: Option<InvoiceStatus>,
    pub banking: Option<BankingDetails>,
    pub customer_id: Option<String>,
}

impl NewInvoice {
    /// Builds the unsaved invoice record for `owner`. The derived totals are
    /// left at zero until [`Invoice::recompute_totals`] runs.
    pub fn into_invoice(self, owner: &str, invoice_number: String, now: DateTime<Utc>) -> Invoice {
        let mut invoice = Invoice {
            id: None,
            owner_id: owner.to_string(),
            invoice_number,
            issue_date: self.issue_date,
            due_date: self.due_date,
            sender: self.sender,
            recipient: self.recipient,
            items: self.items,
            notes: self.notes,
            payment_cadence: self.payment_cadence,
            tax_rate: self.tax_rate,
            discount: self.discount,
            subtotal: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            total: Decimal::ZERO,
            status: self.status.unwrap_or_else(InvoiceStateMachine::initial_state),
            banking: self.banking,
            customer_id: self.customer_id,
            created_at: now,
            updated_at: now,
            sent_at: None,
            paid_at: None,
        };
        invoice.stamp_status(now);
        invoice
    }
}

/// Partial invoice update.
///
/// `None` leaves a field untouched. Clearable fields use a nested option:
/// `Some(None)` (JSON `null`) clears the value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InvoicePatch {
    pub invoice_number: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub issue_date: Option<Option<NaiveDate>>,
    #[serde(deserialize_with = "double_option")]
    pub due_date: Option<Option<NaiveDate>>,
    pub sender: Option<Party>,
    pub recipient: Option<Party>,
    pub items: Option<Vec<LineItem>>,
    pub notes: Option<String>,
    pub payment_cadence: Option<PaymentCadence>,
    pub tax_rate: Option<Decimal>,
    pub discount: Option<Discount>,
    pub status: Option<InvoiceStatus>,
    #[serde(deserialize_with = "double_option")]
    pub banking: Option<Option<BankingDetails>>,
    #[serde(deserialize_with = "double_option")]
    pub customer_id: Option<Option<String>>,
}

impl InvoicePatch {
    /// Applies every present field to `invoice` and returns the names of the
    /// fields it touched.
    pub fn apply(self, invoice: &mut Invoice) -> Vec<&'static str> {
        let mut touched = Vec::new();

        macro_rules! set {
            ($field:ident) => {
                if let Some(value) = self.$field {
                    invoice.$field = value;
                    touched.push(stringify!($field));
                }
            };
        }

        set!(invoice_number);
        set!(issue_date);
        set!(due_date);
        set!(sender);
        set!(recipient);
        set!(items);
        set!(notes);
        set!(payment_cadence);
        set!(tax_rate);
        set!(discount);
        set!(status);
        set!(banking);
        set!(customer_id);

        touched
    }
}

/// Invoice response (public representation), with the derived totals rounded
/// for display next to the full-precision stored values.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceResponse {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub display: Totals,
}

impl From<Invoice> for InvoiceResponse {
    fn from(invoice: Invoice) -> Self {
        let display = invoice.totals().rounded();
        InvoiceResponse { invoice, display }
    }
}
