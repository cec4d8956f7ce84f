pub mod customer;
pub mod invoice;
pub mod line_item;
pub mod party;

pub use customer::{Customer, CustomerPatch, NewCustomer};
pub use invoice::{
    Discount, DiscountKind, Invoice, InvoicePatch, InvoiceResponse, InvoiceStatus, NewInvoice,
    PaymentCadence,
};
pub use line_item::LineItem;
pub use party::{BankingDetails, Party};

use serde::{Deserialize, Deserializer};

/// Deserializes a present field (including `null`) as `Some(..)`, so patch
/// types can tell "clear this field" apart from "leave it alone".
pub(crate) fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
