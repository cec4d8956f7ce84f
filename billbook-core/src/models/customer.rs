use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::double_option;
use crate::error::{CoreError, Result};
use crate::store::{Document, StoreError};

/// Customer model with denormalized invoice aggregates.
///
/// `total_invoices` and `total_amount` are maintained alongside invoice
/// creation and deletion and may drift if one of those side effects fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub owner_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub phone: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub vat_number: Option<String>,

    #[serde(default)]
    pub total_invoices: u64,

    #[serde(default)]
    pub total_amount: Decimal,

    #[serde(default, with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(default, with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut customer: Customer = doc.decode()?;
        customer.id = Some(doc.id.clone());
        Ok(customer)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::validation("customer name must not be empty"));
        }
        Ok(())
    }
}

/// Customer creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewCustomer {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub vat_number: Option<String>,
}

impl NewCustomer {
    pub fn into_customer(self, owner: &str, now: DateTime<Utc>) -> Customer {
        Customer {
            id: None,
            owner_id: owner.to_string(),
            name: self.name,
            email: self.email,
            phone: self.phone,
            address: self.address,
            vat_number: self.vat_number,
            total_invoices: 0,
            total_amount: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Customer update request. Aggregates are not patchable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustomerPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub vat_number: Option<Option<String>>,
}

impl CustomerPatch {
    pub fn apply(self, customer: &mut Customer) -> Vec<&'static str> {
        let mut touched = Vec::new();
        if let Some(name) = self.name {
            customer.name = name;
            touched.push("name");
        }
        if let Some(email) = self.email {
            customer.email = email;
            touched.push("email");
        }
        if let Some(phone) = self.phone {
            customer.phone = phone;
            touched.push("phone");
        }
        if let Some(address) = self.address {
            customer.address = address;
            touched.push("address");
        }
        if let Some(vat_number) = self.vat_number {
            customer.vat_number = vat_number;
            touched.push("vat_number");
        }
        touched
    }
}
