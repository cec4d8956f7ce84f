//! Sequential invoice numbers (`INV-001`, `INV-002`, ...).
//!
//! Each owner has a counter document in the `counters` collection holding the
//! last suffix handed out. Advancing it is a compare-and-swap on the
//! document revision, so concurrent callers for the same owner never receive
//! the same number. The counter never falls behind the suffix of the owner's
//! most recently created invoice, which also seeds it the first time.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::{
    collections, to_fields, Direction, DocumentStore, Precondition, Query, StoreError,
};

pub const PREFIX: &str = "INV-";

/// Attempts before the assigner gives up on a contended counter.
const MAX_ATTEMPTS: usize = 8;

/// Size of the time-derived fallback space (`INV-000` to `INV-999`).
const FALLBACK_SPACE: i64 = 1000;

/// Formats a suffix as `INV-` plus at least three digits.
pub fn format_number(suffix: u64) -> String {
    format!("{}{:03}", PREFIX, suffix)
}

/// Extracts the numeric suffix of an `INV-<digits>` number.
pub fn parse_suffix(number: &str) -> Option<u64> {
    let digits = number.trim().strip_prefix(PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The number following `last`, or `INV-001` when there is none (or it does
/// not follow the `INV-<digits>` pattern).
pub fn successor(last: Option<&str>) -> String {
    let suffix = last.and_then(parse_suffix).unwrap_or(0);
    format_number(suffix.saturating_add(1))
}

/// Result of [`NumberingAssigner::next_number`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignedNumber {
    pub number: String,
    /// `true` when the counter could not be advanced and the number was
    /// derived from the clock instead. Such numbers are not sequential. They
    /// skip numbers the owner already holds whenever the invoices can still be
    /// read, but are not guaranteed unique when they cannot.
    pub degraded: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
    #[serde(default)]
    owner_id: String,
    #[serde(default)]
    last: u64,
}

/// Hands out per-owner invoice numbers.
#[derive(Clone)]
pub struct NumberingAssigner {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl NumberingAssigner {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Consumes and returns the owner's next invoice number.
    ///
    /// Never fails: if the store cannot be used the number falls back to the
    /// last three digits of the clock's millisecond reading (moving forward
    /// past numbers the owner already uses) and is flagged as degraded.
    pub async fn next_number(&self, owner: &str) -> AssignedNumber {
        match self.advance(owner).await {
            Ok(suffix) => {
                let number = format_number(suffix);
                debug!(owner, number = %number, "Assigned invoice number");
                AssignedNumber {
                    number,
                    degraded: false,
                }
            }
            Err(e) => {
                let number = self.fallback_number(owner).await;
                warn!(
                    owner,
                    number = %number,
                    error = %e,
                    "Numbering store unavailable, using time-derived invoice number"
                );
                AssignedNumber {
                    number,
                    degraded: true,
                }
            }
        }
    }

    /// Returns the number the next call to [`next_number`](Self::next_number)
    /// would hand out, without consuming it. Used to prefill forms.
    pub async fn peek_number(&self, owner: &str) -> AssignedNumber {
        let peeked = async {
            let stored = match self.store.get(collections::COUNTERS, owner).await? {
                Some(doc) => doc.decode::<Counter>()?.last,
                None => 0,
            };
            let latest = self.latest_suffix(owner).await?;
            Ok::<_, StoreError>(stored.max(latest))
        }
        .await;

        match peeked {
            Ok(last) => AssignedNumber {
                number: format_number(last.saturating_add(1)),
                degraded: false,
            },
            Err(e) => {
                warn!(owner, error = %e, "Could not preview next invoice number");
                AssignedNumber {
                    number: self.fallback_number(owner).await,
                    degraded: true,
                }
            }
        }
    }

    async fn advance(&self, owner: &str) -> Result<u64, StoreError> {
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let latest = self.latest_suffix(owner).await?;
            let outcome = match self.store.get(collections::COUNTERS, owner).await? {
                Some(doc) => {
                    let counter: Counter = doc.decode()?;
                    let next = counter.last.max(latest).saturating_add(1);
                    let fields = to_fields(&Counter {
                        owner_id: owner.to_string(),
                        last: next,
                    })?;
                    self.store
                        .update(
                            collections::COUNTERS,
                            owner,
                            fields,
                            Precondition::Revision(doc.revision),
                        )
                        .await
                        .map(|_| next)
                }
                None => {
                    let next = latest.saturating_add(1);
                    let fields = to_fields(&Counter {
                        owner_id: owner.to_string(),
                        last: next,
                    })?;
                    let created = self
                        .store
                        .create_with_id(collections::COUNTERS, owner, fields)
                        .await
                        .map(|_| next);
                    if created.is_ok() {
                        info!(owner, seed = latest, "Initialized invoice counter");
                    }
                    created
                }
            };

            match outcome {
                Ok(next) => return Ok(next),
                Err(e @ (StoreError::RevisionMismatch { .. } | StoreError::AlreadyExists { .. })) => {
                    debug!(owner, attempt, "Invoice counter contended, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::revision_mismatch(collections::COUNTERS, owner)))
    }

    /// Suffix of the owner's most recently created invoice, or 0.
    async fn latest_suffix(&self, owner: &str) -> Result<u64, StoreError> {
        let query = Query::new()
            .filter_eq("owner_id", owner)
            .order_by("created_at", Direction::Descending)
            .limit(1);
        let latest = self.store.query(collections::INVOICES, &query).await?;

        Ok(latest
            .first()
            .and_then(|doc| doc.field("invoice_number"))
            .and_then(|value| value.as_str())
            .and_then(parse_suffix)
            .unwrap_or(0))
    }

    /// First time-derived number, starting at the clock's millisecond digits,
    /// that the owner does not already use. Without a readable invoice list
    /// the starting candidate is returned as is.
    async fn fallback_number(&self, owner: &str) -> String {
        let millis = self.clock.now().timestamp_millis();
        let candidate = |offset: i64| {
            format!("{}{:03}", PREFIX, (millis + offset).rem_euclid(FALLBACK_SPACE))
        };

        let taken = match self.numbers_in_use(owner).await {
            Ok(taken) => taken,
            Err(e) => {
                debug!(owner, error = %e, "Cannot check fallback number for clashes");
                return candidate(0);
            }
        };

        (0..FALLBACK_SPACE)
            .map(candidate)
            .find(|number| !taken.contains(number))
            .unwrap_or_else(|| candidate(0))
    }

    async fn numbers_in_use(&self, owner: &str) -> Result<HashSet<String>, StoreError> {
        let query = Query::new().filter_eq("owner_id", owner);
        let docs = self.store.query(collections::INVOICES, &query).await?;

        Ok(docs
            .iter()
            .filter_map(|doc| doc.field("invoice_number"))
            .filter_map(|value| value.as_str())
            .map(str::to_string)
            .collect())
    }
}
