//! Derived invoice totals.
//!
//! Amounts keep full decimal precision everywhere they are stored. Rounding
//! to cents (round-half-even) happens only when figures are presented, via
//! [`Totals::rounded`].

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Discount, DiscountKind, LineItem};

const ONE_HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Decimal places shown to users.
pub const CURRENCY_DECIMALS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub total: Decimal,
}

impl Totals {
    /// Presentation view: every figure rounded half-to-even to cents.
    pub fn rounded(&self) -> Totals {
        Totals {
            subtotal: round_currency(self.subtotal),
            tax_amount: round_currency(self.tax_amount),
            discount_amount: round_currency(self.discount_amount),
            total: round_currency(self.total),
        }
    }
}

/// A computed figure does not fit in a `Decimal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invoice totals exceed the supported range")]
pub struct TotalsOverflow;

pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CURRENCY_DECIMALS, RoundingStrategy::MidpointNearestEven)
}

/// Computes subtotal, tax, discount and total for a set of line items.
///
/// * `subtotal` is the sum of `quantity × unit_price`
/// * `tax_amount` is `subtotal × tax_rate / 100`
/// * `discount_amount` is either a percentage of the subtotal or the fixed value
/// * `total` is `subtotal + tax_amount − discount_amount`
///
/// A fixed discount larger than the subtotal yields a negative total.
///
/// # Errors
///
/// Returns [`TotalsOverflow`] if any intermediate figure leaves the range of
/// `Decimal`. Validated invoices never get there.
pub fn compute(
    items: &[LineItem],
    tax_rate: Decimal,
    discount: &Discount,
) -> Result<Totals, TotalsOverflow> {
    let subtotal = items.iter().try_fold(Decimal::ZERO, |sum, item| {
        item.amount().and_then(|amount| sum.checked_add(amount))
    });
    let subtotal = subtotal.ok_or(TotalsOverflow)?;

    let tax_amount = percent_of(subtotal, tax_rate)?;
    let discount_amount = match discount.kind {
        DiscountKind::Percentage => percent_of(subtotal, discount.value)?,
        DiscountKind::Fixed => discount.value,
    };
    let total = subtotal
        .checked_add(tax_amount)
        .and_then(|gross| gross.checked_sub(discount_amount))
        .ok_or(TotalsOverflow)?;

    Ok(Totals {
        subtotal,
        tax_amount,
        discount_amount,
        total,
    })
}

fn percent_of(amount: Decimal, rate: Decimal) -> Result<Decimal, TotalsOverflow> {
    amount
        .checked_mul(rate)
        .and_then(|scaled| scaled.checked_div(ONE_HUNDRED))
        .ok_or(TotalsOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(id: &str, quantity: Decimal, unit_price: Decimal) -> LineItem {
        LineItem::new(id, "", quantity, unit_price)
    }

    #[test]
    fn test_fixed_discount_scenario() {
        let totals = compute(
            &[item("a", dec!(2), dec!(100))],
            dec!(15),
            &Discount::fixed(dec!(20)),
        )
        .unwrap();
        assert_eq!(totals.subtotal, dec!(200));
        assert_eq!(totals.tax_amount, dec!(30));
        assert_eq!(totals.discount_amount, dec!(20));
        assert_eq!(totals.total, dec!(210));
    }

    #[test]
    fn test_percentage_discount() {
        let totals = compute(
            &[item("a", dec!(1), dec!(80)), item("b", dec!(4), dec!(5))],
            dec!(10),
            &Discount::percentage(dec!(25)),
        )
        .unwrap();
        assert_eq!(totals.subtotal, dec!(100));
        assert_eq!(totals.tax_amount, dec!(10));
        assert_eq!(totals.discount_amount, dec!(25));
        assert_eq!(totals.total, dec!(85));
    }

    #[test]
    fn test_no_items_is_all_zero() {
        for discount in [Discount::fixed(Decimal::ZERO), Discount::percentage(dec!(50))] {
            let totals = compute(&[], dec!(15), &discount).unwrap();
            assert_eq!(totals, Totals::default());
        }
    }

    #[test]
    fn test_subtotal_is_exact_sum() {
        let items: Vec<_> = (0..10)
            .map(|i| item(&i.to_string(), dec!(0.1), dec!(0.3)))
            .collect();
        let totals = compute(&items, Decimal::ZERO, &Discount::default()).unwrap();
        assert_eq!(totals.subtotal, dec!(0.3));
        assert_eq!(
            totals.total,
            totals.subtotal + totals.tax_amount - totals.discount_amount
        );
    }

    #[test]
    fn test_rounding_is_half_even_and_presentation_only() {
        let totals =
            compute(&[item("a", dec!(1), dec!(0.125))], dec!(0), &Discount::default()).unwrap();
        assert_eq!(totals.subtotal, dec!(0.125));
        assert_eq!(totals.rounded().subtotal, dec!(0.12));
        assert_eq!(round_currency(dec!(0.135)), dec!(0.14));
    }

    #[test]
    fn test_overflow_is_an_error_not_a_panic() {
        let huge = [item("a", Decimal::MAX, dec!(2))];
        assert_eq!(
            compute(&huge, Decimal::ZERO, &Discount::default()),
            Err(TotalsOverflow)
        );

        let sum_overflows = [item("a", Decimal::MAX, dec!(1)), item("b", Decimal::MAX, dec!(1))];
        assert_eq!(
            compute(&sum_overflows, Decimal::ZERO, &Discount::default()),
            Err(TotalsOverflow)
        );

        let tax_overflows = [item("a", Decimal::MAX, dec!(1))];
        assert_eq!(
            compute(&tax_overflows, dec!(1000), &Discount::default()),
            Err(TotalsOverflow)
        );
    }
}
