use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::errors::{CheckoutError, ValidationFailure};

/// Largest cart subtotal checkout will charge.
pub const MAX_CART_SUBTOTAL: Decimal = dec!(1000000);

/// A single menu line as handed over by the shopping flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub catalog_id: String,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_variant: Option<String>,
}

impl LineItem {
    pub fn new(
        catalog_id: impl Into<String>,
        name: impl Into<String>,
        unit_price: Decimal,
        quantity: u32,
    ) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            name: name.into(),
            unit_price,
            quantity,
            size_variant: None,
        }
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size_variant = Some(size.into());
        self
    }

    /// `None` when the line cannot be represented.
    pub fn line_total(&self) -> Option<Decimal> {
        self.unit_price.checked_mul(Decimal::from(self.quantity))
    }
}

/// Ordered cart snapshot. Read-only inside checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub items: Vec<LineItem>,
}

impl Cart {
    pub fn new(items: Vec<LineItem>) -> Self {
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_count(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity)).sum()
    }

    /// Sum of line totals, `None` on overflow.
    pub fn checked_subtotal(&self) -> Option<Decimal> {
        self.items
            .iter()
            .try_fold(Decimal::ZERO, |acc, item| acc.checked_add(item.line_total()?))
    }

    /// Subtotal of a cart that passed `ensure_checkout_ready`.
    pub fn subtotal(&self) -> Decimal {
        self.checked_subtotal().unwrap_or(Decimal::MAX)
    }

    /// Checkout only proceeds for a non-empty cart whose lines all have a
    /// positive quantity and a non-negative price, and whose subtotal can
    /// be charged.
    pub fn ensure_checkout_ready(&self) -> Result<(), CheckoutError> {
        if self.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        let mut failure = ValidationFailure::default();
        for (i, item) in self.items.iter().enumerate() {
            if item.quantity == 0 {
                failure.push(format!("items[{i}].quantity"), "Quantity must be at least 1");
            }
            if item.unit_price.is_sign_negative() {
                failure.push(format!("items[{i}].unit_price"), "Price cannot be negative");
            }
        }
        if !failure.is_empty() {
            return Err(CheckoutError::Validation(failure));
        }
        match self.checked_subtotal() {
            Some(subtotal) if subtotal <= MAX_CART_SUBTOTAL => Ok(()),
            _ => Err(CheckoutError::validation(
                "items",
                format!("Cart total exceeds the {MAX_CART_SUBTOTAL} limit"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cart() -> Cart {
        Cart::new(vec![
            LineItem::new("jollof-rice", "Jollof Rice", dec!(8.99), 2),
            LineItem::new("puff-puff", "Puff Puff", dec!(4.00), 1).with_size("large"),
        ])
    }

    #[test]
    fn subtotal_sums_line_totals() {
        assert_eq!(sample_cart().subtotal(), dec!(21.98));
        assert_eq!(sample_cart().item_count(), 3);
    }

    #[test]
    fn empty_cart_is_not_checkout_ready() {
        assert!(matches!(
            Cart::default().ensure_checkout_ready(),
            Err(CheckoutError::EmptyCart)
        ));
    }

    #[test]
    fn bad_lines_are_reported_per_field() {
        let cart = Cart::new(vec![
            LineItem::new("suya", "Suya", dec!(6.50), 0),
            LineItem::new("chin-chin", "Chin Chin", dec!(-1.00), 1),
        ]);
        match cart.ensure_checkout_ready() {
            Err(CheckoutError::Validation(failure)) => {
                assert!(failure.has_field("items[0].quantity"));
                assert!(failure.has_field("items[1].unit_price"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert!(sample_cart().ensure_checkout_ready().is_ok());
    }

    #[test]
    fn overflowing_cart_is_rejected_without_panicking() {
        let cart = Cart::new(vec![LineItem::new("feast", "Feast", Decimal::MAX, 2)]);
        assert_eq!(cart.checked_subtotal(), None);
        assert!(matches!(
            cart.ensure_checkout_ready(),
            Err(CheckoutError::Validation(f)) if f.has_field("items")
        ));

        let pricey = Cart::new(vec![LineItem::new("feast", "Feast", dec!(600000), 2)]);
        assert!(pricey.ensure_checkout_ready().is_err());
    }
}
