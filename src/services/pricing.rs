use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::errors::CheckoutError;
use crate::models::{Cart, FulfillmentMode};

/// Subtotal, fulfillment fee and total for a cart. Derived on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentQuote {
    pub subtotal: Decimal,
    pub fee: Decimal,
    pub total: Decimal,
}

/// Fixed fulfillment tariff keyed by mode.
#[derive(Debug, Clone)]
pub struct PricingService {
    delivery_fee: Decimal,
}

impl PricingService {
    pub fn new(delivery_fee: Decimal) -> Self {
        Self { delivery_fee }
    }

    pub fn fee(&self, mode: FulfillmentMode) -> Decimal {
        match mode {
            FulfillmentMode::Pickup => Decimal::ZERO,
            FulfillmentMode::Delivery => self.delivery_fee,
        }
    }

    pub fn quote(&self, cart: &Cart, mode: FulfillmentMode) -> FulfillmentQuote {
        let subtotal = cart.subtotal();
        let fee = self.fee(mode);
        FulfillmentQuote {
            subtotal,
            fee,
            total: subtotal.saturating_add(fee),
        }
    }
}

/// Converts a major-unit amount to the minor units providers charge in.
pub fn to_minor_units(amount: Decimal) -> Result<i64, CheckoutError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .filter(|units| *units > 0)
        .ok_or_else(|| CheckoutError::Internal(format!("amount {} cannot be charged", amount)))
}

pub fn from_minor_units(units: i64) -> Decimal {
    Decimal::new(units, 2)
}
