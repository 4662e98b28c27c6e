use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use validator::{Validate, ValidationError};

use crate::errors::ValidationFailure;

static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 ()\-]{5,22}$").expect("valid phone regex"));

const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let digits = phone.chars().filter(char::is_ascii_digit).count();
    if PHONE_PATTERN.is_match(phone) && (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits) {
        Ok(())
    } else {
        let mut err = ValidationError::new("phone");
        err.message = Some("Enter a valid phone number".into());
        Err(err)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FulfillmentMode {
    Pickup,
    Delivery,
}

/// Customer contact and fulfillment details.
///
/// The address trio is mandatory iff the mode is `Delivery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DeliveryDetails {
    #[validate(length(min = 1, max = 120, message = "Full name is required"))]
    pub full_name: String,

    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,

    #[validate(custom = "validate_phone")]
    pub phone: String,

    pub fulfillment_mode: FulfillmentMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
}

impl DeliveryDetails {
    pub fn pickup(
        full_name: impl Into<String>,
        email: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            email: email.into(),
            phone: phone.into(),
            fulfillment_mode: FulfillmentMode::Pickup,
            address: None,
            city: None,
            postcode: None,
        }
    }

    pub fn delivery(
        full_name: impl Into<String>,
        email: impl Into<String>,
        phone: impl Into<String>,
        address: impl Into<String>,
        city: impl Into<String>,
        postcode: impl Into<String>,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            email: email.into(),
            phone: phone.into(),
            fulfillment_mode: FulfillmentMode::Delivery,
            address: Some(address.into()),
            city: Some(city.into()),
            postcode: Some(postcode.into()),
        }
    }

    /// Trims every field and collapses blank optional fields to `None`.
    pub fn normalized(self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Self {
            full_name: self.full_name.trim().to_string(),
            email: self.email.trim().to_string(),
            phone: self.phone.trim().to_string(),
            fulfillment_mode: self.fulfillment_mode,
            address: clean(self.address),
            city: clean(self.city),
            postcode: clean(self.postcode),
        }
    }

    /// Runs the field validators plus the delivery-only address rule and
    /// collects every problem at once.
    pub fn check(&self) -> Result<(), ValidationFailure> {
        let mut failure = match self.validate() {
            Ok(()) => ValidationFailure::default(),
            Err(errors) => ValidationFailure::from(errors),
        };

        if self.fulfillment_mode == FulfillmentMode::Delivery {
            let trio = [
                ("address", &self.address),
                ("city", &self.city),
                ("postcode", &self.postcode),
            ];
            for (field, value) in trio {
                let blank = value.as_deref().map_or(true, |v| v.trim().is_empty());
                if blank {
                    failure.push(field, "Required for delivery");
                }
            }
        }

        if failure.is_empty() {
            Ok(())
        } else {
            Err(failure)
        }
    }
}
