//! Checkout data model: carts, delivery details, payment intents, the
//! recovery journal record and the finalized order.

pub mod cart;
pub mod delivery;
pub mod environment;
pub mod order;
pub mod payment_intent;
pub mod recovery;

pub use cart::{Cart, LineItem};
pub use delivery::{DeliveryDetails, FulfillmentMode};
pub use environment::{CompletionStrategy, EnvironmentProfile};
pub use order::{OrderRecord, OrderStatus};
pub use payment_intent::{IntentStatus, PaymentDetails, PaymentIntent, ProviderKind};
pub use recovery::{JournalStage, RecoveryRecord};
