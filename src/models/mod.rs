// Value objects
pub mod biller;
pub mod values;

// Purchase process aggregate and its parts
pub mod cascade;
pub mod fraud_advice;
pub mod initialized_item;
pub mod purchase_process;
pub mod purchase_process_state;

pub use biller::{Biller, BillerName};
pub use cascade::{Cascade, CascadeError};
pub use fraud_advice::{FraudAdvice, FraudRecommendation, FraudRecommendationCollection};
pub use initialized_item::{InitializedItem, ThreeDChallenge, Transaction, TransactionState};
pub use purchase_process::{CaptchaStep, PurchaseProcess, PurchaseProcessError};
pub use purchase_process_state::{IllegalStateTransition, PurchaseProcessState, StateAction};
pub use values::SessionId;
