//! API handlers for the ledger backend

pub mod health;
pub mod loans;
pub mod mpesa;
pub mod notifications;
pub mod sync;
pub mod transactions;

pub use health::health_check;
pub use loans::*;
pub use mpesa::*;
pub use notifications::*;
pub use sync::*;
pub use transactions::*;
