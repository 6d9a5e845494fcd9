//! Route definitions for the ledger API

mod loan;
mod mpesa;
mod notification;
mod sync;
mod transaction;

pub use loan::loan_routes;
pub use mpesa::mpesa_routes;
pub use notification::notification_routes;
pub use sync::sync_routes;
pub use transaction::transaction_routes;
