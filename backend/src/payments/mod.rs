//! Mobile-money integration

pub mod gateway;
pub mod model;
pub mod service;

pub use gateway::{CarrierGateway, DarajaGateway};
pub use model::{
    loan_reference, parse_loan_reference, C2bAck, C2bConfirmation, GatewayReceipt,
    IncomingTransactionRequest, PaymentStatus, StkPushRequest,
};
pub use service::{PaymentRecord, PaymentService, RecordedPayment};
