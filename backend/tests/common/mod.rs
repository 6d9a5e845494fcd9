//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use pesa_ledger::loan::{Loan, NewLoan, RepaymentMethod};
use pesa_ledger::models::{PhoneNumber, User};
use pesa_ledger::payments::{CarrierGateway, GatewayReceipt, PaymentStatus};
use pesa_ledger::state::AppState;
use pesa_ledger::store::InMemoryLedgerStore;

pub const BORROWER: &str = "254712345678";
pub const LENDER: &str = "254722000111";

pub fn phone(raw: &str) -> PhoneNumber {
    PhoneNumber::parse(raw).unwrap()
}

/// Gateway double recording every call
#[derive(Default)]
pub struct RecordingGateway {
    pub collections: Mutex<Vec<(String, i64, String)>>,
    pub disbursements: Mutex<Vec<(String, i64)>>,
}

#[async_trait]
impl CarrierGateway for RecordingGateway {
    async fn initiate_collection(
        &self,
        phone: &PhoneNumber,
        amount: i64,
        account_reference: &str,
        _description: &str,
    ) -> Result<GatewayReceipt> {
        self.collections.lock().await.push((
            phone.to_string(),
            amount,
            account_reference.to_string(),
        ));
        Ok(GatewayReceipt {
            request_id: "ws_CO_001".to_string(),
            response_code: "0".to_string(),
            description: "Success. Request accepted for processing".to_string(),
        })
    }

    async fn initiate_disbursement(
        &self,
        phone: &PhoneNumber,
        amount: i64,
        _remarks: &str,
    ) -> Result<GatewayReceipt> {
        self.disbursements
            .lock()
            .await
            .push((phone.to_string(), amount));
        Ok(GatewayReceipt {
            request_id: "AG_001".to_string(),
            response_code: "0".to_string(),
            description: "Accept the service request successfully.".to_string(),
        })
    }

    async fn query_status(&self, _request_id: &str) -> Result<PaymentStatus> {
        Ok(PaymentStatus::Completed)
    }
}

pub struct Fixture {
    pub store: InMemoryLedgerStore,
    pub state: AppState,
    pub gateway: Arc<RecordingGateway>,
    pub borrower: User,
    pub lender: User,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_gateway(true).await
    }

    pub async fn with_gateway(enabled: bool) -> Self {
        let store = InMemoryLedgerStore::new();
        let borrower = store.seed_user(&phone(BORROWER), "Wanjiku Borrower").await;
        let lender = store.seed_user(&phone(LENDER), "Otieno Lender").await;

        let gateway = Arc::new(RecordingGateway::default());
        let carrier: Option<Arc<dyn CarrierGateway>> = if enabled {
            Some(gateway.clone())
        } else {
            None
        };

        let state = AppState::assemble(Arc::new(store.clone()), carrier, 100, 5);

        Self {
            store,
            state,
            gateway,
            borrower,
            lender,
        }
    }

    pub async fn active_loan(&self, method: RepaymentMethod, value: i64, balance: i64) -> Loan {
        self.store
            .seed_active_loan(
                NewLoan {
                    borrower_id: self.borrower.id,
                    lender_id: self.lender.id,
                    principal_amount: balance,
                    repayment_method: method,
                    repayment_value: value,
                    client_reference: None,
                },
                balance,
            )
            .await
    }
}
