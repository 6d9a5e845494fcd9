//! Loan service layer - request and approval lifecycle

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::loan::{Loan, LoanStatus, LoanUpdate, NewLoan, RepaymentMethod};
use crate::models::{NewNotification, NotificationKind, PhoneNumber, User};
use crate::payments::CarrierGateway;
use crate::store::{CasOutcome, LedgerStore};

/// A borrower asking a lender for money
#[derive(Debug, Clone)]
pub struct LoanRequest {
    pub borrower_phone: PhoneNumber,
    pub lender_phone: PhoneNumber,
    pub principal_amount: i64,
    pub repayment_method: RepaymentMethod,
    pub repayment_value: i64,
    /// Makes the request idempotent when replayed from the sync queue
    pub client_reference: Option<String>,
}

/// Loan service for managing loan lifecycle
#[derive(Clone)]
pub struct LoanService {
    store: Arc<dyn LedgerStore>,
    gateway: Option<Arc<dyn CarrierGateway>>,
}

impl LoanService {
    pub fn new(store: Arc<dyn LedgerStore>, gateway: Option<Arc<dyn CarrierGateway>>) -> Self {
        Self { store, gateway }
    }

    /// Creates a pending loan and tells the lender about it. A repeated
    /// client reference returns the loan created the first time.
    pub async fn request_loan(&self, request: LoanRequest) -> LedgerResult<Loan> {
        let borrower = self.user_by_phone(&request.borrower_phone).await?;
        let lender = self.user_by_phone(&request.lender_phone).await?;

        let new_loan = NewLoan {
            borrower_id: borrower.id,
            lender_id: lender.id,
            principal_amount: request.principal_amount,
            repayment_method: request.repayment_method,
            repayment_value: request.repayment_value,
            client_reference: request.client_reference.clone(),
        };
        new_loan.validate()?;

        let loan = match self.store.insert_loan(new_loan).await {
            Ok(loan) => loan,
            Err(LedgerError::Duplicate(_)) => {
                let reference = request.client_reference.as_deref().unwrap_or_default();
                tracing::info!(reference = %reference, "Loan request already recorded");
                return self
                    .store
                    .get_loan_by_client_reference(reference)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::NotFound(format!("Loan with client reference {}", reference))
                    });
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            loan_id = %loan.id,
            borrower = %request.borrower_phone,
            lender = %request.lender_phone,
            amount = loan.principal_amount,
            "Loan requested"
        );

        self.notify(
            lender.id,
            &loan,
            NotificationKind::LoanRequest,
            format!(
                "New loan request of KES {} from {}",
                loan.principal_amount,
                borrower.full_name.as_deref().unwrap_or(&borrower.phone_number)
            ),
        )
        .await;

        Ok(loan)
    }

    /// Lender approves or declines a pending loan
    pub async fn decide_loan(
        &self,
        loan_id: Uuid,
        lender_phone: &PhoneNumber,
        approved: bool,
    ) -> LedgerResult<Loan> {
        let lender = self.user_by_phone(lender_phone).await?;
        let loan = self.get_loan(loan_id).await?;

        if loan.lender_id != lender.id {
            return Err(LedgerError::Validation(
                "Only the lender can decide on this loan".to_string(),
            ));
        }

        let update = LoanUpdate {
            loan_id,
            expected_version: loan.version,
            status: if approved {
                LoanStatus::Active
            } else {
                LoanStatus::Declined
            },
            repayment_method: loan.repayment_method,
            repayment_value: loan.repayment_value,
        };

        match self.apply_update(&loan, update).await? {
            CasOutcome::Updated(loan) => Ok(loan),
            CasOutcome::Stale(current) => Err(LedgerError::Conflict(format!(
                "Loan {} changed (version {}), retry the decision",
                loan_id, current.version
            ))),
        }
    }

    /// Version-checked write of a loan's status and terms. A status change
    /// must be a legal transition; side effects of a decision run only when
    /// the write lands.
    pub async fn apply_update(
        &self,
        current: &Loan,
        update: LoanUpdate,
    ) -> LedgerResult<CasOutcome<Loan>> {
        if update.status != current.status {
            if !current.status.can_transition_to(update.status) {
                return Err(LedgerError::Validation(format!(
                    "Loan cannot move from {:?} to {:?}",
                    current.status, update.status
                )));
            }
            if update.status == LoanStatus::Completed {
                return Err(LedgerError::Validation(
                    "Loans complete only through repayments".to_string(),
                ));
            }
        }
        crate::loan::validate_repayment_terms(update.repayment_method, update.repayment_value)?;

        let previous_status = current.status;
        let outcome = self.store.update_loan(update).await?;

        if let CasOutcome::Updated(loan) = &outcome {
            if loan.status != previous_status {
                self.after_decision(loan).await;
            }
        }

        Ok(outcome)
    }

    pub async fn get_loan(&self, loan_id: Uuid) -> LedgerResult<Loan> {
        self.store
            .get_loan(loan_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Loan {}", loan_id)))
    }

    async fn after_decision(&self, loan: &Loan) {
        let approved = loan.status == LoanStatus::Active;
        tracing::info!(loan_id = %loan.id, status = ?loan.status, "Loan decided");

        let message = if approved {
            format!("Your loan of KES {} has been approved", loan.principal_amount)
        } else {
            format!("Your loan request of KES {} was declined", loan.principal_amount)
        };
        self.notify(loan.borrower_id, loan, NotificationKind::Approval, message)
            .await;

        if !approved {
            return;
        }
        let Some(gateway) = &self.gateway else {
            return;
        };

        let borrower_phone = match self.store.get_user(loan.borrower_id).await {
            Ok(Some(user)) => PhoneNumber::parse(&user.phone_number),
            Ok(None) => Err(LedgerError::NotFound(format!("User {}", loan.borrower_id))),
            Err(e) => Err(e),
        };
        let phone = match borrower_phone {
            Ok(phone) => phone,
            Err(e) => {
                tracing::warn!(loan_id = %loan.id, error = %e, "Skipping disbursement");
                return;
            }
        };

        match gateway
            .initiate_disbursement(&phone, loan.principal_amount, "Loan disbursement")
            .await
        {
            Ok(receipt) => tracing::info!(
                loan_id = %loan.id,
                request_id = %receipt.request_id,
                "Loan disbursement initiated"
            ),
            Err(e) => tracing::warn!(
                loan_id = %loan.id,
                error = %format!("{:#}", e),
                "Loan disbursement failed"
            ),
        }
    }

    async fn user_by_phone(&self, phone: &PhoneNumber) -> LedgerResult<User> {
        self.store
            .get_user_by_phone(phone)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("User with phone {}", phone)))
    }

    async fn notify(&self, user_id: Uuid, loan: &Loan, kind: NotificationKind, message: String) {
        let notification = NewNotification {
            user_id,
            loan_id: Some(loan.id),
            repayment_id: None,
            kind,
            message,
        };
        if let Err(e) = self.store.insert_notification(notification).await {
            tracing::warn!(user_id = %user_id, loan_id = %loan.id, error = %e, "Failed to send notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedgerStore;

    async fn setup() -> (InMemoryLedgerStore, LoanService, PhoneNumber, PhoneNumber) {
        let store = InMemoryLedgerStore::new();
        let borrower = PhoneNumber::parse("0712345678").unwrap();
        let lender = PhoneNumber::parse("0722000111").unwrap();
        store.seed_user(&borrower, "Amina").await;
        store.seed_user(&lender, "Otieno").await;
        let service = LoanService::new(Arc::new(store.clone()), None);
        (store, service, borrower, lender)
    }

    fn request(borrower: &PhoneNumber, lender: &PhoneNumber) -> LoanRequest {
        LoanRequest {
            borrower_phone: borrower.clone(),
            lender_phone: lender.clone(),
            principal_amount: 5000,
            repayment_method: RepaymentMethod::Fixed,
            repayment_value: 500,
            client_reference: Some("client-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_request_is_pending_and_idempotent() {
        let (store, service, borrower, lender) = setup().await;

        let loan = service.request_loan(request(&borrower, &lender)).await.unwrap();
        assert_eq!(loan.status, LoanStatus::Pending);
        assert_eq!(loan.remaining_balance, 5000);

        let again = service.request_loan(request(&borrower, &lender)).await.unwrap();
        assert_eq!(again.id, loan.id);
        assert_eq!(store.loans().await.len(), 1);
        assert_eq!(store.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn test_only_lender_decides_once() {
        let (_, service, borrower, lender) = setup().await;
        let loan = service.request_loan(request(&borrower, &lender)).await.unwrap();

        let err = service.decide_loan(loan.id, &borrower, true).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let active = service.decide_loan(loan.id, &lender, true).await.unwrap();
        assert_eq!(active.status, LoanStatus::Active);
        assert_eq!(active.version, loan.version + 1);

        let err = service.decide_loan(loan.id, &lender, false).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
