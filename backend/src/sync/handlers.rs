//! Entity handlers for queued mutations
//!
//! Each handler replays one decoded queue item through the same services the
//! live API uses. Handlers classify; they never mark the item themselves.

use std::sync::Arc;

use uuid::Uuid;

use super::conflict::{Conflict, ConflictResolver, RecordVersion, Resolution, ResolutionStrategy, Winner};
use super::model::{ResolutionRecord, SyncEntityType, SyncQueueItem};
use super::payload::{
    LoanCreatePayload, LoanUpdatePayload, QueuedMutation, RepaymentCreatePayload,
    TransactionCreatePayload, UserUpdatePayload,
};
use crate::allocation::{AllocationTarget, RepaymentAllocator};
use crate::error::{LedgerError, LedgerResult};
use crate::loan::LoanUpdate;
use crate::loan_service::{LoanRequest, LoanService};
use crate::models::{PhoneNumber, TransactionDirection, User, UserProfileUpdate};
use crate::payments::{PaymentRecord, PaymentService};
use crate::store::{CasOutcome, LedgerStore};

/// Strategy applied per entity when a queued edit is based on a stale version
#[derive(Debug, Clone, Copy)]
pub struct ConflictPolicy {
    pub loan: ResolutionStrategy,
    pub user: ResolutionStrategy,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            loan: ResolutionStrategy::LocalWins,
            user: ResolutionStrategy::Merge,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Applied,
    /// The server version won; nothing written, item is done
    Superseded(Resolution),
    /// No automatic winner; item stays pending
    Deferred { conflict: Conflict, resolution: Resolution },
    /// The row moved between the read and the version-checked write; item
    /// stays pending and is resolved against the new row on the next drain
    Raced(Conflict),
}

#[derive(Debug, Clone)]
pub struct HandledItem {
    pub outcome: ItemOutcome,
    /// Audit entries written while handling the item
    pub resolutions: Vec<ResolutionRecord>,
}

impl HandledItem {
    fn applied(resolutions: Vec<ResolutionRecord>) -> Self {
        Self {
            outcome: ItemOutcome::Applied,
            resolutions,
        }
    }
}

#[derive(Clone)]
pub struct EntityHandlers {
    store: Arc<dyn LedgerStore>,
    loans: LoanService,
    payments: PaymentService,
    allocator: RepaymentAllocator,
    resolver: ConflictResolver,
    policy: ConflictPolicy,
}

impl EntityHandlers {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        loans: LoanService,
        payments: PaymentService,
        allocator: RepaymentAllocator,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            store,
            loans,
            payments,
            allocator,
            resolver: ConflictResolver::new(),
            policy,
        }
    }

    pub async fn handle(&self, item: &SyncQueueItem) -> LedgerResult<HandledItem> {
        let owner = PhoneNumber::parse(&item.owner_phone)?;
        let mutation = QueuedMutation::decode(item.entity_type, item.operation, &item.payload)?;

        match mutation {
            QueuedMutation::CreateLoan(p) => self.create_loan(item, &owner, p).await,
            QueuedMutation::UpdateLoan(p) => self.update_loan(item, &owner, p).await,
            QueuedMutation::CreateTransaction(p) => self.create_transaction(item, owner, p).await,
            QueuedMutation::CreateRepayment(p) => self.create_repayment(&owner, p).await,
            QueuedMutation::UpdateUser(p) => self.update_user(item, &owner, p).await,
        }
    }

    async fn create_loan(
        &self,
        item: &SyncQueueItem,
        owner: &PhoneNumber,
        p: LoanCreatePayload,
    ) -> LedgerResult<HandledItem> {
        if *owner != p.borrower_phone && *owner != p.lender_phone {
            return Err(LedgerError::Validation(
                "Queue owner is not a party to this loan".to_string(),
            ));
        }

        let loan = self
            .loans
            .request_loan(LoanRequest {
                borrower_phone: p.borrower_phone,
                lender_phone: p.lender_phone,
                principal_amount: p.principal_amount,
                repayment_method: p.repayment_method,
                repayment_value: p.repayment_value,
                client_reference: Some(item.id.to_string()),
            })
            .await?;

        tracing::debug!(item_id = %item.id, loan_id = %loan.id, "Replayed loan request");
        Ok(HandledItem::applied(Vec::new()))
    }

    async fn update_loan(
        &self,
        item: &SyncQueueItem,
        owner: &PhoneNumber,
        p: LoanUpdatePayload,
    ) -> LedgerResult<HandledItem> {
        let owner_user = self.owner(owner).await?;
        let current = self.loans.get_loan(p.loan_id).await?;
        if !current.involves(owner_user.id) {
            return Err(LedgerError::Validation(
                "Queue owner is not a party to this loan".to_string(),
            ));
        }
        let changes_status = p.status.map_or(false, |s| s != current.status);
        if changes_status && current.lender_id != owner_user.id {
            return Err(LedgerError::Validation(
                "Only the lender can change the loan status".to_string(),
            ));
        }

        let mut resolutions = Vec::new();
        if let Some(balance) = p.remaining_balance {
            if balance != current.remaining_balance {
                let resolution = Resolution {
                    strategy: ResolutionStrategy::ServerWins,
                    winner: Winner::Server,
                    reason: format!(
                        "remaining balance is server-owned; ignored client value {} (server {})",
                        balance, current.remaining_balance
                    ),
                };
                resolutions.push(
                    self.audit(item, SyncEntityType::Loan, current.id, &resolution)
                        .await?,
                );
            }
        }

        if p.status.is_none() && p.repayment_method.is_none() && p.repayment_value.is_none() {
            return Ok(HandledItem::applied(resolutions));
        }

        let local = RecordVersion {
            version: p.version,
            updated_at: p.edited_at.unwrap_or(item.created_at),
        };
        let server = RecordVersion {
            version: current.version,
            updated_at: current.updated_at,
        };

        if let Some(conflict) =
            self.resolver
                .detect(SyncEntityType::Loan, current.id, Some(local), Some(server))
        {
            let resolution = self.resolver.resolve(&conflict, self.policy.loan);
            match resolution.winner {
                Winner::Local | Winner::Merged => {
                    resolutions.push(
                        self.audit(item, SyncEntityType::Loan, current.id, &resolution)
                            .await?,
                    );
                }
                Winner::Server => {
                    resolutions.push(
                        self.audit(item, SyncEntityType::Loan, current.id, &resolution)
                            .await?,
                    );
                    return Ok(HandledItem {
                        outcome: ItemOutcome::Superseded(resolution),
                        resolutions,
                    });
                }
                Winner::None => {
                    resolutions.extend(self.audit_deferral(item, current.id, &resolution).await?);
                    return Ok(HandledItem {
                        outcome: ItemOutcome::Deferred {
                            conflict,
                            resolution,
                        },
                        resolutions,
                    });
                }
            }
        }

        let update = LoanUpdate {
            loan_id: current.id,
            expected_version: current.version,
            status: p.status.unwrap_or(current.status),
            repayment_method: p.repayment_method.unwrap_or(current.repayment_method),
            repayment_value: p.repayment_value.unwrap_or(current.repayment_value),
        };

        match self.loans.apply_update(&current, update).await? {
            CasOutcome::Updated(_) => Ok(HandledItem::applied(resolutions)),
            CasOutcome::Stale(now) => Ok(HandledItem {
                outcome: ItemOutcome::Raced(Conflict {
                    entity_type: SyncEntityType::Loan,
                    entity_id: now.id,
                    local: server,
                    server: RecordVersion {
                        version: now.version,
                        updated_at: now.updated_at,
                    },
                }),
                resolutions,
            }),
        }
    }

    async fn create_transaction(
        &self,
        item: &SyncQueueItem,
        owner: PhoneNumber,
        p: TransactionCreatePayload,
    ) -> LedgerResult<HandledItem> {
        let recorded = self
            .payments
            .record_payment(PaymentRecord {
                phone: owner,
                amount: p.amount,
                direction: p.direction,
                source_phone: p.source_phone.map(String::from),
                description: p.description,
                external_reference: Some(p.reference.unwrap_or_else(|| item.id.to_string())),
                target: AllocationTarget::Borrower,
            })
            .await?;

        // Replay is idempotent, so an incomplete allocation is retried as a whole
        if recorded.allocation_incomplete() {
            return Err(LedgerError::Transient(format!(
                "Allocation for transaction {} incomplete",
                recorded.transaction.id
            )));
        }
        Ok(HandledItem::applied(Vec::new()))
    }

    async fn create_repayment(
        &self,
        owner: &PhoneNumber,
        p: RepaymentCreatePayload,
    ) -> LedgerResult<HandledItem> {
        let owner_user = self.owner(owner).await?;
        let transaction = self
            .store
            .get_transaction(p.transaction_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Transaction {}", p.transaction_id)))?;

        if transaction.user_id != owner_user.id {
            return Err(LedgerError::Validation(
                "Transaction belongs to another user".to_string(),
            ));
        }
        if transaction.direction != TransactionDirection::Incoming {
            return Err(LedgerError::Validation(
                "Only incoming transactions repay loans".to_string(),
            ));
        }

        let target = p
            .loan_id
            .map(AllocationTarget::Loan)
            .unwrap_or(AllocationTarget::Borrower);
        let result = self
            .allocator
            .allocate_to(owner_user.id, transaction.amount, transaction.id, target)
            .await?;

        if result.is_partial() {
            return Err(LedgerError::Transient(format!(
                "Allocation for transaction {} incomplete",
                transaction.id
            )));
        }
        Ok(HandledItem::applied(Vec::new()))
    }

    async fn update_user(
        &self,
        item: &SyncQueueItem,
        owner: &PhoneNumber,
        p: UserUpdatePayload,
    ) -> LedgerResult<HandledItem> {
        let user = self.owner(owner).await?;
        let mut resolutions = Vec::new();

        if let Some(balance) = p.wallet_balance {
            if balance != user.wallet_balance {
                let resolution = Resolution {
                    strategy: ResolutionStrategy::ServerWins,
                    winner: Winner::Server,
                    reason: format!(
                        "wallet balance is server-owned; ignored client value {} (server {})",
                        balance, user.wallet_balance
                    ),
                };
                resolutions.push(
                    self.audit(item, SyncEntityType::User, user.id, &resolution)
                        .await?,
                );
            }
        }

        let profile = UserProfileUpdate {
            full_name: p.full_name,
            email: p.email,
        };
        if profile.is_empty() {
            return Ok(HandledItem::applied(resolutions));
        }

        let local = RecordVersion {
            version: p.version,
            updated_at: p.edited_at.unwrap_or(item.created_at),
        };
        let server = RecordVersion {
            version: user.version,
            updated_at: user.updated_at,
        };

        let profile = match self
            .resolver
            .detect(SyncEntityType::User, user.id, Some(local), Some(server))
        {
            None => profile,
            Some(conflict) => {
                let (resolution, merged) = if self.policy.user == ResolutionStrategy::Merge {
                    let server_profile = UserProfileUpdate {
                        full_name: user.full_name.clone(),
                        email: user.email.clone(),
                    };
                    self.resolver
                        .merge(&conflict, &profile, &server_profile, merge_profile)
                } else {
                    (self.resolver.resolve(&conflict, self.policy.user), profile)
                };

                match resolution.winner {
                    Winner::Local | Winner::Merged => {
                        resolutions.push(
                            self.audit(item, SyncEntityType::User, user.id, &resolution)
                                .await?,
                        );
                        merged
                    }
                    Winner::Server => {
                        resolutions.push(
                            self.audit(item, SyncEntityType::User, user.id, &resolution)
                                .await?,
                        );
                        return Ok(HandledItem {
                            outcome: ItemOutcome::Superseded(resolution),
                            resolutions,
                        });
                    }
                    Winner::None => {
                        resolutions.extend(self.audit_deferral(item, user.id, &resolution).await?);
                        return Ok(HandledItem {
                            outcome: ItemOutcome::Deferred {
                                conflict,
                                resolution,
                            },
                            resolutions,
                        });
                    }
                }
            }
        };

        match self
            .store
            .update_user_profile(user.id, user.version, &profile)
            .await?
        {
            CasOutcome::Updated(_) => Ok(HandledItem::applied(resolutions)),
            CasOutcome::Stale(now) => Ok(HandledItem {
                outcome: ItemOutcome::Raced(Conflict {
                    entity_type: SyncEntityType::User,
                    entity_id: now.id,
                    local: server,
                    server: RecordVersion {
                        version: now.version,
                        updated_at: now.updated_at,
                    },
                }),
                resolutions,
            }),
        }
    }

    async fn owner(&self, phone: &PhoneNumber) -> LedgerResult<User> {
        self.store
            .get_user_by_phone(phone)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("User with phone {}", phone)))
    }

    async fn audit(
        &self,
        item: &SyncQueueItem,
        entity_type: SyncEntityType,
        entity_id: Uuid,
        resolution: &Resolution,
    ) -> LedgerResult<ResolutionRecord> {
        tracing::info!(
            item_id = %item.id,
            entity = entity_type.as_str(),
            entity_id = %entity_id,
            strategy = resolution.strategy.as_str(),
            winner = resolution.winner.as_str(),
            reason = %resolution.reason,
            "Conflict resolved"
        );
        self.store
            .insert_resolution(resolution.audit_record(Some(item.id), entity_type, Some(entity_id)))
            .await
    }

    /// A deferred item is seen on every drain; audit it once
    async fn audit_deferral(
        &self,
        item: &SyncQueueItem,
        entity_id: Uuid,
        resolution: &Resolution,
    ) -> LedgerResult<Option<ResolutionRecord>> {
        let already_deferred = self
            .store
            .resolutions_for_item(item.id)
            .await?
            .iter()
            .any(|r| r.winner == Winner::None.as_str());
        if already_deferred {
            return Ok(None);
        }
        self.audit(item, item.entity_type, entity_id, resolution)
            .await
            .map(Some)
    }
}

/// Client edits land on top of the server's profile
fn merge_profile(local: &UserProfileUpdate, server: &UserProfileUpdate) -> UserProfileUpdate {
    UserProfileUpdate {
        full_name: local.full_name.clone().or_else(|| server.full_name.clone()),
        email: local.email.clone().or_else(|| server.email.clone()),
    }
}
