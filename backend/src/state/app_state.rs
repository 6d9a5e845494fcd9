//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::allocation::RepaymentAllocator;
use crate::loan_service::LoanService;
use crate::payments::{CarrierGateway, PaymentService};
use crate::store::LedgerStore;
use crate::sync::{
    ConflictPolicy, EntityHandlers, IncrementalSyncManager, SyncEngine, SyncQueueManager,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub sync_engine: SyncEngine,
    pub loan_service: LoanService,
    pub payment_service: PaymentService,
}

impl AppState {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sync_engine: SyncEngine,
        loan_service: LoanService,
        payment_service: PaymentService,
    ) -> Self {
        Self {
            store,
            sync_engine,
            loan_service,
            payment_service,
        }
    }

    /// Wires every service over one store. `threshold` is the smallest
    /// incoming amount the allocator acts on.
    pub fn assemble(
        store: Arc<dyn LedgerStore>,
        gateway: Option<Arc<dyn CarrierGateway>>,
        threshold: i64,
        sync_max_retries: i32,
    ) -> Self {
        let allocator = RepaymentAllocator::new(store.clone(), threshold);
        let loan_service = LoanService::new(store.clone(), gateway.clone());
        let payment_service = PaymentService::new(store.clone(), allocator.clone(), gateway);

        let handlers = EntityHandlers::new(
            store.clone(),
            loan_service.clone(),
            payment_service.clone(),
            allocator,
            ConflictPolicy::default(),
        );
        let sync_engine = SyncEngine::new(
            store.clone(),
            SyncQueueManager::new(store.clone(), sync_max_retries),
            IncrementalSyncManager::new(store.clone()),
            handlers,
        );

        Self::new(store, sync_engine, loan_service, payment_service)
    }
}

impl FromRef<AppState> for Arc<dyn LedgerStore> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.store.clone()
    }
}

impl FromRef<AppState> for SyncEngine {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.sync_engine.clone()
    }
}

impl FromRef<AppState> for LoanService {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.loan_service.clone()
    }
}

impl FromRef<AppState> for PaymentService {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.payment_service.clone()
    }
}
