//! PostgreSQL store tests
//!
//! These need a provisioned schema at TEST_DATABASE_URL and are ignored by
//! default: `cargo test -- --ignored`.

use sqlx::PgPool;
use uuid::Uuid;

use pesa_ledger::loan::{LoanStatus, NewLoan, RepaymentApplied, RepaymentMethod, RepaymentWrite};
use pesa_ledger::models::{NewTransaction, PhoneNumber, TransactionDirection, User};
use pesa_ledger::store::{LedgerStore, PgLedgerStore};
use pesa_ledger::sync::{NewQueueItem, SyncEntityType, SyncOperation};

/// Helper to create a test database pool
async fn setup_test_db() -> PgPool {
    let database_url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/pesa_ledger_test".to_string());

    sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database")
}

/// Inserts a user with a random phone number
async fn create_user(pool: &PgPool) -> User {
    let subscriber = 700_000_000 + (Uuid::new_v4().as_u128() % 99_999_999) as u64;
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, phone_number, full_name, wallet_balance, version, created_at, updated_at)
        VALUES ($1, $2, $3, 0, 1, NOW(), NOW())
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(format!("254{}", subscriber))
    .bind("Test User")
    .fetch_one(pool)
    .await
    .expect("Failed to insert user")
}

#[tokio::test]
#[ignore] // Requires database setup
async fn test_transaction_reference_is_unique_and_credits_once() {
    let pool = setup_test_db().await;
    let store = PgLedgerStore::new(pool.clone());
    let user = create_user(&pool).await;
    let reference = format!("TEST-{}", Uuid::new_v4());

    let new_tx = NewTransaction {
        user_id: user.id,
        amount: 1000,
        direction: TransactionDirection::Incoming,
        source_phone: None,
        description: Some("test".to_string()),
        external_reference: Some(reference.clone()),
    };

    store.insert_transaction(new_tx.clone()).await.unwrap();
    let duplicate = store.insert_transaction(new_tx).await;
    assert!(matches!(
        duplicate,
        Err(pesa_ledger::error::LedgerError::Duplicate(_))
    ));

    let user = store.get_user(user.id).await.unwrap().unwrap();
    assert_eq!(user.wallet_balance, 1000);
}

#[tokio::test]
#[ignore] // Requires database setup
async fn test_repayment_write_is_version_checked_and_deduplicated() {
    let pool = setup_test_db().await;
    let store = PgLedgerStore::new(pool.clone());
    let borrower = create_user(&pool).await;
    let lender = create_user(&pool).await;

    let loan = store
        .insert_loan(NewLoan {
            borrower_id: borrower.id,
            lender_id: lender.id,
            principal_amount: 1000,
            repayment_method: RepaymentMethod::Fixed,
            repayment_value: 400,
            client_reference: None,
        })
        .await
        .unwrap();
    sqlx::query("UPDATE loans SET status = 'active' WHERE id = $1")
        .bind(loan.id)
        .execute(&pool)
        .await
        .unwrap();
    let loan = store.get_loan(loan.id).await.unwrap().unwrap();

    let tx = store
        .insert_transaction(NewTransaction {
            user_id: borrower.id,
            amount: 400,
            direction: TransactionDirection::Incoming,
            source_phone: None,
            description: None,
            external_reference: None,
        })
        .await
        .unwrap();

    let write = RepaymentWrite {
        loan_id: loan.id,
        transaction_id: tx.id,
        expected_version: loan.version,
        amount_deducted: 400,
        new_balance: 600,
        new_status: LoanStatus::Active,
    };

    let first = store.apply_repayment(write.clone()).await.unwrap();
    assert!(matches!(first, RepaymentApplied::Applied { .. }));

    let replay = store.apply_repayment(write).await.unwrap();
    assert!(matches!(replay, RepaymentApplied::Duplicate(_)));

    let stale = store
        .apply_repayment(RepaymentWrite {
            loan_id: loan.id,
            transaction_id: Uuid::new_v4(),
            expected_version: loan.version,
            amount_deducted: 100,
            new_balance: 500,
            new_status: LoanStatus::Active,
        })
        .await
        .unwrap();
    assert!(matches!(stale, RepaymentApplied::VersionConflict { .. }));

    let loan = store.get_loan(loan.id).await.unwrap().unwrap();
    assert_eq!(loan.remaining_balance, 600);
}

#[tokio::test]
#[ignore] // Requires database setup
async fn test_queue_items_keep_insertion_order() {
    let pool = setup_test_db().await;
    let store = PgLedgerStore::new(pool.clone());
    let user = create_user(&pool).await;
    let owner = PhoneNumber::parse(&user.phone_number).unwrap();

    let mut ids = Vec::new();
    for amount in [100, 200, 300] {
        let item = store
            .insert_queue_item(NewQueueItem {
                entity_type: SyncEntityType::Transaction,
                operation: SyncOperation::Create,
                payload: serde_json::json!({ "amount": amount }),
                owner_phone: owner.clone(),
            })
            .await
            .unwrap();
        ids.push(item.id);
    }

    let pending = store.pending_queue_items(&owner).await.unwrap();
    let pending_ids: Vec<_> = pending.iter().map(|i| i.id).collect();
    assert_eq!(pending_ids, ids);
}

#[tokio::test]
#[ignore] // Requires database setup
async fn test_watermark_stays_below_open_transactions() {
    let pool = setup_test_db().await;
    let store = PgLedgerStore::new(pool.clone());
    let borrower = create_user(&pool).await;
    let lender = create_user(&pool).await;
    let loan = store
        .insert_loan(NewLoan {
            borrower_id: borrower.id,
            lender_id: lender.id,
            principal_amount: 5000,
            repayment_method: RepaymentMethod::Fixed,
            repayment_value: 500,
            client_reference: None,
        })
        .await
        .unwrap();

    let mut open = pool.begin().await.unwrap();
    let (stamped,): (chrono::DateTime<chrono::Utc>,) = sqlx::query_as(
        "UPDATE loans SET version = version + 1, updated_at = NOW() WHERE id = $1 RETURNING updated_at",
    )
    .bind(loan.id)
    .fetch_one(&mut *open)
    .await
    .unwrap();

    let watermark = store.change_watermark().await.unwrap();
    assert!(watermark < stamped);

    let owner = PhoneNumber::parse(&borrower.phone_number).unwrap();
    let before_commit = store.changes_since(&owner, watermark).await.unwrap();
    assert!(before_commit.iter().all(|c| c.id != loan.id || c.version == loan.version));

    open.commit().await.unwrap();

    let after_commit = store.changes_since(&owner, watermark).await.unwrap();
    assert!(after_commit
        .iter()
        .any(|c| c.id == loan.id && c.version == loan.version + 1));
}
