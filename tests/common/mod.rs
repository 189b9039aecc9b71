// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use anyhow::Result;
use balance_builder::LedgerConfig;
use balance_builder::application::{LedgerReceipt, LedgerService};
use balance_builder::domain::{AccountRef, Minor, PaymentRef};
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(LedgerService, TempDir)> {
    let (config, temp_dir) = test_config()?;
    let service = LedgerService::init(config).await?;
    Ok((service, temp_dir))
}

/// Config pointing at a fresh temporary database file
pub fn test_config() -> Result<(LedgerConfig, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    Ok((LedgerConfig::new(db_path.to_str().unwrap()), temp_dir))
}

/// Raw pool on the same file, for poking at rows the service never exposes
pub async fn raw_pool(temp_dir: &TempDir) -> Result<SqlitePool> {
    let url = format!("sqlite:{}", temp_dir.path().join("test.db").display());
    Ok(SqlitePool::connect(&url).await?)
}

/// A fresh customer/merchant pair
pub fn new_account() -> AccountRef {
    AccountRef::new(Uuid::new_v4(), Uuid::new_v4())
}

/// Deposit `amount` from a one-off payment event
pub async fn fund(service: &LedgerService, account: AccountRef, amount: Minor) -> Result<LedgerReceipt> {
    let payment = PaymentRef::new(format!("evt_{}", Uuid::new_v4().simple()));
    let receipt = service
        .deposit(account, amount, &payment, &payment.idempotency_key())
        .await?;
    Ok(receipt)
}

/// Redeem with a fresh idempotency key
pub async fn spend(
    service: &LedgerService,
    account: AccountRef,
    amount: Minor,
    description: &str,
) -> Result<LedgerReceipt> {
    let key = format!("visit-{}", Uuid::new_v4().simple());
    let receipt = service.redeem(account, amount, description, &key).await?;
    Ok(receipt)
}
