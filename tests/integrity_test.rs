mod common;

use anyhow::Result;
use balance_builder::application::LedgerError;
use balance_builder::domain::IntegrityIssue;
use common::{fund, new_account, raw_pool, spend, test_service};

#[tokio::test]
async fn test_healthy_ledger_passes_check() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let a = new_account();
    let b = new_account();
    fund(&service, a, 8000).await?;
    let visit = spend(&service, a, 3500, "Facial").await?;
    service.refund(visit.entry.id, 1000, "Short", "r1").await?;
    fund(&service, b, 2000).await?;

    let report = service.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);
    assert_eq!(report.account_count, 2);
    assert_eq!(report.entry_count, 4);
    assert_eq!(report.total_outstanding, 5500 + 2000);

    Ok(())
}

#[tokio::test]
async fn test_empty_ledger_is_healthy() -> Result<()> {
    let (service, _temp) = test_service().await?;

    let report = service.check_integrity().await?;
    assert!(report.is_healthy());
    assert_eq!(report.entry_count, 0);
    assert_eq!(report.total_outstanding, 0);

    Ok(())
}

#[tokio::test]
async fn test_reconcile_matches_log() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 5000).await?;
    spend(&service, account, 1500, "Massage").await?;

    let rec = service.reconcile(account).await?;
    assert!(rec.is_consistent());
    assert_eq!(rec.entry_count, 2);
    assert_eq!(rec.cached.balance, 3500);
    assert_eq!(rec.recomputed.balance, 3500);
    assert_eq!(rec.recomputed.total_spent, 1500);

    let unknown = service.reconcile(new_account()).await;
    assert!(matches!(unknown, Err(LedgerError::AccountNotFound(_))));

    Ok(())
}

#[tokio::test]
async fn test_drifted_projection_detected_and_rebuilt() -> Result<()> {
    let (service, temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 5000).await?;
    spend(&service, account, 1500, "Massage").await?;

    // Corrupt the cached balance behind the service's back
    let pool = raw_pool(&temp).await?;
    sqlx::query("UPDATE accounts SET balance = balance + 700 WHERE customer_id = ? AND merchant_id = ?")
        .bind(account.customer_id.to_string())
        .bind(account.merchant_id.to_string())
        .execute(&pool)
        .await?;
    pool.close().await;

    let rec = service.reconcile(account).await?;
    assert!(!rec.is_consistent());
    assert_eq!(rec.balance_drift(), 700);

    let report = service.check_integrity().await?;
    assert!(!report.is_healthy());
    assert!(report
        .issues
        .iter()
        .any(|issue| matches!(issue, IntegrityIssue::ProjectionMismatch(r) if r.account == account)));

    let before = service.rebuild_projection(account).await?;
    assert_eq!(before.cached.balance, 4200);

    let after = service.reconcile(account).await?;
    assert!(after.is_consistent());
    assert_eq!(service.get_balance(account).await?.balance, 3500);
    assert!(service.check_integrity().await?.is_healthy());

    // Writes keep working on the rebuilt projection
    let receipt = spend(&service, account, 3500, "Package").await?;
    assert_eq!(receipt.balance.balance, 0);

    Ok(())
}

#[tokio::test]
async fn test_entries_cannot_be_edited_or_deleted() -> Result<()> {
    let (service, temp) = test_service().await?;
    let account = new_account();
    let deposit = fund(&service, account, 5000).await?;

    let pool = raw_pool(&temp).await?;
    let update = sqlx::query("UPDATE entries SET amount = 9999 WHERE id = ?")
        .bind(deposit.entry.id.to_string())
        .execute(&pool)
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM entries WHERE id = ?")
        .bind(deposit.entry.id.to_string())
        .execute(&pool)
        .await;
    assert!(delete.is_err());
    pool.close().await;

    let detail = service.get_entry(deposit.entry.id).await?;
    assert_eq!(detail.entry.amount, 5000);

    Ok(())
}
