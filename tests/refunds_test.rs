mod common;

use anyhow::Result;
use balance_builder::application::LedgerError;
use balance_builder::domain::EntryKind;
use common::{fund, new_account, spend, test_service};
use uuid::Uuid;

#[tokio::test]
async fn test_refund_redemption_restores_balance() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 8000).await?;
    let facial = spend(&service, account, 3500, "Facial").await?;

    let receipt = service
        .refund(facial.entry.id, 1000, "Partial service", "refund-1")
        .await?;

    assert_eq!(receipt.entry.kind, EntryKind::Refund);
    assert_eq!(receipt.entry.amount, 1000);
    assert_eq!(receipt.entry.reverses, Some(facial.entry.id));
    assert_eq!(receipt.entry.account, account);
    assert_eq!(receipt.balance.balance, 5500);
    // Refunds leave lifetime totals alone
    assert_eq!(receipt.balance.total_earned, 8000);
    assert_eq!(receipt.balance.total_spent, 3500);

    Ok(())
}

#[tokio::test]
async fn test_cumulative_refunds_bounded_by_original() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;
    let original = spend(&service, account, 500, "Manicure").await?;
    let id = original.entry.id;

    service.refund(id, 300, "Chipped", "r1").await?;

    match service.refund(id, 201, "More", "r2").await {
        Err(LedgerError::RefundExceedsOriginal {
            original_id,
            original_amount,
            already_refunded,
            requested,
        }) => {
            assert_eq!(original_id, id);
            assert_eq!(original_amount, 500);
            assert_eq!(already_refunded, 300);
            assert_eq!(requested, 201);
        }
        other => panic!("expected RefundExceedsOriginal, got {:?}", other),
    }

    service.refund(id, 200, "Rest", "r3").await?;
    assert!(matches!(
        service.refund(id, 1, "Extra", "r4").await,
        Err(LedgerError::RefundExceedsOriginal { .. })
    ));

    let detail = service.get_entry(id).await?;
    assert_eq!(detail.refunds.len(), 2);
    assert_eq!(detail.total_refunded, 500);
    assert_eq!(detail.refundable, 0);
    assert_eq!(service.get_balance(account).await?.balance, 1000);

    Ok(())
}

#[tokio::test]
async fn test_single_refund_larger_than_original() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;
    let original = spend(&service, account, 500, "Manicure").await?;

    let result = service.refund(original.entry.id, 501, "Oops", "r1").await;
    assert!(matches!(
        result,
        Err(LedgerError::RefundExceedsOriginal { original_amount: 500, already_refunded: 0, requested: 501, .. })
    ));

    Ok(())
}

#[tokio::test]
async fn test_refund_of_refund_rejected() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;
    let original = spend(&service, account, 500, "Manicure").await?;
    let refund = service
        .refund(original.entry.id, 200, "Partial", "r1")
        .await?;

    let result = service.refund(refund.entry.id, 100, "Undo", "r2").await;
    assert!(matches!(
        result,
        Err(LedgerError::InvalidRefundTarget(id)) if id == refund.entry.id
    ));

    let detail = service.get_entry(refund.entry.id).await?;
    assert_eq!(detail.refundable, 0);

    Ok(())
}

#[tokio::test]
async fn test_refund_of_deposit_cannot_overdraw() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    let deposit = fund(&service, account, 1000).await?;
    spend(&service, account, 800, "Massage").await?;

    let result = service
        .refund(deposit.entry.id, 500, "Chargeback", "r1")
        .await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientBalance { available: 200, requested: 500 })
    ));

    let receipt = service
        .refund(deposit.entry.id, 200, "Chargeback", "r2")
        .await?;
    assert_eq!(receipt.entry.amount, -200);
    assert_eq!(receipt.balance.balance, 0);
    assert_eq!(receipt.balance.total_earned, 1000);

    Ok(())
}

#[tokio::test]
async fn test_refund_unknown_entry() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let missing = Uuid::new_v4();

    let result = service.refund(missing, 100, "Ghost", "r1").await;
    assert!(matches!(result, Err(LedgerError::EntryNotFound(id)) if id == missing));

    Ok(())
}

#[tokio::test]
async fn test_refund_replay() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;
    let original = spend(&service, account, 500, "Manicure").await?;

    let first = service
        .refund(original.entry.id, 500, "Full", "refund-full")
        .await?;
    // The original is now fully refunded, yet the replay still succeeds
    let replay = service
        .refund(original.entry.id, 500, "Full", "refund-full")
        .await?;

    assert!(replay.replayed);
    assert_eq!(replay.entry.id, first.entry.id);
    assert_eq!(service.get_balance(account).await?.balance, 1000);

    Ok(())
}

#[tokio::test]
async fn test_refund_remaining_retry_replays() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;
    let original = spend(&service, account, 500, "Manicure").await?;
    let id = original.entry.id;

    service.refund(id, 200, "Chipped", "r1").await?;

    let rest = service.refund_remaining(id, "Rest", "r2").await?;
    assert!(!rest.replayed);
    assert_eq!(rest.entry.amount, 300);

    // Nothing is left, yet the same key still replays the earlier refund
    let retry = service.refund_remaining(id, "Rest", "r2").await?;
    assert!(retry.replayed);
    assert_eq!(retry.entry.id, rest.entry.id);
    assert_eq!(service.get_balance(account).await?.balance, 1000);

    let fresh = service.refund_remaining(id, "Again", "r3").await;
    assert!(matches!(
        fresh,
        Err(LedgerError::RefundExceedsOriginal { already_refunded: 500, requested: 0, .. })
    ));

    Ok(())
}

#[tokio::test]
async fn test_refund_remaining_rejects_refund_target() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;
    let original = spend(&service, account, 500, "Manicure").await?;
    let refund = service.refund(original.entry.id, 100, "Partial", "r1").await?;

    let result = service.refund_remaining(refund.entry.id, "Undo", "r2").await;
    assert!(matches!(result, Err(LedgerError::InvalidRefundTarget(_))));

    Ok(())
}
