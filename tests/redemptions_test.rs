mod common;

use anyhow::Result;
use balance_builder::application::LedgerError;
use balance_builder::domain::EntryKind;
use common::{fund, new_account, spend, test_service};

#[tokio::test]
async fn test_redeem_debits_balance() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 8000).await?;

    let receipt = service.redeem(account, 3500, "Facial", "visit-1").await?;

    assert_eq!(receipt.entry.kind, EntryKind::Redemption);
    assert_eq!(receipt.entry.amount, -3500);
    assert_eq!(receipt.entry.description, "Facial");
    assert_eq!(receipt.balance.balance, 4500);
    assert_eq!(receipt.balance.total_earned, 8000);
    assert_eq!(receipt.balance.total_spent, 3500);

    Ok(())
}

#[tokio::test]
async fn test_redeem_exact_balance_then_one_more() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 300).await?;

    let over = service.redeem(account, 301, "Too much", "visit-over").await;
    match over {
        Err(LedgerError::InsufficientBalance {
            available,
            requested,
        }) => {
            assert_eq!(available, 300);
            assert_eq!(requested, 301);
        }
        other => panic!("expected InsufficientBalance, got {:?}", other),
    }

    let exact = service.redeem(account, 300, "Everything", "visit-exact").await?;
    assert_eq!(exact.balance.balance, 0);

    let after = service.redeem(account, 1, "Nothing left", "visit-after").await;
    assert!(matches!(
        after,
        Err(LedgerError::InsufficientBalance { available: 0, requested: 1 })
    ));

    Ok(())
}

#[tokio::test]
async fn test_redeem_on_unfunded_account() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();

    let result = service.redeem(account, 100, "Manicure", "visit-1").await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientBalance { available: 0, requested: 100 })
    ));

    // A rejected debit never opens the account
    assert!(service.list_balances().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_rejected_redeem_writes_nothing() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;

    let result = service.redeem(account, 5000, "Massage", "visit-big").await;
    assert_eq!(result.unwrap_err().shortfall(), Some(4000));

    let page = service.list_entries(account, &Default::default()).await?;
    assert_eq!(page.entries.len(), 1);
    assert_eq!(service.get_balance(account).await?.balance, 1000);

    // The key stays free for a later, smaller redemption
    let retry = service.redeem(account, 800, "Massage", "visit-big").await?;
    assert!(!retry.replayed);
    assert_eq!(retry.balance.balance, 200);

    Ok(())
}

#[tokio::test]
async fn test_redeem_replay_returns_original() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;

    let first = service.redeem(account, 400, "Haircut", "visit-7").await?;
    let replay = service.redeem(account, 400, "Haircut", "visit-7").await?;

    assert!(replay.replayed);
    assert_eq!(replay.entry.id, first.entry.id);
    assert_eq!(replay.balance.balance, 600);
    assert_eq!(service.get_balance(account).await?.total_spent, 400);

    Ok(())
}

#[tokio::test]
async fn test_redeem_key_reused_for_different_amount() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;

    service.redeem(account, 400, "Haircut", "visit-7").await?;
    let result = service.redeem(account, 500, "Haircut", "visit-7").await;

    assert!(matches!(result, Err(LedgerError::IdempotencyKeyReused { .. })));
    assert_eq!(service.get_balance(account).await?.balance, 600);

    Ok(())
}

#[tokio::test]
async fn test_redeem_validation() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();
    fund(&service, account, 1000).await?;

    assert!(matches!(
        service.redeem(account, 0, "Facial", "k").await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        service.redeem(account, -5, "Facial", "k").await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        service.redeem(account, 100, "   ", "k").await,
        Err(LedgerError::InvalidRequest(_))
    ));
    assert!(matches!(
        service.redeem(account, 100, "Facial", "").await,
        Err(LedgerError::InvalidRequest(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_totals_track_lifetime_activity() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = new_account();

    fund(&service, account, 5000).await?;
    spend(&service, account, 1200, "Pedicure").await?;
    fund(&service, account, 5000).await?;
    spend(&service, account, 3000, "Massage").await?;

    let balance = service.get_balance(account).await?;
    assert_eq!(balance.balance, 5800);
    assert_eq!(balance.total_earned, 10000);
    assert_eq!(balance.total_spent, 4200);
    assert_eq!(
        balance.balance,
        balance.total_earned - balance.total_spent
    );

    Ok(())
}
