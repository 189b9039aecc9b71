use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Minor;

pub type CustomerId = Uuid;
pub type MerchantId = Uuid;

/// Identity of a stored-value account: one per customer and merchant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub customer_id: CustomerId,
    pub merchant_id: MerchantId,
}

impl AccountRef {
    pub fn new(customer_id: CustomerId, merchant_id: MerchantId) -> Self {
        Self {
            customer_id,
            merchant_id,
        }
    }
}

impl std::fmt::Display for AccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.customer_id, self.merchant_id)
    }
}

/// Change an entry applies to the account projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountDelta {
    pub balance: Minor,
    pub earned: Minor,
    pub spent: Minor,
}

/// Running totals of an account, either cached on the account row or
/// recomputed from the entry log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub balance: Minor,
    pub total_earned: Minor,
    pub total_spent: Minor,
}

impl LedgerTotals {
    /// Apply a delta, refusing any result that would leave the balance negative.
    pub fn apply(&self, delta: AccountDelta) -> Result<Self, PostingError> {
        let balance = self
            .balance
            .checked_add(delta.balance)
            .ok_or(PostingError::Overflow)?;
        if balance < 0 {
            return Err(PostingError::InsufficientBalance {
                available: self.balance,
                requested: -delta.balance,
            });
        }
        Ok(Self {
            balance,
            total_earned: self
                .total_earned
                .checked_add(delta.earned)
                .ok_or(PostingError::Overflow)?,
            total_spent: self
                .total_spent
                .checked_add(delta.spent)
                .ok_or(PostingError::Overflow)?,
        })
    }
}

/// The materialised account row. The entry log is authoritative; this is a
/// projection maintained in the same transaction as every append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account: AccountRef,
    pub balance: Minor,
    pub total_earned: Minor,
    pub total_spent: Minor,
    /// Optimistic concurrency token, bumped on every mutation
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn open(account: AccountRef, now: DateTime<Utc>) -> Self {
        Self {
            account,
            balance: 0,
            total_earned: 0,
            total_spent: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn totals(&self) -> LedgerTotals {
        LedgerTotals {
            balance: self.balance,
            total_earned: self.total_earned,
            total_spent: self.total_spent,
        }
    }

    /// Returns the account as it will look after `delta` is committed.
    pub fn posted(&self, delta: AccountDelta, now: DateTime<Utc>) -> Result<Self, PostingError> {
        let totals = self.totals().apply(delta)?;
        Ok(Self {
            account: self.account,
            balance: totals.balance,
            total_earned: totals.total_earned,
            total_spent: totals.total_spent,
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: now,
        })
    }
}

/// Read model returned to balance queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account: AccountRef,
    pub balance: Minor,
    pub total_earned: Minor,
    pub total_spent: Minor,
    /// None when the account has never received a deposit
    pub updated_at: Option<DateTime<Utc>>,
}

impl AccountBalance {
    pub fn empty(account: AccountRef) -> Self {
        Self {
            account,
            balance: 0,
            total_earned: 0,
            total_spent: 0,
            updated_at: None,
        }
    }
}

impl From<&Account> for AccountBalance {
    fn from(account: &Account) -> Self {
        Self {
            account: account.account,
            balance: account.balance,
            total_earned: account.total_earned,
            total_spent: account.total_spent,
            updated_at: Some(account.updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostingError {
    InsufficientBalance { available: Minor, requested: Minor },
    /// A total would leave the representable range
    Overflow,
}

impl std::fmt::Display for PostingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostingError::InsufficientBalance {
                available,
                requested,
            } => write!(
                f,
                "Posting of {} would overdraw balance of {}",
                requested, available
            ),
            PostingError::Overflow => write!(f, "Posting would overflow account totals"),
        }
    }
}

impl std::error::Error for PostingError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ref() -> AccountRef {
        AccountRef::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_open_account_is_empty() {
        let account = Account::open(sample_ref(), Utc::now());
        assert_eq!(account.totals(), LedgerTotals::default());
        assert_eq!(account.version, 0);
    }

    #[test]
    fn test_posted_bumps_version_and_totals() {
        let account = Account::open(sample_ref(), Utc::now());
        let later = Utc::now();
        let posted = account
            .posted(
                AccountDelta {
                    balance: 8000,
                    earned: 8000,
                    spent: 0,
                },
                later,
            )
            .unwrap();

        assert_eq!(posted.balance, 8000);
        assert_eq!(posted.total_earned, 8000);
        assert_eq!(posted.version, 1);
        assert_eq!(posted.updated_at, later);
        assert_eq!(posted.created_at, account.created_at);
    }

    #[test]
    fn test_posting_cannot_overdraw() {
        let totals = LedgerTotals {
            balance: 300,
            total_earned: 300,
            total_spent: 0,
        };
        let result = totals.apply(AccountDelta {
            balance: -301,
            earned: 0,
            spent: 301,
        });
        assert_eq!(
            result,
            Err(PostingError::InsufficientBalance {
                available: 300,
                requested: 301
            })
        );
    }

    #[test]
    fn test_posting_overflow_is_rejected() {
        let totals = LedgerTotals {
            balance: Minor::MAX - 10,
            total_earned: Minor::MAX - 10,
            total_spent: 0,
        };
        let result = totals.apply(AccountDelta {
            balance: 11,
            earned: 11,
            spent: 0,
        });
        assert_eq!(result, Err(PostingError::Overflow));

        let spent_only = LedgerTotals {
            balance: 100,
            total_earned: 100,
            total_spent: Minor::MAX,
        };
        let result = spent_only.apply(AccountDelta {
            balance: -1,
            earned: 0,
            spent: 1,
        });
        assert_eq!(result, Err(PostingError::Overflow));
    }

    #[test]
    fn test_balance_read_model_for_missing_account() {
        let account = sample_ref();
        let balance = AccountBalance::empty(account);
        assert_eq!(balance.balance, 0);
        assert!(balance.updated_at.is_none());
    }
}
