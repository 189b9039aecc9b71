use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AccountDelta, AccountRef, Minor};

pub type EntryId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Funds paid in, normally by a subscription payment
    Deposit,
    /// Merchant charge against the balance for a rendered service
    Redemption,
    /// Offsetting entry against an earlier deposit or redemption
    Refund,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Redemption => "redemption",
            EntryKind::Refund => "refund",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "deposit" => Some(EntryKind::Deposit),
            "redemption" => Some(EntryKind::Redemption),
            "refund" => Some(EntryKind::Refund),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a deposit's money came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRef {
    /// Payment processor event or charge id
    pub event_id: String,
    pub subscription_id: Option<String>,
}

impl PaymentRef {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            subscription_id: None,
        }
    }

    pub fn with_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    /// Key that makes redelivery of the same processor event a replay.
    pub fn idempotency_key(&self) -> String {
        format!("payment:{}", self.event_id)
    }
}

/// One balance-affecting event. Entries are immutable once committed;
/// corrections are new refund entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Commit order across the whole store, assigned by the repository
    pub sequence: i64,
    pub account: AccountRef,
    pub kind: EntryKind,
    /// Signed delta applied to the balance
    pub amount: Minor,
    pub description: String,
    pub related_subscription_id: Option<String>,
    pub payment_ref: Option<String>,
    /// For refunds, the entry being reversed
    pub reverses: Option<EntryId>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn draft(
        account: AccountRef,
        kind: EntryKind,
        amount: Minor,
        description: String,
        idempotency_key: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0, // Will be set by repository
            account,
            kind,
            amount,
            description,
            related_subscription_id: None,
            payment_ref: None,
            reverses: None,
            idempotency_key,
            created_at: Utc::now(),
        }
    }

    pub fn deposit(
        account: AccountRef,
        amount: Minor,
        payment: &PaymentRef,
        idempotency_key: impl Into<String>,
    ) -> Self {
        assert!(amount > 0, "Deposit amount must be positive");
        let description = match &payment.subscription_id {
            Some(sub) => format!("Subscription payment {} ({})", payment.event_id, sub),
            None => format!("Payment {}", payment.event_id),
        };
        let mut entry = Self::draft(
            account,
            EntryKind::Deposit,
            amount,
            description,
            idempotency_key.into(),
        );
        entry.related_subscription_id = payment.subscription_id.clone();
        entry.payment_ref = Some(payment.event_id.clone());
        entry
    }

    pub fn redemption(
        account: AccountRef,
        amount: Minor,
        description: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        assert!(amount > 0, "Redemption amount must be positive");
        Self::draft(
            account,
            EntryKind::Redemption,
            -amount,
            description.into(),
            idempotency_key.into(),
        )
    }

    /// Create a refund of `amount` against this entry, signed opposite to it.
    pub fn refund(
        &self,
        amount: Minor,
        description: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        assert!(
            amount > 0 && amount <= self.magnitude(),
            "Refund amount must be between 0 and original amount"
        );
        let signed = if self.amount < 0 { amount } else { -amount };
        let mut entry = Self::draft(
            self.account,
            EntryKind::Refund,
            signed,
            description.into(),
            idempotency_key.into(),
        );
        entry.reverses = Some(self.id);
        entry
    }

    pub fn magnitude(&self) -> Minor {
        self.amount.abs()
    }

    pub fn is_refund(&self) -> bool {
        self.kind == EntryKind::Refund
    }

    /// Effect on the account projection. Refunds move the balance only:
    /// earned and spent totals never decrease.
    pub fn delta(&self) -> AccountDelta {
        match self.kind {
            EntryKind::Deposit => AccountDelta {
                balance: self.amount,
                earned: self.amount,
                spent: 0,
            },
            EntryKind::Redemption => AccountDelta {
                balance: self.amount,
                earned: 0,
                spent: -self.amount,
            },
            EntryKind::Refund => AccountDelta {
                balance: self.amount,
                earned: 0,
                spent: 0,
            },
        }
    }

    /// Whether `other`, submitted under the same idempotency key, describes
    /// the same logical operation as this committed entry.
    pub fn matches_request(&self, other: &LedgerEntry) -> bool {
        self.account == other.account
            && self.kind == other.kind
            && self.amount == other.amount
            && self.reverses == other.reverses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> AccountRef {
        AccountRef::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [EntryKind::Deposit, EntryKind::Redemption, EntryKind::Refund] {
            assert_eq!(EntryKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(EntryKind::from_str("REFUND"), Some(EntryKind::Refund));
        assert_eq!(EntryKind::from_str("transfer"), None);
    }

    #[test]
    fn test_deposit_carries_payment_details() {
        let payment = PaymentRef::new("evt_1").with_subscription("sub_9");
        let entry = LedgerEntry::deposit(sample_account(), 8000, &payment, payment.idempotency_key());

        assert_eq!(entry.amount, 8000);
        assert_eq!(entry.kind, EntryKind::Deposit);
        assert_eq!(entry.payment_ref.as_deref(), Some("evt_1"));
        assert_eq!(entry.related_subscription_id.as_deref(), Some("sub_9"));
        assert_eq!(entry.idempotency_key, "payment:evt_1");
        assert_eq!(
            entry.delta(),
            AccountDelta {
                balance: 8000,
                earned: 8000,
                spent: 0
            }
        );
    }

    #[test]
    fn test_redemption_is_negative() {
        let entry = LedgerEntry::redemption(sample_account(), 3500, "Facial", "ui-1");
        assert_eq!(entry.amount, -3500);
        assert_eq!(entry.delta().spent, 3500);
    }

    #[test]
    fn test_refund_of_redemption_credits_back() {
        let original = LedgerEntry::redemption(sample_account(), 3500, "Facial", "ui-1");
        let refund = original.refund(1000, "Partial refund", "ui-2");

        assert_eq!(refund.amount, 1000);
        assert_eq!(refund.kind, EntryKind::Refund);
        assert_eq!(refund.reverses, Some(original.id));
        assert_eq!(refund.account, original.account);
        assert_eq!(refund.delta().spent, 0);
    }

    #[test]
    fn test_refund_of_deposit_debits() {
        let payment = PaymentRef::new("evt_2");
        let original = LedgerEntry::deposit(sample_account(), 500, &payment, "k");
        let refund = original.refund(500, "Charged twice", "k2");
        assert_eq!(refund.amount, -500);
        assert_eq!(refund.delta().earned, 0);
    }

    #[test]
    fn test_matches_request_ignores_description() {
        let account = sample_account();
        let first = LedgerEntry::redemption(account, 200, "Haircut", "key2");
        let retry = LedgerEntry::redemption(account, 200, "Haircut (retry)", "key2");
        let other = LedgerEntry::redemption(account, 250, "Haircut", "key2");

        assert!(first.matches_request(&retry));
        assert!(!first.matches_request(&other));
    }

    #[test]
    #[should_panic(expected = "Redemption amount must be positive")]
    fn test_redemption_requires_positive_amount() {
        LedgerEntry::redemption(sample_account(), 0, "x", "k");
    }

    #[test]
    #[should_panic(expected = "Refund amount must be between 0 and original amount")]
    fn test_refund_cannot_exceed_original() {
        let original = LedgerEntry::redemption(sample_account(), 100, "x", "k");
        original.refund(101, "too much", "k2");
    }
}
