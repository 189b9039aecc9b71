use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::domain::{
    AccountBalance, AccountRef, EntryId, EntryKind, IntegrityReport, LedgerEntry,
    MAX_ENTRY_AMOUNT, Minor, PaymentRef, PostingError, Reconciliation, RefundError,
    build_integrity_report, total_refunded,
};
use crate::storage::{AppendOutcome, AppendRejection, Repository, is_transient};

use super::{LedgerError, LedgerEvent, NoopNotifier, Notifier};

/// Application service owning every balance mutation.
/// This is the primary interface for any client (CLI, webhook handler, UI backend).
pub struct LedgerService {
    repo: Repository,
    config: LedgerConfig,
    notifier: Arc<dyn Notifier>,
}

/// Result of a deposit, redemption or refund.
#[derive(Debug, Clone)]
pub struct LedgerReceipt {
    pub entry: LedgerEntry,
    pub balance: AccountBalance,
    /// True when the idempotency key had already been applied and nothing changed
    pub replayed: bool,
}

/// An entry together with the refunds recorded against it.
#[derive(Debug, Clone)]
pub struct EntryDetail {
    pub entry: LedgerEntry,
    pub refunds: Vec<LedgerEntry>,
    pub total_refunded: Minor,
    /// How much can still be refunded (zero for refund entries)
    pub refundable: Minor,
}

/// Position in an account's history; the next page holds older entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryCursor {
    pub before_sequence: i64,
}

/// Filter for querying entries
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub kind: Option<EntryKind>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    /// Page size; clamped to the configured bounds
    pub limit: Option<usize>,
    pub before: Option<EntryCursor>,
}

#[derive(Debug, Clone)]
pub struct EntryPage {
    /// Newest first
    pub entries: Vec<LedgerEntry>,
    /// Cursor for the following page, None on the last one
    pub next: Option<EntryCursor>,
}

fn validate_amount(amount: Minor) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(
            "Amount must be positive".to_string(),
        ));
    }
    if amount > MAX_ENTRY_AMOUNT {
        return Err(LedgerError::InvalidAmount(format!(
            "Amount must not exceed {}",
            MAX_ENTRY_AMOUNT
        )));
    }
    Ok(())
}

fn require_text(field: &str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidRequest(format!("{} is required", field)));
    }
    Ok(())
}

impl LedgerService {
    /// Create a new ledger service with the given repository.
    pub fn new(repo: Repository, config: LedgerConfig) -> Self {
        Self {
            repo,
            config,
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Initialize (create and migrate) the database described by `config`.
    pub async fn init(config: LedgerConfig) -> Result<Self, LedgerError> {
        let repo = Repository::init(&config).await?;
        Ok(Self::new(repo, config))
    }

    /// Connect to an existing database.
    pub async fn connect(config: LedgerConfig) -> Result<Self, LedgerError> {
        let repo = Repository::connect(&config).await?;
        Ok(Self::new(repo, config))
    }

    pub async fn close(&self) {
        self.repo.close().await;
    }

    // ========================
    // Mutations
    // ========================

    /// Credit a successful payment to the customer's balance with this merchant.
    /// Replaying the same idempotency key returns the original entry.
    pub async fn deposit(
        &self,
        account: AccountRef,
        amount: Minor,
        payment: &PaymentRef,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        validate_amount(amount)?;
        require_text("Payment reference", &payment.event_id)?;
        require_text("Idempotency key", idempotency_key)?;

        let entry = LedgerEntry::deposit(account, amount, payment, idempotency_key);
        self.append("deposit", entry).await
    }

    /// Charge the customer's balance for a service rendered by the merchant.
    /// The balance check and the debit happen in the same write transaction.
    pub async fn redeem(
        &self,
        account: AccountRef,
        amount: Minor,
        description: &str,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        validate_amount(amount)?;
        require_text("Description", description)?;
        require_text("Idempotency key", idempotency_key)?;

        let entry = LedgerEntry::redemption(account, amount, description.trim(), idempotency_key);
        self.append("redeem", entry).await
    }

    /// Reverse part or all of an earlier deposit or redemption.
    pub async fn refund(
        &self,
        entry_id: EntryId,
        amount: Minor,
        description: &str,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        validate_amount(amount)?;
        require_text("Description", description)?;
        require_text("Idempotency key", idempotency_key)?;

        let detail = self.get_entry(entry_id).await?;
        let original = detail.entry;

        if original.is_refund() {
            return Err(LedgerError::InvalidRefundTarget(original.id));
        }
        // Only the single-refund bound is checked here. The cumulative bound
        // is enforced in the write transaction, after the replay check.
        if amount > original.magnitude() {
            return Err(LedgerError::RefundExceedsOriginal {
                original_id: original.id,
                original_amount: original.magnitude(),
                already_refunded: detail.total_refunded,
                requested: amount,
            });
        }

        let entry = original.refund(amount, description.trim(), idempotency_key);
        self.append("refund", entry).await
    }

    /// Refund whatever is still refundable on an entry. Retrying with the
    /// same key resends the amount that key already committed, so a retry
    /// replays instead of refunding a different remainder.
    pub async fn refund_remaining(
        &self,
        entry_id: EntryId,
        description: &str,
        idempotency_key: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        require_text("Description", description)?;
        require_text("Idempotency key", idempotency_key)?;

        let detail = self.get_entry(entry_id).await?;
        let account = detail.entry.account;
        let previous = self
            .with_retry("refund", || self.repo.get_entry_by_key(&account, idempotency_key))
            .await?;

        let amount = match previous {
            Some(previous) if previous.reverses == Some(entry_id) => previous.magnitude(),
            _ if detail.entry.is_refund() => {
                return Err(LedgerError::InvalidRefundTarget(entry_id));
            }
            _ if detail.refundable == 0 => {
                return Err(LedgerError::RefundExceedsOriginal {
                    original_id: entry_id,
                    original_amount: detail.entry.magnitude(),
                    already_refunded: detail.total_refunded,
                    requested: 0,
                });
            }
            _ => detail.refundable,
        };
        self.refund(entry_id, amount, description, idempotency_key).await
    }

    async fn append(&self, op: &'static str, entry: LedgerEntry) -> Result<LedgerReceipt, LedgerError> {
        let outcome = self
            .with_retry(op, || self.repo.append_entry(&entry))
            .await?;

        match outcome {
            AppendOutcome::Committed { entry, account } => {
                info!(
                    op,
                    entry_id = %entry.id,
                    account = %entry.account,
                    amount = entry.amount,
                    balance = account.balance,
                    "Ledger entry committed"
                );
                self.notify(LedgerEvent::committed(&entry, &account));
                Ok(LedgerReceipt {
                    balance: AccountBalance::from(&account),
                    entry,
                    replayed: false,
                })
            }
            AppendOutcome::Replayed { entry, account } => {
                info!(
                    op,
                    entry_id = %entry.id,
                    key = %entry.idempotency_key,
                    "Idempotent replay, nothing applied"
                );
                Ok(LedgerReceipt {
                    balance: AccountBalance::from(&account),
                    entry,
                    replayed: true,
                })
            }
            AppendOutcome::KeyReused { existing } => {
                warn!(op, key = %entry.idempotency_key, existing = %existing.id, "Idempotency key reused");
                Err(LedgerError::IdempotencyKeyReused {
                    key: entry.idempotency_key,
                    existing: existing.id,
                })
            }
            AppendOutcome::PaymentConflict { existing } => {
                let payment_ref = existing.payment_ref.clone().unwrap_or_default();
                warn!(op, payment_ref = %payment_ref, existing = %existing.id, "Payment already credited differently");
                Err(LedgerError::PaymentConflict {
                    payment_ref,
                    existing: existing.id,
                })
            }
            AppendOutcome::Rejected(rejection) => {
                let err = match rejection {
                    AppendRejection::Posting(PostingError::InsufficientBalance {
                        available,
                        requested,
                    }) => LedgerError::InsufficientBalance {
                        available,
                        requested,
                    },
                    AppendRejection::Posting(PostingError::Overflow) => LedgerError::InvalidAmount(
                        "Amount would overflow the account totals".to_string(),
                    ),
                    AppendRejection::Refund(RefundError::ExceedsOriginalAmount {
                        original_amount,
                        already_refunded,
                        requested,
                    }) => LedgerError::RefundExceedsOriginal {
                        original_id: entry.reverses.unwrap_or(entry.id),
                        original_amount,
                        already_refunded,
                        requested,
                    },
                    AppendRejection::Refund(RefundError::TargetIsRefund { original_id }) => {
                        LedgerError::InvalidRefundTarget(original_id)
                    }
                    AppendRejection::MissingOriginal(id) => LedgerError::EntryNotFound(id),
                };
                debug!(op, account = %entry.account, error = %err, "Ledger entry rejected");
                Err(err)
            }
        }
    }

    /// Run a store operation, retrying transient failures with linear backoff.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut attempt_op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match attempt_op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) => {
                    if attempt >= self.config.max_attempts {
                        warn!(op, attempts = attempt, error = %err, "Store still unavailable, giving up");
                        return Err(LedgerError::StoreUnavailable {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    debug!(op, attempt, error = %err, "Transient store failure, retrying");
                    tokio::time::sleep(self.config.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(LedgerError::Store(err)),
            }
        }
    }

    fn notify(&self, event: LedgerEvent) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(&event).await {
                warn!(entry_id = %event.entry_id, error = %err, "Ledger notification failed");
            }
        });
    }

    // ========================
    // Queries
    // ========================

    /// Current balance and lifetime totals. Never-funded accounts read as zero.
    pub async fn get_balance(&self, account: AccountRef) -> Result<AccountBalance, LedgerError> {
        let stored = self
            .with_retry("get_balance", || self.repo.get_account(&account))
            .await?;
        Ok(stored
            .as_ref()
            .map(AccountBalance::from)
            .unwrap_or_else(|| AccountBalance::empty(account)))
    }

    /// Balances of every account that has been opened.
    pub async fn list_balances(&self) -> Result<Vec<AccountBalance>, LedgerError> {
        let accounts = self
            .with_retry("list_balances", || self.repo.list_accounts())
            .await?;
        Ok(accounts.iter().map(AccountBalance::from).collect())
    }

    /// One page of history, newest first.
    pub async fn list_entries(
        &self,
        account: AccountRef,
        filter: &EntryFilter,
    ) -> Result<EntryPage, LedgerError> {
        let limit = self.config.page_size(filter.limit);
        let before = filter.before.map(|c| c.before_sequence);

        // One extra row tells us whether another page follows
        let mut entries = self
            .with_retry("list_entries", || {
                self.repo.list_entries_page(
                    &account,
                    filter.kind,
                    filter.from_date,
                    filter.to_date,
                    before,
                    limit + 1,
                )
            })
            .await?;

        let next = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(|e| EntryCursor {
                before_sequence: e.sequence,
            })
        } else {
            None
        };

        Ok(EntryPage { entries, next })
    }

    /// Every entry matching `filter`, newest first, fetched a page at a time
    /// as the stream is polled.
    pub fn entries(
        &self,
        account: AccountRef,
        filter: EntryFilter,
    ) -> impl Stream<Item = Result<LedgerEntry, LedgerError>> + '_ {
        stream::try_unfold(Some(filter), move |state| async move {
            let Some(filter) = state else {
                return Ok::<_, LedgerError>(None);
            };
            let page = self.list_entries(account, &filter).await?;
            let next = page.next.map(|cursor| EntryFilter {
                before: Some(cursor),
                ..filter
            });
            Ok(Some((page.entries, next)))
        })
        .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<LedgerEntry, LedgerError>)))
        .try_flatten()
    }

    /// The deposit that credited `payment` to `account`, if it was applied.
    pub async fn find_deposit(
        &self,
        account: AccountRef,
        payment: &PaymentRef,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        self.with_retry("find_deposit", || {
            self.repo.get_entry_by_payment(&account, &payment.event_id)
        })
        .await
    }

    /// Get an entry with its refund history.
    pub async fn get_entry(&self, id: EntryId) -> Result<EntryDetail, LedgerError> {
        let entry = self
            .with_retry("get_entry", || self.repo.get_entry(id))
            .await?
            .ok_or(LedgerError::EntryNotFound(id))?;
        let refunds = self
            .with_retry("get_entry", || self.repo.get_refunds_for_entry(id))
            .await?;

        let total_refunded = total_refunded(id, &refunds);
        let refundable = if entry.is_refund() {
            0
        } else {
            entry.magnitude() - total_refunded
        };

        Ok(EntryDetail {
            entry,
            refunds,
            total_refunded,
            refundable,
        })
    }

    // ========================
    // Integrity operations
    // ========================

    /// Compare the cached projection of one account with its entry log.
    pub async fn reconcile(&self, account: AccountRef) -> Result<Reconciliation, LedgerError> {
        self.with_retry("reconcile", || self.repo.reconcile(&account))
            .await?
            .ok_or(LedgerError::AccountNotFound(account))
    }

    /// Rewrite the cached projection from the entry log. Returns the state
    /// found before the rebuild.
    pub async fn rebuild_projection(&self, account: AccountRef) -> Result<Reconciliation, LedgerError> {
        let before = self
            .with_retry("rebuild_projection", || self.repo.rebuild_projection(&account))
            .await?
            .ok_or(LedgerError::AccountNotFound(account))?;

        if !before.is_consistent() {
            warn!(
                account = %account,
                cached = before.cached.balance,
                drift = before.balance_drift(),
                "Account projection rebuilt from entry log"
            );
        }
        Ok(before)
    }

    /// Check ledger integrity and return a report.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, LedgerError> {
        let stats = self
            .with_retry("check_integrity", || self.repo.get_integrity_stats())
            .await?;
        let reconciliations = self
            .with_retry("check_integrity", || self.repo.reconcile_all())
            .await?;
        let overages = self
            .with_retry("check_integrity", || self.repo.find_refund_overages())
            .await?;

        Ok(build_integrity_report(&stats, &reconciliations, overages))
    }
}
