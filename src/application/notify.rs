use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{Account, AccountRef, EntryId, EntryKind, LedgerEntry, Minor};

/// A committed balance change, as told to the customer-facing side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub entry_id: EntryId,
    pub kind: EntryKind,
    pub account: AccountRef,
    pub amount: Minor,
    pub balance_after: Minor,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn committed(entry: &LedgerEntry, account: &Account) -> Self {
        Self {
            entry_id: entry.id,
            kind: entry.kind,
            account: entry.account,
            amount: entry.amount,
            balance_after: account.balance,
            description: entry.description.clone(),
            occurred_at: entry.created_at,
        }
    }
}

/// Receives committed ledger events. Delivery is best effort: a failing
/// notifier never affects the ledger mutation it reports.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &LedgerEvent) -> Result<()>;
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: &LedgerEvent) -> Result<()> {
        Ok(())
    }
}

/// Emits each event as a structured log line.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &LedgerEvent) -> Result<()> {
        tracing::info!(
            target: "balance_builder::notify",
            entry_id = %event.entry_id,
            kind = %event.kind,
            account = %event.account,
            amount = event.amount,
            balance_after = event.balance_after,
            "Customer notification"
        );
        Ok(())
    }
}

/// Forwards events to an in-process consumer, e.g. a messaging worker.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<LedgerEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LedgerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: &LedgerEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("Notification receiver dropped"))
    }
}
