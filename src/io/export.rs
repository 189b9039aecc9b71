use std::io::Write;
use std::pin::pin;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::application::{EntryFilter, LedgerService};
use crate::domain::{AccountBalance, AccountRef, LedgerEntry};

/// Account statement for JSON export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatement {
    pub exported_at: DateTime<Utc>,
    pub balance: AccountBalance,
    /// Newest first
    pub entries: Vec<LedgerEntry>,
}

/// Exporter for writing an account's history
pub struct Exporter<'a> {
    service: &'a LedgerService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a LedgerService) -> Self {
        Self { service }
    }

    /// Export entries to CSV, newest first. Amounts stay in minor units.
    pub async fn export_entries_csv<W: Write>(
        &self,
        account: AccountRef,
        filter: EntryFilter,
        writer: W,
    ) -> Result<usize> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "sequence",
            "created_at",
            "kind",
            "amount",
            "description",
            "related_subscription_id",
            "payment_ref",
            "reverses",
            "idempotency_key",
        ])?;

        let mut entries = pin!(self.service.entries(account, filter));
        let mut count = 0;
        while let Some(entry) = entries.try_next().await? {
            csv_writer.write_record([
                entry.id.to_string(),
                entry.sequence.to_string(),
                entry.created_at.to_rfc3339(),
                entry.kind.to_string(),
                entry.amount.to_string(),
                entry.description.clone(),
                entry.related_subscription_id.clone().unwrap_or_default(),
                entry.payment_ref.clone().unwrap_or_default(),
                entry.reverses.map(|id| id.to_string()).unwrap_or_default(),
                entry.idempotency_key.clone(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export the balance and full history as one JSON document.
    pub async fn export_statement_json<W: Write>(
        &self,
        account: AccountRef,
        writer: W,
    ) -> Result<usize> {
        let balance = self.service.get_balance(account).await?;
        let entries: Vec<LedgerEntry> = self
            .service
            .entries(account, EntryFilter::default())
            .try_collect()
            .await?;
        let count = entries.len();

        let statement = AccountStatement {
            exported_at: Utc::now(),
            balance,
            entries,
        };
        serde_json::to_writer_pretty(writer, &statement)?;
        Ok(count)
    }
}
