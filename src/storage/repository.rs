use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::domain::{
    Account, AccountRef, EntryId, EntryKind, IntegrityIssue, IntegrityStats, LedgerEntry,
    LedgerTotals, Minor, PostingError, Reconciliation, RefundError, replay_totals,
    validate_refund,
};

use super::MIGRATION_001_INITIAL;
use super::tx::ImmediateTx;

const ENTRY_COLUMNS: &str = "id, sequence, customer_id, merchant_id, kind, amount, description, related_subscription_id, payment_ref, reverses, idempotency_key, created_at";

const ACCOUNT_COLUMNS: &str =
    "customer_id, merchant_id, balance, total_earned, total_spent, version, created_at, updated_at";

/// Result of trying to append an entry inside one write transaction.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// Entry and account update landed together
    Committed { entry: LedgerEntry, account: Account },
    /// An identical operation was already committed under this key
    Replayed { entry: LedgerEntry, account: Account },
    /// The key is taken by a different operation on this account
    KeyReused { existing: LedgerEntry },
    /// The payment was already credited with different details
    PaymentConflict { existing: LedgerEntry },
    /// A ledger rule refused the entry; nothing was written
    Rejected(AppendRejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendRejection {
    Posting(PostingError),
    Refund(RefundError),
    MissingOriginal(EntryId),
}

/// The account row changed between read and compare-and-swap.
#[derive(Debug, thiserror::Error)]
#[error("Concurrent update of account {0}")]
pub struct VersionConflict(pub AccountRef);

/// Whether a storage failure is worth retrying: lock contention, pool
/// exhaustion, I/O hiccups and lost compare-and-swap races.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.downcast_ref::<VersionConflict>().is_some() {
            return true;
        }
        match cause.downcast_ref::<sqlx::Error>() {
            Some(sqlx::Error::PoolTimedOut) | Some(sqlx::Error::Io(_)) => true,
            Some(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
                matches!(
                    db.code().as_deref(),
                    Some("5" | "6" | "261" | "262" | "517" | "773")
                ) || db.message().contains("database is locked")
            }
            _ => false,
        }
    })
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str, what: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid {} timestamp", what))?
        .with_timezone(&Utc))
}

/// Repository for the account projection and the entry log.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn connect_options(config: &LedgerConfig, create: bool) -> Result<SqliteConnectOptions> {
        let url = format!("sqlite:{}", config.database_path);
        Ok(SqliteConnectOptions::from_str(&url)
            .context("Invalid database path")?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true))
    }

    async fn open(config: &LedgerConfig, create: bool) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(Self::connect_options(config, create)?)
            .await
            .with_context(|| format!("Failed to open database {}", config.database_path))?;
        Ok(Self::new(pool))
    }

    /// Connect to an existing database.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        Self::open(config, false).await
    }

    /// Initialize a database (create if missing + migrate).
    pub async fn init(config: &LedgerConfig) -> Result<Self> {
        let repo = Self::open(config, true).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================
    // Account operations
    // ========================

    /// Get the account projection, if the account has ever been opened.
    pub async fn get_account(&self, account: &AccountRef) -> Result<Option<Account>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        Self::fetch_account(&mut conn, account).await
    }

    /// List all account projections.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM accounts ORDER BY customer_id, merchant_id",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list accounts")?;

        rows.iter().map(Self::row_to_account).collect()
    }

    async fn fetch_account(
        conn: &mut SqliteConnection,
        account: &AccountRef,
    ) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE customer_id = ? AND merchant_id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(account.customer_id.to_string())
        .bind(account.merchant_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch account")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    /// Create the account row with zero balances if it does not exist yet.
    async fn open_account(
        conn: &mut SqliteConnection,
        account: &AccountRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let opened = Account::open(*account, now);
        sqlx::query(
            r#"
            INSERT INTO accounts (customer_id, merchant_id, balance, total_earned, total_spent, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (customer_id, merchant_id) DO NOTHING
            "#,
        )
        .bind(account.customer_id.to_string())
        .bind(account.merchant_id.to_string())
        .bind(opened.balance)
        .bind(opened.total_earned)
        .bind(opened.total_spent)
        .bind(opened.version)
        .bind(timestamp(opened.created_at))
        .bind(timestamp(opened.updated_at))
        .execute(&mut *conn)
        .await
        .context("Failed to open account")?;
        Ok(())
    }

    /// Write the projection only if nobody else moved its version on.
    async fn swap_account(
        conn: &mut SqliteConnection,
        updated: &Account,
        expected_version: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = ?, total_earned = ?, total_spent = ?, version = ?, updated_at = ?
            WHERE customer_id = ? AND merchant_id = ? AND version = ?
            "#,
        )
        .bind(updated.balance)
        .bind(updated.total_earned)
        .bind(updated.total_spent)
        .bind(updated.version)
        .bind(timestamp(updated.updated_at))
        .bind(updated.account.customer_id.to_string())
        .bind(updated.account.merchant_id.to_string())
        .bind(expected_version)
        .execute(&mut *conn)
        .await
        .context("Failed to update account")?;

        if result.rows_affected() != 1 {
            return Err(VersionConflict(updated.account).into());
        }
        Ok(())
    }

    fn row_to_account(row: &SqliteRow) -> Result<Account> {
        let customer_str: String = row.get("customer_id");
        let merchant_str: String = row.get("merchant_id");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Account {
            account: AccountRef::new(
                Uuid::parse_str(&customer_str).context("Invalid customer ID")?,
                Uuid::parse_str(&merchant_str).context("Invalid merchant ID")?,
            ),
            balance: row.get("balance"),
            total_earned: row.get("total_earned"),
            total_spent: row.get("total_spent"),
            version: row.get("version"),
            created_at: parse_timestamp(&created_at_str, "created_at")?,
            updated_at: parse_timestamp(&updated_at_str, "updated_at")?,
        })
    }

    // ========================
    // Append path
    // ========================

    /// Append an entry and move the account projection in one write
    /// transaction. Rule rejections and replays roll back and are reported
    /// through the outcome; storage failures are returned as errors.
    pub async fn append_entry(&self, entry: &LedgerEntry) -> Result<AppendOutcome> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let outcome = Self::append_in_tx(tx.conn()?, entry, Utc::now()).await;

        match outcome {
            Ok(outcome @ AppendOutcome::Committed { .. }) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Ok(outcome) => {
                tx.rollback().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after failed append also failed");
                }
                Err(err)
            }
        }
    }

    async fn append_in_tx(
        conn: &mut SqliteConnection,
        entry: &LedgerEntry,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        if let Some(existing) =
            Self::fetch_entry_by_key(conn, &entry.account, &entry.idempotency_key).await?
        {
            if !existing.matches_request(entry) {
                return Ok(AppendOutcome::KeyReused { existing });
            }
            return Self::replayed(conn, existing).await;
        }

        // A payment is credited once, whatever key it arrives under
        if let Some(payment_ref) = entry.payment_ref.as_deref() {
            if let Some(existing) =
                Self::fetch_entry_by_payment(conn, &entry.account, payment_ref).await?
            {
                if !existing.matches_request(entry) {
                    return Ok(AppendOutcome::PaymentConflict { existing });
                }
                return Self::replayed(conn, existing).await;
            }
        }

        if entry.kind == EntryKind::Deposit {
            Self::open_account(conn, &entry.account, now).await?;
        }

        let Some(account) = Self::fetch_account(conn, &entry.account).await? else {
            // Only debits can reach an account that was never funded
            return Ok(AppendOutcome::Rejected(AppendRejection::Posting(
                PostingError::InsufficientBalance {
                    available: 0,
                    requested: entry.magnitude(),
                },
            )));
        };

        if let Some(original_id) = entry.reverses {
            let original = match Self::fetch_entry(conn, original_id).await? {
                Some(original) if original.account == entry.account => original,
                _ => {
                    return Ok(AppendOutcome::Rejected(AppendRejection::MissingOriginal(
                        original_id,
                    )));
                }
            };
            let already_refunded = Self::sum_refunded(conn, original_id).await?;
            if let Err(err) = validate_refund(&original, entry.magnitude(), already_refunded) {
                return Ok(AppendOutcome::Rejected(AppendRejection::Refund(err)));
            }
        }

        let updated = match account.posted(entry.delta(), now) {
            Ok(updated) => updated,
            Err(err) => return Ok(AppendOutcome::Rejected(AppendRejection::Posting(err))),
        };
        Self::swap_account(conn, &updated, account.version).await?;

        let mut committed = entry.clone();
        committed.sequence = Self::next_sequence(conn).await?;
        committed.created_at = now;
        Self::insert_entry(conn, &committed).await?;

        Ok(AppendOutcome::Committed {
            entry: committed,
            account: updated,
        })
    }

    async fn replayed(conn: &mut SqliteConnection, existing: LedgerEntry) -> Result<AppendOutcome> {
        let account = Self::fetch_account(conn, &existing.account)
            .await?
            .ok_or_else(|| anyhow!("Account {} missing for entry {}", existing.account, existing.id))?;
        Ok(AppendOutcome::Replayed {
            entry: existing,
            account,
        })
    }

    /// Get the next sequence number and increment the counter.
    async fn next_sequence(conn: &mut SqliteConnection) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_counter
            SET value = value + 1
            WHERE name = 'entry_sequence'
            RETURNING value
            "#,
        )
        .fetch_one(&mut *conn)
        .await
        .context("Failed to get next sequence number")?;

        Ok(row.get("value"))
    }

    async fn insert_entry(conn: &mut SqliteConnection, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO entries ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ENTRY_COLUMNS
        ))
        .bind(entry.id.to_string())
        .bind(entry.sequence)
        .bind(entry.account.customer_id.to_string())
        .bind(entry.account.merchant_id.to_string())
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(&entry.description)
        .bind(&entry.related_subscription_id)
        .bind(&entry.payment_ref)
        .bind(entry.reverses.map(|id| id.to_string()))
        .bind(&entry.idempotency_key)
        .bind(timestamp(entry.created_at))
        .execute(&mut *conn)
        .await
        .context("Failed to save entry")?;
        Ok(())
    }

    // ========================
    // Entry queries
    // ========================

    /// Get an entry by ID.
    pub async fn get_entry(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        Self::fetch_entry(&mut conn, id).await
    }

    async fn fetch_entry(conn: &mut SqliteConnection, id: EntryId) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(&format!("SELECT {} FROM entries WHERE id = ?", ENTRY_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch entry")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn fetch_entry_by_key(
        conn: &mut SqliteConnection,
        account: &AccountRef,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM entries WHERE customer_id = ? AND merchant_id = ? AND idempotency_key = ?",
            ENTRY_COLUMNS
        ))
        .bind(account.customer_id.to_string())
        .bind(account.merchant_id.to_string())
        .bind(idempotency_key)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch entry by idempotency key")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn fetch_entry_by_payment(
        conn: &mut SqliteConnection,
        account: &AccountRef,
        payment_ref: &str,
    ) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM entries WHERE customer_id = ? AND merchant_id = ? AND payment_ref = ?",
            ENTRY_COLUMNS
        ))
        .bind(account.customer_id.to_string())
        .bind(account.merchant_id.to_string())
        .bind(payment_ref)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch entry by payment reference")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    /// Look up the entry committed under an idempotency key, if any.
    pub async fn get_entry_by_key(
        &self,
        account: &AccountRef,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        Self::fetch_entry_by_key(&mut conn, account, idempotency_key).await
    }

    /// Look up the deposit that credited a payment, if any.
    pub async fn get_entry_by_payment(
        &self,
        account: &AccountRef,
        payment_ref: &str,
    ) -> Result<Option<LedgerEntry>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        Self::fetch_entry_by_payment(&mut conn, account, payment_ref).await
    }

    async fn sum_refunded(conn: &mut SqliteConnection, original_id: EntryId) -> Result<Minor> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(ABS(amount)), 0) as total
            FROM entries
            WHERE reverses = ?
            "#,
        )
        .bind(original_id.to_string())
        .fetch_one(&mut *conn)
        .await
        .context("Failed to sum refunds")?;

        Ok(row.get("total"))
    }

    /// Get all refunds recorded against an entry, oldest first.
    pub async fn get_refunds_for_entry(&self, id: EntryId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM entries WHERE reverses = ? ORDER BY sequence",
            ENTRY_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to get refunds")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn fetch_account_entries(
        conn: &mut SqliteConnection,
        account: &AccountRef,
    ) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM entries WHERE customer_id = ? AND merchant_id = ? ORDER BY sequence",
            ENTRY_COLUMNS
        ))
        .bind(account.customer_id.to_string())
        .bind(account.merchant_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .context("Failed to load account entries")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// One page of an account's entries, newest first.
    /// `before` restricts the page to entries committed before that sequence.
    pub async fn list_entries_page(
        &self,
        account: &AccountRef,
        kind: Option<EntryKind>,
        from_date: Option<DateTime<Utc>>,
        to_date: Option<DateTime<Utc>>,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let mut query = format!(
            "SELECT {} FROM entries WHERE customer_id = ? AND merchant_id = ?",
            ENTRY_COLUMNS
        );

        let from_date_str = from_date.map(timestamp);
        let to_date_str = to_date.map(timestamp);

        if kind.is_some() {
            query.push_str(" AND kind = ?");
        }
        if from_date.is_some() {
            query.push_str(" AND created_at >= ?");
        }
        if to_date.is_some() {
            query.push_str(" AND created_at <= ?");
        }
        if before.is_some() {
            query.push_str(" AND sequence < ?");
        }
        query.push_str(" ORDER BY sequence DESC LIMIT ?");

        let mut sql_query = sqlx::query(&query)
            .bind(account.customer_id.to_string())
            .bind(account.merchant_id.to_string());

        if let Some(kind) = kind {
            sql_query = sql_query.bind(kind.as_str());
        }
        if let Some(ref fd_str) = from_date_str {
            sql_query = sql_query.bind(fd_str);
        }
        if let Some(ref td_str) = to_date_str {
            sql_query = sql_query.bind(td_str);
        }
        if let Some(sequence) = before {
            sql_query = sql_query.bind(sequence);
        }
        sql_query = sql_query.bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list entries")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    fn row_to_entry(row: &SqliteRow) -> Result<LedgerEntry> {
        let id_str: String = row.get("id");
        let customer_str: String = row.get("customer_id");
        let merchant_str: String = row.get("merchant_id");
        let kind_str: String = row.get("kind");
        let reverses_str: Option<String> = row.get("reverses");
        let created_at_str: String = row.get("created_at");

        Ok(LedgerEntry {
            id: Uuid::parse_str(&id_str).context("Invalid entry ID")?,
            sequence: row.get("sequence"),
            account: AccountRef::new(
                Uuid::parse_str(&customer_str).context("Invalid customer ID")?,
                Uuid::parse_str(&merchant_str).context("Invalid merchant ID")?,
            ),
            kind: EntryKind::from_str(&kind_str)
                .ok_or_else(|| anyhow!("Invalid entry kind: {}", kind_str))?,
            amount: row.get("amount"),
            description: row.get("description"),
            related_subscription_id: row.get("related_subscription_id"),
            payment_ref: row.get("payment_ref"),
            reverses: reverses_str
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .context("Invalid reverses ID")?,
            idempotency_key: row.get("idempotency_key"),
            created_at: parse_timestamp(&created_at_str, "created_at")?,
        })
    }

    // ========================
    // Reconciliation
    // ========================

    /// Compare an account's cached projection with sums over its entries.
    pub async fn reconcile(&self, account: &AccountRef) -> Result<Option<Reconciliation>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        Self::reconcile_on(&mut conn, account).await
    }

    async fn reconcile_on(
        conn: &mut SqliteConnection,
        account: &AccountRef,
    ) -> Result<Option<Reconciliation>> {
        let Some(cached) = Self::fetch_account(conn, account).await? else {
            return Ok(None);
        };

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(amount), 0) as balance,
                COALESCE(SUM(CASE WHEN kind = 'deposit' THEN amount ELSE 0 END), 0) as total_earned,
                COALESCE(SUM(CASE WHEN kind = 'redemption' THEN -amount ELSE 0 END), 0) as total_spent,
                COUNT(*) as entry_count
            FROM entries
            WHERE customer_id = ? AND merchant_id = ?
            "#,
        )
        .bind(account.customer_id.to_string())
        .bind(account.merchant_id.to_string())
        .fetch_one(&mut *conn)
        .await
        .context("Failed to sum entries")?;

        Ok(Some(Reconciliation {
            account: *account,
            cached: cached.totals(),
            recomputed: LedgerTotals {
                balance: row.get("balance"),
                total_earned: row.get("total_earned"),
                total_spent: row.get("total_spent"),
            },
            entry_count: row.get("entry_count"),
        }))
    }

    /// Reconcile every account in a single aggregate query.
    pub async fn reconcile_all(&self) -> Result<Vec<Reconciliation>> {
        let rows = sqlx::query(
            r#"
            SELECT
                a.customer_id, a.merchant_id, a.balance, a.total_earned, a.total_spent,
                COALESCE(e.balance, 0) as sum_balance,
                COALESCE(e.total_earned, 0) as sum_earned,
                COALESCE(e.total_spent, 0) as sum_spent,
                COALESCE(e.entry_count, 0) as entry_count
            FROM accounts a
            LEFT JOIN (
                SELECT
                    customer_id,
                    merchant_id,
                    SUM(amount) as balance,
                    SUM(CASE WHEN kind = 'deposit' THEN amount ELSE 0 END) as total_earned,
                    SUM(CASE WHEN kind = 'redemption' THEN -amount ELSE 0 END) as total_spent,
                    COUNT(*) as entry_count
                FROM entries
                GROUP BY customer_id, merchant_id
            ) e ON e.customer_id = a.customer_id AND e.merchant_id = a.merchant_id
            ORDER BY a.customer_id, a.merchant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to reconcile accounts")?;

        rows.iter()
            .map(|row| {
                let customer_str: String = row.get("customer_id");
                let merchant_str: String = row.get("merchant_id");
                Ok(Reconciliation {
                    account: AccountRef::new(
                        Uuid::parse_str(&customer_str).context("Invalid customer ID")?,
                        Uuid::parse_str(&merchant_str).context("Invalid merchant ID")?,
                    ),
                    cached: LedgerTotals {
                        balance: row.get("balance"),
                        total_earned: row.get("total_earned"),
                        total_spent: row.get("total_spent"),
                    },
                    recomputed: LedgerTotals {
                        balance: row.get("sum_balance"),
                        total_earned: row.get("sum_earned"),
                        total_spent: row.get("sum_spent"),
                    },
                    entry_count: row.get("entry_count"),
                })
            })
            .collect()
    }

    /// Overwrite an account's cached projection with totals recomputed from
    /// its entries, under the write lock. Returns the reconciliation as it
    /// stood before the rebuild.
    pub async fn rebuild_projection(&self, account: &AccountRef) -> Result<Option<Reconciliation>> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let result = Self::rebuild_in_tx(tx.conn()?, account).await;

        match result {
            Ok(Some(before)) => {
                tx.commit().await?;
                Ok(Some(before))
            }
            Ok(None) => {
                tx.rollback().await?;
                Ok(None)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after failed rebuild also failed");
                }
                Err(err)
            }
        }
    }

    async fn rebuild_in_tx(
        conn: &mut SqliteConnection,
        account: &AccountRef,
    ) -> Result<Option<Reconciliation>> {
        let Some(before) = Self::reconcile_on(conn, account).await? else {
            return Ok(None);
        };
        if before.is_consistent() {
            return Ok(Some(before));
        }
        let Some(current) = Self::fetch_account(conn, account).await? else {
            return Ok(None);
        };

        // Replaying in commit order also proves the log never overdrew
        let entries = Self::fetch_account_entries(conn, account).await?;
        let replayed = replay_totals(&entries)
            .map_err(|e| anyhow!("Entry log of {} does not replay cleanly: {}", account, e))?;

        let rebuilt = Account {
            balance: replayed.balance,
            total_earned: replayed.total_earned,
            total_spent: replayed.total_spent,
            version: current.version + 1,
            updated_at: Utc::now(),
            ..current
        };
        Self::swap_account(conn, &rebuilt, current.version).await?;
        Ok(Some(before))
    }

    // ========================
    // Integrity
    // ========================

    /// Get statistics for integrity checking.
    pub async fn get_integrity_stats(&self) -> Result<IntegrityStats> {
        let account_count: i64 = sqlx::query("SELECT COUNT(*) as count FROM accounts")
            .fetch_one(&self.pool)
            .await?
            .get("count");

        let sequence_check = sqlx::query(
            r#"
            SELECT
                MIN(sequence) as min_seq,
                MAX(sequence) as max_seq,
                COUNT(*) as count
            FROM entries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let min_seq: Option<i64> = sequence_check.get("min_seq");
        let max_seq: Option<i64> = sequence_check.get("max_seq");
        let entry_count: i64 = sequence_check.get("count");

        let has_sequence_gaps = match (min_seq, max_seq) {
            (Some(min), Some(max)) => min != 1 || (max - min + 1) != entry_count,
            _ => false,
        };

        // Refunds must carry the sign opposite to the entry they reverse
        let invalid_signs: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count
            FROM entries e
            WHERE (e.kind = 'deposit' AND e.amount <= 0)
               OR (e.kind = 'redemption' AND e.amount >= 0)
               OR (e.kind = 'refund' AND (
                    e.reverses IS NULL
                    OR EXISTS (
                        SELECT 1 FROM entries o
                        WHERE o.id = e.reverses AND (o.amount > 0) = (e.amount > 0)
                    )
               ))
            "#,
        )
        .fetch_one(&self.pool)
        .await?
        .get("count");

        let orphan_entries: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count
            FROM entries e
            WHERE NOT EXISTS (
                SELECT 1 FROM accounts a
                WHERE a.customer_id = e.customer_id AND a.merchant_id = e.merchant_id
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?
        .get("count");

        Ok(IntegrityStats {
            account_count,
            entry_count,
            has_sequence_gaps,
            invalid_signs,
            orphan_entries,
        })
    }

    /// Entries whose cumulative refunds exceed their own magnitude.
    pub async fn find_refund_overages(&self) -> Result<Vec<IntegrityIssue>> {
        let rows = sqlx::query(
            r#"
            SELECT o.id as original_id, ABS(o.amount) as original_amount, SUM(ABS(r.amount)) as refunded
            FROM entries r
            JOIN entries o ON r.reverses = o.id
            GROUP BY o.id
            HAVING SUM(ABS(r.amount)) > ABS(o.amount)
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to check refund totals")?;

        rows.iter()
            .map(|row| {
                let id_str: String = row.get("original_id");
                Ok(IntegrityIssue::RefundOverage {
                    original_id: Uuid::parse_str(&id_str).context("Invalid entry ID")?,
                    original_amount: row.get("original_amount"),
                    refunded: row.get("refunded"),
                })
            })
            .collect()
    }
}
