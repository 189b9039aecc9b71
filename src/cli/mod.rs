use std::fs::File;
use std::io::{self, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::application::{
    EntryCursor, EntryFilter, LedgerError, LedgerReceipt, LedgerService, LogNotifier,
};
use crate::config::LedgerConfig;
use crate::domain::{AccountRef, EntryKind, PaymentRef, format_minor, parse_minor};
use crate::io::{Exporter, IngestOptions, PaymentIngester};

/// Balance Builder - prepaid credit ledger
#[derive(Parser)]
#[command(name = "balance-builder")]
#[command(about = "Merchant-scoped prepaid balances with an append-only audit trail")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "BALANCE_BUILDER_DB", default_value = "balance-builder.db")]
    pub database: String,

    /// Enable verbose output (debug logging unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Attempts per mutation before a busy database is reported
    #[arg(long, env = "BALANCE_BUILDER_MAX_ATTEMPTS", default_value = "3", global = true)]
    pub max_attempts: u32,

    /// How long to wait on the database write lock, in milliseconds
    #[arg(long, env = "BALANCE_BUILDER_BUSY_TIMEOUT_MS", default_value = "5000", global = true)]
    pub busy_timeout_ms: u64,

    #[command(subcommand)]
    pub command: Commands,
}

/// Identifies the customer/merchant account a command works on.
#[derive(clap::Args, Clone, Copy)]
pub struct AccountArgs {
    /// Customer ID (UUID)
    #[arg(long)]
    pub customer: Uuid,

    /// Merchant ID (UUID)
    #[arg(long)]
    pub merchant: Uuid,
}

impl AccountArgs {
    fn account(&self) -> AccountRef {
        AccountRef::new(self.customer, self.merchant)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Credit a successful subscription payment to a balance
    Deposit {
        /// Amount (e.g., "80.00" or "80")
        amount: String,

        #[command(flatten)]
        account: AccountArgs,

        /// Payment processor event or charge ID
        #[arg(long)]
        payment_ref: String,

        /// Subscription the payment belongs to
        #[arg(long)]
        subscription: Option<String>,

        /// Idempotency key (defaults to one derived from the payment reference)
        #[arg(long)]
        key: Option<String>,
    },

    /// Charge a balance for a service rendered
    Redeem {
        /// Amount (e.g., "35.00")
        amount: String,

        #[command(flatten)]
        account: AccountArgs,

        /// What the customer is being charged for
        #[arg(short, long)]
        description: String,

        /// Idempotency key; reuse it when retrying the same redemption
        #[arg(long)]
        key: String,
    },

    /// Refund all or part of an earlier entry
    Refund {
        /// Entry ID to refund
        id: String,

        /// Amount to refund (omit to refund everything still refundable)
        #[arg(short, long)]
        amount: Option<String>,

        /// Reason for the refund
        #[arg(short, long)]
        description: String,

        /// Idempotency key; reuse it when retrying the same refund
        #[arg(long)]
        key: String,
    },

    /// Show balance for an account, or all accounts
    Balance {
        /// Customer ID (omit together with --merchant for all accounts)
        #[arg(long, requires = "merchant")]
        customer: Option<Uuid>,

        /// Merchant ID
        #[arg(long, requires = "customer")]
        merchant: Option<Uuid>,
    },

    /// List an account's entries, newest first
    History {
        #[command(flatten)]
        account: AccountArgs,

        /// Filter by kind: deposit, redemption, refund
        #[arg(long)]
        kind: Option<String>,

        /// Filter from date (YYYY-MM-DD)
        #[arg(long)]
        from_date: Option<String>,

        /// Filter to date (YYYY-MM-DD, inclusive)
        #[arg(long)]
        to_date: Option<String>,

        /// Page size
        #[arg(short, long)]
        limit: Option<usize>,

        /// Continue from a cursor printed by a previous page
        #[arg(long)]
        before: Option<i64>,
    },

    /// Show detailed entry information
    Show {
        /// Entry ID
        id: String,
    },

    /// Apply payment events (newline-delimited JSON) as deposits
    Ingest {
        /// Input file (stdin if omitted)
        #[arg(short, long)]
        input: Option<String>,

        /// Classify events without applying them
        #[arg(long)]
        dry_run: bool,
    },

    /// Export an account's history
    Export {
        #[command(flatten)]
        account: AccountArgs,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,

        /// Format: csv, json
        #[arg(short, long, default_value = "csv")]
        format: String,
    },

    /// Compare an account's cached balance with its entry log
    Reconcile {
        #[command(flatten)]
        account: AccountArgs,

        /// Rewrite the cached balance from the entry log if they differ
        #[arg(long)]
        repair: bool,
    },

    /// Verify ledger integrity across all accounts
    Check,
}

/// Install the global tracing subscriber, writing to stderr.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to initialize logging")
}

impl Cli {
    fn config(&self) -> LedgerConfig {
        LedgerConfig::new(&self.database)
            .with_max_attempts(self.max_attempts)
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
    }

    async fn connect(&self) -> Result<LedgerService> {
        let service = LedgerService::connect(self.config())
            .await
            .with_context(|| format!("Cannot open {} (run `balance-builder init` first?)", self.database))?;
        Ok(service.with_notifier(Arc::new(LogNotifier)))
    }

    pub async fn run(self) -> Result<()> {
        if let Commands::Init = self.command {
            LedgerService::init(self.config()).await?;
            println!("Database initialized: {}", self.database);
            return Ok(());
        }

        let service = self.connect().await?;
        let result = self.dispatch(&service).await;
        service.close().await;
        result
    }

    async fn dispatch(self, service: &LedgerService) -> Result<()> {
        match self.command {
            Commands::Init => unreachable!("handled before connecting"),

            Commands::Deposit {
                amount,
                account,
                payment_ref,
                subscription,
                key,
            } => {
                let amount = parse_minor(&amount).context("Invalid amount format. Use '80.00' or '80'")?;
                let mut payment = PaymentRef::new(payment_ref);
                if let Some(sub) = subscription {
                    payment = payment.with_subscription(sub);
                }
                let key = key.unwrap_or_else(|| payment.idempotency_key());

                let receipt = service
                    .deposit(account.account(), amount, &payment, &key)
                    .await
                    .map_err(explain)?;
                print_receipt("Deposited", &receipt);
            }

            Commands::Redeem {
                amount,
                account,
                description,
                key,
            } => {
                let amount = parse_minor(&amount).context("Invalid amount format. Use '35.00' or '35'")?;
                let receipt = service
                    .redeem(account.account(), amount, &description, &key)
                    .await
                    .map_err(explain)?;
                print_receipt("Redeemed", &receipt);
            }

            Commands::Refund {
                id,
                amount,
                description,
                key,
            } => {
                let entry_id = Uuid::parse_str(&id).context("Invalid entry ID format (expected UUID)")?;
                let receipt = match amount {
                    Some(a) => {
                        let amount = parse_minor(&a).context("Invalid amount format for refund")?;
                        service.refund(entry_id, amount, &description, &key).await
                    }
                    None => service.refund_remaining(entry_id, &description, &key).await,
                }
                .map_err(explain)?;
                print_receipt("Refunded", &receipt);
            }

            Commands::Balance { customer, merchant } => match customer.zip(merchant) {
                Some((customer, merchant)) => {
                    let balance = service
                        .get_balance(AccountRef::new(customer, merchant))
                        .await
                        .map_err(explain)?;
                    println!("Account:  {}", balance.account);
                    println!("Balance:  {}", format_minor(balance.balance));
                    println!("Earned:   {}", format_minor(balance.total_earned));
                    println!("Spent:    {}", format_minor(balance.total_spent));
                    match balance.updated_at {
                        Some(at) => println!("Updated:  {}", at.format("%Y-%m-%d %H:%M:%S")),
                        None => println!("Updated:  never (no deposits yet)"),
                    }
                }
                None => run_all_balances_command(service).await?,
            },

            Commands::History {
                account,
                kind,
                from_date,
                to_date,
                limit,
                before,
            } => {
                let kind = kind
                    .map(|k| {
                        EntryKind::from_str(&k).with_context(|| {
                            format!("Invalid kind '{}'. Use deposit, redemption or refund", k)
                        })
                    })
                    .transpose()?;
                let filter = EntryFilter {
                    kind,
                    from_date: from_date.map(|d| parse_date(&d)).transpose()?,
                    to_date: to_date.map(|d| parse_end_of_day(&d)).transpose()?,
                    limit,
                    before: before.map(|before_sequence| EntryCursor { before_sequence }),
                };
                run_history_command(service, account.account(), &filter).await?;
            }

            Commands::Show { id } => {
                let entry_id = Uuid::parse_str(&id).context("Invalid entry ID format (expected UUID)")?;
                run_show_command(service, entry_id).await?;
            }

            Commands::Ingest { input, dry_run } => {
                let ingester = PaymentIngester::new(service);
                let options = IngestOptions { dry_run };
                let result = match input {
                    Some(path) => {
                        let file = File::open(&path).with_context(|| format!("Cannot open {}", path))?;
                        ingester.ingest_ndjson(BufReader::new(file), &options).await?
                    }
                    None => ingester.ingest_ndjson(io::stdin().lock(), &options).await?,
                };

                let verb = if dry_run { "Would apply" } else { "Applied" };
                println!(
                    "{}: {}, already applied: {}, skipped: {}, errors: {}",
                    verb,
                    result.applied,
                    result.replayed,
                    result.skipped,
                    result.errors.len()
                );
                for err in &result.errors {
                    println!(
                        "  line {}{}: {}{}",
                        err.line,
                        err.event_id.as_deref().map(|id| format!(" ({})", id)).unwrap_or_default(),
                        err.error,
                        if err.retryable { " [retryable]" } else { "" }
                    );
                }
                if !result.errors.is_empty() {
                    bail!("{} event(s) could not be applied", result.errors.len());
                }
            }

            Commands::Export {
                account,
                output,
                format,
            } => {
                let writer: Box<dyn Write> = match &output {
                    Some(path) => Box::new(File::create(path).with_context(|| format!("Cannot create {}", path))?),
                    None => Box::new(io::stdout().lock()),
                };
                let exporter = Exporter::new(service);
                let count = match format.as_str() {
                    "csv" => {
                        exporter
                            .export_entries_csv(account.account(), EntryFilter::default(), writer)
                            .await?
                    }
                    "json" => exporter.export_statement_json(account.account(), writer).await?,
                    other => bail!("Unknown format '{}'. Use csv or json", other),
                };
                if let Some(path) = output {
                    println!("Exported {} entries to {}", count, path);
                }
            }

            Commands::Reconcile { account, repair } => {
                let account = account.account();
                let rec = if repair {
                    service.rebuild_projection(account).await
                } else {
                    service.reconcile(account).await
                }
                .map_err(explain)?;

                println!("Account:  {}", rec.account);
                println!("Entries:  {}", rec.entry_count);
                println!("               {:>12} {:>12}", "cached", "from log");
                println!(
                    "  Balance:     {:>12} {:>12}",
                    format_minor(rec.cached.balance),
                    format_minor(rec.recomputed.balance)
                );
                println!(
                    "  Earned:      {:>12} {:>12}",
                    format_minor(rec.cached.total_earned),
                    format_minor(rec.recomputed.total_earned)
                );
                println!(
                    "  Spent:       {:>12} {:>12}",
                    format_minor(rec.cached.total_spent),
                    format_minor(rec.recomputed.total_spent)
                );
                match (rec.is_consistent(), repair) {
                    (true, _) => println!("Consistent."),
                    (false, true) => println!("Cached balance rebuilt from the entry log."),
                    (false, false) => bail!("Cached balance disagrees with the entry log (use --repair)"),
                }
            }

            Commands::Check => run_check_command(service).await?,
        }

        Ok(())
    }
}

/// Turn ledger errors into operator-facing messages.
fn explain(err: LedgerError) -> anyhow::Error {
    match &err {
        LedgerError::InsufficientBalance {
            available,
            requested,
        } => anyhow::anyhow!(
            "Insufficient balance: {} available, {} requested (short by {})",
            format_minor(*available),
            format_minor(*requested),
            format_minor(err.shortfall().unwrap_or_default())
        ),
        LedgerError::RefundExceedsOriginal {
            original_id,
            original_amount,
            already_refunded,
            requested,
        } => anyhow::anyhow!(
            "Cannot refund {} against {}: original {}, already refunded {}",
            format_minor(*requested),
            original_id,
            format_minor(*original_amount),
            format_minor(*already_refunded)
        ),
        _ if err.is_retryable() => anyhow::anyhow!(
            "{}. Nothing was applied; retrying with the same --key is safe.",
            err
        ),
        _ => err.into(),
    }
}

fn print_receipt(verb: &str, receipt: &LedgerReceipt) {
    let entry = &receipt.entry;
    if receipt.replayed {
        println!(
            "Already applied (idempotency key '{}'): {} {} ({})",
            entry.idempotency_key,
            entry.kind,
            format_minor(entry.amount),
            entry.id
        );
    } else {
        println!(
            "{} {} for {} ({})",
            verb,
            format_minor(entry.magnitude()),
            entry.account,
            entry.id
        );
    }
    println!("Balance: {}", format_minor(receipt.balance.balance));
}

async fn run_all_balances_command(service: &LedgerService) -> Result<()> {
    let balances = service.list_balances().await?;
    if balances.is_empty() {
        println!("No accounts yet.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<36}  {:>12} {:>12} {:>12}",
        "Customer", "Merchant", "Balance", "Earned", "Spent"
    );
    println!("{}", "-".repeat(114));
    for b in &balances {
        println!(
            "{:<36}  {:<36}  {:>12} {:>12} {:>12}",
            b.account.customer_id,
            b.account.merchant_id,
            format_minor(b.balance),
            format_minor(b.total_earned),
            format_minor(b.total_spent)
        );
    }
    Ok(())
}

async fn run_history_command(
    service: &LedgerService,
    account: AccountRef,
    filter: &EntryFilter,
) -> Result<()> {
    let page = service.list_entries(account, filter).await?;

    if page.entries.is_empty() {
        println!("No entries found.");
        return Ok(());
    }

    println!(
        "{:<6} {:<16} {:<10} {:>12}  {:<32}  ID",
        "Seq", "Date", "Kind", "Amount", "Description"
    );
    println!("{}", "-".repeat(118));
    for entry in &page.entries {
        println!(
            "{:<6} {:<16} {:<10} {:>12}  {:<32}  {}",
            entry.sequence,
            entry.created_at.format("%Y-%m-%d %H:%M"),
            entry.kind,
            format_minor(entry.amount),
            truncate(&entry.description, 32),
            entry.id
        );
    }

    if let Some(next) = page.next {
        println!();
        println!("More entries: --before {}", next.before_sequence);
    }
    Ok(())
}

async fn run_show_command(service: &LedgerService, entry_id: Uuid) -> Result<()> {
    let detail = service.get_entry(entry_id).await.map_err(explain)?;
    let entry = &detail.entry;

    println!("Entry: {}", entry.id);
    println!("  Sequence:    {}", entry.sequence);
    println!("  Kind:        {}", entry.kind);
    println!("  Amount:      {}", format_minor(entry.amount));
    println!("  Account:     {}", entry.account);
    println!("  Description: {}", entry.description);
    if let Some(sub) = &entry.related_subscription_id {
        println!("  Subscription: {}", sub);
    }
    if let Some(payment) = &entry.payment_ref {
        println!("  Payment ref: {}", payment);
    }
    println!("  Key:         {}", entry.idempotency_key);
    println!(
        "  Recorded at: {}",
        entry.created_at.format("%Y-%m-%d %H:%M:%S")
    );

    if let Some(original) = entry.reverses {
        println!();
        println!("  This is a refund of: {}", original);
    }

    if !detail.refunds.is_empty() {
        println!();
        println!("  Refund status:");
        println!("    Refunded:   {}", format_minor(detail.total_refunded));
        println!("    Refundable: {}", format_minor(detail.refundable));
        println!("    Refunds:");
        for refund in &detail.refunds {
            println!(
                "      - {} on {} ({})",
                format_minor(refund.magnitude()),
                refund.created_at.format("%Y-%m-%d"),
                refund.id
            );
        }
    }

    Ok(())
}

async fn run_check_command(service: &LedgerService) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = service.check_integrity().await?;

    println!("Accounts:    {}", report.account_count);
    println!("Entries:     {}", report.entry_count);
    println!("Outstanding: {}", format_minor(report.total_outstanding));
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        bail!("Ledger integrity check failed");
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

/// Last representable instant of the given day, so `--to-date` is inclusive.
fn parse_end_of_day(date_str: &str) -> Result<DateTime<Utc>> {
    let start = parse_date(date_str)?;
    Ok(start + chrono::Duration::days(1) - chrono::Duration::microseconds(1))
}

fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    let naive_date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}'. Use YYYY-MM-DD", date_str))?;

    let naive_datetime = naive_date
        .and_hms_opt(0, 0, 0)
        .context("Failed to build midnight timestamp")?;
    Ok(naive_datetime.and_utc())
}
