use serde::{Deserialize, Serialize};

use super::{AccountRef, EntryId, LedgerTotals, Minor};

/// Cached account projection compared against totals recomputed from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub account: AccountRef,
    pub cached: LedgerTotals,
    pub recomputed: LedgerTotals,
    pub entry_count: i64,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.cached == self.recomputed
    }

    pub fn balance_drift(&self) -> Minor {
        self.cached.balance - self.recomputed.balance
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityIssue {
    ProjectionMismatch(Reconciliation),
    NegativeBalance { account: AccountRef, balance: Minor },
    SequenceGaps,
    InvalidSigns { count: i64 },
    RefundOverage {
        original_id: EntryId,
        original_amount: Minor,
        refunded: Minor,
    },
    OrphanEntries { count: i64 },
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::ProjectionMismatch(r) => write!(
                f,
                "Account {} caches balance {} / earned {} / spent {} but its entries sum to {} / {} / {}",
                r.account,
                r.cached.balance,
                r.cached.total_earned,
                r.cached.total_spent,
                r.recomputed.balance,
                r.recomputed.total_earned,
                r.recomputed.total_spent
            ),
            IntegrityIssue::NegativeBalance { account, balance } => {
                write!(f, "Account {} has negative balance {}", account, balance)
            }
            IntegrityIssue::SequenceGaps => write!(f, "Entry sequence numbers have gaps"),
            IntegrityIssue::InvalidSigns { count } => {
                write!(f, "{} entries have an amount sign that contradicts their kind", count)
            }
            IntegrityIssue::RefundOverage {
                original_id,
                original_amount,
                refunded,
            } => write!(
                f,
                "Entry {} has {} refunded against an original of {}",
                original_id, refunded, original_amount
            ),
            IntegrityIssue::OrphanEntries { count } => {
                write!(f, "{} entries reference a missing account", count)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub account_count: i64,
    pub entry_count: i64,
    pub total_outstanding: Minor,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Raw counts gathered by the repository for an integrity check.
#[derive(Debug, Clone, Default)]
pub struct IntegrityStats {
    pub account_count: i64,
    pub entry_count: i64,
    pub has_sequence_gaps: bool,
    pub invalid_signs: i64,
    pub orphan_entries: i64,
}

pub fn build_integrity_report(
    stats: &IntegrityStats,
    reconciliations: &[Reconciliation],
    refund_overages: Vec<IntegrityIssue>,
) -> IntegrityReport {
    let mut issues = Vec::new();

    for r in reconciliations {
        if r.cached.balance < 0 {
            issues.push(IntegrityIssue::NegativeBalance {
                account: r.account,
                balance: r.cached.balance,
            });
        }
        if !r.is_consistent() {
            issues.push(IntegrityIssue::ProjectionMismatch(r.clone()));
        }
    }
    if stats.has_sequence_gaps {
        issues.push(IntegrityIssue::SequenceGaps);
    }
    if stats.invalid_signs > 0 {
        issues.push(IntegrityIssue::InvalidSigns {
            count: stats.invalid_signs,
        });
    }
    if stats.orphan_entries > 0 {
        issues.push(IntegrityIssue::OrphanEntries {
            count: stats.orphan_entries,
        });
    }
    issues.extend(refund_overages);

    IntegrityReport {
        account_count: stats.account_count,
        entry_count: stats.entry_count,
        total_outstanding: reconciliations.iter().map(|r| r.cached.balance).sum(),
        issues,
    }
}
