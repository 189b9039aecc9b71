use super::{EntryId, LedgerEntry, LedgerTotals, Minor, PostingError};

/// Fold entries, in commit order, into account totals.
/// Fails if the running balance would go negative at any point.
pub fn replay_totals(entries: &[LedgerEntry]) -> Result<LedgerTotals, PostingError> {
    let mut ordered: Vec<&LedgerEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.sequence);

    ordered
        .into_iter()
        .try_fold(LedgerTotals::default(), |totals, entry| {
            totals.apply(entry.delta())
        })
}

/// Total magnitude already refunded against an entry.
pub fn total_refunded(original_id: EntryId, entries: &[LedgerEntry]) -> Minor {
    entries
        .iter()
        .filter(|e| e.reverses == Some(original_id))
        .map(|e| e.magnitude())
        .sum()
}

/// Validate a proposed refund against the entry it reverses.
pub fn validate_refund(
    original: &LedgerEntry,
    requested: Minor,
    already_refunded: Minor,
) -> Result<(), RefundError> {
    if original.is_refund() {
        return Err(RefundError::TargetIsRefund {
            original_id: original.id,
        });
    }
    if already_refunded + requested > original.magnitude() {
        return Err(RefundError::ExceedsOriginalAmount {
            original_amount: original.magnitude(),
            already_refunded,
            requested,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundError {
    TargetIsRefund {
        original_id: EntryId,
    },
    ExceedsOriginalAmount {
        original_amount: Minor,
        already_refunded: Minor,
        requested: Minor,
    },
}

impl std::fmt::Display for RefundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefundError::TargetIsRefund { original_id } => {
                write!(f, "Entry {} is itself a refund", original_id)
            }
            RefundError::ExceedsOriginalAmount {
                original_amount,
                already_refunded,
                requested,
            } => {
                write!(
                    f,
                    "Refund of {} would exceed original amount ({}, {} already refunded)",
                    requested, original_amount, already_refunded
                )
            }
        }
    }
}

impl std::error::Error for RefundError {}
