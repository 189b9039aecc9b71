use thiserror::Error;

use crate::domain::{AccountRef, EntryId, Minor};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient balance: {available} available, {requested} requested")]
    InsufficientBalance { available: Minor, requested: Minor },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Idempotency key '{key}' was already used for a different operation (entry {existing})")]
    IdempotencyKeyReused { key: String, existing: EntryId },

    #[error("Payment '{payment_ref}' was already credited with different details (entry {existing})")]
    PaymentConflict { payment_ref: String, existing: EntryId },

    #[error("Refund of {requested} would exceed original amount ({original_amount}, {already_refunded} already refunded)")]
    RefundExceedsOriginal {
        original_id: EntryId,
        original_amount: Minor,
        already_refunded: Minor,
        requested: Minor,
    },

    #[error("Entry {0} is a refund and cannot itself be refunded")]
    InvalidRefundTarget(EntryId),

    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountRef),

    #[error("Ledger store unavailable after {attempts} attempt(s), try again")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Database error: {0}")]
    Store(#[from] anyhow::Error),
}

impl LedgerError {
    /// Transient failures are safe to retry with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StoreUnavailable { .. })
    }

    /// How much more balance a rejected redemption would have needed.
    pub fn shortfall(&self) -> Option<Minor> {
        match self {
            LedgerError::InsufficientBalance {
                available,
                requested,
            } => Some(requested - available),
            _ => None,
        }
    }
}
