//! Error types for the Escrowbook ledger.
//!
//! All errors use the `LG_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Request validation errors
//! - 2xx: Balance errors
//! - 3xx: Escrow log errors
//! - 4xx: Trade lifecycle errors
//! - 5xx: Idempotency errors
//! - 6xx: Settlement errors
//! - 7xx: Storage errors
//! - 9xx: General / internal errors

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{AccountId, EscrowState, IdempotencyKey, TradeId, TradeState};

/// Central error enum for all Escrowbook operations.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    // =================================================================
    // Request Errors (1xx)
    // =================================================================
    /// Amount is non-positive or carries more decimals than the currency allows.
    #[error("LG_ERR_100: Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    /// The request is structurally invalid.
    #[error("LG_ERR_101: Invalid request: {reason}")]
    InvalidRequest { reason: String },

    // =================================================================
    // Balance Errors (2xx)
    // =================================================================
    /// No balance row exists for this (account, currency).
    #[error("LG_ERR_200: Balance not found for {account} in {currency}")]
    BalanceNotFound { account: AccountId, currency: String },

    /// Not enough available balance to lock.
    #[error("LG_ERR_201: Insufficient available balance: need {needed}, have {available}")]
    InsufficientAvailable { needed: Decimal, available: Decimal },

    /// Not enough locked balance to unlock or settle.
    #[error("LG_ERR_202: Insufficient locked balance: need {needed}, have {locked}")]
    InsufficientLocked { needed: Decimal, locked: Decimal },

    /// A balance row failed `total >= locked >= 0`. Critical.
    #[error("LG_ERR_203: Balance invariant violation: {reason}")]
    InvariantViolation { reason: String },

    /// Σ totals for a currency diverged from Σ external credits. Critical.
    #[error("LG_ERR_204: Supply invariant violation: {reason}")]
    SupplyInvariantViolation { reason: String },

    // =================================================================
    // Escrow Log Errors (3xx)
    // =================================================================
    /// Release/unlock of a trade that is not (or no longer) locked,
    /// or a second lock for the same trade.
    #[error("LG_ERR_300: Invalid escrow transition for {trade_id}: {reason}")]
    InvalidTransition { trade_id: TradeId, reason: String },

    /// The caller's (account, currency, amount) disagree with the locked record.
    #[error("LG_ERR_301: Escrow mismatch for {trade_id}: {reason}")]
    EscrowMismatch { trade_id: TradeId, reason: String },

    /// The escrow record is in an unexpected state for this operation.
    #[error("LG_ERR_302: Escrow for {trade_id} is {state}")]
    EscrowState { trade_id: TradeId, state: EscrowState },

    // =================================================================
    // Trade Errors (4xx)
    // =================================================================
    /// No trade record exists for this ID.
    #[error("LG_ERR_400: Trade not found: {0}")]
    TradeNotFound(TradeId),

    /// The trade state machine forbids this move.
    #[error("LG_ERR_401: Trade {trade_id} cannot move from {from} to {to}")]
    InvalidTradeTransition {
        trade_id: TradeId,
        from: TradeState,
        to: TradeState,
    },

    // =================================================================
    // Idempotency Errors (5xx)
    // =================================================================
    /// Another request with this key is still running its creation step.
    #[error("LG_ERR_500: Request with idempotency key {0} is still in flight")]
    IdempotencyInFlight(IdempotencyKey),

    // =================================================================
    // Settlement Errors (6xx)
    // =================================================================
    /// Multi-step release failed; compensation ran. Needs an operator.
    #[error("LG_ERR_600: Settlement failed for {trade_id}: {reason}")]
    SettlementFailed { trade_id: TradeId, reason: String },

    // =================================================================
    // Storage Errors (7xx)
    // =================================================================
    /// The backing store failed. May succeed on retry.
    #[error("LG_ERR_700: Storage error: {0}")]
    Storage(String),

    /// Optimistic update kept losing the race past the retry bound.
    #[error("LG_ERR_701: Store contention on {account}/{currency} after {attempts} attempts")]
    StoreContention {
        account: AccountId,
        currency: String,
        attempts: u32,
    },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("LG_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("LG_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, missing fields, etc.).
    #[error("LG_ERR_902: Configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    /// Whether a retry of the same call could succeed.
    ///
    /// Business-rule failures (shortages, invalid transitions) never are:
    /// retrying a failed precondition does not change the shortage.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::StoreContention { .. })
    }

    /// Integrity failures that indicate a prior bug or a tampered record.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::EscrowMismatch { .. }
                | Self::InvariantViolation { .. }
                | Self::SupplyInvariantViolation { .. }
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, LedgerError>;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_available_display() {
        let err = LedgerError::InsufficientAvailable {
            needed: Decimal::new(100, 2),
            available: Decimal::new(30, 2),
        };
        let msg = format!("{err}");
        assert!(msg.starts_with("LG_ERR_201"), "Got: {msg}");
        assert!(msg.contains("1.00"));
        assert!(msg.contains("0.30"));
    }

    #[test]
    fn invalid_trade_transition_display() {
        let err = LedgerError::InvalidTradeTransition {
            trade_id: TradeId::new(),
            from: TradeState::Released,
            to: TradeState::Cancelled,
        };
        let msg = format!("{err}");
        assert!(msg.contains("LG_ERR_401"));
        assert!(msg.contains("RELEASED"));
        assert!(msg.contains("CANCELLED"));
    }

    #[test]
    fn only_storage_failures_are_transient() {
        assert!(LedgerError::Storage("timeout".into()).is_transient());
        assert!(
            LedgerError::StoreContention {
                account: AccountId::new(),
                currency: "BTC".into(),
                attempts: 3,
            }
            .is_transient()
        );
        assert!(
            !LedgerError::InsufficientAvailable {
                needed: Decimal::ONE,
                available: Decimal::ZERO,
            }
            .is_transient()
        );
        assert!(
            !LedgerError::InvalidTransition {
                trade_id: TradeId::new(),
                reason: "terminal".into(),
            }
            .is_transient()
        );
    }

    #[test]
    fn all_errors_have_lg_err_prefix() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(LedgerError::InvalidAmount { reason: "zero".into() }),
            Box::new(LedgerError::TradeNotFound(TradeId::new())),
            Box::new(LedgerError::Internal("test".into())),
            Box::new(LedgerError::SettlementFailed {
                trade_id: TradeId::new(),
                reason: "buyer leg".into(),
            }),
            Box::new(LedgerError::EscrowState {
                trade_id: TradeId::new(),
                state: EscrowState::Released,
            }),
        ];
        for err in errors {
            let msg = format!("{err}");
            assert!(msg.starts_with("LG_ERR_"), "Error missing LG_ERR_ prefix: {msg}");
        }
    }
}
