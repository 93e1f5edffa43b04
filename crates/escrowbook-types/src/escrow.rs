//! # EscrowRecord: one row per successful lock
//!
//! ## State Machine
//!
//! ```text
//!   ┌────────┐  settlement   ┌──────────┐
//!   │ LOCKED ├──────────────▶│ RELEASED │
//!   └───┬────┘               └──────────┘
//!       │ cancel/refund
//!       ▼
//!   ┌──────────┐
//!   │ UNLOCKED │
//!   └──────────┘
//! ```
//!
//! Transitions are monotonic and terminal. A record that reached RELEASED
//! can never release again, which is what makes a retried release safe.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, Currency, LedgerError, Result, TradeId};

/// The lifecycle state of an escrow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowState {
    /// Funds are held for the trade.
    Locked,
    /// Funds left the seller's custody at trade completion.
    Released,
    /// Funds returned to the seller's available balance.
    Unlocked,
}

impl EscrowState {
    /// Can a record move from this state to `target`?
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!((self, target), (Self::Locked, Self::Released | Self::Unlocked))
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Locked)
    }
}

impl std::fmt::Display for EscrowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "LOCKED"),
            Self::Released => write!(f, "RELEASED"),
            Self::Unlocked => write!(f, "UNLOCKED"),
        }
    }
}

/// Audit row for the escrow held on behalf of a single trade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowRecord {
    pub trade_id: TradeId,
    /// The account whose funds are held (the seller).
    pub account_id: AccountId,
    pub currency: Currency,
    pub amount: Decimal,
    pub state: EscrowState,
    pub created_at: DateTime<Utc>,
    /// Set once, when the record reaches a terminal state.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscrowRecord {
    /// A fresh LOCKED record.
    #[must_use]
    pub fn locked(trade_id: TradeId, account_id: AccountId, currency: &str, amount: Decimal) -> Self {
        Self {
            trade_id,
            account_id,
            currency: currency.to_string(),
            amount,
            state: EscrowState::Locked,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Whether `(account, currency, amount)` describe this escrow.
    #[must_use]
    pub fn matches(&self, account: AccountId, currency: &str, amount: Decimal) -> bool {
        self.account_id == account && self.currency == currency && self.amount == amount
    }

    /// Explain how a caller's parameters disagree with this record.
    #[must_use]
    pub fn mismatch(&self, account: AccountId, currency: &str, amount: Decimal) -> LedgerError {
        LedgerError::EscrowMismatch {
            trade_id: self.trade_id,
            reason: format!(
                "record holds {} {} for {}, request named {} {} for {}",
                self.amount, self.currency, self.account_id, amount, currency, account
            ),
        }
    }

    /// Move to a terminal state.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the record is already terminal.
    pub fn transition(&mut self, target: EscrowState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(LedgerError::InvalidTransition {
                trade_id: self.trade_id,
                reason: format!("cannot move escrow from {} to {}", self.state, target),
            });
        }
        self.state = target;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}
