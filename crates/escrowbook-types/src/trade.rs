//! Trade lifecycle types.
//!
//! ## State Machine
//!
//! ```text
//!   CREATED ──▶ ESCROW_LOCKED ──▶ PAYMENT_MARKED ──▶ RELEASED
//!      │              │  │               │
//!      │              │  └──▶ DISPUTED ◀─┘
//!      ▼              ▼          │
//!   CANCELLED ◀───────┘          ├──▶ RELEASED
//!                                └──▶ REFUNDED
//! ```
//!
//! Transitions are forward-only. RELEASED, CANCELLED and REFUNDED are terminal.
//! A dispute may also be raised after payment is marked. The one backward
//! move is [`TradeRecord::reinstate_escrow`], taken only when a failed
//! release is compensated and the escrow is LOCKED again.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, Currency, LedgerError, Referral, Result, TradeId};

/// Where a trade is in its settlement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeState {
    Created,
    EscrowLocked,
    PaymentMarked,
    Disputed,
    Released,
    Cancelled,
    Refunded,
}

impl TradeState {
    /// Can a trade move from this state to `target`?
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        use TradeState::{
            Cancelled, Created, Disputed, EscrowLocked, PaymentMarked, Refunded, Released,
        };
        matches!(
            (self, target),
            (Created, EscrowLocked | Cancelled)
                | (EscrowLocked, PaymentMarked | Disputed | Released | Cancelled)
                | (PaymentMarked, Released | Disputed)
                | (Disputed, Released | Refunded)
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Cancelled | Self::Refunded)
    }
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::EscrowLocked => write!(f, "ESCROW_LOCKED"),
            Self::PaymentMarked => write!(f, "PAYMENT_MARKED"),
            Self::Disputed => write!(f, "DISPUTED"),
            Self::Released => write!(f, "RELEASED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Refunded => write!(f, "REFUNDED"),
        }
    }
}

/// A trade as tracked by the settlement orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub seller: AccountId,
    pub buyer: AccountId,
    pub currency: Currency,
    /// Escrowed quantity; the gross amount of the eventual release.
    pub amount: Decimal,
    pub referrer: Option<Referral>,
    pub state: TradeState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    #[must_use]
    pub fn new(
        id: TradeId,
        seller: AccountId,
        buyer: AccountId,
        currency: &str,
        amount: Decimal,
        referrer: Option<Referral>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            seller,
            buyer,
            currency: currency.to_string(),
            amount,
            referrer,
            state: TradeState::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the trade forward.
    ///
    /// # Errors
    /// Returns `InvalidTradeTransition` if the state machine forbids it.
    pub fn advance(&mut self, target: TradeState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(LedgerError::InvalidTradeTransition {
                trade_id: self.id,
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Return the trade to ESCROW_LOCKED after a compensated release.
    ///
    /// # Errors
    /// Returns `InvalidTradeTransition` unless the trade holds an escrow
    /// (ESCROW_LOCKED, PAYMENT_MARKED or DISPUTED).
    pub fn reinstate_escrow(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            TradeState::EscrowLocked | TradeState::PaymentMarked | TradeState::Disputed
        ) {
            return Err(LedgerError::InvalidTradeTransition {
                trade_id: self.id,
                from: self.state,
                to: TradeState::EscrowLocked,
            });
        }
        self.state = TradeState::EscrowLocked;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// What a completed release paid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub trade_id: TradeId,
    pub currency: Currency,
    pub fee_amount: Decimal,
    pub net_to_buyer: Decimal,
    pub admin_net: Decimal,
    pub referrer_commission: Decimal,
    pub settled_at: DateTime<Utc>,
}

/// What a cancellation (or refund) returned to the seller.
///
/// The caller uses `unlocked_amount` to return quantity to the open offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub trade_id: TradeId,
    pub seller: AccountId,
    pub currency: Currency,
    pub unlocked_amount: Decimal,
    pub final_state: TradeState,
}
