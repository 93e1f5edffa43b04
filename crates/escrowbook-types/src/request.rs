//! Typed request structures accepted at the ledger boundary.
//!
//! Requests are validated here, before any business logic runs, so the
//! ledger itself only ever sees positive, correctly-scaled amounts.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, CreditReason, Currency, IdempotencyKey, LedgerError, Referral, Result, TradeId};

/// Reject non-positive amounts and amounts finer than `scale` decimals.
///
/// # Errors
/// Returns `InvalidAmount`.
pub fn validate_amount(amount: Decimal, scale: u32) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount {
            reason: format!("amount {amount} must be positive"),
        });
    }
    if amount.normalize().scale() > scale {
        return Err(LedgerError::InvalidAmount {
            reason: format!("amount {amount} has more than {scale} decimal places"),
        });
    }
    Ok(())
}

fn validate_currency(currency: &str) -> Result<()> {
    if currency.trim().is_empty() {
        return Err(LedgerError::InvalidRequest {
            reason: "currency must not be blank".into(),
        });
    }
    Ok(())
}

/// `Credit(account, currency, amount, reason)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditRequest {
    pub account: AccountId,
    pub currency: Currency,
    pub amount: Decimal,
    pub reason: CreditReason,
}

impl CreditRequest {
    /// # Errors
    /// Returns `InvalidRequest` or `InvalidAmount`.
    pub fn validate(&self, scale: u32) -> Result<()> {
        validate_currency(&self.currency)?;
        validate_amount(self.amount, scale)
    }
}

/// `Lock` / `Unlock` / `SettleRelease` against one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRequest {
    pub account: AccountId,
    pub currency: Currency,
    pub amount: Decimal,
    pub trade_id: TradeId,
}

impl EscrowRequest {
    /// # Errors
    /// Returns `InvalidRequest` or `InvalidAmount`.
    pub fn validate(&self, scale: u32) -> Result<()> {
        validate_currency(&self.currency)?;
        validate_amount(self.amount, scale)
    }
}

/// `Release(trade_id, seller, buyer, currency, gross_amount, fee_percent, referrer?)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub trade_id: TradeId,
    pub seller: AccountId,
    pub buyer: AccountId,
    pub currency: Currency,
    pub gross_amount: Decimal,
    /// Fee in percent of `gross_amount` (`1` = 1%).
    pub fee_percent: Decimal,
    pub referrer: Option<Referral>,
}

impl ReleaseRequest {
    /// # Errors
    /// Returns `InvalidRequest` or `InvalidAmount`.
    pub fn validate(&self, scale: u32) -> Result<()> {
        validate_currency(&self.currency)?;
        validate_amount(self.gross_amount, scale)?;
        if self.seller == self.buyer {
            return Err(LedgerError::InvalidRequest {
                reason: "seller and buyer must differ".into(),
            });
        }
        if self.fee_percent < Decimal::ZERO || self.fee_percent > Decimal::ONE_HUNDRED {
            return Err(LedgerError::InvalidRequest {
                reason: format!("fee_percent {} outside [0, 100]", self.fee_percent),
            });
        }
        if let Some(referral) = &self.referrer {
            if referral.account == self.seller || referral.account == self.buyer {
                return Err(LedgerError::InvalidRequest {
                    reason: "referrer must not be a trade party".into(),
                });
            }
        }
        Ok(())
    }
}

/// Parameters of `BeginTrade(idempotency_key, params)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginTradeRequest {
    pub idempotency_key: IdempotencyKey,
    pub seller: AccountId,
    pub buyer: AccountId,
    pub currency: Currency,
    /// Quantity moved into escrow from the seller.
    pub amount: Decimal,
    pub referrer: Option<Referral>,
}

impl BeginTradeRequest {
    /// # Errors
    /// Returns `InvalidRequest` or `InvalidAmount`.
    pub fn validate(&self, scale: u32) -> Result<()> {
        validate_currency(&self.currency)?;
        validate_amount(self.amount, scale)?;
        if self.seller == self.buyer {
            return Err(LedgerError::InvalidRequest {
                reason: "seller and buyer must differ".into(),
            });
        }
        Ok(())
    }
}
