//! Balance tracking types for the Escrowbook ledger.
//!
//! Every (account, currency) row stores a `total` and a `locked` amount.
//! `available` is always derived as `total - locked` and never stored.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, LedgerError, Result};

/// Type alias for currency codes (e.g., "BTC", "USDT", "EUR").
pub type Currency = String;

/// Primary key of a balance row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BalanceKey {
    pub account: AccountId,
    pub currency: Currency,
}

impl BalanceKey {
    #[must_use]
    pub fn new(account: AccountId, currency: &str) -> Self {
        Self {
            account,
            currency: currency.to_string(),
        }
    }
}

impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.currency)
    }
}

/// A single balance row for an (account, currency) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountBalance {
    /// Everything the account holds in custody.
    pub total: Decimal,
    /// Portion of `total` held in escrow for open trades.
    pub locked: Decimal,
}

impl AccountBalance {
    /// Create a zero balance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total: Decimal::ZERO,
            locked: Decimal::ZERO,
        }
    }

    /// Spendable balance (`total - locked`).
    #[must_use]
    pub fn available(&self) -> Decimal {
        self.total - self.locked
    }

    /// Whether this row holds nothing at all.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.total.is_zero() && self.locked.is_zero()
    }

    /// Check `total >= locked >= 0`.
    ///
    /// # Errors
    /// Returns `InvariantViolation` describing the broken bound.
    pub fn check_invariant(&self) -> Result<()> {
        if self.locked < Decimal::ZERO {
            return Err(LedgerError::InvariantViolation {
                reason: format!("locked {} is negative", self.locked),
            });
        }
        if self.total < self.locked {
            return Err(LedgerError::InvariantViolation {
                reason: format!("total {} below locked {}", self.total, self.locked),
            });
        }
        Ok(())
    }

    /// The row after crediting `amount` to `total`.
    ///
    /// # Errors
    /// Returns `InvalidAmount` if `total` would leave the decimal range.
    pub fn credited(&self, amount: Decimal) -> Result<Self> {
        Ok(Self {
            total: checked_sum(self.total, amount, "total")?,
            locked: self.locked,
        })
    }

    /// The row after locking `amount`, or `InsufficientAvailable`.
    pub fn locked_by(&self, amount: Decimal) -> Result<Self> {
        // An overflowing sum is necessarily above `total`.
        match self.locked.checked_add(amount) {
            Some(locked) if locked <= self.total => Ok(Self {
                total: self.total,
                locked,
            }),
            _ => Err(LedgerError::InsufficientAvailable {
                needed: amount,
                available: self.available(),
            }),
        }
    }

    /// The row after unlocking `amount`, or `InsufficientLocked`.
    pub fn unlocked_by(&self, amount: Decimal) -> Result<Self> {
        if self.locked < amount {
            return Err(LedgerError::InsufficientLocked {
                needed: amount,
                locked: self.locked,
            });
        }
        Ok(Self {
            total: self.total,
            locked: self.locked - amount,
        })
    }

    /// The row after `amount` leaves custody out of escrow.
    pub fn settled_by(&self, amount: Decimal) -> Result<Self> {
        if self.locked < amount {
            return Err(LedgerError::InsufficientLocked {
                needed: amount,
                locked: self.locked,
            });
        }
        Ok(Self {
            total: self.total - amount,
            locked: self.locked - amount,
        })
    }

    /// The row after `amount` re-enters custody directly into escrow.
    ///
    /// # Errors
    /// Returns `InvalidAmount` if either field would leave the decimal range.
    pub fn restored_by(&self, amount: Decimal) -> Result<Self> {
        Ok(Self {
            total: checked_sum(self.total, amount, "total")?,
            locked: checked_sum(self.locked, amount, "locked")?,
        })
    }
}

fn checked_sum(current: Decimal, amount: Decimal, field: &str) -> Result<Decimal> {
    current
        .checked_add(amount)
        .ok_or_else(|| LedgerError::InvalidAmount {
            reason: format!("{field} {current} + {amount} overflows"),
        })
}

impl Default for AccountBalance {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{total: {}, locked: {}, available: {}}}",
            self.total,
            self.locked,
            self.available()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bal(total: i64, locked: i64) -> AccountBalance {
        AccountBalance {
            total: Decimal::new(total, 2),
            locked: Decimal::new(locked, 2),
        }
    }

    #[test]
    fn default_is_zero() {
        let b = AccountBalance::default();
        assert!(b.is_zero());
        assert_eq!(b.available(), Decimal::ZERO);
        assert!(b.check_invariant().is_ok());
    }

    #[test]
    fn available_is_derived() {
        let b = bal(10_000, 2_500);
        assert_eq!(b.available(), Decimal::new(7_500, 2));
    }

    #[test]
    fn lock_respects_total() {
        let b = bal(100, 0);
        let locked = b.locked_by(Decimal::new(100, 2)).unwrap();
        assert_eq!(locked.available(), Decimal::ZERO);
        let err = locked.locked_by(Decimal::new(1, 2)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAvailable { .. }));
    }

    #[test]
    fn unlock_requires_locked() {
        let b = bal(100, 40);
        assert_eq!(b.unlocked_by(Decimal::new(40, 2)).unwrap(), bal(100, 0));
        let err = b.unlocked_by(Decimal::new(41, 2)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientLocked { .. }));
    }

    #[test]
    fn settle_reduces_total_and_locked() {
        let b = bal(100, 40);
        let after = b.settled_by(Decimal::new(40, 2)).unwrap();
        assert_eq!(after, bal(60, 0));
        assert_eq!(after.available(), b.available());
    }

    #[test]
    fn restore_inverts_settle() {
        let b = bal(100, 40);
        let amount = Decimal::new(40, 2);
        assert_eq!(b.settled_by(amount).unwrap().restored_by(amount).unwrap(), b);
    }

    #[test]
    fn overflow_is_an_error_not_a_panic() {
        let full = AccountBalance {
            total: Decimal::MAX,
            locked: Decimal::ZERO,
        };
        assert!(matches!(
            full.credited(Decimal::ONE),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            full.restored_by(Decimal::ONE),
            Err(LedgerError::InvalidAmount { .. })
        ));

        let fully_locked = AccountBalance {
            total: Decimal::MAX,
            locked: Decimal::MAX,
        };
        assert!(matches!(
            fully_locked.locked_by(Decimal::MAX),
            Err(LedgerError::InsufficientAvailable { .. })
        ));
    }

    #[test]
    fn invariant_detects_overlock() {
        let b = bal(10, 20);
        assert!(matches!(
            b.check_invariant(),
            Err(LedgerError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn balance_serde_roundtrip() {
        let b = bal(12_345, 678);
        let json = serde_json::to_string(&b).unwrap();
        let back: AccountBalance = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }
}
