//! Supply conservation invariant checker.
//!
//! ```text
//! ∀ currency: Σ total == Σ external credits (funding + adjustments)
//! ```
//!
//! Settlement only moves funds between accounts: the seller's settled
//! amount reappears as buyer net + admin fee + referral commission. If the
//! sums ever diverge, money was created or destroyed.

use dashmap::DashMap;
use escrowbook_types::{Currency, LedgerError, Result};
use rust_decimal::Decimal;

/// Tracks per-currency external inflows.
#[derive(Debug, Default)]
pub struct SupplyConservation {
    external: DashMap<Currency, Decimal>,
}

impl SupplyConservation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record funds entering custody from outside the ledger.
    ///
    /// # Errors
    /// Returns `InvalidAmount` if the currency's supply would overflow.
    pub fn record_external(&self, currency: &str, amount: Decimal) -> Result<()> {
        let mut supply = self
            .external
            .entry(currency.to_string())
            .or_insert(Decimal::ZERO);
        let current = *supply;
        *supply = current
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount {
                reason: format!("{currency} supply {current} + {amount} overflows"),
            })?;
        Ok(())
    }

    /// Withdraw an inflow recorded for a credit that did not land.
    pub fn revert_external(&self, currency: &str, amount: Decimal) {
        if let Some(mut supply) = self.external.get_mut(currency) {
            *supply -= amount;
        }
    }

    /// Expected Σ total for a currency.
    #[must_use]
    pub fn expected_supply(&self, currency: &str) -> Decimal {
        self.external
            .get(currency)
            .map_or(Decimal::ZERO, |total| *total)
    }

    /// Compare the observed supply against the expected one.
    ///
    /// # Errors
    /// Returns [`LedgerError::SupplyInvariantViolation`] if actual ≠ expected.
    pub fn verify(&self, currency: &str, actual_supply: Decimal) -> Result<()> {
        let expected = self.expected_supply(currency);
        if actual_supply != expected {
            return Err(LedgerError::SupplyInvariantViolation {
                reason: format!(
                    "{currency}: actual supply {actual_supply} != expected {expected}"
                ),
            });
        }
        Ok(())
    }

    /// Every currency that has seen an external credit.
    #[must_use]
    pub fn tracked_currencies(&self) -> Vec<Currency> {
        let mut currencies: Vec<Currency> =
            self.external.iter().map(|entry| entry.key().clone()).collect();
        currencies.sort();
        currencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_supply_is_zero() {
        let sc = SupplyConservation::new();
        assert_eq!(sc.expected_supply("BTC"), Decimal::ZERO);
        assert!(sc.verify("BTC", Decimal::ZERO).is_ok());
    }

    #[test]
    fn external_credits_accumulate() {
        let sc = SupplyConservation::new();
        sc.record_external("USDT", Decimal::new(1000, 0)).unwrap();
        sc.record_external("USDT", Decimal::new(500, 0)).unwrap();
        assert_eq!(sc.expected_supply("USDT"), Decimal::new(1500, 0));
    }

    #[test]
    fn overflowing_inflow_is_rejected() {
        let sc = SupplyConservation::new();
        sc.record_external("BTC", Decimal::MAX).unwrap();
        assert!(matches!(
            sc.record_external("BTC", Decimal::ONE),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert_eq!(sc.expected_supply("BTC"), Decimal::MAX);
        sc.revert_external("BTC", Decimal::MAX);
        assert_eq!(sc.expected_supply("BTC"), Decimal::ZERO);
    }

    #[test]
    fn verify_fails_when_imbalanced() {
        let sc = SupplyConservation::new();
        sc.record_external("BTC", Decimal::new(10, 0)).unwrap();
        let err = sc.verify("BTC", Decimal::new(11, 0)).unwrap_err();
        assert!(matches!(err, LedgerError::SupplyInvariantViolation { .. }));
    }

    #[test]
    fn currencies_independent() {
        let sc = SupplyConservation::new();
        sc.record_external("BTC", Decimal::new(5, 0)).unwrap();
        sc.record_external("EUR", Decimal::new(50_000, 0)).unwrap();
        assert!(sc.verify("BTC", Decimal::new(5, 0)).is_ok());
        assert!(sc.verify("EUR", Decimal::new(50_000, 0)).is_ok());
        assert_eq!(sc.tracked_currencies(), vec!["BTC".to_string(), "EUR".to_string()]);
    }
}
