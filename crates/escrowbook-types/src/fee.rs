//! Fee and referral-commission types.
//!
//! A release of `gross_amount` is divided into the counterparty's net and a
//! platform fee; the fee is further divided between an optional referrer
//! and the admin account.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, Currency, TradeId};

/// Referral programme tier of the referrer attached to a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferrerTier {
    /// Default commission rate.
    Standard,
    /// Higher commission rate for promoted referrers.
    Elevated,
}

impl std::fmt::Display for ReferrerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "STANDARD"),
            Self::Elevated => write!(f, "ELEVATED"),
        }
    }
}

/// An active referrer that earns part of the platform fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referral {
    pub account: AccountId,
    pub tier: ReferrerTier,
}

/// Output of the pure fee computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAmounts {
    pub fee_amount: Decimal,
    pub net_to_counterparty: Decimal,
    pub referrer_commission: Decimal,
    pub admin_net: Decimal,
}

impl SplitAmounts {
    /// `fee + net == gross` and `commission + admin == fee`.
    #[must_use]
    pub fn is_exact(&self, gross_amount: Decimal) -> bool {
        self.fee_amount + self.net_to_counterparty == gross_amount
            && self.referrer_commission + self.admin_net == self.fee_amount
    }
}

/// Persisted audit record of the split applied to one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub trade_id: TradeId,
    pub gross_amount: Decimal,
    pub fee_amount: Decimal,
    pub net_to_counterparty: Decimal,
    pub referrer_commission: Decimal,
    pub admin_net: Decimal,
    pub currency: Currency,
    pub referrer: Option<Referral>,
}

impl FeeSplit {
    #[must_use]
    pub fn new(
        trade_id: TradeId,
        gross_amount: Decimal,
        currency: &str,
        referrer: Option<Referral>,
        amounts: SplitAmounts,
    ) -> Self {
        Self {
            trade_id,
            gross_amount,
            fee_amount: amounts.fee_amount,
            net_to_counterparty: amounts.net_to_counterparty,
            referrer_commission: amounts.referrer_commission,
            admin_net: amounts.admin_net,
            currency: currency.to_string(),
            referrer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactness_check() {
        let amounts = SplitAmounts {
            fee_amount: Decimal::new(1, 4),
            net_to_counterparty: Decimal::new(99, 4),
            referrer_commission: Decimal::ZERO,
            admin_net: Decimal::new(1, 4),
        };
        assert!(amounts.is_exact(Decimal::new(1, 2)));
        assert!(!amounts.is_exact(Decimal::new(2, 2)));
    }

    #[test]
    fn tier_display() {
        assert_eq!(ReferrerTier::Standard.to_string(), "STANDARD");
        assert_eq!(ReferrerTier::Elevated.to_string(), "ELEVATED");
    }
}
