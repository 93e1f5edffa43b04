//! Fee and referral-commission splitter.
//!
//! ```text
//! fee        = round(gross × fee_percent / 100)
//! net        = gross − fee
//! commission = round(fee × tier_rate)        (0 without a referrer)
//! admin      = fee − commission
//! ```
//!
//! Only the fee and the commission are rounded; the other two parts are
//! remainders, so `fee + net == gross` and `commission + admin == fee` hold
//! exactly for every input. Rounding is banker's rounding at the currency
//! scale.

use escrowbook_types::{FeePolicyConfig, LedgerError, ReferrerTier, Result, SplitAmounts};
use rust_decimal::{Decimal, RoundingStrategy};

/// Source of the current fee percent and referral tier rates.
pub trait FeePolicyProvider: Send + Sync {
    /// Fee in percent of the gross amount (`1` = 1%).
    fn fee_percent(&self, currency: &str) -> Decimal;

    /// Fraction of the fee paid to a referrer of `tier`.
    fn referral_rate(&self, tier: ReferrerTier) -> Decimal;
}

/// Policy backed by fixed configuration values.
#[derive(Debug, Clone, Default)]
pub struct StaticFeePolicy {
    config: FeePolicyConfig,
}

impl StaticFeePolicy {
    /// # Errors
    /// Returns `Configuration` if a rate is out of range.
    pub fn new(config: FeePolicyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl FeePolicyProvider for StaticFeePolicy {
    fn fee_percent(&self, _currency: &str) -> Decimal {
        self.config.fee_percent
    }

    fn referral_rate(&self, tier: ReferrerTier) -> Decimal {
        self.config.rate_for(tier)
    }
}

fn round(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven)
}

fn overflow(what: &str) -> LedgerError {
    LedgerError::InvalidAmount {
        reason: format!("{what} overflows decimal range"),
    }
}

/// `Split(gross_amount, fee_percent, referral_rate?)` at `scale` decimals.
///
/// # Errors
/// `InvalidRequest` for a negative gross, a fee percent outside
/// `[0, 100]` or a referral rate outside `[0, 1]`.
pub fn split(
    gross_amount: Decimal,
    fee_percent: Decimal,
    referral_rate: Option<Decimal>,
    scale: u32,
) -> Result<SplitAmounts> {
    if gross_amount < Decimal::ZERO {
        return Err(LedgerError::InvalidRequest {
            reason: format!("gross amount {gross_amount} is negative"),
        });
    }
    if fee_percent < Decimal::ZERO || fee_percent > Decimal::ONE_HUNDRED {
        return Err(LedgerError::InvalidRequest {
            reason: format!("fee_percent {fee_percent} outside [0, 100]"),
        });
    }

    let raw_fee = gross_amount
        .checked_mul(fee_percent)
        .ok_or_else(|| overflow("fee"))?
        / Decimal::ONE_HUNDRED;
    let fee_amount = round(raw_fee, scale);
    let net_to_counterparty = gross_amount - fee_amount;

    let referrer_commission = match referral_rate {
        Some(rate) if rate < Decimal::ZERO || rate > Decimal::ONE => {
            return Err(LedgerError::InvalidRequest {
                reason: format!("referral rate {rate} outside [0, 1]"),
            });
        }
        Some(rate) => round(
            fee_amount.checked_mul(rate).ok_or_else(|| overflow("commission"))?,
            scale,
        ),
        None => Decimal::ZERO,
    };

    Ok(SplitAmounts {
        fee_amount,
        net_to_counterparty,
        referrer_commission,
        admin_net: fee_amount - referrer_commission,
    })
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn one_percent_of_small_btc_trade() {
        let s = split(d("0.01"), d("1.0"), None, 8).unwrap();
        assert_eq!(s.fee_amount, d("0.0001"));
        assert_eq!(s.net_to_counterparty, d("0.0099"));
        assert_eq!(s.admin_net, d("0.0001"));
        assert_eq!(s.referrer_commission, Decimal::ZERO);
    }

    #[test]
    fn standard_referrer_takes_twenty_percent_of_fee() {
        let s = split(d("250"), d("1"), Some(d("0.20")), 2).unwrap();
        assert_eq!(s.fee_amount, d("2.50"));
        assert_eq!(s.referrer_commission, d("0.50"));
        assert_eq!(s.admin_net, d("2.00"));
        assert_eq!(s.net_to_counterparty, d("247.50"));
    }

    #[test]
    fn elevated_referrer_takes_half() {
        let s = split(d("1"), d("1"), Some(d("0.5")), 8).unwrap();
        assert_eq!(s.referrer_commission, d("0.005"));
        assert_eq!(s.admin_net, d("0.005"));
    }

    #[test]
    fn midpoint_rounds_to_even() {
        // 0.50 × 1% = 0.005 → 0.00 at fiat scale
        assert_eq!(split(d("0.50"), d("1"), None, 2).unwrap().fee_amount, d("0.00"));
        // 1.50 × 1% = 0.015 → 0.02
        assert_eq!(split(d("1.50"), d("1"), None, 2).unwrap().fee_amount, d("0.02"));
        // 2.50 × 1% = 0.025 → 0.02
        assert_eq!(split(d("2.50"), d("1"), None, 2).unwrap().fee_amount, d("0.02"));
    }

    #[test]
    fn zero_fee_goes_entirely_to_counterparty() {
        let s = split(d("3.3"), Decimal::ZERO, Some(d("0.2")), 8).unwrap();
        assert_eq!(s.fee_amount, Decimal::ZERO);
        assert_eq!(s.net_to_counterparty, d("3.3"));
        assert_eq!(s.admin_net, Decimal::ZERO);
    }

    #[test]
    fn rejects_out_of_range_inputs() {
        assert!(split(d("1"), d("101"), None, 8).is_err());
        assert!(split(d("1"), d("-1"), None, 8).is_err());
        assert!(split(d("-1"), d("1"), None, 8).is_err());
        assert!(split(d("1"), d("1"), Some(d("1.5")), 8).is_err());
    }

    #[test]
    fn randomized_splits_are_exact() {
        let mut rng = rand::thread_rng();
        for _ in 0..5_000 {
            let scale = if rng.gen_bool(0.5) { 8 } else { 2 };
            let gross = Decimal::new(rng.gen_range(1..10_000_000_000_i64), scale);
            let fee_percent = Decimal::new(rng.gen_range(0..=10_000_i64), 2);
            let rate = if rng.gen_bool(0.5) {
                Some(Decimal::new(rng.gen_range(0..=100_i64), 2))
            } else {
                None
            };
            let s = split(gross, fee_percent, rate, scale).unwrap();
            assert!(s.is_exact(gross), "{gross} @ {fee_percent}% → {s:?}");
            assert!(s.fee_amount.scale() <= scale);
            assert!(s.net_to_counterparty >= Decimal::ZERO);
            assert!(s.admin_net >= Decimal::ZERO);
        }
    }

    #[test]
    fn no_drift_across_many_releases() {
        let gross = d("0.12345679");
        let mut paid_out = Decimal::ZERO;
        for _ in 0..10_000 {
            let s = split(gross, d("0.75"), Some(d("0.2")), 8).unwrap();
            paid_out += s.net_to_counterparty + s.admin_net + s.referrer_commission;
        }
        assert_eq!(paid_out, gross * Decimal::from(10_000));
    }

    #[test]
    fn static_policy_reads_config() {
        let policy = StaticFeePolicy::new(FeePolicyConfig::default()).unwrap();
        assert_eq!(policy.fee_percent("BTC"), Decimal::ONE);
        assert_eq!(policy.referral_rate(ReferrerTier::Standard), d("0.20"));
        assert_eq!(policy.referral_rate(ReferrerTier::Elevated), d("0.50"));
    }
}
