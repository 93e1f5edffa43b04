//! Configuration types for an Escrowbook ledger instance.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, LedgerError, ReferrerTier, Result, constants};

/// Top-level configuration for one ledger process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Account that receives the platform's share of every fee.
    pub admin_account: AccountId,
    /// Fee and referral rates.
    pub fee_policy: FeePolicyConfig,
    /// Per-currency decimal scales.
    pub currencies: Vec<CurrencyConfig>,
    /// Scale for currencies not listed in `currencies`.
    pub default_scale: u32,
    /// Retry behaviour of settlement credit legs.
    pub settlement: SettlementConfig,
    /// Optimistic-update attempts before `StoreContention`.
    pub max_cas_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            admin_account: AccountId::from_bytes([0u8; 16]),
            fee_policy: FeePolicyConfig::default(),
            currencies: vec![
                CurrencyConfig::crypto("BTC"),
                CurrencyConfig::crypto("ETH"),
                CurrencyConfig::crypto("USDT"),
                CurrencyConfig::fiat("USD"),
                CurrencyConfig::fiat("EUR"),
            ],
            default_scale: constants::DEFAULT_SCALE,
            settlement: SettlementConfig::default(),
            max_cas_retries: constants::DEFAULT_MAX_CAS_RETRIES,
        }
    }
}

impl LedgerConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    /// `Serialization` for malformed JSON, `Configuration` for bad values.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field for a usable value.
    ///
    /// # Errors
    /// Returns `Configuration` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.fee_policy.validate()?;
        self.settlement.validate()?;
        if self.max_cas_retries == 0 {
            return Err(LedgerError::Configuration(
                "max_cas_retries must be > 0".into(),
            ));
        }
        if self.default_scale > Decimal::MAX_SCALE {
            return Err(LedgerError::Configuration(format!(
                "default_scale {} exceeds {}",
                self.default_scale,
                Decimal::MAX_SCALE
            )));
        }
        for currency in &self.currencies {
            if currency.code.trim().is_empty() {
                return Err(LedgerError::Configuration(
                    "currency code must not be blank".into(),
                ));
            }
            if currency.scale > Decimal::MAX_SCALE {
                return Err(LedgerError::Configuration(format!(
                    "scale {} for {} exceeds {}",
                    currency.scale,
                    currency.code,
                    Decimal::MAX_SCALE
                )));
            }
        }
        Ok(())
    }

    /// Decimal places used for amounts and fee rounding in `currency`.
    #[must_use]
    pub fn scale_for(&self, currency: &str) -> u32 {
        self.currencies
            .iter()
            .find(|c| c.code == currency)
            .map_or(self.default_scale, |c| c.scale)
    }
}

/// Per-currency precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyConfig {
    pub code: String,
    pub scale: u32,
}

impl CurrencyConfig {
    #[must_use]
    pub fn crypto(code: &str) -> Self {
        Self {
            code: code.to_string(),
            scale: constants::CRYPTO_SCALE,
        }
    }

    #[must_use]
    pub fn fiat(code: &str) -> Self {
        Self {
            code: code.to_string(),
            scale: constants::FIAT_SCALE,
        }
    }
}

/// Platform fee and referral commission rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeePolicyConfig {
    /// Fee charged on a release, in percent (`1` = 1%).
    pub fee_percent: Decimal,
    /// Fraction of the fee paid to a standard-tier referrer.
    pub standard_referral_rate: Decimal,
    /// Fraction of the fee paid to an elevated-tier referrer.
    pub elevated_referral_rate: Decimal,
}

impl Default for FeePolicyConfig {
    fn default() -> Self {
        Self {
            fee_percent: Decimal::from(constants::DEFAULT_FEE_PERCENT),
            standard_referral_rate: Decimal::new(
                i64::from(constants::STANDARD_REFERRAL_RATE_PERCENT),
                2,
            ),
            elevated_referral_rate: Decimal::new(
                i64::from(constants::ELEVATED_REFERRAL_RATE_PERCENT),
                2,
            ),
        }
    }
}

impl FeePolicyConfig {
    /// The commission rate for a referrer tier.
    #[must_use]
    pub fn rate_for(&self, tier: ReferrerTier) -> Decimal {
        match tier {
            ReferrerTier::Standard => self.standard_referral_rate,
            ReferrerTier::Elevated => self.elevated_referral_rate,
        }
    }

    /// # Errors
    /// Returns `Configuration` for out-of-range percentages or rates.
    pub fn validate(&self) -> Result<()> {
        if self.fee_percent < Decimal::ZERO || self.fee_percent > Decimal::ONE_HUNDRED {
            return Err(LedgerError::Configuration(format!(
                "fee_percent {} outside [0, 100]",
                self.fee_percent
            )));
        }
        for (name, rate) in [
            ("standard_referral_rate", self.standard_referral_rate),
            ("elevated_referral_rate", self.elevated_referral_rate),
        ] {
            if rate < Decimal::ZERO || rate > Decimal::ONE {
                return Err(LedgerError::Configuration(format!(
                    "{name} {rate} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Retry settings for settlement credit legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Total attempts per credit leg, including the first.
    pub max_credit_attempts: u32,
    /// Delay before the first retry (milliseconds). Doubles per attempt.
    pub initial_backoff_ms: u64,
    /// Cap on a single retry delay (milliseconds).
    pub max_backoff_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_credit_attempts: constants::DEFAULT_MAX_CREDIT_ATTEMPTS,
            initial_backoff_ms: constants::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: constants::DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl SettlementConfig {
    /// # Errors
    /// Returns `Configuration` for a zero attempt count or inverted backoff bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_credit_attempts == 0 {
            return Err(LedgerError::Configuration(
                "settlement.max_credit_attempts must be > 0".into(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(LedgerError::Configuration(format!(
                "settlement.initial_backoff_ms {} exceeds max_backoff_ms {}",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = LedgerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.fee_policy.fee_percent, Decimal::ONE);
        assert_eq!(cfg.fee_policy.rate_for(ReferrerTier::Standard), Decimal::new(20, 2));
        assert_eq!(cfg.fee_policy.rate_for(ReferrerTier::Elevated), Decimal::new(50, 2));
    }

    #[test]
    fn scale_lookup() {
        let cfg = LedgerConfig::default();
        assert_eq!(cfg.scale_for("BTC"), 8);
        assert_eq!(cfg.scale_for("EUR"), 2);
        assert_eq!(cfg.scale_for("DOGE"), constants::DEFAULT_SCALE);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = LedgerConfig::from_json_str(
            r#"{ "fee_policy": { "fee_percent": "0.5" }, "max_cas_retries": 8 }"#,
        )
        .unwrap();
        assert_eq!(cfg.fee_policy.fee_percent, Decimal::new(5, 1));
        assert_eq!(cfg.fee_policy.standard_referral_rate, Decimal::new(20, 2));
        assert_eq!(cfg.max_cas_retries, 8);
        assert_eq!(cfg.settlement.max_credit_attempts, 3);
    }

    #[test]
    fn rejects_fee_over_hundred() {
        let err = LedgerConfig::from_json_str(r#"{ "fee_policy": { "fee_percent": "101" } }"#)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Configuration(_)));
    }

    #[test]
    fn rejects_referral_rate_over_one() {
        let mut cfg = LedgerConfig::default();
        cfg.fee_policy.elevated_referral_rate = Decimal::new(15, 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut cfg = LedgerConfig::default();
        cfg.settlement.max_credit_attempts = 0;
        assert!(matches!(cfg.validate(), Err(LedgerError::Configuration(_))));
    }

    #[test]
    fn rejects_scale_beyond_decimal_range() {
        let mut cfg = LedgerConfig::default();
        cfg.currencies.push(CurrencyConfig {
            code: "WEI".into(),
            scale: 29,
        });
        assert!(matches!(cfg.validate(), Err(LedgerError::Configuration(_))));

        let mut cfg = LedgerConfig::default();
        cfg.default_scale = 29;
        assert!(matches!(cfg.validate(), Err(LedgerError::Configuration(_))));
        cfg.default_scale = 28;
        cfg.validate().unwrap();
    }

    #[test]
    fn malformed_json_is_serialization_error() {
        let err = LedgerConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, LedgerError::Serialization(_)));
    }

    #[test]
    fn config_serde_roundtrip() {
        let cfg = LedgerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back = LedgerConfig::from_json_str(&json).unwrap();
        assert_eq!(cfg.admin_account, back.admin_account);
        assert_eq!(cfg.currencies, back.currencies);
        assert_eq!(cfg.fee_policy.fee_percent, back.fee_policy.fee_percent);
    }
}
