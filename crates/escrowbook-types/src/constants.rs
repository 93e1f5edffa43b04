//! System-wide constants for the Escrowbook ledger.

/// Decimal places for crypto assets.
pub const CRYPTO_SCALE: u32 = 8;

/// Decimal places for fiat currencies.
pub const FIAT_SCALE: u32 = 2;

/// Scale applied to currencies with no explicit configuration.
pub const DEFAULT_SCALE: u32 = CRYPTO_SCALE;

/// Default platform fee, in percent of the gross release.
pub const DEFAULT_FEE_PERCENT: u32 = 1;

/// Standard referral tier: share of the fee, in percent.
pub const STANDARD_REFERRAL_RATE_PERCENT: u32 = 20;

/// Elevated referral tier: share of the fee, in percent.
pub const ELEVATED_REFERRAL_RATE_PERCENT: u32 = 50;

/// Attempts per settlement credit leg before it counts as failed.
pub const DEFAULT_MAX_CREDIT_ATTEMPTS: u32 = 3;

/// First retry delay for a settlement credit leg (milliseconds).
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 10;

/// Upper bound on a single retry delay (milliseconds).
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 500;

/// Optimistic-update attempts before `StoreContention` is surfaced.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 256;

/// Longest accepted idempotency key, in bytes.
pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 128;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "Escrowbook";
