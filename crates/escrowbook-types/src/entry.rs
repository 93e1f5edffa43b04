//! Immutable ledger history entries.
//!
//! Every balance mutation produces a [`LedgerEntry`]. Entries are chained:
//! each carries the SHA-256 hash of its predecessor, so downstream readers
//! (history, dashboards, revenue reporting) can detect tampering.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AccountBalance, AccountId, Currency, EntryId, TradeId};

/// Why funds were credited to an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreditReason {
    /// External deposit into custody.
    Funding,
    /// Buyer's net proceeds from a release.
    TradeProceeds,
    /// Platform fee to the admin account.
    PlatformFee,
    /// Referrer's share of the platform fee.
    ReferralCommission,
    /// Manual operator adjustment.
    Adjustment(String),
}

impl CreditReason {
    /// Whether this credit brings new funds into custody (changes supply)
    /// rather than moving funds between accounts.
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Funding | Self::Adjustment(_))
    }
}

impl std::fmt::Display for CreditReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Funding => write!(f, "FUNDING"),
            Self::TradeProceeds => write!(f, "TRADE_PROCEEDS"),
            Self::PlatformFee => write!(f, "PLATFORM_FEE"),
            Self::ReferralCommission => write!(f, "REFERRAL_COMMISSION"),
            Self::Adjustment(note) => write!(f, "ADJUSTMENT({note})"),
        }
    }
}

/// The mutation an entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Credit(CreditReason),
    Lock,
    Unlock,
    SettleRelease,
    /// Settled funds put back into escrow after a failed release.
    Compensation,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Credit(reason) => write!(f, "CREDIT:{reason}"),
            Self::Lock => write!(f, "LOCK"),
            Self::Unlock => write!(f, "UNLOCK"),
            Self::SettleRelease => write!(f, "SETTLE_RELEASE"),
            Self::Compensation => write!(f, "COMPENSATION"),
        }
    }
}

/// One immutable row of the ledger history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Position in the chain, starting at 0.
    pub sequence: u64,
    pub account: AccountId,
    pub currency: Currency,
    pub kind: EntryKind,
    pub amount: Decimal,
    pub trade_id: Option<TradeId>,
    pub balance_after: AccountBalance,
    /// Version the row carried after this mutation. Orders the entries of
    /// one (account, currency) row even when concurrent writers appended
    /// them to the chain out of order.
    pub row_version: u64,
    pub recorded_at: DateTime<Utc>,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

impl LedgerEntry {
    /// `SHA-256(domain_sep || prev_hash || sequence || account || currency || kind || amount || trade || total || locked || row_version)`
    #[must_use]
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"escrowbook:entry:v1:");
        hasher.update(self.prev_hash);
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.account.0.as_bytes());
        hasher.update(self.currency.as_bytes());
        hasher.update(self.kind.to_string().as_bytes());
        hasher.update(self.amount.to_string().as_bytes());
        if let Some(trade_id) = self.trade_id {
            hasher.update(trade_id.0.as_bytes());
        }
        hasher.update(self.balance_after.total.to_string().as_bytes());
        hasher.update(self.balance_after.locked.to_string().as_bytes());
        hasher.update(self.row_version.to_le_bytes());
        hasher.finalize().into()
    }

    /// Short hex digest for log lines.
    #[must_use]
    pub fn short_hash(&self) -> String {
        hex::encode(&self.hash[..8])
    }
}
