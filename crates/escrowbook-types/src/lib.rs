//! # escrowbook-types
//!
//! Shared types, errors, and configuration for the **Escrowbook** ledger.
//!
//! This crate is the leaf dependency of the workspace; every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`AccountId`], [`TradeId`], [`EntryId`], [`IdempotencyKey`]
//! - **Balance model**: [`AccountBalance`], [`BalanceKey`], [`Currency`]
//! - **Escrow model**: [`EscrowRecord`], [`EscrowState`]
//! - **Fee model**: [`FeeSplit`], [`SplitAmounts`], [`ReferrerTier`], [`Referral`]
//! - **Trade model**: [`TradeRecord`], [`TradeState`], [`ReleaseOutcome`]
//! - **History model**: [`LedgerEntry`], [`EntryKind`], [`CreditReason`]
//! - **Requests**: typed, boundary-validated request structures
//! - **Configuration**: [`LedgerConfig`], [`FeePolicyConfig`], [`SettlementConfig`]
//! - **Errors**: [`LedgerError`] with `LG_ERR_` prefix codes
//! - **Constants**: scales, default rates and retry bounds

pub mod balance;
pub mod config;
pub mod constants;
pub mod entry;
pub mod error;
pub mod escrow;
pub mod fee;
pub mod ids;
pub mod request;
pub mod trade;

// Re-export all primary types at crate root for ergonomic imports:
//   use escrowbook_types::{AccountBalance, EscrowRecord, LedgerError, ...};

pub use balance::*;
pub use config::*;
pub use entry::*;
pub use error::*;
pub use escrow::*;
pub use fee::*;
pub use ids::*;
pub use request::*;
pub use trade::*;

// Constants are accessed via `escrowbook_types::constants::FOO`
// (not re-exported to avoid name collisions).
