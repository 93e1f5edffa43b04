//! # escrowbook-ledger
//!
//! **Balance plane**: the only component that mutates balance rows.
//!
//! ## Architecture
//!
//! - [`BalanceStore`]: per-(account, currency) rows with a versioned
//!   compare-and-swap as the sole write primitive
//! - [`Ledger`]: Credit / Lock / Unlock / SettleRelease, each a
//!   read → check → conditional-swap loop that keeps `total >= locked >= 0`
//! - [`EscrowLog`]: one record per locked trade; every escrow operation
//!   consults it before touching a row, which makes retries safe
//! - [`LedgerHistory`]: append-only hash-chained record of every mutation
//! - [`SupplyConservation`]: Σ totals must equal Σ external credits
//!
//! ## Row invariant
//!
//! ```text
//! total >= locked >= 0        available = total - locked (derived)
//! ```

pub mod escrow_log;
pub mod history;
pub mod ledger;
pub mod store;
pub mod supply;

pub use escrow_log::EscrowLog;
pub use history::LedgerHistory;
pub use ledger::{EscrowReceipt, Ledger};
pub use store::{BalanceStore, InMemoryBalanceStore, VersionedBalance};
pub use supply::SupplyConservation;
