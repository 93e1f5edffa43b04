//! # escrowbook-settlement
//!
//! **Settlement plane**: trade creation, release, cancellation and refund
//! on top of the balance ledger.
//!
//! ## Architecture
//!
//! The [`SettlementOrchestrator`] receives caller requests and:
//! 1. Deduplicates trade creation by idempotency key ([`IdempotencyGuard`])
//! 2. Locks the seller's escrow when a trade opens
//! 3. Splits the gross amount into net, platform fee and referral
//!    commission ([`fee_splitter`])
//! 4. Debits the seller, then credits buyer, admin and referrer, retrying
//!    transient failures ([`RetryPolicy`])
//! 5. Compensates a failed buyer credit and records every failure needing
//!    an operator in the [`IncidentLog`]

pub mod fee_splitter;
pub mod idempotency;
pub mod incident;
pub mod orchestrator;
pub mod retry;

pub use fee_splitter::{FeePolicyProvider, StaticFeePolicy};
pub use idempotency::{BeginTradeOutcome, IdempotencyGuard};
pub use incident::{Incident, IncidentKind, IncidentLog};
pub use orchestrator::{CreditLeg, OutstandingCredit, SettlementOrchestrator};
pub use retry::RetryPolicy;
