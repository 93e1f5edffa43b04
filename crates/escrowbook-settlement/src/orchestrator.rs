//! Trade settlement orchestrator.
//!
//! Sequences the multi-account mutations of a trade's lifecycle on top of
//! the [`Ledger`]:
//!
//! ```text
//! open_trade   BeginTrade(key) → Lock(seller)                 → ESCROW_LOCKED
//! release      (1) SettleRelease(seller, gross)   never retried
//!              (2) Credit(buyer, net)              retried, else compensate
//!              (3) Credit(admin, admin_net)        retried, else outstanding
//!              (4) Credit(referrer, commission)    retried, else outstanding
//!                                                             → RELEASED
//! cancel       Unlock(seller, amount)  only from ESCROW_LOCKED → CANCELLED
//! refund       Unlock(seller, amount)  only from DISPUTED      → REFUNDED
//! ```
//!
//! Compensation for a failed step (2) puts the settled amount back into
//! the seller's escrow, reinstates the LOCKED escrow record and returns
//! the trade to ESCROW_LOCKED, then surfaces `SettlementFailed`. Funds are never left debited with no
//! matching credit. A completed release is cached per trade id; repeating
//! it returns the cached outcome without touching balances.

use std::sync::Arc;

use chrono::Utc;
use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use escrowbook_ledger::{BalanceStore, Ledger};
use escrowbook_types::{
    AccountId, BeginTradeRequest, CancelOutcome, CreditReason, Currency, FeeSplit, LedgerError,
    ReleaseOutcome, ReleaseRequest, Result, TradeId, TradeRecord, TradeState,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    fee_splitter::{self, FeePolicyProvider, StaticFeePolicy},
    idempotency::{BeginTradeOutcome, IdempotencyGuard},
    incident::{IncidentKind, IncidentLog},
    retry::RetryPolicy,
};

/// One credit of a release, after the seller's debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum CreditLeg {
    Buyer,
    Admin,
    Referrer,
}

impl CreditLeg {
    fn reason(self) -> CreditReason {
        match self {
            Self::Buyer => CreditReason::TradeProceeds,
            Self::Admin => CreditReason::PlatformFee,
            Self::Referrer => CreditReason::ReferralCommission,
        }
    }
}

impl std::fmt::Display for CreditLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buyer => write!(f, "BUYER"),
            Self::Admin => write!(f, "ADMIN"),
            Self::Referrer => write!(f, "REFERRER"),
        }
    }
}

/// A fee credit leg that exhausted its retries and is still owed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutstandingCredit {
    pub trade_id: TradeId,
    pub leg: CreditLeg,
    pub account: AccountId,
    pub currency: Currency,
    pub amount: Decimal,
    /// Failed re-drive rounds since the leg was first recorded.
    pub redrives: u32,
    pub last_error: String,
}

#[derive(Debug, Clone)]
enum ReleaseSlot {
    InFlight,
    Settled(ReleaseOutcome),
}

/// Drives trades from creation to release, cancellation or refund.
pub struct SettlementOrchestrator<S: BalanceStore> {
    ledger: Ledger<S>,
    policy: Arc<dyn FeePolicyProvider>,
    retry: RetryPolicy,
    idempotency: IdempotencyGuard,
    trades: DashMap<TradeId, Arc<Mutex<TradeRecord>>>,
    releases: DashMap<TradeId, ReleaseSlot>,
    fee_splits: DashMap<TradeId, FeeSplit>,
    applied_legs: DashSet<(TradeId, CreditLeg)>,
    outstanding: DashMap<(TradeId, CreditLeg), OutstandingCredit>,
    incidents: IncidentLog,
}

impl<S: BalanceStore> SettlementOrchestrator<S> {
    /// Orchestrator using the ledger's configured fee policy and retry bounds.
    ///
    /// # Errors
    /// Returns `Configuration` if the fee policy is invalid.
    pub fn new(ledger: Ledger<S>) -> Result<Self> {
        let policy = StaticFeePolicy::new(ledger.config().fee_policy.clone())?;
        let retry = RetryPolicy::from(&ledger.config().settlement);
        Ok(Self::with_policy(ledger, Arc::new(policy), retry))
    }

    #[must_use]
    pub fn with_policy(
        ledger: Ledger<S>,
        policy: Arc<dyn FeePolicyProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            policy,
            retry,
            idempotency: IdempotencyGuard::new(),
            trades: DashMap::new(),
            releases: DashMap::new(),
            fee_splits: DashMap::new(),
            applied_legs: DashSet::new(),
            outstanding: DashMap::new(),
            incidents: IncidentLog::new(),
        }
    }

    // =================================================================
    // Trade lifecycle
    // =================================================================

    /// `BeginTrade(idempotency_key, params)`: create a trade and lock the
    /// seller's escrow, at most once per key.
    ///
    /// # Errors
    /// - `InvalidRequest` / `InvalidAmount` for a malformed request
    /// - `InsufficientAvailable` if the seller cannot cover the amount
    /// - `IdempotencyInFlight` if the same key is being processed
    pub fn open_trade(&self, request: &BeginTradeRequest) -> Result<BeginTradeOutcome> {
        request.validate(self.ledger.scale_for(&request.currency))?;
        if let Some(referral) = &request.referrer {
            if referral.account == request.seller || referral.account == request.buyer {
                return Err(LedgerError::InvalidRequest {
                    reason: "referrer must not be a trade party".into(),
                });
            }
        }
        self.idempotency
            .begin_trade(&request.idempotency_key, || self.create_trade(request))
    }

    fn create_trade(&self, request: &BeginTradeRequest) -> Result<TradeId> {
        let mut trade = TradeRecord::new(
            TradeId::new(),
            request.seller,
            request.buyer,
            &request.currency,
            request.amount,
            request.referrer,
        );
        self.ledger
            .lock(trade.seller, &trade.currency, trade.amount, trade.id)?;
        trade.advance(TradeState::EscrowLocked)?;
        info!(
            trade_id = %trade.id,
            seller = %trade.seller,
            buyer = %trade.buyer,
            currency = %trade.currency,
            amount = %trade.amount,
            "Trade opened"
        );
        let trade_id = trade.id;
        self.trades.insert(trade_id, Arc::new(Mutex::new(trade)));
        Ok(trade_id)
    }

    /// Buyer reports the off-ledger payment as sent.
    pub fn mark_payment(&self, trade_id: TradeId) -> Result<TradeRecord> {
        self.advance(trade_id, TradeState::PaymentMarked)
    }

    /// Either party escalates the trade.
    pub fn open_dispute(&self, trade_id: TradeId) -> Result<TradeRecord> {
        self.advance(trade_id, TradeState::Disputed)
    }

    fn advance(&self, trade_id: TradeId, target: TradeState) -> Result<TradeRecord> {
        let handle = self.trade_handle(trade_id)?;
        let mut trade = handle.lock();
        trade.advance(target)?;
        info!(%trade_id, state = %target, "Trade advanced");
        Ok(trade.clone())
    }

    // =================================================================
    // Release
    // =================================================================

    /// `Release(trade_id, seller, buyer, currency, gross_amount,
    /// fee_percent, referrer?)`.
    ///
    /// Works on any escrow LOCKED under `trade_id`. When the trade was
    /// opened through [`open_trade`](Self::open_trade), the request must
    /// match it and the trade moves to RELEASED.
    ///
    /// # Errors
    /// - `InsufficientLocked` / `InvalidTransition` / `EscrowMismatch` from
    ///   the seller leg; nothing was moved
    /// - `SettlementFailed` if the buyer leg failed and compensation ran
    /// - `InvalidTradeTransition` if the trade cannot be released
    pub fn release(&self, request: &ReleaseRequest) -> Result<ReleaseOutcome> {
        request.validate(self.ledger.scale_for(&request.currency))?;
        let trade_id = request.trade_id;
        if let Some(outcome) = self.cached_release(trade_id) {
            debug!(%trade_id, "Release answered from cache");
            return Ok(outcome);
        }

        // The trade lock is held only to read and to advance the state. The
        // release slot serializes concurrent releases of one trade, and a
        // racing cancel loses on the escrow log.
        let handle = self.trades.get(&trade_id).map(|t| Arc::clone(t.value()));
        if let Some(handle) = &handle {
            check_release_matches(&handle.lock(), request)?;
        }

        let outcome = self.execute_release(request)?;

        if let Some(handle) = &handle {
            let mut trade = handle.lock();
            if trade.state != TradeState::Released {
                trade.advance(TradeState::Released)?;
            }
        }
        Ok(outcome)
    }

    /// Release an opened trade at the policy's current fee percent.
    pub fn release_trade(&self, trade_id: TradeId) -> Result<ReleaseOutcome> {
        let request = {
            let handle = self.trade_handle(trade_id)?;
            let trade = handle.lock();
            ReleaseRequest {
                trade_id,
                seller: trade.seller,
                buyer: trade.buyer,
                currency: trade.currency.clone(),
                gross_amount: trade.amount,
                fee_percent: self.policy.fee_percent(&trade.currency),
                referrer: trade.referrer,
            }
        };
        self.release(&request)
    }

    fn cached_release(&self, trade_id: TradeId) -> Option<ReleaseOutcome> {
        self.releases.get(&trade_id).and_then(|slot| match &*slot {
            ReleaseSlot::Settled(outcome) => Some(outcome.clone()),
            ReleaseSlot::InFlight => None,
        })
    }

    fn execute_release(&self, request: &ReleaseRequest) -> Result<ReleaseOutcome> {
        let trade_id = request.trade_id;
        match self.releases.entry(trade_id) {
            Entry::Occupied(slot) => {
                return match slot.get() {
                    ReleaseSlot::Settled(outcome) => Ok(outcome.clone()),
                    ReleaseSlot::InFlight => Err(LedgerError::InvalidTransition {
                        trade_id,
                        reason: "release already in progress".into(),
                    }),
                };
            }
            Entry::Vacant(slot) => {
                slot.insert(ReleaseSlot::InFlight);
            }
        }

        let result = self.run_release(request);
        match &result {
            Ok(outcome) => {
                self.releases
                    .insert(trade_id, ReleaseSlot::Settled(outcome.clone()));
            }
            Err(_) => {
                self.releases.remove(&trade_id);
            }
        }
        result
    }

    fn run_release(&self, request: &ReleaseRequest) -> Result<ReleaseOutcome> {
        let trade_id = request.trade_id;
        let currency = request.currency.as_str();
        let rate = request
            .referrer
            .map(|referral| self.policy.referral_rate(referral.tier));
        let amounts = fee_splitter::split(
            request.gross_amount,
            request.fee_percent,
            rate,
            self.ledger.scale_for(currency),
        )?;

        // (1) Seller leg. A retry here could double-debit; the escrow log's
        // terminal state is what makes a repeated release safe instead.
        let receipt = self
            .ledger
            .settle_release(request.seller, currency, request.gross_amount, trade_id)
            .map_err(|err| self.flag_integrity(trade_id, err))?;
        if receipt.replayed {
            return Err(self.flag_integrity(
                trade_id,
                LedgerError::InvalidTransition {
                    trade_id,
                    reason: "escrow was already released outside settlement".into(),
                },
            ));
        }

        // (2) Buyer leg.
        if let Err(cause) = self.apply_leg(
            trade_id,
            CreditLeg::Buyer,
            request.buyer,
            currency,
            amounts.net_to_counterparty,
        ) {
            return Err(self.compensate(request, &cause));
        }

        // (3) and (4) Fee legs.
        let admin = self.ledger.config().admin_account;
        self.apply_fee_leg(trade_id, CreditLeg::Admin, admin, currency, amounts.admin_net);
        if let Some(referral) = request.referrer {
            self.apply_fee_leg(
                trade_id,
                CreditLeg::Referrer,
                referral.account,
                currency,
                amounts.referrer_commission,
            );
        }

        self.fee_splits.insert(
            trade_id,
            FeeSplit::new(
                trade_id,
                request.gross_amount,
                currency,
                request.referrer,
                amounts,
            ),
        );
        let outcome = ReleaseOutcome {
            trade_id,
            currency: currency.to_string(),
            fee_amount: amounts.fee_amount,
            net_to_buyer: amounts.net_to_counterparty,
            admin_net: amounts.admin_net,
            referrer_commission: amounts.referrer_commission,
            settled_at: Utc::now(),
        };
        info!(
            %trade_id,
            currency,
            gross = %request.gross_amount,
            fee = %outcome.fee_amount,
            net_to_buyer = %outcome.net_to_buyer,
            commission = %outcome.referrer_commission,
            "Trade released"
        );
        Ok(outcome)
    }

    /// Credit one leg at most once per (trade, leg), retrying transient
    /// failures.
    fn apply_leg(
        &self,
        trade_id: TradeId,
        leg: CreditLeg,
        account: AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<()> {
        if amount.is_zero() || self.applied_legs.contains(&(trade_id, leg)) {
            return Ok(());
        }
        self.retry.run(&format!("credit {leg}"), || {
            self.ledger.credit(account, currency, amount, leg.reason())
        })?;
        self.applied_legs.insert((trade_id, leg));
        Ok(())
    }

    fn apply_fee_leg(
        &self,
        trade_id: TradeId,
        leg: CreditLeg,
        account: AccountId,
        currency: &str,
        amount: Decimal,
    ) {
        if let Err(err) = self.apply_leg(trade_id, leg, account, currency, amount) {
            self.incidents.record(
                IncidentKind::OutstandingCredit,
                Some(trade_id),
                format!("{leg} credit of {amount} {currency} to {account} outstanding: {err}"),
            );
            self.outstanding.insert(
                (trade_id, leg),
                OutstandingCredit {
                    trade_id,
                    leg,
                    account,
                    currency: currency.to_string(),
                    amount,
                    redrives: 0,
                    last_error: err.to_string(),
                },
            );
        }
    }

    /// Undo step (1) after step (2) failed for good.
    fn compensate(&self, request: &ReleaseRequest, cause: &LedgerError) -> LedgerError {
        let trade_id = request.trade_id;
        warn!(%trade_id, error = %cause, "Buyer credit failed, restoring seller escrow");
        let restored = self.retry.run("restore escrow", || {
            self.ledger.restore_escrow(
                request.seller,
                &request.currency,
                request.gross_amount,
                trade_id,
            )
        });
        let (kind, reason) = match restored {
            Ok(_) => {
                self.reinstate_trade(trade_id);
                (
                    IncidentKind::SettlementFailed,
                    format!("buyer credit failed ({cause}); seller escrow restored"),
                )
            }
            Err(err) => (
                IncidentKind::CompensationFailed,
                format!("buyer credit failed ({cause}); compensation failed ({err})"),
            ),
        };
        self.incidents.record(kind, Some(trade_id), reason.clone());
        LedgerError::SettlementFailed { trade_id, reason }
    }

    /// Put an opened trade back to ESCROW_LOCKED once its escrow is.
    fn reinstate_trade(&self, trade_id: TradeId) {
        let Some(handle) = self.trades.get(&trade_id).map(|t| Arc::clone(t.value())) else {
            return;
        };
        let mut trade = handle.lock();
        if let Err(err) = trade.reinstate_escrow() {
            self.incidents
                .record(IncidentKind::Integrity, Some(trade_id), err.to_string());
        } else {
            info!(%trade_id, "Trade returned to escrow after compensation");
        }
    }

    /// Re-drive every outstanding fee leg once. Returns how many landed.
    pub fn retry_outstanding_credits(&self) -> usize {
        let keys: Vec<(TradeId, CreditLeg)> =
            self.outstanding.iter().map(|entry| *entry.key()).collect();
        let mut resolved = 0;
        for key in keys {
            // Removal claims the leg; a concurrent re-drive skips it.
            let Some((_, mut credit)) = self.outstanding.remove(&key) else {
                continue;
            };
            match self.apply_leg(
                credit.trade_id,
                credit.leg,
                credit.account,
                &credit.currency,
                credit.amount,
            ) {
                Ok(()) => {
                    info!(trade_id = %credit.trade_id, leg = %credit.leg, "Outstanding credit applied");
                    resolved += 1;
                }
                Err(err) => {
                    credit.redrives += 1;
                    credit.last_error = err.to_string();
                    warn!(
                        trade_id = %credit.trade_id,
                        leg = %credit.leg,
                        redrives = credit.redrives,
                        error = %err,
                        "Outstanding credit still failing"
                    );
                    self.outstanding.insert(key, credit);
                }
            }
        }
        resolved
    }

    // =================================================================
    // Cancellation and refund
    // =================================================================

    /// Cancel an ESCROW_LOCKED trade, returning the full amount to the
    /// seller's available balance. A repeated cancel returns the same
    /// outcome.
    ///
    /// # Errors
    /// `InvalidTradeTransition` from any other state.
    pub fn cancel(&self, trade_id: TradeId) -> Result<CancelOutcome> {
        self.unwind(trade_id, TradeState::EscrowLocked, TradeState::Cancelled)
    }

    /// Resolve a DISPUTED trade in the seller's favour: unlock the escrow.
    ///
    /// # Errors
    /// `InvalidTradeTransition` unless the trade is DISPUTED.
    pub fn refund(&self, trade_id: TradeId) -> Result<CancelOutcome> {
        self.unwind(trade_id, TradeState::Disputed, TradeState::Refunded)
    }

    fn unwind(&self, trade_id: TradeId, from: TradeState, to: TradeState) -> Result<CancelOutcome> {
        let handle = self.trade_handle(trade_id)?;
        let mut trade = handle.lock();
        if trade.state != to {
            if trade.state != from {
                return Err(LedgerError::InvalidTradeTransition {
                    trade_id,
                    from: trade.state,
                    to,
                });
            }
            self.ledger
                .unlock(trade.seller, &trade.currency, trade.amount, trade_id)
                .map_err(|err| self.flag_integrity(trade_id, err))?;
            trade.advance(to)?;
            info!(%trade_id, state = %to, amount = %trade.amount, "Escrow returned to seller");
        }
        Ok(CancelOutcome {
            trade_id,
            seller: trade.seller,
            currency: trade.currency.clone(),
            unlocked_amount: trade.amount,
            final_state: trade.state,
        })
    }

    // =================================================================
    // Accessors
    // =================================================================

    #[must_use]
    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    /// Snapshot of a trade.
    #[must_use]
    pub fn trade(&self, trade_id: TradeId) -> Option<TradeRecord> {
        self.trades.get(&trade_id).map(|t| t.lock().clone())
    }

    /// The fee split persisted for a released trade.
    #[must_use]
    pub fn fee_split(&self, trade_id: TradeId) -> Option<FeeSplit> {
        self.fee_splits.get(&trade_id).map(|s| s.clone())
    }

    #[must_use]
    pub fn incidents(&self) -> &IncidentLog {
        &self.incidents
    }

    #[must_use]
    pub fn idempotency(&self) -> &IdempotencyGuard {
        &self.idempotency
    }

    /// Fee legs still owed, sorted by trade.
    #[must_use]
    pub fn outstanding_credits(&self) -> Vec<OutstandingCredit> {
        let mut credits: Vec<OutstandingCredit> =
            self.outstanding.iter().map(|e| e.value().clone()).collect();
        credits.sort_by_key(|c| (c.trade_id, c.leg));
        credits
    }

    fn trade_handle(&self, trade_id: TradeId) -> Result<Arc<Mutex<TradeRecord>>> {
        self.trades
            .get(&trade_id)
            .map(|t| Arc::clone(t.value()))
            .ok_or(LedgerError::TradeNotFound(trade_id))
    }

    fn flag_integrity(&self, trade_id: TradeId, err: LedgerError) -> LedgerError {
        if err.is_integrity() {
            self.incidents
                .record(IncidentKind::Integrity, Some(trade_id), err.to_string());
        }
        err
    }
}

fn check_release_matches(trade: &TradeRecord, request: &ReleaseRequest) -> Result<()> {
    if trade.state == TradeState::Released {
        return Ok(());
    }
    if !trade.state.can_transition_to(TradeState::Released) {
        return Err(LedgerError::InvalidTradeTransition {
            trade_id: trade.id,
            from: trade.state,
            to: TradeState::Released,
        });
    }
    if trade.seller != request.seller
        || trade.buyer != request.buyer
        || trade.currency != request.currency
        || trade.amount != request.gross_amount
    {
        return Err(LedgerError::EscrowMismatch {
            trade_id: trade.id,
            reason: "release parameters differ from the opened trade".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use escrowbook_ledger::InMemoryBalanceStore;
    use escrowbook_types::LedgerConfig;

    use super::*;

    fn trade(amount: i64) -> TradeRecord {
        let mut trade = TradeRecord::new(
            TradeId::new(),
            AccountId::new(),
            AccountId::new(),
            "BTC",
            Decimal::new(amount, 2),
            None,
        );
        trade.advance(TradeState::EscrowLocked).unwrap();
        trade
    }

    fn request_for(trade: &TradeRecord) -> ReleaseRequest {
        ReleaseRequest {
            trade_id: trade.id,
            seller: trade.seller,
            buyer: trade.buyer,
            currency: trade.currency.clone(),
            gross_amount: trade.amount,
            fee_percent: Decimal::ONE,
            referrer: None,
        }
    }

    #[test]
    fn legs_credit_with_their_reason() {
        assert_eq!(CreditLeg::Buyer.reason(), CreditReason::TradeProceeds);
        assert_eq!(CreditLeg::Admin.reason(), CreditReason::PlatformFee);
        assert_eq!(CreditLeg::Referrer.reason(), CreditReason::ReferralCommission);
        assert_eq!(CreditLeg::Referrer.to_string(), "REFERRER");
    }

    #[test]
    fn matching_request_passes() {
        let trade = trade(50);
        assert!(check_release_matches(&trade, &request_for(&trade)).is_ok());
    }

    #[test]
    fn amount_mismatch_rejected() {
        let trade = trade(50);
        let mut request = request_for(&trade);
        request.gross_amount = Decimal::new(49, 2);
        assert!(matches!(
            check_release_matches(&trade, &request),
            Err(LedgerError::EscrowMismatch { .. })
        ));
    }

    #[test]
    fn cancelled_trade_cannot_release() {
        let mut trade = trade(50);
        trade.advance(TradeState::Cancelled).unwrap();
        assert!(matches!(
            check_release_matches(&trade, &request_for(&trade)),
            Err(LedgerError::InvalidTradeTransition {
                from: TradeState::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn new_uses_configured_policy() {
        let ledger = Ledger::new(InMemoryBalanceStore::new(), LedgerConfig::default()).unwrap();
        let orch = SettlementOrchestrator::new(ledger).unwrap();
        assert_eq!(orch.policy.fee_percent("BTC"), Decimal::ONE);
        assert_eq!(orch.retry.max_attempts, 3);
        assert!(orch.incidents().is_empty());
        assert!(orch.outstanding_credits().is_empty());
    }
}
