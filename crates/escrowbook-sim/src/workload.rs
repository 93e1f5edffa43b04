//! Randomised concurrent trade workload.
//!
//! Workers open trades between a pool of funded sellers and a pool of
//! buyers, then drive each trade to release, cancellation or a dispute.
//! A slice of requests deliberately reuse an earlier idempotency key.

use std::sync::atomic::{AtomicU64, Ordering};

use escrowbook_ledger::BalanceStore;
use escrowbook_settlement::SettlementOrchestrator;
use escrowbook_types::{
    AccountId, BeginTradeRequest, CreditReason, CreditRequest, IdempotencyKey, LedgerError,
    Referral, ReferrerTier, Result, TradeId,
};
use rand::{Rng, seq::SliceRandom};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Shape of the simulated load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub workers: usize,
    pub trades_per_worker: usize,
    pub sellers: usize,
    pub buyers: usize,
    pub referrers: usize,
    pub currency: String,
    /// Initial funding per seller.
    pub seller_funding: Decimal,
    /// Largest trade, in smallest currency units.
    pub max_trade_units: i64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            trades_per_worker: 250,
            sellers: 6,
            buyers: 10,
            referrers: 2,
            currency: "BTC".into(),
            seller_funding: Decimal::new(5, 0),
            max_trade_units: 5_000_000,
        }
    }
}

impl WorkloadConfig {
    /// # Errors
    /// Returns `Configuration` for an empty pool or a non-positive bound.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.sellers == 0 || self.buyers == 0 {
            return Err(LedgerError::Configuration(
                "workload needs at least one worker, seller and buyer".into(),
            ));
        }
        if self.max_trade_units <= 0 || self.seller_funding <= Decimal::ZERO {
            return Err(LedgerError::Configuration(
                "max_trade_units and seller_funding must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Counts of what the workload did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkloadReport {
    pub opened: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub released: u64,
    pub cancelled: u64,
    pub refunded: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    released: AtomicU64,
    cancelled: AtomicU64,
    refunded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> WorkloadReport {
        WorkloadReport {
            opened: self.opened.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            refunded: self.refunded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct Pools {
    sellers: Vec<AccountId>,
    buyers: Vec<AccountId>,
    referrers: Vec<AccountId>,
}

/// Fund the sellers and run every worker to completion.
pub fn run<S: BalanceStore>(
    orch: &SettlementOrchestrator<S>,
    config: &WorkloadConfig,
) -> Result<WorkloadReport> {
    config.validate()?;
    let pools = Pools {
        sellers: (0..config.sellers).map(|_| AccountId::new()).collect(),
        buyers: (0..config.buyers).map(|_| AccountId::new()).collect(),
        referrers: (0..config.referrers).map(|_| AccountId::new()).collect(),
    };
    for seller in &pools.sellers {
        orch.ledger().apply_credit(&CreditRequest {
            account: *seller,
            currency: config.currency.clone(),
            amount: config.seller_funding,
            reason: CreditReason::Funding,
        })?;
    }
    info!(
        workers = config.workers,
        trades_per_worker = config.trades_per_worker,
        sellers = config.sellers,
        "Workload starting"
    );

    let counters = Counters::default();
    std::thread::scope(|s| {
        for worker in 0..config.workers {
            let (pools, counters) = (&pools, &counters);
            s.spawn(move || run_worker(orch, config, pools, counters, worker));
        }
    });
    Ok(counters.report())
}

fn run_worker<S: BalanceStore>(
    orch: &SettlementOrchestrator<S>,
    config: &WorkloadConfig,
    pools: &Pools,
    counters: &Counters,
    worker: usize,
) {
    let mut rng = rand::thread_rng();
    let scale = orch.ledger().scale_for(&config.currency);
    let mut last_key: Option<IdempotencyKey> = None;

    for n in 0..config.trades_per_worker {
        let key = match &last_key {
            Some(previous) if rng.gen_bool(0.05) => previous.clone(),
            _ => match IdempotencyKey::parse(format!("w{worker}-t{n}")) {
                Ok(key) => key,
                Err(err) => {
                    warn!(error = %err, "Skipping malformed key");
                    continue;
                }
            },
        };
        last_key = Some(key.clone());

        let (Some(seller), Some(buyer)) = (
            pools.sellers.choose(&mut rng).copied(),
            pools.buyers.choose(&mut rng).copied(),
        ) else {
            return;
        };
        let referrer = pools
            .referrers
            .choose(&mut rng)
            .filter(|_| rng.gen_bool(0.3))
            .map(|account| Referral {
                account: *account,
                tier: if rng.gen_bool(0.2) {
                    ReferrerTier::Elevated
                } else {
                    ReferrerTier::Standard
                },
            });
        let request = BeginTradeRequest {
            idempotency_key: key,
            seller,
            buyer,
            currency: config.currency.clone(),
            amount: Decimal::new(rng.gen_range(1..=config.max_trade_units), scale),
            referrer,
        };

        match orch.open_trade(&request) {
            Ok(outcome) if outcome.is_duplicate => Counters::bump(&counters.duplicates),
            Ok(outcome) => {
                Counters::bump(&counters.opened);
                drive(orch, counters, outcome.trade_id, rng.gen_range(0..10));
            }
            Err(LedgerError::InsufficientAvailable { .. }) => Counters::bump(&counters.rejected),
            Err(err) => {
                debug!(error = %err, "Trade not opened");
                Counters::bump(&counters.failed);
            }
        }
    }
}

/// Take an open trade to a terminal state.
fn drive<S: BalanceStore>(
    orch: &SettlementOrchestrator<S>,
    counters: &Counters,
    trade_id: TradeId,
    roll: u32,
) {
    let result = match roll {
        0..=5 => orch
            .mark_payment(trade_id)
            .and_then(|_| orch.release_trade(trade_id))
            .map(|_| &counters.released),
        6 | 7 => orch.cancel(trade_id).map(|_| &counters.cancelled),
        8 => orch
            .open_dispute(trade_id)
            .and_then(|_| orch.refund(trade_id))
            .map(|_| &counters.refunded),
        _ => orch
            .open_dispute(trade_id)
            .and_then(|_| orch.release_trade(trade_id))
            .map(|_| &counters.released),
    };
    match result {
        Ok(counter) => Counters::bump(counter),
        Err(err) => {
            warn!(%trade_id, error = %err, "Trade did not settle");
            Counters::bump(&counters.failed);
        }
    }
}
