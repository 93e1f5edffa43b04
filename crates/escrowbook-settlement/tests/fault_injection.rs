//! Settlement under storage faults: retried credit legs, compensation of a
//! failed buyer credit, and outstanding fee legs re-driven later.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use escrowbook_ledger::{BalanceStore, InMemoryBalanceStore, Ledger, VersionedBalance};
use escrowbook_settlement::{IncidentKind, RetryPolicy, SettlementOrchestrator, StaticFeePolicy};
use escrowbook_types::*;
use parking_lot::Mutex;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Fail the next `n` reads of the account's rows.
    Times(u32),
    /// Fail every read until healed.
    Always,
}

/// Store wrapper that fails row reads for selected accounts.
#[derive(Debug, Default)]
struct FaultyStore {
    inner: InMemoryBalanceStore,
    faults: Mutex<HashMap<AccountId, Fault>>,
    tripped: AtomicBool,
}

impl FaultyStore {
    fn fail(&self, account: AccountId, fault: Fault) {
        self.faults.lock().insert(account, fault);
    }

    fn heal(&self, account: AccountId) {
        self.faults.lock().remove(&account);
    }

    /// Whether any injected fault has fired yet.
    fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    fn check(&self, key: &BalanceKey) -> Result<()> {
        let mut faults = self.faults.lock();
        match faults.get_mut(&key.account) {
            Some(Fault::Always) => {
                self.tripped.store(true, Ordering::SeqCst);
                Err(LedgerError::Storage(format!("injected outage on {key}")))
            }
            Some(Fault::Times(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                self.tripped.store(true, Ordering::SeqCst);
                Err(LedgerError::Storage(format!("injected timeout on {key}")))
            }
            _ => Ok(()),
        }
    }
}

impl BalanceStore for FaultyStore {
    fn load(&self, key: &BalanceKey) -> Result<Option<VersionedBalance>> {
        self.check(key)?;
        self.inner.load(key)
    }

    fn insert_if_absent(
        &self,
        key: &BalanceKey,
        initial: AccountBalance,
    ) -> Result<VersionedBalance> {
        self.inner.insert_if_absent(key, initial)
    }

    fn compare_and_swap(
        &self,
        key: &BalanceKey,
        expected_version: u64,
        next: AccountBalance,
    ) -> Result<bool> {
        self.inner.compare_and_swap(key, expected_version, next)
    }

    fn snapshot(&self) -> Result<Vec<(BalanceKey, AccountBalance)>> {
        self.inner.snapshot()
    }
}

struct Harness {
    store: Arc<FaultyStore>,
    orch: SettlementOrchestrator<Arc<FaultyStore>>,
    admin: AccountId,
    seller: AccountId,
    buyer: AccountId,
    trade_id: TradeId,
}

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

/// Seller funded with 1 BTC, 0.01 locked under `trade_id`.
fn harness() -> Harness {
    harness_with(RetryPolicy::immediate(3))
}

fn harness_with(retry: RetryPolicy) -> Harness {
    let store = Arc::new(FaultyStore::default());
    let admin = AccountId::new();
    let config = LedgerConfig {
        admin_account: admin,
        ..LedgerConfig::default()
    };
    let ledger = Ledger::new(Arc::clone(&store), config).unwrap();
    let orch = SettlementOrchestrator::with_policy(
        ledger,
        Arc::new(StaticFeePolicy::default()),
        retry,
    );
    let (seller, buyer, trade_id) = (AccountId::new(), AccountId::new(), TradeId::new());
    orch.ledger()
        .credit(seller, "BTC", d("1"), CreditReason::Funding)
        .unwrap();
    orch.ledger().lock(seller, "BTC", d("0.01"), trade_id).unwrap();
    Harness {
        store,
        orch,
        admin,
        seller,
        buyer,
        trade_id,
    }
}

impl Harness {
    fn request(&self) -> ReleaseRequest {
        ReleaseRequest {
            trade_id: self.trade_id,
            seller: self.seller,
            buyer: self.buyer,
            currency: "BTC".into(),
            gross_amount: d("0.01"),
            fee_percent: d("1"),
            referrer: None,
        }
    }

    /// Open a trade through the orchestrator for a fresh buyer.
    fn open(&self, key: &str, amount: &str) -> (TradeId, AccountId) {
        let buyer = AccountId::new();
        let trade_id = self
            .orch
            .open_trade(&BeginTradeRequest {
                idempotency_key: IdempotencyKey::parse(key).unwrap(),
                seller: self.seller,
                buyer,
                currency: "BTC".into(),
                amount: d(amount),
                referrer: None,
            })
            .unwrap()
            .trade_id;
        (trade_id, buyer)
    }

    fn balance(&self, account: AccountId) -> AccountBalance {
        self.orch.ledger().balance_or_zero(account, "BTC").unwrap()
    }
}

#[test]
fn transient_buyer_failure_is_retried() {
    let h = harness();
    h.store.fail(h.buyer, Fault::Times(2));

    let outcome = h.orch.release(&h.request()).unwrap();
    assert_eq!(outcome.net_to_buyer, d("0.0099"));
    assert_eq!(h.balance(h.buyer).total, d("0.0099"));
    assert!(h.orch.incidents().is_empty());
    h.orch.ledger().verify_supply("BTC").unwrap();
}

#[test]
fn permanent_buyer_failure_compensates_seller() {
    let h = harness();
    h.store.fail(h.buyer, Fault::Always);

    let err = h.orch.release(&h.request()).unwrap_err();
    assert!(matches!(err, LedgerError::SettlementFailed { .. }));

    // Seller is back to the pre-release escrow state, escrow is LOCKED again.
    assert_eq!(
        h.balance(h.seller),
        AccountBalance {
            total: d("1"),
            locked: d("0.01"),
        }
    );
    assert_eq!(
        h.orch.ledger().escrow_log().get(&h.trade_id).unwrap().state,
        EscrowState::Locked
    );
    assert_eq!(h.orch.incidents().count(IncidentKind::SettlementFailed), 1);
    h.orch.ledger().verify_invariants().unwrap();
    h.orch.ledger().verify_supply("BTC").unwrap();

    // Once the outage clears, the same release goes through.
    h.store.heal(h.buyer);
    let outcome = h.orch.release(&h.request()).unwrap();
    assert_eq!(outcome.net_to_buyer, d("0.0099"));
    assert_eq!(h.balance(h.seller).total, d("0.99"));
    assert_eq!(h.balance(h.buyer).total, d("0.0099"));
    h.orch.ledger().verify_supply("BTC").unwrap();

    let kinds: Vec<EntryKind> = h
        .orch
        .ledger()
        .history()
        .entries_for_trade(h.trade_id)
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EntryKind::Lock,
            EntryKind::SettleRelease,
            EntryKind::Compensation,
            EntryKind::SettleRelease,
        ]
    );
}

#[test]
fn seller_leg_failure_moves_nothing() {
    let h = harness();
    h.store.fail(h.seller, Fault::Times(1));

    let err = h.orch.release(&h.request()).unwrap_err();
    assert!(matches!(err, LedgerError::Storage(_)));
    assert_eq!(h.balance(h.seller).locked, d("0.01"));
    assert!(h.balance(h.buyer).is_zero());

    // The seller leg is not retried internally; the caller's retry succeeds.
    h.orch.release(&h.request()).unwrap();
    assert_eq!(h.balance(h.seller).total, d("0.99"));
}

#[test]
fn admin_failure_leaves_outstanding_credit() {
    let h = harness();
    h.store.fail(h.admin, Fault::Always);

    let outcome = h.orch.release(&h.request()).unwrap();
    assert_eq!(outcome.admin_net, d("0.0001"));
    assert_eq!(h.balance(h.buyer).total, d("0.0099"));

    let outstanding = h.orch.outstanding_credits();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].amount, d("0.0001"));
    assert_eq!(h.orch.incidents().count(IncidentKind::OutstandingCredit), 1);
    // The fee is owed, so supply is short until the leg lands.
    assert!(h.orch.ledger().verify_supply("BTC").is_err());

    // Still failing: the leg stays outstanding.
    assert_eq!(h.orch.retry_outstanding_credits(), 0);
    assert_eq!(h.orch.outstanding_credits()[0].redrives, 1);

    h.store.heal(h.admin);
    assert_eq!(h.orch.retry_outstanding_credits(), 1);
    assert_eq!(h.orch.retry_outstanding_credits(), 0);
    assert!(h.orch.outstanding_credits().is_empty());
    assert_eq!(h.balance(h.admin).total, d("0.0001"));
    h.orch.ledger().verify_supply("BTC").unwrap();

    // A repeated release is served from cache and does not re-pay the fee.
    h.orch.release(&h.request()).unwrap();
    assert_eq!(h.balance(h.admin).total, d("0.0001"));
}

#[test]
fn compensated_release_returns_trade_to_escrow_locked() {
    let h = harness();
    let (trade_id, buyer) = h.open("paid-then-failed", "0.02");
    h.orch.mark_payment(trade_id).unwrap();
    h.store.fail(buyer, Fault::Always);

    let err = h.orch.release_trade(trade_id).unwrap_err();
    assert!(matches!(err, LedgerError::SettlementFailed { .. }));
    assert_eq!(h.orch.trade(trade_id).unwrap().state, TradeState::EscrowLocked);
    assert_eq!(
        h.balance(h.seller),
        AccountBalance {
            total: d("1"),
            locked: d("0.03"),
        }
    );

    // Back in ESCROW_LOCKED, the trade can be cancelled like any open one.
    let outcome = h.orch.cancel(trade_id).unwrap();
    assert_eq!(outcome.final_state, TradeState::Cancelled);
    assert_eq!(h.balance(h.seller).locked, d("0.01"));
    h.orch.ledger().verify_supply("BTC").unwrap();
}

#[test]
fn trade_is_not_locked_while_a_leg_backs_off() {
    let h = harness_with(RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 300,
        max_backoff_ms: 300,
    });
    let (trade_id, buyer) = h.open("slow-buyer", "0.02");
    h.store.fail(buyer, Fault::Times(1));

    std::thread::scope(|s| {
        let releasing = s.spawn(|| h.orch.release_trade(trade_id));
        while !h.store.tripped() && !releasing.is_finished() {
            std::thread::yield_now();
        }
        assert!(h.store.tripped());

        let started = Instant::now();
        let trade = h.orch.trade(trade_id).unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(trade.state, TradeState::EscrowLocked);

        let outcome = releasing.join().unwrap().unwrap();
        assert_eq!(outcome.net_to_buyer, d("0.0198"));
    });
    assert_eq!(h.orch.trade(trade_id).unwrap().state, TradeState::Released);
    h.orch.ledger().verify_supply("BTC").unwrap();
}
