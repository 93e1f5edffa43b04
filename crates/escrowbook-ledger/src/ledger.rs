//! Balance invariant enforcer.
//!
//! [`Ledger`] is the only component that mutates balance rows. Every
//! mutation is a read → check → conditional-swap loop against the
//! [`BalanceStore`]: the precondition (`locked + amount <= total` for a
//! lock, `locked >= amount` for an unlock or settle) is evaluated on the
//! exact row version the swap is conditioned on. If another writer moved
//! the row in between, the swap fails and the loop re-reads, so two
//! concurrent locks that together exceed availability cannot both land.
//!
//! Escrow operations consult the [`EscrowLog`] first; a retried call is
//! answered from the log instead of re-executing the mutation.

use escrowbook_types::{
    AccountBalance, AccountId, BalanceKey, CreditReason, CreditRequest, EntryKind, EscrowRecord,
    EscrowRequest, EscrowState, LedgerConfig, LedgerError, Result, TradeId,
    request::validate_amount,
};
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use crate::{
    escrow_log::{Claim, EscrowLog, Reservation},
    history::{EntryDraft, LedgerHistory},
    store::{BalanceStore, VersionedBalance},
    supply::SupplyConservation,
};

/// Result of an escrow operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowReceipt {
    /// The account's balance after the operation (current balance on replay).
    pub balance: AccountBalance,
    /// The escrow record as the log now holds it.
    pub record: EscrowRecord,
    /// `true` when the call was answered from the log without mutating.
    pub replayed: bool,
}

/// Balance ledger: store + escrow log + history + supply tracking.
pub struct Ledger<S: BalanceStore> {
    store: S,
    escrow_log: EscrowLog,
    history: LedgerHistory,
    supply: SupplyConservation,
    config: LedgerConfig,
}

impl<S: BalanceStore> Ledger<S> {
    /// Build a ledger over `store`.
    ///
    /// # Errors
    /// Returns `Configuration` if `config` does not validate.
    pub fn new(store: S, config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            escrow_log: EscrowLog::new(),
            history: LedgerHistory::new(),
            supply: SupplyConservation::new(),
            config,
        })
    }

    // =================================================================
    // Reads
    // =================================================================

    /// `GetBalance(account, currency)`.
    ///
    /// # Errors
    /// `BalanceNotFound` if the row was never created.
    pub fn get_balance(&self, account: AccountId, currency: &str) -> Result<AccountBalance> {
        self.store
            .load(&BalanceKey::new(account, currency))?
            .map(|row| row.balance)
            .ok_or_else(|| LedgerError::BalanceNotFound {
                account,
                currency: currency.to_string(),
            })
    }

    /// Balance, or a zero row if none exists yet.
    pub fn balance_or_zero(&self, account: AccountId, currency: &str) -> Result<AccountBalance> {
        Ok(self
            .store
            .load(&BalanceKey::new(account, currency))?
            .map(|row| row.balance)
            .unwrap_or_default())
    }

    // =================================================================
    // Mutations
    // =================================================================

    /// `Credit(account, currency, amount, reason)`: `total += amount`.
    /// Creates the row on first credit.
    ///
    /// # Errors
    /// `InvalidAmount` for a non-positive or over-precise amount; storage
    /// errors from the store.
    pub fn credit(
        &self,
        account: AccountId,
        currency: &str,
        amount: Decimal,
        reason: CreditReason,
    ) -> Result<AccountBalance> {
        self.validate(currency, amount)?;
        let key = BalanceKey::new(account, currency);
        let external = reason.is_external();
        if external {
            self.supply.record_external(currency, amount)?;
        }
        let row = match self.mutate(&key, true, |row| row.credited(amount)) {
            Ok(row) => row,
            Err(err) => {
                if external {
                    self.supply.revert_external(currency, amount);
                }
                return Err(err);
            }
        };
        debug!(%account, currency, %amount, %reason, total = %row.balance.total, "Credit applied");
        self.record(&key, EntryKind::Credit(reason), amount, None, row);
        Ok(row.balance)
    }

    /// `Lock(account, currency, amount, trade_id)`: `locked += amount`
    /// iff `locked + amount <= total`.
    ///
    /// A repeat call for an already-locked trade with identical parameters
    /// returns the current balance without locking again.
    ///
    /// # Errors
    /// - `InsufficientAvailable` if `available < amount`
    /// - `InvalidTransition` if the trade's escrow is in flight or ended
    /// - `EscrowMismatch` if a retry names different parameters
    pub fn lock(
        &self,
        account: AccountId,
        currency: &str,
        amount: Decimal,
        trade_id: TradeId,
    ) -> Result<EscrowReceipt> {
        self.validate(currency, amount)?;
        if let Reservation::Existing(record) = self.escrow_log.reserve(trade_id)? {
            if !record.matches(account, currency, amount) {
                return Err(self.integrity(record.mismatch(account, currency, amount)));
            }
            debug!(%trade_id, %account, "Lock replayed from escrow log");
            return Ok(EscrowReceipt {
                balance: self.balance_or_zero(account, currency)?,
                record,
                replayed: true,
            });
        }

        let key = BalanceKey::new(account, currency);
        let row = match self.mutate(&key, false, |row| row.locked_by(amount)) {
            Ok(row) => row,
            Err(err) => {
                self.escrow_log.abandon(trade_id);
                return Err(match err {
                    LedgerError::BalanceNotFound { .. } => LedgerError::InsufficientAvailable {
                        needed: amount,
                        available: Decimal::ZERO,
                    },
                    other => other,
                });
            }
        };

        let record = EscrowRecord::locked(trade_id, account, currency, amount);
        self.escrow_log.record_locked(record.clone());
        debug!(%trade_id, %account, currency, %amount, locked = %row.balance.locked, "Escrow locked");
        self.record(&key, EntryKind::Lock, amount, Some(trade_id), row);
        Ok(EscrowReceipt {
            balance: row.balance,
            record,
            replayed: false,
        })
    }

    /// `Unlock(account, currency, amount, trade_id)`: `locked -= amount`.
    /// A repeat call on an already-unlocked trade is a no-op success.
    ///
    /// # Errors
    /// - `InsufficientLocked` if `locked < amount`
    /// - `InvalidTransition` if the trade is not locked (or was released)
    /// - `EscrowMismatch` if the parameters disagree with the lock
    pub fn unlock(
        &self,
        account: AccountId,
        currency: &str,
        amount: Decimal,
        trade_id: TradeId,
    ) -> Result<EscrowReceipt> {
        self.resolve(
            account,
            currency,
            amount,
            trade_id,
            EscrowState::Unlocked,
            |row| row.unlocked_by(amount),
        )
    }

    /// `SettleRelease(account, currency, amount, trade_id)`: the seller leg
    /// of a release. `locked -= amount` and `total -= amount`.
    ///
    /// # Errors
    /// Same as [`unlock`](Self::unlock).
    pub fn settle_release(
        &self,
        account: AccountId,
        currency: &str,
        amount: Decimal,
        trade_id: TradeId,
    ) -> Result<EscrowReceipt> {
        self.resolve(
            account,
            currency,
            amount,
            trade_id,
            EscrowState::Released,
            |row| row.settled_by(amount),
        )
    }

    /// Compensation for a release whose buyer leg failed: the settled
    /// amount re-enters the seller's custody directly into escrow
    /// (`total += amount`, `locked += amount` in one swap) and the escrow
    /// record returns to LOCKED.
    ///
    /// # Errors
    /// `InvalidTransition` unless the trade's escrow is RELEASED with
    /// matching parameters.
    pub fn restore_escrow(
        &self,
        account: AccountId,
        currency: &str,
        amount: Decimal,
        trade_id: TradeId,
    ) -> Result<EscrowReceipt> {
        let record = self.escrow_log.get(&trade_id).ok_or_else(|| {
            LedgerError::InvalidTransition {
                trade_id,
                reason: "no escrow recorded".into(),
            }
        })?;
        if record.state != EscrowState::Released {
            return Err(LedgerError::EscrowState {
                trade_id,
                state: record.state,
            });
        }
        if !record.matches(account, currency, amount) {
            return Err(self.integrity(record.mismatch(account, currency, amount)));
        }

        let key = BalanceKey::new(account, currency);
        let row = self.mutate(&key, true, |row| row.restored_by(amount))?;
        let record = self.escrow_log.reinstate(trade_id)?;
        warn!(%trade_id, %account, currency, %amount, "Settled escrow restored by compensation");
        self.record(&key, EntryKind::Compensation, amount, Some(trade_id), row);
        Ok(EscrowReceipt {
            balance: row.balance,
            record,
            replayed: false,
        })
    }

    // =================================================================
    // Typed boundary requests
    // =================================================================

    /// [`credit`](Self::credit) for a deserialized request.
    pub fn apply_credit(&self, request: &CreditRequest) -> Result<AccountBalance> {
        request.validate(self.scale_for(&request.currency))?;
        self.credit(
            request.account,
            &request.currency,
            request.amount,
            request.reason.clone(),
        )
    }

    /// [`lock`](Self::lock) for a deserialized request.
    pub fn apply_lock(&self, request: &EscrowRequest) -> Result<EscrowReceipt> {
        request.validate(self.scale_for(&request.currency))?;
        self.lock(request.account, &request.currency, request.amount, request.trade_id)
    }

    /// [`unlock`](Self::unlock) for a deserialized request.
    pub fn apply_unlock(&self, request: &EscrowRequest) -> Result<EscrowReceipt> {
        request.validate(self.scale_for(&request.currency))?;
        self.unlock(request.account, &request.currency, request.amount, request.trade_id)
    }

    // =================================================================
    // Audits
    // =================================================================

    /// Check `total >= locked >= 0` on every row.
    ///
    /// # Errors
    /// Returns the first `InvariantViolation` found.
    pub fn verify_invariants(&self) -> Result<()> {
        for (key, balance) in self.store.snapshot()? {
            balance.check_invariant().map_err(|err| {
                error!(%key, %balance, "Balance invariant violated");
                err
            })?;
        }
        Ok(())
    }

    /// Σ total across all accounts for one currency.
    ///
    /// # Errors
    /// `SupplyInvariantViolation` if the sum leaves the decimal range.
    pub fn total_supply(&self, currency: &str) -> Result<Decimal> {
        self.store
            .snapshot()?
            .into_iter()
            .filter(|(key, _)| key.currency == currency)
            .try_fold(Decimal::ZERO, |sum, (_, balance)| {
                sum.checked_add(balance.total).ok_or_else(|| {
                    LedgerError::SupplyInvariantViolation {
                        reason: format!("{currency}: total supply overflows"),
                    }
                })
            })
    }

    /// Check supply conservation for one currency. Only meaningful at a
    /// quiescent point (no mutation in flight).
    ///
    /// # Errors
    /// Returns `SupplyInvariantViolation` if supply drifted.
    pub fn verify_supply(&self, currency: &str) -> Result<()> {
        let actual = self.total_supply(currency)?;
        self.supply.verify(currency, actual).map_err(|err| {
            error!(currency, %actual, "Supply conservation violated");
            err
        })
    }

    /// Check supply conservation for every currency that was ever funded.
    pub fn verify_all_supply(&self) -> Result<()> {
        for currency in self.supply.tracked_currencies() {
            self.verify_supply(&currency)?;
        }
        Ok(())
    }

    // =================================================================
    // Accessors
    // =================================================================

    #[must_use]
    pub fn escrow_log(&self) -> &EscrowLog {
        &self.escrow_log
    }

    #[must_use]
    pub fn history(&self) -> &LedgerHistory {
        &self.history
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decimal places for `currency`.
    #[must_use]
    pub fn scale_for(&self, currency: &str) -> u32 {
        self.config.scale_for(currency)
    }

    // =================================================================
    // Internals
    // =================================================================

    fn validate(&self, currency: &str, amount: Decimal) -> Result<()> {
        if currency.trim().is_empty() {
            return Err(LedgerError::InvalidRequest {
                reason: "currency must not be blank".into(),
            });
        }
        validate_amount(amount, self.scale_for(currency))
    }

    /// Shared body of unlock and settle-release.
    fn resolve<F>(
        &self,
        account: AccountId,
        currency: &str,
        amount: Decimal,
        trade_id: TradeId,
        target: EscrowState,
        apply: F,
    ) -> Result<EscrowReceipt>
    where
        F: Fn(&AccountBalance) -> Result<AccountBalance>,
    {
        self.validate(currency, amount)?;
        let record = match self.escrow_log.claim(trade_id, target) {
            Ok(Claim::Fresh(record)) => record,
            Ok(Claim::Resolved(record)) => {
                if !record.matches(account, currency, amount) {
                    return Err(self.integrity(record.mismatch(account, currency, amount)));
                }
                debug!(%trade_id, state = %target, "Escrow resolution replayed from log");
                return Ok(EscrowReceipt {
                    balance: self.balance_or_zero(account, currency)?,
                    record,
                    replayed: true,
                });
            }
            Err(err) => return Err(self.integrity(err)),
        };

        if !record.matches(account, currency, amount) {
            self.escrow_log.release_claim(trade_id);
            return Err(self.integrity(record.mismatch(account, currency, amount)));
        }

        let key = BalanceKey::new(account, currency);
        let row = match self.mutate(&key, false, apply) {
            Ok(row) => row,
            Err(err) => {
                self.escrow_log.release_claim(trade_id);
                return Err(match err {
                    LedgerError::BalanceNotFound { .. } => LedgerError::InsufficientLocked {
                        needed: amount,
                        locked: Decimal::ZERO,
                    },
                    other => other,
                });
            }
        };

        let record = self.escrow_log.complete(trade_id)?;
        let kind = match target {
            EscrowState::Released => EntryKind::SettleRelease,
            _ => EntryKind::Unlock,
        };
        debug!(%trade_id, %account, currency, %amount, state = %target, "Escrow resolved");
        self.record(&key, kind, amount, Some(trade_id), row);
        Ok(EscrowReceipt {
            balance: row.balance,
            record,
            replayed: false,
        })
    }

    /// Optimistic read → check → conditional-swap loop on one row. Returns
    /// the row as the winning swap left it.
    fn mutate<F>(&self, key: &BalanceKey, create: bool, apply: F) -> Result<VersionedBalance>
    where
        F: Fn(&AccountBalance) -> Result<AccountBalance>,
    {
        for _ in 0..self.config.max_cas_retries {
            let current = match self.store.load(key)? {
                Some(row) => row,
                None if create => self.store.insert_if_absent(key, AccountBalance::new())?,
                None => {
                    return Err(LedgerError::BalanceNotFound {
                        account: key.account,
                        currency: key.currency.clone(),
                    });
                }
            };
            let next = apply(&current.balance)?;
            next.check_invariant()?;
            if self.store.compare_and_swap(key, current.version, next)? {
                return Ok(VersionedBalance {
                    balance: next,
                    version: current.version + 1,
                });
            }
            std::thread::yield_now();
        }
        warn!(%key, attempts = self.config.max_cas_retries, "Optimistic update gave up");
        Err(LedgerError::StoreContention {
            account: key.account,
            currency: key.currency.clone(),
            attempts: self.config.max_cas_retries,
        })
    }

    fn record(
        &self,
        key: &BalanceKey,
        kind: EntryKind,
        amount: Decimal,
        trade_id: Option<TradeId>,
        row: VersionedBalance,
    ) {
        self.history.append(EntryDraft {
            account: key.account,
            currency: &key.currency,
            kind,
            amount,
            trade_id,
            balance_after: row.balance,
            row_version: row.version,
        });
    }

    /// Log integrity failures at elevated severity on their way out.
    fn integrity(&self, err: LedgerError) -> LedgerError {
        if err.is_integrity() {
            error!(error = %err, "Escrow integrity failure");
        }
        err
    }
}
