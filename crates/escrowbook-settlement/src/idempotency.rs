//! Trade-creation idempotency guard: one trade per caller-supplied key.
//!
//! ```text
//!   (absent) ──reserve──▶ RESERVED ──creation ok──▶ BOUND(trade_id)
//!                             │
//!                             └──creation failed──▶ (absent)
//! ```
//!
//! Reservation is an atomic insert-if-absent on the key, so of two
//! concurrent requests with the same key exactly one runs the creation
//! step. The other sees RESERVED (in flight) or BOUND (duplicate).

use dashmap::{DashMap, mapref::entry::Entry};
use escrowbook_types::{IdempotencyKey, LedgerError, Result, TradeId};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySlot {
    Reserved,
    Bound(TradeId),
}

/// Result of [`IdempotencyGuard::begin_trade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginTradeOutcome {
    pub trade_id: TradeId,
    /// `true` when the key was already bound and creation did not run.
    pub is_duplicate: bool,
}

/// Maps idempotency keys to the trades they produced.
#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    slots: DashMap<IdempotencyKey, KeySlot>,
}

/// Drops an unbound reservation if creation fails or panics.
struct Reservation<'a> {
    guard: &'a IdempotencyGuard,
    key: &'a IdempotencyKey,
    bound: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.bound {
            self.guard
                .slots
                .remove_if(self.key, |_, slot| *slot == KeySlot::Reserved);
        }
    }
}

impl IdempotencyGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `BeginTrade(key, creation_fn)`.
    ///
    /// Returns the bound trade flagged duplicate if the key was seen before;
    /// otherwise runs `creation_fn` and binds its trade id to the key. A
    /// failed creation releases the key so the caller can retry.
    ///
    /// # Errors
    /// - `IdempotencyInFlight` if another request holds the key
    /// - whatever `creation_fn` returns
    pub fn begin_trade<F>(&self, key: &IdempotencyKey, creation_fn: F) -> Result<BeginTradeOutcome>
    where
        F: FnOnce() -> Result<TradeId>,
    {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(slot) => {
                return match *slot.get() {
                    KeySlot::Bound(trade_id) => {
                        debug!(%key, %trade_id, "Duplicate trade creation request");
                        Ok(BeginTradeOutcome {
                            trade_id,
                            is_duplicate: true,
                        })
                    }
                    KeySlot::Reserved => Err(LedgerError::IdempotencyInFlight(key.clone())),
                };
            }
            Entry::Vacant(slot) => {
                slot.insert(KeySlot::Reserved);
            }
        }

        let mut reservation = Reservation {
            guard: self,
            key,
            bound: false,
        };
        let trade_id = creation_fn()?;
        self.slots.insert(key.clone(), KeySlot::Bound(trade_id));
        reservation.bound = true;
        Ok(BeginTradeOutcome {
            trade_id,
            is_duplicate: false,
        })
    }

    /// The trade bound to `key`, if creation completed.
    #[must_use]
    pub fn lookup(&self, key: &IdempotencyKey) -> Option<TradeId> {
        self.slots.get(key).and_then(|slot| match *slot {
            KeySlot::Bound(trade_id) => Some(trade_id),
            KeySlot::Reserved => None,
        })
    }

    /// Number of keys bound to a trade.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(*slot.value(), KeySlot::Bound(_)))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
