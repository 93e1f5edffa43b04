//! Ledger store: persistent per-(account, currency) balance rows.
//!
//! The store exposes exactly one way to change a row: a versioned
//! compare-and-swap. A write lands only if the row still carries the
//! version the caller read, so a caller's precondition check and its
//! write are atomic with respect to every other writer of that row.
//! There is no unconditional update.

use std::sync::Arc;

use dashmap::DashMap;
use escrowbook_types::{AccountBalance, BalanceKey, Result};

/// A balance row plus its optimistic-concurrency version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedBalance {
    pub balance: AccountBalance,
    /// Incremented by every successful swap.
    pub version: u64,
}

/// Backing storage for balance rows.
///
/// Implementations must make [`compare_and_swap`](Self::compare_and_swap)
/// atomic per key (a database conditional write, or a row latch held only
/// for the compare and the write). Distinct keys must not contend.
pub trait BalanceStore: Send + Sync {
    /// Read a row, if it exists.
    fn load(&self, key: &BalanceKey) -> Result<Option<VersionedBalance>>;

    /// Create the row with `initial` unless it already exists; return the
    /// row as it now stands.
    fn insert_if_absent(&self, key: &BalanceKey, initial: AccountBalance)
    -> Result<VersionedBalance>;

    /// Replace the row with `next` iff its version is still `expected_version`.
    /// A successful swap leaves the row at `expected_version + 1`.
    ///
    /// Returns `Ok(false)` when another writer got there first (or the row
    /// is missing); the caller re-reads and re-checks its precondition.
    fn compare_and_swap(
        &self,
        key: &BalanceKey,
        expected_version: u64,
        next: AccountBalance,
    ) -> Result<bool>;

    /// Every row, for invariant and supply audits.
    fn snapshot(&self) -> Result<Vec<(BalanceKey, AccountBalance)>>;
}

impl<S: BalanceStore + ?Sized> BalanceStore for Arc<S> {
    fn load(&self, key: &BalanceKey) -> Result<Option<VersionedBalance>> {
        (**self).load(key)
    }

    fn insert_if_absent(
        &self,
        key: &BalanceKey,
        initial: AccountBalance,
    ) -> Result<VersionedBalance> {
        (**self).insert_if_absent(key, initial)
    }

    fn compare_and_swap(
        &self,
        key: &BalanceKey,
        expected_version: u64,
        next: AccountBalance,
    ) -> Result<bool> {
        (**self).compare_and_swap(key, expected_version, next)
    }

    fn snapshot(&self) -> Result<Vec<(BalanceKey, AccountBalance)>> {
        (**self).snapshot()
    }
}

/// In-process store backed by a sharded concurrent map.
///
/// The shard guard taken by `get_mut` is the row latch: it is held for the
/// version compare and the write, never across any other work.
#[derive(Debug, Default)]
pub struct InMemoryBalanceStore {
    rows: DashMap<BalanceKey, VersionedBalance>,
}

impl InMemoryBalanceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows (zero rows included; rows are never deleted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl BalanceStore for InMemoryBalanceStore {
    fn load(&self, key: &BalanceKey) -> Result<Option<VersionedBalance>> {
        Ok(self.rows.get(key).map(|row| *row))
    }

    fn insert_if_absent(
        &self,
        key: &BalanceKey,
        initial: AccountBalance,
    ) -> Result<VersionedBalance> {
        let row = self.rows.entry(key.clone()).or_insert(VersionedBalance {
            balance: initial,
            version: 0,
        });
        Ok(*row)
    }

    fn compare_and_swap(
        &self,
        key: &BalanceKey,
        expected_version: u64,
        next: AccountBalance,
    ) -> Result<bool> {
        let Some(mut row) = self.rows.get_mut(key) else {
            return Ok(false);
        };
        if row.version != expected_version {
            return Ok(false);
        }
        row.balance = next;
        row.version += 1;
        Ok(true)
    }

    fn snapshot(&self) -> Result<Vec<(BalanceKey, AccountBalance)>> {
        Ok(self
            .rows
            .iter()
            .map(|row| (row.key().clone(), row.value().balance))
            .collect())
    }
}
