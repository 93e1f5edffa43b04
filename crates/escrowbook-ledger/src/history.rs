//! Append-only, hash-chained ledger history.
//!
//! Readers (transaction history, dashboards, revenue reporting) consume
//! entries but never mutate them. Each entry commits to its predecessor's
//! hash, so [`LedgerHistory::verify_chain`] detects any rewrite.
//!
//! Entries reach the chain after their row swap has landed, so two writers
//! of one row may append in either order. Chain order is arrival order;
//! per-row order is the row version each entry carries, and the account
//! queries return entries in that order.

use chrono::Utc;
use escrowbook_types::{
    AccountBalance, AccountId, EntryId, EntryKind, LedgerEntry, LedgerError, Result, TradeId,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;

#[derive(Debug, Default)]
struct Chain {
    entries: Vec<LedgerEntry>,
    last_hash: [u8; 32],
}

/// Process-scoped history of every balance mutation.
#[derive(Debug, Default)]
pub struct LedgerHistory {
    chain: Mutex<Chain>,
}

/// Fields of an entry supplied by the ledger; the chain fills in the rest.
#[derive(Debug, Clone)]
pub struct EntryDraft<'a> {
    pub account: AccountId,
    pub currency: &'a str,
    pub kind: EntryKind,
    pub amount: Decimal,
    pub trade_id: Option<TradeId>,
    pub balance_after: AccountBalance,
    pub row_version: u64,
}

impl LedgerHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal a draft onto the end of the chain and return the stored entry.
    pub fn append(&self, draft: EntryDraft<'_>) -> LedgerEntry {
        let mut chain = self.chain.lock();
        let mut entry = LedgerEntry {
            id: EntryId::new(),
            sequence: chain.entries.len() as u64,
            account: draft.account,
            currency: draft.currency.to_string(),
            kind: draft.kind,
            amount: draft.amount,
            trade_id: draft.trade_id,
            balance_after: draft.balance_after,
            row_version: draft.row_version,
            recorded_at: Utc::now(),
            prev_hash: chain.last_hash,
            hash: [0u8; 32],
        };
        entry.hash = entry.compute_hash();
        chain.last_hash = entry.hash;
        chain.entries.push(entry.clone());
        entry
    }

    /// Recompute every hash and link.
    ///
    /// # Errors
    /// Returns `InvariantViolation` at the first broken entry.
    pub fn verify_chain(&self) -> Result<()> {
        let chain = self.chain.lock();
        let mut prev = [0u8; 32];
        for entry in &chain.entries {
            if entry.prev_hash != prev || entry.compute_hash() != entry.hash {
                return Err(LedgerError::InvariantViolation {
                    reason: format!("history chain broken at sequence {}", entry.sequence),
                });
            }
            prev = entry.hash;
        }
        Ok(())
    }

    /// Copy of every entry, in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.chain.lock().entries.clone()
    }

    /// Entries touching one account, grouped by currency and ordered by
    /// row version within each currency.
    #[must_use]
    pub fn entries_for_account(&self, account: AccountId) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .chain
            .lock()
            .entries
            .iter()
            .filter(|e| e.account == account)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.currency
                .cmp(&b.currency)
                .then(a.row_version.cmp(&b.row_version))
        });
        entries
    }

    /// Entries of one balance row, in row-version order.
    #[must_use]
    pub fn entries_for_row(&self, account: AccountId, currency: &str) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .chain
            .lock()
            .entries
            .iter()
            .filter(|e| e.account == account && e.currency == currency)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.row_version);
        entries
    }

    /// Entries belonging to one trade.
    #[must_use]
    pub fn entries_for_trade(&self, trade_id: TradeId) -> Vec<LedgerEntry> {
        self.chain
            .lock()
            .entries
            .iter()
            .filter(|e| e.trade_id == Some(trade_id))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite an entry's amount in place. Test-only tamper hook.
    #[cfg(test)]
    fn tamper(&self, sequence: usize, amount: Decimal) {
        self.chain.lock().entries[sequence].amount = amount;
    }
}
