//! Escrow operation log: one record per successful lock, keyed by trade.
//!
//! Every lock, unlock and release consults the log before touching a
//! balance row. The log serialises work per trade id:
//!
//! - a lock first **reserves** the trade id; the record becomes visible as
//!   LOCKED only once the balance update landed
//! - an unlock or release first **claims** the LOCKED record; the terminal
//!   state is committed only once the balance update landed
//!
//! A retried call finds either its own committed outcome (answered from
//! the log, no second mutation) or an in-flight claim (rejected).

use dashmap::{DashMap, mapref::entry::Entry};
use escrowbook_types::{EscrowRecord, EscrowState, LedgerError, Result, TradeId};

#[derive(Debug, Clone)]
enum Slot {
    /// A lock is mutating the balance; no record yet.
    Reserved,
    Recorded {
        record: EscrowRecord,
        /// Terminal state a resolver is currently applying.
        pending: Option<EscrowState>,
    },
}

/// Outcome of [`EscrowLog::reserve`].
#[derive(Debug, Clone)]
pub enum Reservation {
    /// No prior lock: the caller now owns the trade id and must call
    /// [`EscrowLog::record_locked`] or [`EscrowLog::abandon`].
    Fresh,
    /// The trade is already locked; the caller is a retry.
    Existing(EscrowRecord),
}

/// Outcome of [`EscrowLog::claim`].
#[derive(Debug, Clone)]
pub enum Claim {
    /// The record was LOCKED and is now claimed; the caller must call
    /// [`EscrowLog::complete`] or [`EscrowLog::release_claim`].
    Fresh(EscrowRecord),
    /// The record already reached the requested state; the caller is a retry.
    Resolved(EscrowRecord),
}

/// Append-mostly audit of escrow per trade id.
#[derive(Debug, Default)]
pub struct EscrowLog {
    slots: DashMap<TradeId, Slot>,
}

fn invalid(trade_id: TradeId, reason: impl Into<String>) -> LedgerError {
    LedgerError::InvalidTransition {
        trade_id,
        reason: reason.into(),
    }
}

impl EscrowLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `trade_id` for a lock.
    ///
    /// # Errors
    /// `InvalidTransition` if another lock is in flight or the trade's
    /// escrow already ended.
    pub fn reserve(&self, trade_id: TradeId) -> Result<Reservation> {
        match self.slots.entry(trade_id) {
            Entry::Vacant(slot) => {
                slot.insert(Slot::Reserved);
                Ok(Reservation::Fresh)
            }
            Entry::Occupied(slot) => match slot.get() {
                Slot::Reserved => Err(invalid(trade_id, "lock already in flight")),
                Slot::Recorded { record, .. } if record.state == EscrowState::Locked => {
                    Ok(Reservation::Existing(record.clone()))
                }
                Slot::Recorded { record, .. } => Err(invalid(
                    trade_id,
                    format!("escrow already {}", record.state),
                )),
            },
        }
    }

    /// Publish the LOCKED record for a reserved trade id.
    pub fn record_locked(&self, record: EscrowRecord) {
        self.slots.insert(
            record.trade_id,
            Slot::Recorded {
                record,
                pending: None,
            },
        );
    }

    /// Drop a reservation whose balance update failed.
    pub fn abandon(&self, trade_id: TradeId) {
        self.slots
            .remove_if(&trade_id, |_, slot| matches!(slot, Slot::Reserved));
    }

    /// Claim a LOCKED record for resolution to `target`.
    ///
    /// # Errors
    /// `InvalidTransition` if the trade was never locked, its lock is not
    /// yet durable, another resolution is in flight, or it already reached
    /// a different terminal state.
    pub fn claim(&self, trade_id: TradeId, target: EscrowState) -> Result<Claim> {
        let Some(mut slot) = self.slots.get_mut(&trade_id) else {
            return Err(invalid(trade_id, "no escrow recorded"));
        };
        match &mut *slot {
            Slot::Reserved => Err(invalid(trade_id, "lock not yet durable")),
            Slot::Recorded {
                pending: Some(in_flight),
                ..
            } => Err(invalid(
                trade_id,
                format!("resolution to {in_flight} already in flight"),
            )),
            Slot::Recorded { record, pending } => {
                if record.state == EscrowState::Locked {
                    if !record.state.can_transition_to(target) {
                        return Err(invalid(
                            trade_id,
                            format!("cannot move escrow from LOCKED to {target}"),
                        ));
                    }
                    *pending = Some(target);
                    Ok(Claim::Fresh(record.clone()))
                } else if record.state == target {
                    Ok(Claim::Resolved(record.clone()))
                } else {
                    Err(invalid(
                        trade_id,
                        format!("escrow already {}, cannot move to {target}", record.state),
                    ))
                }
            }
        }
    }

    /// Commit a claimed resolution.
    ///
    /// # Errors
    /// `Internal` if there is no claim to commit.
    pub fn complete(&self, trade_id: TradeId) -> Result<EscrowRecord> {
        let Some(mut slot) = self.slots.get_mut(&trade_id) else {
            return Err(LedgerError::Internal(format!("no escrow slot for {trade_id}")));
        };
        let Slot::Recorded { record, pending } = &mut *slot else {
            return Err(LedgerError::Internal(format!("lock for {trade_id} not yet durable")));
        };
        let Some(target) = pending.take() else {
            return Err(LedgerError::Internal(format!(
                "no claimed resolution to commit for {trade_id}"
            )));
        };
        record.transition(target)?;
        Ok(record.clone())
    }

    /// Drop a claim whose balance update failed. The record stays LOCKED.
    pub fn release_claim(&self, trade_id: TradeId) {
        if let Some(mut slot) = self.slots.get_mut(&trade_id) {
            if let Slot::Recorded { pending, .. } = &mut *slot {
                *pending = None;
            }
        }
    }

    /// Move a LOCKED record straight to a terminal state.
    ///
    /// # Errors
    /// `InvalidTransition` if the record is missing, in flight, or terminal.
    pub fn transition(&self, trade_id: TradeId, target: EscrowState) -> Result<EscrowRecord> {
        let Some(mut slot) = self.slots.get_mut(&trade_id) else {
            return Err(invalid(trade_id, "no escrow recorded"));
        };
        match &mut *slot {
            Slot::Recorded {
                record,
                pending: None,
            } => {
                record.transition(target)?;
                Ok(record.clone())
            }
            Slot::Recorded { .. } => Err(invalid(trade_id, "resolution already in flight")),
            Slot::Reserved => Err(invalid(trade_id, "lock not yet durable")),
        }
    }

    /// Put a RELEASED record back to LOCKED after its release was
    /// compensated. The only backwards move the log allows.
    ///
    /// # Errors
    /// `InvalidTransition` unless the record is RELEASED and idle.
    pub fn reinstate(&self, trade_id: TradeId) -> Result<EscrowRecord> {
        let Some(mut slot) = self.slots.get_mut(&trade_id) else {
            return Err(invalid(trade_id, "no escrow recorded"));
        };
        match &mut *slot {
            Slot::Recorded {
                record,
                pending: None,
            } if record.state == EscrowState::Released => {
                record.state = EscrowState::Locked;
                record.resolved_at = None;
                Ok(record.clone())
            }
            _ => Err(invalid(trade_id, "only an idle RELEASED escrow can be reinstated")),
        }
    }

    /// Look up the record for a trade. Reservations are not visible.
    #[must_use]
    pub fn get(&self, trade_id: &TradeId) -> Option<EscrowRecord> {
        self.slots.get(trade_id).and_then(|slot| match &*slot {
            Slot::Recorded { record, .. } => Some(record.clone()),
            Slot::Reserved => None,
        })
    }

    /// Number of records in `state`.
    #[must_use]
    pub fn count_in_state(&self, state: EscrowState) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(&**slot, Slot::Recorded { record, .. } if record.state == state))
            .count()
    }

    /// Number of recorded escrows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(&**slot, Slot::Recorded { .. }))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use escrowbook_types::AccountId;
    use rust_decimal::Decimal;

    use super::*;

    fn locked(log: &EscrowLog) -> TradeId {
        let trade_id = TradeId::new();
        assert!(matches!(log.reserve(trade_id).unwrap(), Reservation::Fresh));
        log.record_locked(EscrowRecord::locked(
            trade_id,
            AccountId::new(),
            "BTC",
            Decimal::new(5, 2),
        ));
        trade_id
    }

    #[test]
    fn reservation_is_invisible_until_recorded() {
        let log = EscrowLog::new();
        let trade_id = TradeId::new();
        log.reserve(trade_id).unwrap();
        assert!(log.get(&trade_id).is_none());
        assert!(log.is_empty());
        let err = log.claim(trade_id, EscrowState::Unlocked).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn second_reserve_while_in_flight_fails() {
        let log = EscrowLog::new();
        let trade_id = TradeId::new();
        log.reserve(trade_id).unwrap();
        assert!(log.reserve(trade_id).is_err());
    }

    #[test]
    fn abandon_frees_trade_id() {
        let log = EscrowLog::new();
        let trade_id = TradeId::new();
        log.reserve(trade_id).unwrap();
        log.abandon(trade_id);
        assert!(matches!(log.reserve(trade_id).unwrap(), Reservation::Fresh));
    }

    #[test]
    fn reserve_on_locked_returns_existing() {
        let log = EscrowLog::new();
        let trade_id = locked(&log);
        assert!(matches!(
            log.reserve(trade_id).unwrap(),
            Reservation::Existing(rec) if rec.trade_id == trade_id
        ));
    }

    #[test]
    fn claim_complete_then_retry_is_resolved() {
        let log = EscrowLog::new();
        let trade_id = locked(&log);
        assert!(matches!(
            log.claim(trade_id, EscrowState::Released).unwrap(),
            Claim::Fresh(_)
        ));
        let rec = log.complete(trade_id).unwrap();
        assert_eq!(rec.state, EscrowState::Released);
        assert!(rec.resolved_at.is_some());
        assert!(matches!(
            log.claim(trade_id, EscrowState::Released).unwrap(),
            Claim::Resolved(_)
        ));
        assert!(log.claim(trade_id, EscrowState::Unlocked).is_err());
    }

    #[test]
    fn concurrent_claim_rejected() {
        let log = EscrowLog::new();
        let trade_id = locked(&log);
        log.claim(trade_id, EscrowState::Released).unwrap();
        let err = log.claim(trade_id, EscrowState::Unlocked).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn release_claim_keeps_locked() {
        let log = EscrowLog::new();
        let trade_id = locked(&log);
        log.claim(trade_id, EscrowState::Unlocked).unwrap();
        log.release_claim(trade_id);
        assert_eq!(log.get(&trade_id).unwrap().state, EscrowState::Locked);
        assert!(matches!(
            log.claim(trade_id, EscrowState::Unlocked).unwrap(),
            Claim::Fresh(_)
        ));
    }

    #[test]
    fn transition_missing_is_invalid() {
        let log = EscrowLog::new();
        let err = log.transition(TradeId::new(), EscrowState::Released).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn transition_terminal_is_invalid() {
        let log = EscrowLog::new();
        let trade_id = locked(&log);
        log.transition(trade_id, EscrowState::Unlocked).unwrap();
        assert!(log.transition(trade_id, EscrowState::Released).is_err());
        assert_eq!(log.count_in_state(EscrowState::Unlocked), 1);
    }

    #[test]
    fn reinstate_only_from_released() {
        let log = EscrowLog::new();
        let trade_id = locked(&log);
        assert!(log.reinstate(trade_id).is_err());
        log.transition(trade_id, EscrowState::Released).unwrap();
        let rec = log.reinstate(trade_id).unwrap();
        assert_eq!(rec.state, EscrowState::Locked);
        assert!(rec.resolved_at.is_none());
    }
}
