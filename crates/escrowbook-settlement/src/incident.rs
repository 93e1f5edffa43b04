//! Operator-visible incident log.
//!
//! Every failure that needs manual reconciliation lands here and is logged
//! at `error!`: settlements that were compensated, compensation that itself
//! failed, fee credit legs left outstanding, and integrity errors. The log
//! is owned by one orchestrator instance; nothing is global.

use chrono::{DateTime, Utc};
use escrowbook_types::TradeId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentKind {
    /// A release failed after the seller was debited; compensation restored
    /// the escrow.
    SettlementFailed,
    /// Compensation for a failed release did not apply. Funds are debited
    /// with no matching credit until an operator intervenes.
    CompensationFailed,
    /// A fee or commission credit leg is still owed.
    OutstandingCredit,
    /// A caller addressed an escrow in the wrong state or with wrong data.
    Integrity,
}

impl std::fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SettlementFailed => write!(f, "SETTLEMENT_FAILED"),
            Self::CompensationFailed => write!(f, "COMPENSATION_FAILED"),
            Self::OutstandingCredit => write!(f, "OUTSTANDING_CREDIT"),
            Self::Integrity => write!(f, "INTEGRITY"),
        }
    }
}

/// One recorded incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    /// Position in the log, starting at 0.
    pub sequence: u64,
    pub kind: IncidentKind,
    pub trade_id: Option<TradeId>,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only list of incidents.
#[derive(Debug, Default)]
pub struct IncidentLog {
    incidents: Mutex<Vec<Incident>>,
}

impl IncidentLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an incident and log it.
    pub fn record(
        &self,
        kind: IncidentKind,
        trade_id: Option<TradeId>,
        detail: impl Into<String>,
    ) -> Incident {
        let mut incidents = self.incidents.lock();
        let incident = Incident {
            sequence: incidents.len() as u64,
            kind,
            trade_id,
            detail: detail.into(),
            recorded_at: Utc::now(),
        };
        match trade_id {
            Some(trade_id) => {
                error!(%kind, %trade_id, detail = %incident.detail, "Settlement incident");
            }
            None => error!(%kind, detail = %incident.detail, "Settlement incident"),
        }
        incidents.push(incident.clone());
        incident
    }

    /// Every incident, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<Incident> {
        self.incidents.lock().clone()
    }

    #[must_use]
    pub fn for_trade(&self, trade_id: TradeId) -> Vec<Incident> {
        self.incidents
            .lock()
            .iter()
            .filter(|i| i.trade_id == Some(trade_id))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count(&self, kind: IncidentKind) -> usize {
        self.incidents.lock().iter().filter(|i| i.kind == kind).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.incidents.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
