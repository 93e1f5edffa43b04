//! Escrowbook simulation binary.
//!
//! Runs a concurrent trade workload against an in-memory ledger and audits
//! the books afterwards: every row satisfies `total >= locked >= 0`, no
//! escrow is left locked, supply is conserved and the history chain is
//! intact.
//!
//! ```text
//! escrowbook-sim [config.json]
//!
//! ESCROWBOOK_CONFIG   config path when no argument is given
//! ESCROWBOOK_LOG_JSON emit JSON log lines when set
//! RUST_LOG            log filter (default "info")
//! ```

mod workload;

use std::process::ExitCode;

use escrowbook_ledger::{BalanceStore, InMemoryBalanceStore, Ledger};
use escrowbook_settlement::SettlementOrchestrator;
use escrowbook_types::{EscrowState, LedgerConfig, LedgerError, Result, constants};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::workload::WorkloadConfig;

/// Configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct SimConfig {
    ledger: LedgerConfig,
    workload: WorkloadConfig,
}

impl SimConfig {
    fn load() -> Result<Self> {
        let path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("ESCROWBOOK_CONFIG").ok());
        let Some(path) = path else {
            info!("No config given, using defaults");
            return Ok(Self::default());
        };
        info!(%path, "Loading config");
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| LedgerError::Configuration(format!("cannot read {path}: {err}")))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.ledger.validate()?;
        config.workload.validate()?;
        Ok(config)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var_os("ESCROWBOOK_LOG_JSON").is_some() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn audit<S: BalanceStore>(orch: &SettlementOrchestrator<S>) -> Result<()> {
    let ledger = orch.ledger();
    ledger.verify_invariants()?;
    ledger.verify_all_supply()?;
    ledger.history().verify_chain()?;
    let still_locked = ledger.escrow_log().count_in_state(EscrowState::Locked);
    if still_locked > 0 && orch.incidents().is_empty() {
        return Err(LedgerError::InvariantViolation {
            reason: format!("{still_locked} escrows left locked with no incident recorded"),
        });
    }
    info!(
        entries = ledger.history().len(),
        escrows = ledger.escrow_log().len(),
        released = ledger.escrow_log().count_in_state(EscrowState::Released),
        unlocked = ledger.escrow_log().count_in_state(EscrowState::Unlocked),
        incidents = orch.incidents().len(),
        "Audit passed"
    );
    Ok(())
}

fn run() -> Result<()> {
    info!(
        engine = constants::ENGINE_NAME,
        version = constants::VERSION,
        "Starting simulation"
    );
    let config = SimConfig::load()?;
    let ledger = Ledger::new(InMemoryBalanceStore::new(), config.ledger.clone())?;
    let orch = SettlementOrchestrator::new(ledger)?;

    let report = workload::run(&orch, &config.workload)?;
    info!(report = %serde_json::to_string(&report)?, "Workload finished");

    audit(&orch)
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Simulation failed");
            ExitCode::FAILURE
        }
    }
}
