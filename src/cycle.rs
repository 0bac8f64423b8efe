//! One reconciliation cycle for one account.
//!
//! allocation → valuation → quotes → conversion → diff against the stored
//! snapshot → sequenced orders → snapshot write-back. A fatal error in any
//! step before the orders aborts the cycle with nothing placed; per-symbol
//! order failures are recorded and the rest of the cycle carries on.

use std::fmt;

use chrono::{DateTime, Utc};
use copytrade_broker::{Brokerage, Symbol};
use log::{error, info, warn};
use serde::Serialize;

use crate::convert::{self, AccountValuation, QuoteSet, Rounding, TargetQuantities};
use crate::diff::{Diff, diff};
use crate::error::Error;
use crate::retry::{RetryPolicy, Sleeper, with_retry};
use crate::sequencer::{
    Failure, IntentOutcome, Intents, Mode, Phase, Sequencer, SettlementPolicy, plan_intents,
};
use crate::snapshot::{HoldingsSnapshot, SnapshotStore};
use crate::target::AllocationProvider;

/// Per-cycle knobs, resolved from the config file and CLI flags.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleSettings {
    pub trade_with_pct: f64,
    pub padding_cents: i64,
    pub rounding: Rounding,
    pub mode: Mode,
    pub retry: RetryPolicy,
    pub settlement: SettlementPolicy,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            trade_with_pct: 100.0,
            padding_cents: 0,
            rounding: Rounding::Down,
            mode: Mode::DryRun,
            retry: RetryPolicy::default(),
            settlement: SettlementPolicy::default(),
        }
    }
}

/// A fatal error, tagged with the step it happened in.
#[derive(Debug, thiserror::Error)]
#[error("{phase} failed: {source}")]
pub struct CycleError {
    pub phase: Phase,
    pub source: Error,
}

fn at(phase: Phase) -> impl FnOnce(Error) -> CycleError {
    move |source| CycleError { phase, source }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Orders were sequenced (some may have failed; see `failures`).
    Completed,
    /// Target quantities match the snapshot; nothing to do.
    NoChange,
    /// A fatal error stopped the cycle.
    Aborted { phase: Phase, cause: String },
}

/// Everything a cycle computed and did, for logging and the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub account_id: String,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub trade_value_cents: Option<i64>,
    pub targets: Option<TargetQuantities>,
    pub diff: Diff,
    pub intents: Vec<IntentOutcome>,
    pub failures: Vec<Failure>,
    pub unsettled: Vec<Symbol>,
    pub snapshot_saved: bool,
}

impl ExecutionReport {
    fn new(account_id: &str, mode: Mode, started_at: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.to_string(),
            mode,
            started_at,
            finished_at: started_at,
            outcome: CycleOutcome::NoChange,
            trade_value_cents: None,
            targets: None,
            diff: Diff::default(),
            intents: Vec::new(),
            failures: Vec::new(),
            unsettled: Vec::new(),
            snapshot_saved: false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Aborted { .. })
    }

    /// Neither aborted nor carrying per-symbol failures.
    pub fn is_clean(&self) -> bool {
        !self.is_aborted() && self.failures.is_empty()
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: ", self.account_id, self.mode)?;
        match &self.outcome {
            CycleOutcome::Completed => writeln!(
                f,
                "completed, {} intents, {} failures{}",
                self.intents.len(),
                self.failures.len(),
                if self.snapshot_saved {
                    ", snapshot saved"
                } else {
                    ""
                }
            )?,
            CycleOutcome::NoChange => writeln!(f, "no change")?,
            CycleOutcome::Aborted { phase, cause } => {
                writeln!(f, "ABORTED during {phase}: {cause}")?
            }
        }
        for failure in &self.failures {
            writeln!(f, "  FAILED {failure}")?;
        }
        if !self.unsettled.is_empty() {
            let names: Vec<&str> = self.unsettled.iter().map(|s| s.as_str()).collect();
            writeln!(f, "  unsettled sells: {}", names.join(", "))?;
        }
        Ok(())
    }
}

/// Conversion and diff for one account, without any orders placed.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub account_id: String,
    pub equity_cents: i64,
    pub trade_value_cents: i64,
    pub dollar_targets: Vec<(Symbol, i64)>,
    pub targets: TargetQuantities,
    pub previous: Option<HoldingsSnapshot>,
    pub diff: Diff,
    pub intents: Intents,
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "PLAN for {} (equity ${:.2}, trade value ${:.2}):",
            self.account_id,
            self.equity_cents as f64 / 100.0,
            self.trade_value_cents as f64 / 100.0
        )?;
        writeln!(f, "  {:8} {:>12} {:>8}", "Symbol", "Target $", "Shares")?;
        for (sym, cents) in &self.dollar_targets {
            let shares = self.targets.get(sym).unwrap_or(0);
            writeln!(f, "  {sym:8} {:>12.2} {shares:>8}", *cents as f64 / 100.0)?;
        }
        match &self.previous {
            Some(snap) => writeln!(
                f,
                "\n  Changes since {}:",
                snap.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
            )?,
            None => writeln!(f, "\n  No snapshot yet; everything is new:")?,
        }
        write!(f, "{}", self.diff)?;
        if !self.intents.is_empty() {
            writeln!(f, "\n  Orders ({}):", self.intents.len())?;
            for intent in self.intents.sells.iter().chain(&self.intents.buys) {
                writeln!(f, "    {intent}")?;
            }
        }
        Ok(())
    }
}

/// Runs cycles against one broker, allocation source and snapshot store.
pub struct Reconciler<'a> {
    settings: &'a CycleSettings,
    provider: &'a dyn AllocationProvider,
    broker: &'a dyn Brokerage,
    store: &'a dyn SnapshotStore,
    sleeper: &'a dyn Sleeper,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        settings: &'a CycleSettings,
        provider: &'a dyn AllocationProvider,
        broker: &'a dyn Brokerage,
        store: &'a dyn SnapshotStore,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            settings,
            provider,
            broker,
            store,
            sleeper,
        }
    }

    pub fn settings(&self) -> &CycleSettings {
        self.settings
    }

    /// Convert and diff without placing orders or touching the snapshot.
    pub fn plan(&self, account_id: &str) -> Result<Plan, CycleError> {
        let allocation = self
            .provider
            .fetch_target_allocation()
            .map_err(at(Phase::Allocation))?;

        let previous = self.store.load(account_id).map_err(at(Phase::Snapshot))?;

        let account = with_retry(
            &self.settings.retry,
            self.sleeper,
            &format!("{account_id}: account"),
            || self.broker.account(account_id),
        )
        .map_err(|source| Error::Broker {
            step: "account",
            source,
        })
        .map_err(at(Phase::Valuation))?;
        let valuation = AccountValuation {
            equity_cents: account.equity_cents,
            trade_with_pct: self.settings.trade_with_pct,
            padding_cents: self.settings.padding_cents,
        };
        let trade_value = valuation
            .trade_value_cents()
            .map_err(at(Phase::Valuation))?;

        let symbols = allocation.symbols();
        let quotes: QuoteSet = with_retry(
            &self.settings.retry,
            self.sleeper,
            &format!("{account_id}: quotes"),
            || self.broker.quotes(&symbols),
        )
        .map_err(|source| Error::Broker {
            step: "quotes",
            source,
        })
        .map_err(at(Phase::Quotes))?
        .into();

        let targets = convert::convert(&allocation, &valuation, &quotes, self.settings.rounding)
            .map_err(at(Phase::Conversion))?;

        let baseline = previous
            .as_ref()
            .map(|s| s.quantities.clone())
            .unwrap_or_default();
        let diff = diff(&baseline, &targets);
        let intents = plan_intents(&diff);

        Ok(Plan {
            account_id: account_id.to_string(),
            equity_cents: account.equity_cents,
            trade_value_cents: trade_value,
            dollar_targets: convert::dollar_targets(&allocation, trade_value),
            targets,
            previous,
            diff,
            intents,
        })
    }

    /// Run one full cycle. Never panics on broker or data errors; anything
    /// fatal ends up as `CycleOutcome::Aborted` in the report.
    pub fn run_cycle(&self, account_id: &str) -> ExecutionReport {
        let mode = self.settings.mode;
        let mut report = ExecutionReport::new(account_id, mode, Utc::now());
        info!("{account_id}: cycle started ({mode})");

        match self.execute(account_id, &mut report) {
            Ok(()) => {}
            Err(e) => {
                error!("{account_id}: {e}");
                report.outcome = CycleOutcome::Aborted {
                    phase: e.phase,
                    cause: e.source.to_string(),
                };
            }
        }

        report.finished_at = Utc::now();
        report
    }

    fn execute(&self, account_id: &str, report: &mut ExecutionReport) -> Result<(), CycleError> {
        let plan = self.plan(account_id)?;
        report.trade_value_cents = Some(plan.trade_value_cents);
        report.targets = Some(plan.targets.clone());
        report.diff = plan.diff.clone();

        if plan.diff.is_empty() {
            info!("{account_id}: target quantities unchanged, nothing to do");
            report.outcome = CycleOutcome::NoChange;
            return Ok(());
        }
        info!(
            "{account_id}: {} symbols changed, {} orders\n{}",
            plan.diff.len(),
            plan.intents.len(),
            plan.diff
        );

        let sequencer = Sequencer::new(
            self.broker,
            self.sleeper,
            self.settings.mode,
            self.settings.retry,
            self.settings.settlement,
        );
        let outcome = sequencer.execute(account_id, &plan.diff);

        let failed: Vec<Symbol> = outcome.failed_symbols().into_iter().cloned().collect();
        report.intents = outcome.outcomes;
        report.failures = outcome.failures;
        report.unsettled = outcome.unsettled;
        report.outcome = CycleOutcome::Completed;

        if self.settings.mode == Mode::DryRun {
            return Ok(());
        }

        if !failed.is_empty() {
            warn!(
                "{account_id}: {} symbols failed; they keep their previous snapshot entries",
                failed.len()
            );
        }
        let quantities = persisted_quantities(
            plan.previous.as_ref().map(|s| &s.quantities),
            &plan.targets,
            &failed,
        );
        self.store
            .save(&HoldingsSnapshot::new(account_id, quantities))
            .map_err(at(Phase::Persist))?;
        report.snapshot_saved = true;
        Ok(())
    }
}

/// Quantities to write back after a cycle.
///
/// Symbols that traded take their new target. Failed symbols keep whatever
/// the previous snapshot had (or stay absent), so the next cycle sees the
/// same difference and tries again.
pub fn persisted_quantities(
    previous: Option<&TargetQuantities>,
    targets: &TargetQuantities,
    failed: &[Symbol],
) -> TargetQuantities {
    let old = |sym: &Symbol| previous.and_then(|p| p.get(sym));

    let mut entries: Vec<(Symbol, u64)> = Vec::with_capacity(targets.len());
    for (sym, qty) in targets.iter() {
        if failed.contains(sym) {
            if let Some(prev) = old(sym) {
                entries.push((sym.clone(), prev));
            }
        } else {
            entries.push((sym.clone(), qty));
        }
    }

    if let Some(prev) = previous {
        for (sym, qty) in prev.iter() {
            if failed.contains(sym) && targets.get(sym).is_none() {
                entries.push((sym.clone(), qty));
            }
        }
    }

    TargetQuantities::new(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s)
    }

    fn q(entries: &[(&str, u64)]) -> TargetQuantities {
        entries.iter().map(|(s, n)| (sym(s), *n)).collect()
    }

    #[test]
    fn clean_cycle_persists_targets() {
        let targets = q(&[("TQQQ", 344), ("UPRO", 8)]);
        let persisted = persisted_quantities(Some(&q(&[("TQQQ", 300)])), &targets, &[]);
        assert_eq!(persisted, targets);
    }

    #[test]
    fn failed_add_is_left_out() {
        let persisted = persisted_quantities(
            Some(&q(&[("TQQQ", 300)])),
            &q(&[("TQQQ", 344), ("UPRO", 8)]),
            &[sym("UPRO")],
        );
        assert_eq!(persisted, q(&[("TQQQ", 344)]));
    }

    #[test]
    fn failed_change_keeps_old_quantity() {
        let persisted = persisted_quantities(
            Some(&q(&[("TQQQ", 300)])),
            &q(&[("TQQQ", 344)]),
            &[sym("TQQQ")],
        );
        assert_eq!(persisted, q(&[("TQQQ", 300)]));
    }

    #[test]
    fn failed_removal_keeps_old_entry() {
        let persisted = persisted_quantities(
            Some(&q(&[("TQQQ", 300), ("SOXL", 50)])),
            &q(&[("TQQQ", 300)]),
            &[sym("SOXL")],
        );
        assert_eq!(persisted, q(&[("TQQQ", 300), ("SOXL", 50)]));
    }

    #[test]
    fn first_run_failure_without_snapshot() {
        let persisted = persisted_quantities(None, &q(&[("TQQQ", 344)]), &[sym("TQQQ")]);
        assert!(persisted.is_empty());
    }

    #[test]
    fn outcome_serializes_with_kind() {
        let json = serde_json::to_value(CycleOutcome::Aborted {
            phase: Phase::Quotes,
            cause: "no quote for XYZ".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "aborted");
        assert_eq!(json["phase"], "quotes");
    }
}
