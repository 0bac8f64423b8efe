//! Order sequencing: sell phase → settlement wait → buy phase.
//!
//! Sells always go first so the cash they free up is available to the buys.
//! Every order placement runs under the retry supervisor; a symbol whose
//! order ultimately fails is recorded and skipped, never aborting its
//! siblings.

use std::cell::Cell;
use std::fmt;
use std::time::Duration;

use copytrade_broker::{Brokerage, OrderId, OrderIntent, OrderState, Side, Symbol};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::diff::Diff;
use crate::retry::{RetryPolicy, Sleeper, with_retry};

/// Whether orders are actually sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Compute and log intents; place nothing.
    DryRun,
    /// Place real orders.
    Live,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::DryRun => write!(f, "DRY-RUN"),
            Mode::Live => write!(f, "LIVE"),
        }
    }
}

/// What to do when sells are still open after the settlement wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsettledPolicy {
    /// Warn and place the buys anyway.
    Proceed,
    /// Skip the buy phase; the buys are retried next cycle.
    SkipBuys,
}

/// Settlement wait between the sell and buy phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementPolicy {
    /// Upper bound on the time spent waiting for sells to fill. Backoff
    /// between retried status checks counts toward it, so a round of status
    /// retries can overshoot it by at most that round's backoff.
    pub wait: Duration,
    /// Interval between order status checks.
    pub poll: Duration,
    pub on_unsettled: UnsettledPolicy,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(30),
            poll: Duration::from_secs(1),
            on_unsettled: UnsettledPolicy::Proceed,
        }
    }
}

/// Step of a reconciliation cycle, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Allocation,
    Snapshot,
    Valuation,
    Quotes,
    Conversion,
    Sell,
    Settlement,
    Buy,
    Persist,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Allocation => "allocation",
            Phase::Snapshot => "snapshot",
            Phase::Valuation => "valuation",
            Phase::Quotes => "quotes",
            Phase::Conversion => "conversion",
            Phase::Sell => "sell",
            Phase::Settlement => "settlement",
            Phase::Buy => "buy",
            Phase::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// Sell and buy intents derived from a diff, zero quantities filtered out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Intents {
    pub sells: Vec<OrderIntent>,
    pub buys: Vec<OrderIntent>,
}

impl Intents {
    pub fn is_empty(&self) -> bool {
        self.sells.is_empty() && self.buys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sells.len() + self.buys.len()
    }
}

/// Derive order intents from a diff.
///
/// Sells: every removed symbol in full, plus the reduction of each decreased
/// symbol. Buys: every added symbol in full, plus the increase of each
/// increased symbol.
pub fn plan_intents(diff: &Diff) -> Intents {
    let mut intents = Intents::default();

    for (sym, qty) in &diff.removed {
        push_intent(&mut intents.sells, sym, Side::Sell, *qty);
    }
    for change in &diff.changed {
        if change.new < change.old {
            push_intent(&mut intents.sells, &change.symbol, Side::Sell, change.old - change.new);
        }
    }

    for (sym, qty) in &diff.added {
        push_intent(&mut intents.buys, sym, Side::Buy, *qty);
    }
    for change in &diff.changed {
        if change.new > change.old {
            push_intent(&mut intents.buys, &change.symbol, Side::Buy, change.new - change.old);
        }
    }

    intents
}

fn push_intent(out: &mut Vec<OrderIntent>, symbol: &Symbol, side: Side, quantity: u64) {
    if quantity == 0 {
        return;
    }
    out.push(OrderIntent {
        symbol: symbol.clone(),
        side,
        quantity,
    });
}

/// What happened to one intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntentStatus {
    /// Dry run: computed, not sent.
    Planned,
    /// Accepted by the broker.
    Placed { order_id: OrderId },
    /// Placement failed after retries, or the order was cancelled/rejected.
    Failed { cause: String },
    /// Not attempted this cycle.
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentOutcome {
    pub intent: OrderIntent,
    pub phase: Phase,
    #[serde(flatten)]
    pub status: IntentStatus,
}

/// A per-symbol failure, reported with the phase it occurred in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub symbol: Option<Symbol>,
    pub phase: Phase,
    pub cause: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(sym) => write!(f, "[{}] {}: {}", self.phase, sym, self.cause),
            None => write!(f, "[{}] {}", self.phase, self.cause),
        }
    }
}

/// Result of sequencing one diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SequenceOutcome {
    pub outcomes: Vec<IntentOutcome>,
    /// Sells still open when the settlement wait ran out.
    pub unsettled: Vec<Symbol>,
    pub failures: Vec<Failure>,
}

impl SequenceOutcome {
    /// Symbols whose intent did not go through this cycle.
    pub fn failed_symbols(&self) -> Vec<&Symbol> {
        let mut symbols: Vec<&Symbol> = Vec::new();
        for outcome in &self.outcomes {
            if matches!(
                outcome.status,
                IntentStatus::Failed { .. } | IntentStatus::Skipped { .. }
            ) && !symbols.contains(&&outcome.intent.symbol)
            {
                symbols.push(&outcome.intent.symbol);
            }
        }
        symbols
    }

    pub fn placed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, IntentStatus::Placed { .. }))
            .count()
    }

    fn record_failure(&mut self, intent: &OrderIntent, phase: Phase, cause: String) {
        self.failures.push(Failure {
            symbol: Some(intent.symbol.clone()),
            phase,
            cause: cause.clone(),
        });
        self.outcomes.push(IntentOutcome {
            intent: intent.clone(),
            phase,
            status: IntentStatus::Failed { cause },
        });
    }
}

/// Places a diff's orders against one account in sell-then-buy order.
pub struct Sequencer<'a> {
    broker: &'a dyn Brokerage,
    sleeper: &'a dyn Sleeper,
    mode: Mode,
    retry: RetryPolicy,
    settlement: SettlementPolicy,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        broker: &'a dyn Brokerage,
        sleeper: &'a dyn Sleeper,
        mode: Mode,
        retry: RetryPolicy,
        settlement: SettlementPolicy,
    ) -> Self {
        Self {
            broker,
            sleeper,
            mode,
            retry,
            settlement,
        }
    }

    /// Execute `diff` against `account_id`.
    pub fn execute(&self, account_id: &str, diff: &Diff) -> SequenceOutcome {
        let intents = plan_intents(diff);
        let mut outcome = SequenceOutcome::default();

        if intents.is_empty() {
            info!("{account_id}: nothing to trade");
            return outcome;
        }

        if self.mode == Mode::DryRun {
            for intent in intents.sells.iter().chain(&intents.buys) {
                info!("{account_id}: [DRY RUN] would {intent}");
                outcome.outcomes.push(IntentOutcome {
                    intent: intent.clone(),
                    phase: phase_for(intent.side),
                    status: IntentStatus::Planned,
                });
            }
            return outcome;
        }

        let sells = self.place_all(account_id, &intents.sells, Phase::Sell, &mut outcome);

        if !sells.is_empty() {
            let open = self.await_settlement(account_id, &sells, &mut outcome);
            if !open.is_empty() {
                let names: Vec<&str> = open.iter().map(|s| s.as_str()).collect();
                outcome.unsettled = open.clone();
                match self.settlement.on_unsettled {
                    UnsettledPolicy::Proceed => warn!(
                        "{account_id}: sells still open after {:.0}s ({}); proceeding with buys",
                        self.settlement.wait.as_secs_f64(),
                        names.join(", ")
                    ),
                    UnsettledPolicy::SkipBuys => {
                        warn!(
                            "{account_id}: sells still open after {:.0}s ({}); skipping {} buys",
                            self.settlement.wait.as_secs_f64(),
                            names.join(", "),
                            intents.buys.len()
                        );
                        let reason = format!("sells unsettled: {}", names.join(", "));
                        for intent in &intents.buys {
                            outcome.failures.push(Failure {
                                symbol: Some(intent.symbol.clone()),
                                phase: Phase::Buy,
                                cause: reason.clone(),
                            });
                            outcome.outcomes.push(IntentOutcome {
                                intent: intent.clone(),
                                phase: Phase::Buy,
                                status: IntentStatus::Skipped {
                                    reason: reason.clone(),
                                },
                            });
                        }
                        return outcome;
                    }
                }
            }
        }

        self.place_all(account_id, &intents.buys, Phase::Buy, &mut outcome);
        outcome
    }

    /// Place each intent, isolating failures per symbol. Returns accepted orders.
    fn place_all(
        &self,
        account_id: &str,
        intents: &[OrderIntent],
        phase: Phase,
        outcome: &mut SequenceOutcome,
    ) -> Vec<(OrderId, OrderIntent)> {
        let mut accepted = Vec::new();
        for (i, intent) in intents.iter().enumerate() {
            let label = format!("{account_id}: {intent}");
            match with_retry(&self.retry, self.sleeper, &label, || {
                self.broker.place_order(account_id, intent)
            }) {
                Ok(order_id) => {
                    info!(
                        "{account_id}: [{}/{}] {intent} placed as {order_id}",
                        i + 1,
                        intents.len()
                    );
                    outcome.outcomes.push(IntentOutcome {
                        intent: intent.clone(),
                        phase,
                        status: IntentStatus::Placed { order_id },
                    });
                    accepted.push((order_id, intent.clone()));
                }
                Err(e) => {
                    error!("{account_id}: {intent} failed: {e}");
                    outcome.record_failure(intent, phase, e.to_string());
                }
            }
        }
        accepted
    }

    /// Poll sell orders until they all reach a terminal state or the wait runs
    /// out. Returns the symbols still open.
    fn await_settlement(
        &self,
        account_id: &str,
        sells: &[(OrderId, OrderIntent)],
        outcome: &mut SequenceOutcome,
    ) -> Vec<Symbol> {
        let mut pending: Vec<&(OrderId, OrderIntent)> = sells.iter().collect();
        let mut waited = Duration::ZERO;
        let status_sleeper = CountingSleeper::new(self.sleeper);
        info!(
            "{account_id}: waiting up to {:.0}s for {} sells to settle",
            self.settlement.wait.as_secs_f64(),
            sells.len()
        );

        loop {
            let mut still_open = Vec::new();
            for entry in pending {
                let (id, intent) = entry;
                let label = format!("{account_id}: status of {id}");
                match with_retry(&self.retry, &status_sleeper, &label, || {
                    self.broker.order_status(account_id, *id)
                }) {
                    Ok(OrderState::Filled) => {}
                    Ok(state @ (OrderState::Cancelled | OrderState::Rejected)) => {
                        warn!("{account_id}: sell {intent} ended {state:?}");
                        mark_failed(outcome, intent, Phase::Settlement, format!("sell order {id} {state:?}"));
                    }
                    Ok(_) => still_open.push(entry),
                    Err(e) => {
                        warn!("{account_id}: could not check {id}: {e}");
                        still_open.push(entry);
                    }
                }
            }
            pending = still_open;
            waited += status_sleeper.take();

            if pending.is_empty() || waited >= self.settlement.wait {
                break;
            }
            let step = self
                .settlement
                .poll
                .min(self.settlement.wait.saturating_sub(waited))
                .max(Duration::from_millis(1));
            self.sleeper.sleep(step);
            waited += step;
        }

        pending.into_iter().map(|(_, intent)| intent.symbol.clone()).collect()
    }
}

/// Forwards to another sleeper and totals the time slept.
struct CountingSleeper<'a> {
    inner: &'a dyn Sleeper,
    slept: Cell<Duration>,
}

impl<'a> CountingSleeper<'a> {
    fn new(inner: &'a dyn Sleeper) -> Self {
        Self {
            inner,
            slept: Cell::new(Duration::ZERO),
        }
    }

    /// Time slept since the last call.
    fn take(&self) -> Duration {
        self.slept.replace(Duration::ZERO)
    }
}

impl Sleeper for CountingSleeper<'_> {
    fn sleep(&self, duration: Duration) {
        self.slept.set(self.slept.get() + duration);
        self.inner.sleep(duration);
    }
}

/// Turn an already-placed intent into a failure (the broker cancelled or
/// rejected it after acceptance).
fn mark_failed(outcome: &mut SequenceOutcome, intent: &OrderIntent, phase: Phase, cause: String) {
    if let Some(existing) = outcome
        .outcomes
        .iter_mut()
        .find(|o| o.intent == *intent && matches!(o.status, IntentStatus::Placed { .. }))
    {
        existing.status = IntentStatus::Failed {
            cause: cause.clone(),
        };
    }
    outcome.failures.push(Failure {
        symbol: Some(intent.symbol.clone()),
        phase,
        cause,
    });
}

fn phase_for(side: Side) -> Phase {
    match side {
        Side::Sell => Phase::Sell,
        Side::Buy => Phase::Buy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Change;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s)
    }

    fn intent(s: &str, side: Side, quantity: u64) -> OrderIntent {
        OrderIntent {
            symbol: sym(s),
            side,
            quantity,
        }
    }

    #[test]
    fn scenario_buys_only() {
        let diff = Diff {
            added: vec![(sym("UPRO"), 8)],
            removed: vec![],
            changed: vec![Change {
                symbol: sym("TQQQ"),
                old: 300,
                new: 344,
            }],
        };
        let intents = plan_intents(&diff);
        assert!(intents.sells.is_empty());
        assert_eq!(
            intents.buys,
            vec![intent("UPRO", Side::Buy, 8), intent("TQQQ", Side::Buy, 44)]
        );
    }

    #[test]
    fn reductions_and_removals_are_sells() {
        let diff = Diff {
            added: vec![],
            removed: vec![(sym("SOXL"), 50)],
            changed: vec![Change {
                symbol: sym("TQQQ"),
                old: 344,
                new: 300,
            }],
        };
        let intents = plan_intents(&diff);
        assert_eq!(
            intents.sells,
            vec![intent("SOXL", Side::Sell, 50), intent("TQQQ", Side::Sell, 44)]
        );
        assert!(intents.buys.is_empty());
        assert_eq!(intents.len(), 2);
    }

    #[test]
    fn zero_quantities_are_filtered() {
        let diff = Diff {
            added: vec![(sym("NAIL"), 0)],
            removed: vec![(sym("SOXL"), 0)],
            changed: vec![],
        };
        assert!(plan_intents(&diff).is_empty());
    }

    #[test]
    fn failure_display() {
        let f = Failure {
            symbol: Some(sym("UPRO")),
            phase: Phase::Buy,
            cause: "rate limit exceeded".into(),
        };
        assert_eq!(f.to_string(), "[buy] UPRO: rate limit exceeded");
    }

    #[test]
    fn failed_symbols_deduplicates() {
        let mut outcome = SequenceOutcome::default();
        let i = intent("UPRO", Side::Buy, 8);
        outcome.record_failure(&i, Phase::Buy, "x".into());
        outcome.record_failure(&i, Phase::Buy, "y".into());
        assert_eq!(outcome.failed_symbols(), vec![&sym("UPRO")]);
        assert_eq!(outcome.failures.len(), 2);
    }

    #[test]
    fn mode_serde_names() {
        let m: Mode = serde_json::from_str("\"dry_run\"").unwrap();
        assert_eq!(m, Mode::DryRun);
        let p: UnsettledPolicy = serde_json::from_str("\"skip_buys\"").unwrap();
        assert_eq!(p, UnsettledPolicy::SkipBuys);
    }
}
