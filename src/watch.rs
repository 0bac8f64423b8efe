//! Polling loop: detect target changes and reconcile each account.

use std::collections::BTreeSet;
use std::time::Duration;

use log::{error, info, warn};

use crate::cycle::{ExecutionReport, Reconciler};
use crate::retry::Sleeper;

/// Timing of the watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Time between polls.
    pub poll_interval: Duration,
    /// Delay between detecting a change and trading on it, so a target that
    /// is still being edited settles first.
    pub change_wait: Duration,
}

/// Repeatedly plans every account and runs a cycle where the target moved.
pub struct Watcher<'a> {
    reconciler: &'a Reconciler<'a>,
    accounts: &'a [String],
    schedule: Schedule,
    sleeper: &'a dyn Sleeper,
    /// Accounts whose last cycle aborted or recorded failures.
    failed: BTreeSet<String>,
}

impl<'a> Watcher<'a> {
    pub fn new(
        reconciler: &'a Reconciler<'a>,
        accounts: &'a [String],
        schedule: Schedule,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            reconciler,
            accounts,
            schedule,
            sleeper,
            failed: BTreeSet::new(),
        }
    }

    /// Accounts currently marked as failed.
    pub fn failed_accounts(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(String::as_str)
    }

    /// One pass over every account. Returns the reports of the cycles run.
    pub fn poll_once(&mut self, on_report: &mut dyn FnMut(&ExecutionReport)) -> Vec<ExecutionReport> {
        if !self.failed.is_empty() {
            let names: Vec<&str> = self.failed_accounts().collect();
            warn!("Accounts with failures in their last cycle: {}", names.join(", "));
        }

        let mut changed = Vec::new();
        for account_id in self.accounts {
            match self.reconciler.plan(account_id) {
                Ok(plan) if plan.diff.is_empty() => {
                    info!("{account_id}: no change detected");
                    self.failed.remove(account_id);
                }
                Ok(plan) => {
                    info!(
                        "{account_id}: change detected ({} symbols)\n{}",
                        plan.diff.len(),
                        plan.diff
                    );
                    changed.push(account_id.as_str());
                }
                Err(e) => {
                    error!("{account_id}: change check failed: {e}");
                    self.failed.insert(account_id.clone());
                }
            }
        }

        if changed.is_empty() {
            return Vec::new();
        }

        info!(
            "Waiting {:.0}s before reconciling {} accounts",
            self.schedule.change_wait.as_secs_f64(),
            changed.len()
        );
        self.sleeper.sleep(self.schedule.change_wait);

        let mut reports = Vec::with_capacity(changed.len());
        for account_id in changed {
            let report = self.reconciler.run_cycle(account_id);
            if report.is_clean() {
                self.failed.remove(account_id);
            } else {
                self.failed.insert(account_id.to_string());
            }
            info!("{report}");
            on_report(&report);
            reports.push(report);
        }
        reports
    }

    /// Poll forever, or `max_polls` times when given.
    pub fn run(&mut self, max_polls: Option<u64>, on_report: &mut dyn FnMut(&ExecutionReport)) {
        let mut polls = 0u64;
        loop {
            self.poll_once(on_report);
            polls += 1;
            if max_polls.is_some_and(|max| polls >= max) {
                break;
            }
            self.sleeper.sleep(self.schedule.poll_interval);
        }
    }
}
