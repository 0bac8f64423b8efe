//! Drift check: compare what the broker holds against the stored snapshot.
//!
//! The engine only trades differences between snapshots, so manual trades or
//! partially filled orders make the account drift away from the snapshot.
//! This report shows where.

use copytrade_broker::{Position, Symbol};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::convert::{QuoteSet, TargetQuantities};

/// Drift report for one account.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub account_id: String,
    pub entries: Vec<DriftEntry>,
    /// Sum of |drift value| over entries with a quote.
    pub total_drift_cents: i64,
}

/// One symbol's drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftEntry {
    pub symbol: Symbol,
    pub expected_shares: u64,
    pub actual_shares: u64,
    /// `actual - expected`.
    pub diff_shares: i64,
    /// Drift valued at the current quote; `None` without a quote.
    pub diff_value_cents: Option<i64>,
}

impl DriftReport {
    /// True when every symbol matches the snapshot.
    pub fn in_sync(&self) -> bool {
        self.entries.iter().all(|e| e.diff_shares == 0)
    }

    pub fn drifted(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries.iter().filter(|e| e.diff_shares != 0)
    }
}

/// Compare broker positions against snapshot quantities.
///
/// Symbols come from the snapshot first (in its order), then positions the
/// snapshot does not know about, sorted.
pub fn drift(
    account_id: &str,
    positions: &[Position],
    expected: &TargetQuantities,
    quotes: &QuoteSet,
) -> DriftReport {
    let actual_map: FxHashMap<&Symbol, u64> =
        positions.iter().map(|p| (&p.symbol, p.quantity)).collect();

    let mut symbols: Vec<&Symbol> = expected.iter().map(|(sym, _)| sym).collect();
    let mut extra: Vec<&Symbol> = positions
        .iter()
        .map(|p| &p.symbol)
        .filter(|sym| expected.get(sym).is_none())
        .collect();
    extra.sort();
    extra.dedup();
    symbols.extend(extra);

    let mut entries = Vec::with_capacity(symbols.len());
    let mut total_drift_cents = 0i64;

    for sym in symbols {
        let expected_shares = expected.get(sym).unwrap_or(0);
        let actual_shares = actual_map.get(sym).copied().unwrap_or(0);
        if expected_shares == 0 && actual_shares == 0 {
            continue;
        }
        let diff_shares = actual_shares as i64 - expected_shares as i64;
        let diff_value_cents = quotes.price_cents(sym).map(|price| diff_shares * price);
        if let Some(value) = diff_value_cents {
            total_drift_cents += value.abs();
        }
        entries.push(DriftEntry {
            symbol: sym.clone(),
            expected_shares,
            actual_shares,
            diff_shares,
            diff_value_cents,
        });
    }

    DriftReport {
        account_id: account_id.to_string(),
        entries,
        total_drift_cents,
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "DRIFT for {}:", self.account_id)?;
        writeln!(
            f,
            "  {:8} {:>10} {:>10} {:>8} {:>12}",
            "Symbol", "Snapshot", "Broker", "Diff", "Diff $"
        )?;
        for e in &self.entries {
            let value = match e.diff_value_cents {
                Some(cents) => format!("{:+.2}", cents as f64 / 100.0),
                None => "n/a".to_string(),
            };
            writeln!(
                f,
                "  {:8} {:>10} {:>10} {:>+8} {:>12}",
                e.symbol, e.expected_shares, e.actual_shares, e.diff_shares, value
            )?;
        }
        if self.in_sync() {
            writeln!(f, "\n  In sync with snapshot.")?;
        } else {
            writeln!(
                f,
                "\n  Total drift: ${:.2}",
                self.total_drift_cents as f64 / 100.0
            )?;
        }
        Ok(())
    }
}
