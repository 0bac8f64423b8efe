//! SNAPSHOT→TARGET diff engine.
//!
//! Compares the quantities recorded after the last successful cycle with the
//! freshly converted target quantities. A zero quantity counts as absent, so
//! a symbol whose target rounds to zero shows up as removed.

use std::fmt;

use copytrade_broker::Symbol;
use serde::Serialize;

use crate::convert::TargetQuantities;

/// A symbol held on both sides whose quantity moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub symbol: Symbol,
    pub old: u64,
    pub new: u64,
}

impl Change {
    /// Signed share delta (`new - old`).
    pub fn delta(&self) -> i64 {
        self.new as i64 - self.old as i64
    }
}

/// What moved between two quantity sets.
///
/// Ordering is deterministic: entries follow the new quantities' order, with
/// symbols that only exist in the old set appended in their old order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub added: Vec<(Symbol, u64)>,
    pub removed: Vec<(Symbol, u64)>,
    pub changed: Vec<Change>,
}

impl Diff {
    /// True when nothing needs to trade.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Number of symbols that moved.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    /// Every symbol that appears in any of the three sets.
    pub fn symbols(&self) -> Vec<&Symbol> {
        self.added
            .iter()
            .map(|(sym, _)| sym)
            .chain(self.changed.iter().map(|c| &c.symbol))
            .chain(self.removed.iter().map(|(sym, _)| sym))
            .collect()
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "  (no changes)");
        }
        for (sym, qty) in &self.added {
            writeln!(f, "  + {sym:8} {qty:>8}")?;
        }
        for c in &self.changed {
            writeln!(f, "  ~ {:8} {:>8} -> {:<8} ({:+})", c.symbol, c.old, c.new, c.delta())?;
        }
        for (sym, qty) in &self.removed {
            writeln!(f, "  - {sym:8} {qty:>8}")?;
        }
        Ok(())
    }
}

/// Compute added / removed / changed between `old` and `new`.
///
/// Pure comparison: `diff(s, s)` is always empty.
pub fn diff(old: &TargetQuantities, new: &TargetQuantities) -> Diff {
    let old_map = old.as_map();
    let new_map = new.as_map();

    let mut result = Diff::default();

    for (sym, new_qty) in new.iter() {
        let old_qty = old_map.get(sym).copied().unwrap_or(0);
        match (old_qty, new_qty) {
            (0, 0) => {}
            (0, n) => result.added.push((sym.clone(), n)),
            (o, 0) => result.removed.push((sym.clone(), o)),
            (o, n) if o != n => result.changed.push(Change {
                symbol: sym.clone(),
                old: o,
                new: n,
            }),
            _ => {}
        }
    }

    for (sym, old_qty) in old.iter() {
        if old_qty > 0 && !new_map.contains_key(sym) {
            result.removed.push((sym.clone(), old_qty));
        }
    }

    result
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
    fn scenario_add_and_increase() {
        let d = diff(&q(&[("TQQQ", 300)]), &q(&[("TQQQ", 344), ("UPRO", 8)]));

        assert_eq!(d.added, vec![(sym("UPRO"), 8)]);
        assert!(d.removed.is_empty());
        assert_eq!(
            d.changed,
            vec![Change {
                symbol: sym("TQQQ"),
                old: 300,
                new: 344
            }]
        );
        assert_eq!(d.changed[0].delta(), 44);
    }

    #[test]
    fn identical_snapshots_are_empty() {
        let s = q(&[("TQQQ", 344), ("UPRO", 8), ("NAIL", 0)]);
        assert!(diff(&s, &s).is_empty());
    }

    #[test]
    fn first_run_adds_everything() {
        let d = diff(&TargetQuantities::default(), &q(&[("TQQQ", 344), ("NAIL", 0)]));
        assert_eq!(d.added, vec![(sym("TQQQ"), 344)]);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn dropped_symbol_is_removed() {
        let d = diff(&q(&[("TQQQ", 300), ("SOXL", 50)]), &q(&[("TQQQ", 300)]));
        assert_eq!(d.removed, vec![(sym("SOXL"), 50)]);
        assert!(d.added.is_empty());
        assert!(d.changed.is_empty());
    }

    #[test]
    fn zero_counts_as_absent() {
        // Now zero in new -> removed with the old quantity.
        let d = diff(&q(&[("NAIL", 300)]), &q(&[("NAIL", 0)]));
        assert_eq!(d.removed, vec![(sym("NAIL"), 300)]);

        // Zero in old, positive in new -> added.
        let d = diff(&q(&[("NAIL", 0)]), &q(&[("NAIL", 12)]));
        assert_eq!(d.added, vec![(sym("NAIL"), 12)]);
        assert!(d.changed.is_empty());
    }

    #[test]
    fn decrease_is_change_with_negative_delta() {
        let d = diff(&q(&[("TQQQ", 344)]), &q(&[("TQQQ", 300)]));
        assert_eq!(d.changed[0].delta(), -44);
    }

    #[test]
    fn ordering_follows_new_then_old() {
        let d = diff(
            &q(&[("OLD1", 1), ("KEEP", 5), ("OLD2", 2)]),
            &q(&[("NEW2", 3), ("KEEP", 6), ("NEW1", 4)]),
        );
        assert_eq!(d.added, vec![(sym("NEW2"), 3), (sym("NEW1"), 4)]);
        assert_eq!(d.removed, vec![(sym("OLD1"), 1), (sym("OLD2"), 2)]);
        assert_eq!(
            d.symbols(),
            vec![
                &sym("NEW2"),
                &sym("NEW1"),
                &sym("KEEP"),
                &sym("OLD1"),
                &sym("OLD2")
            ]
        );
    }

    #[test]
    fn display_lists_each_set() {
        let d = diff(&q(&[("TQQQ", 300), ("SOXL", 5)]), &q(&[("TQQQ", 344), ("UPRO", 8)]));
        let s = d.to_string();
        assert!(s.contains("+ UPRO"));
        assert!(s.contains("~ TQQQ"));
        assert!(s.contains("- SOXL"));
        assert!(s.contains("(+44)"));
    }
}
