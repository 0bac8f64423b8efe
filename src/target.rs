//! Target allocation: symbol → percent of the tradable account value.
//!
//! Allocations come from an [`AllocationProvider`]. The bundled provider,
//! [`TargetFile`], reads a JSON document that either lists percentages
//! directly or lists the holdings of a leader account, which are normalized
//! to percentages.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use copytrade_broker::Symbol;
use log::info;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Cash pseudo-symbol reported by leader accounts; never traded.
pub const CASH_SYMBOL: &str = "$USD";

/// Minimum sum of normalized holding percentages. Anything lower means the
/// holdings list was truncated or mispriced.
pub const MIN_HOLDINGS_CHECKSUM: f64 = 99.0;

/// Desired weights for one cycle. Order is preserved from the source and
/// drives the order of every derived structure.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetAllocation {
    entries: Vec<(Symbol, f64)>,
}

impl TargetAllocation {
    /// Build and validate an allocation from (symbol, percent) pairs.
    ///
    /// Percentages must be finite and within [0, 100]; they need not sum to
    /// 100. Duplicate symbols are rejected.
    pub fn new(entries: Vec<(Symbol, f64)>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::Target("allocation is empty".into()));
        }

        let mut seen = rustc_hash::FxHashSet::default();
        for (sym, pct) in &entries {
            if !seen.insert(sym) {
                return Err(Error::Target(format!("duplicate symbol: {sym}")));
            }
            if !pct.is_finite() || *pct < 0.0 || *pct > 100.0 {
                return Err(Error::Target(format!(
                    "percent for {sym} ({pct}) must be within [0, 100]"
                )));
            }
        }

        Ok(Self { entries })
    }

    /// Normalize leader-account holdings (symbol, market value in cents) into
    /// percentages rounded to two decimals.
    ///
    /// Cash and non-positive holdings are skipped. Fails if the rounded
    /// percentages sum to less than [`MIN_HOLDINGS_CHECKSUM`].
    pub fn from_holdings(holdings: &[(Symbol, i64)]) -> Result<Self> {
        let invested: Vec<&(Symbol, i64)> = holdings
            .iter()
            .filter(|(sym, value)| sym.as_str() != CASH_SYMBOL && *value > 0)
            .collect();

        let total: i64 = invested.iter().map(|(_, value)| value).sum();
        if total <= 0 {
            return Err(Error::Target("holdings have no positive market value".into()));
        }

        let entries: Vec<(Symbol, f64)> = invested
            .iter()
            .map(|(sym, value)| {
                let pct = round_2dp(*value as f64 / total as f64 * 100.0);
                (sym.clone(), pct)
            })
            .collect();

        let checksum: f64 = entries.iter().map(|(_, pct)| pct).sum();
        if checksum < MIN_HOLDINGS_CHECKSUM {
            return Err(Error::Target(format!(
                "holding percentages sum to {checksum:.2} (< {MIN_HOLDINGS_CHECKSUM})"
            )));
        }

        Self::new(entries)
    }

    pub fn entries(&self) -> &[(Symbol, f64)] {
        &self.entries
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.entries.iter().map(|(sym, _)| sym.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all percentages.
    pub fn total_percent(&self) -> f64 {
        self.entries.iter().map(|(_, pct)| pct).sum()
    }
}

fn round_2dp(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Source of the target allocation. Any failure aborts the cycle.
pub trait AllocationProvider {
    fn fetch_target_allocation(&self) -> Result<TargetAllocation>;
}

/// On-disk target document.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub targets: Option<Vec<TargetPercent>>,
    #[serde(default)]
    pub holdings: Option<Vec<LeaderHolding>>,
}

/// A single target: symbol + percent of the trade value.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetPercent {
    pub symbol: String,
    pub percent: f64,
}

/// A leader-account holding, valued in dollars.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderHolding {
    pub symbol: String,
    pub market_value: f64,
}

impl TargetSpec {
    /// Parse from a JSON string (useful for testing).
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Convert into a validated allocation.
    pub fn to_allocation(&self) -> Result<TargetAllocation> {
        match (&self.targets, &self.holdings) {
            (Some(targets), None) => {
                let entries = targets
                    .iter()
                    .map(|t| Ok((parse_symbol(&t.symbol)?, t.percent)))
                    .collect::<Result<Vec<_>>>()?;
                TargetAllocation::new(entries)
            }
            (None, Some(holdings)) => {
                let values = holdings
                    .iter()
                    .filter(|h| h.symbol.trim() != CASH_SYMBOL)
                    .map(|h| {
                        if !h.market_value.is_finite() {
                            return Err(Error::Target(format!(
                                "market value for {} is not finite",
                                h.symbol
                            )));
                        }
                        Ok((parse_symbol(&h.symbol)?, (h.market_value * 100.0).round() as i64))
                    })
                    .collect::<Result<Vec<_>>>()?;
                TargetAllocation::from_holdings(&values)
            }
            (Some(_), Some(_)) => Err(Error::Target(
                "target file must contain either `targets` or `holdings`, not both".into(),
            )),
            (None, None) => Err(Error::Target(
                "target file must contain `targets` or `holdings`".into(),
            )),
        }
    }
}

fn parse_symbol(raw: &str) -> Result<Symbol> {
    Symbol::try_new(raw).ok_or_else(|| Error::Target("empty symbol".into()))
}

/// Reads the allocation from a JSON file on every fetch, so edits between
/// polls are picked up.
#[derive(Debug, Clone)]
pub struct TargetFile {
    path: PathBuf,
}

impl TargetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and parse the target document.
    pub fn load(&self) -> Result<TargetSpec> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| Error::TargetRead {
            path: self.path.clone(),
            source: e,
        })?;
        TargetSpec::from_json(&contents)
    }
}

impl AllocationProvider for TargetFile {
    fn fetch_target_allocation(&self) -> Result<TargetAllocation> {
        let spec = self.load()?;
        let allocation = spec.to_allocation()?;
        info!(
            "Loaded {} targets ({:.2}% total) from {}",
            allocation.len(),
            allocation.total_percent(),
            self.path.display()
        );
        Ok(allocation)
    }
}
