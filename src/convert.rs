//! Quantity converter: target allocation × trade value ÷ price → whole shares.
//!
//! All money is integer cents. The dollar target for each symbol is rounded
//! to the cent first, then divided by the quote in exact integer arithmetic,
//! so `Down` can never overshoot its budget and `Nearest` is off by at most
//! half a share.

use std::fmt;

use copytrade_broker::{Quote, Symbol};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::target::TargetAllocation;

/// How fractional share counts are turned into whole shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    /// Round half away from zero.
    Nearest,
    /// Floor; never buys more than the dollar target.
    Down,
}

impl fmt::Display for Rounding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rounding::Nearest => write!(f, "nearest"),
            Rounding::Down => write!(f, "down"),
        }
    }
}

/// Accounts valued below this are never traded: a zero or near-zero valuation
/// would convert every target to zero shares and liquidate the account.
pub const MIN_EQUITY_CENTS: i64 = 1_00;

/// The slice of an account the engine is allowed to allocate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountValuation {
    pub equity_cents: i64,
    /// Percent of equity to trade with, in [0, 100].
    pub trade_with_pct: f64,
    /// Dollars withheld from the trade value, in cents.
    pub padding_cents: i64,
}

impl AccountValuation {
    /// `equity * trade_with_pct / 100 - padding`, rounded to the cent.
    ///
    /// A negative result is a configuration error: the padding exceeds the
    /// tradable part of the account. Equity under [`MIN_EQUITY_CENTS`] is
    /// refused outright.
    pub fn trade_value_cents(&self) -> Result<i64> {
        if self.equity_cents < MIN_EQUITY_CENTS {
            return Err(Error::InsufficientBalance {
                equity_cents: self.equity_cents,
            });
        }
        if !self.trade_with_pct.is_finite() || !(0.0..=100.0).contains(&self.trade_with_pct) {
            return Err(Error::Config(format!(
                "trade_with_pct {} must be within [0, 100]",
                self.trade_with_pct
            )));
        }
        let tradable = (self.equity_cents as f64 * self.trade_with_pct / 100.0).round() as i64;
        let trade_value = tradable - self.padding_cents;
        if trade_value < 0 {
            return Err(Error::Config(format!(
                "trade value is negative: ${:.2} equity × {}% − ${:.2} padding = ${:.2}",
                self.equity_cents as f64 / 100.0,
                self.trade_with_pct,
                self.padding_cents as f64 / 100.0,
                trade_value as f64 / 100.0,
            )));
        }
        Ok(trade_value)
    }
}

/// Mark prices for one cycle.
#[derive(Debug, Clone, Default)]
pub struct QuoteSet {
    prices: FxHashMap<Symbol, i64>,
}

impl QuoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: Symbol, price_cents: i64) {
        self.prices.insert(symbol, price_cents);
    }

    pub fn price_cents(&self, symbol: &Symbol) -> Option<i64> {
        self.prices.get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl From<Vec<Quote>> for QuoteSet {
    fn from(quotes: Vec<Quote>) -> Self {
        Self {
            prices: quotes
                .into_iter()
                .map(|q| (q.symbol, q.price_cents))
                .collect(),
        }
    }
}

impl FromIterator<(Symbol, i64)> for QuoteSet {
    fn from_iter<I: IntoIterator<Item = (Symbol, i64)>>(iter: I) -> Self {
        Self {
            prices: iter.into_iter().collect(),
        }
    }
}

/// Whole-share targets per symbol, in allocation order. Zero entries are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetQuantities {
    entries: Vec<(Symbol, u64)>,
}

impl TargetQuantities {
    pub fn new(entries: Vec<(Symbol, u64)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[(Symbol, u64)] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, u64)> {
        self.entries.iter().map(|(sym, qty)| (sym, *qty))
    }

    /// Quantity for `symbol`, if present.
    pub fn get(&self, symbol: &Symbol) -> Option<u64> {
        self.entries
            .iter()
            .find(|(sym, _)| sym == symbol)
            .map(|(_, qty)| *qty)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookup table for diffing.
    pub fn as_map(&self) -> FxHashMap<&Symbol, u64> {
        self.iter().collect()
    }
}

impl FromIterator<(Symbol, u64)> for TargetQuantities {
    fn from_iter<I: IntoIterator<Item = (Symbol, u64)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Per-symbol dollar targets in cents, each rounded to the cent.
pub fn dollar_targets(allocation: &TargetAllocation, trade_value_cents: i64) -> Vec<(Symbol, i64)> {
    allocation
        .entries()
        .iter()
        .map(|(sym, pct)| {
            let cents = (trade_value_cents as f64 * pct / 100.0).round() as i64;
            (sym.clone(), cents)
        })
        .collect()
}

/// Whole shares purchasable for `target_cents` at `price_cents`.
///
/// A non-positive target or price yields zero.
pub fn shares_for(target_cents: i64, price_cents: i64, rounding: Rounding) -> u64 {
    if target_cents <= 0 || price_cents <= 0 {
        return 0;
    }
    let shares = match rounding {
        Rounding::Down => target_cents / price_cents,
        Rounding::Nearest => (2 * target_cents + price_cents) / (2 * price_cents),
    };
    shares as u64
}

/// Convert a target allocation into whole-share quantities.
///
/// Every allocated symbol needs a positive quote: a partial conversion would
/// silently leave capital unallocated, so the first missing or invalid quote
/// fails the whole conversion.
pub fn convert(
    allocation: &TargetAllocation,
    valuation: &AccountValuation,
    quotes: &QuoteSet,
    rounding: Rounding,
) -> Result<TargetQuantities> {
    let trade_value = valuation.trade_value_cents()?;

    dollar_targets(allocation, trade_value)
        .into_iter()
        .map(|(sym, target_cents)| {
            let price = quotes
                .price_cents(&sym)
                .ok_or_else(|| Error::MissingQuote {
                    symbol: sym.clone(),
                })?;
            if price <= 0 {
                return Err(Error::InvalidQuote {
                    symbol: sym,
                    price_cents: price,
                });
            }
            let qty = shares_for(target_cents, price, rounding);
            Ok((sym, qty))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s)
    }

    fn scenario_allocation() -> TargetAllocation {
        TargetAllocation::new(vec![
            (sym("TQQQ"), 32.03),
            (sym("UPRO"), 0.86),
            (sym("NAIL"), 1.10),
        ])
        .unwrap()
    }

    fn scenario_valuation() -> AccountValuation {
        AccountValuation {
            equity_cents: 100_000_00,
            trade_with_pct: 100.0,
            padding_cents: 10_00,
        }
    }

    fn scenario_quotes() -> QuoteSet {
        [
            (sym("TQQQ"), 93_05),
            (sym("UPRO"), 101_62),
            (sym("NAIL"), 3_66),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn trade_value_applies_fraction_and_padding() {
        assert_eq!(scenario_valuation().trade_value_cents().unwrap(), 99_990_00);

        let v = AccountValuation {
            equity_cents: 100_000_00,
            trade_with_pct: 90.0,
            padding_cents: 500_00,
        };
        assert_eq!(v.trade_value_cents().unwrap(), 89_500_00);
    }

    #[test]
    fn negative_trade_value_is_config_error() {
        let v = AccountValuation {
            equity_cents: 100_00,
            trade_with_pct: 100.0,
            padding_cents: 500_00,
        };
        assert!(matches!(v.trade_value_cents(), Err(Error::Config(_))));
    }

    #[test]
    fn balance_under_one_dollar_is_refused() {
        for equity_cents in [-5_00, 0, 99] {
            let v = AccountValuation {
                equity_cents,
                trade_with_pct: 100.0,
                padding_cents: 0,
            };
            assert!(matches!(
                v.trade_value_cents(),
                Err(Error::InsufficientBalance { .. })
            ));
        }
        let v = AccountValuation {
            equity_cents: 1_00,
            trade_with_pct: 100.0,
            padding_cents: 0,
        };
        assert_eq!(v.trade_value_cents().unwrap(), 1_00);
    }

    #[test]
    fn out_of_range_fraction_is_config_error() {
        let v = AccountValuation {
            equity_cents: 100_00,
            trade_with_pct: 150.0,
            padding_cents: 0,
        };
        assert!(matches!(v.trade_value_cents(), Err(Error::Config(_))));
    }

    #[test]
    fn dollar_targets_round_to_cents() {
        let targets = dollar_targets(&scenario_allocation(), 99_990_00);
        assert_eq!(
            targets,
            vec![
                (sym("TQQQ"), 32_026_80),
                (sym("UPRO"), 859_91),
                (sym("NAIL"), 1_099_89),
            ]
        );
    }

    #[test]
    fn scenario_round_down() {
        let quantities = convert(
            &scenario_allocation(),
            &scenario_valuation(),
            &scenario_quotes(),
            Rounding::Down,
        )
        .unwrap();

        assert_eq!(
            quantities.entries(),
            &[(sym("TQQQ"), 344), (sym("UPRO"), 8), (sym("NAIL"), 300)]
        );
    }

    #[test]
    fn scenario_round_nearest() {
        let quantities = convert(
            &scenario_allocation(),
            &scenario_valuation(),
            &scenario_quotes(),
            Rounding::Nearest,
        )
        .unwrap();

        // NAIL: $1,099.89 / $3.66 = 300.52 -> 301
        assert_eq!(
            quantities.entries(),
            &[(sym("TQQQ"), 344), (sym("UPRO"), 8), (sym("NAIL"), 301)]
        );
    }

    #[test]
    fn nearest_rounds_half_away_from_zero() {
        // $150 / $100 = 1.5 -> 2
        assert_eq!(shares_for(150_00, 100_00, Rounding::Nearest), 2);
        assert_eq!(shares_for(150_00, 100_00, Rounding::Down), 1);
        // $149.99 / $100 -> 1
        assert_eq!(shares_for(149_99, 100_00, Rounding::Nearest), 1);
    }

    #[test]
    fn zero_percent_keeps_zero_entry() {
        let allocation =
            TargetAllocation::new(vec![(sym("TQQQ"), 0.0), (sym("UPRO"), 10.0)]).unwrap();
        let quantities = convert(
            &allocation,
            &scenario_valuation(),
            &scenario_quotes(),
            Rounding::Down,
        )
        .unwrap();
        assert_eq!(quantities.get(&sym("TQQQ")), Some(0));
        assert_eq!(quantities.len(), 2);
    }

    #[test]
    fn missing_quote_fails_whole_conversion() {
        let mut quotes = QuoteSet::new();
        quotes.insert(sym("TQQQ"), 93_05);
        quotes.insert(sym("NAIL"), 3_66);

        let err = convert(
            &scenario_allocation(),
            &scenario_valuation(),
            &quotes,
            Rounding::Down,
        )
        .unwrap_err();
        match err {
            Error::MissingQuote { symbol } => assert_eq!(symbol, sym("UPRO")),
            other => panic!("expected MissingQuote, got {other:?}"),
        }
    }

    #[test]
    fn non_positive_quote_is_rejected() {
        let mut quotes = scenario_quotes();
        quotes.insert(sym("NAIL"), 0);
        assert!(matches!(
            convert(
                &scenario_allocation(),
                &scenario_valuation(),
                &quotes,
                Rounding::Down
            ),
            Err(Error::InvalidQuote { .. })
        ));
    }

    #[test]
    fn negative_trade_value_aborts_before_quotes_are_used() {
        let valuation = AccountValuation {
            equity_cents: 1_00,
            trade_with_pct: 100.0,
            padding_cents: 2_00,
        };
        assert!(matches!(
            convert(
                &scenario_allocation(),
                &valuation,
                &QuoteSet::new(),
                Rounding::Down
            ),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn quantities_serialize_in_order() {
        let quantities = TargetQuantities::new(vec![(sym("UPRO"), 8), (sym("TQQQ"), 344)]);
        let json = serde_json::to_string(&quantities).unwrap();
        assert_eq!(json, r#"[["UPRO",8],["TQQQ",344]]"#);
        let back: TargetQuantities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, quantities);
    }
}
