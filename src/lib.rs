// Allow our dollar.cents digit grouping convention (e.g., 100_00 = $100.00)
#![allow(clippy::inconsistent_digit_grouping)]

//! # copytrade
//!
//! Mirrors a target allocation (symbol → percent of portfolio) into one or
//! more brokerage accounts.
//!
//! Each cycle converts the allocation into whole-share quantities using the
//! account's equity and live quotes, diffs them against the quantities the
//! previous cycle converged to, and places the difference as market orders:
//! sells first, then buys once the sells have settled. Every broker call is
//! retried with exponential backoff on transient failures.
//!
//! ## Quick Start
//!
//! ```
//! use copytrade::convert::{AccountValuation, QuoteSet, Rounding, convert};
//! use copytrade::target::TargetAllocation;
//! use copytrade_broker::Symbol;
//!
//! let allocation = TargetAllocation::new(vec![
//!     (Symbol::new("TQQQ"), 32.03),
//!     (Symbol::new("UPRO"), 0.86),
//! ])
//! .unwrap();
//! let valuation = AccountValuation {
//!     equity_cents: 100_000_00,
//!     trade_with_pct: 100.0,
//!     padding_cents: 10_00,
//! };
//! let quotes: QuoteSet = [(Symbol::new("TQQQ"), 93_05), (Symbol::new("UPRO"), 101_62)]
//!     .into_iter()
//!     .collect();
//!
//! let targets = convert(&allocation, &valuation, &quotes, Rounding::Down).unwrap();
//! assert_eq!(targets.get(&Symbol::new("TQQQ")), Some(344));
//! assert_eq!(targets.get(&Symbol::new("UPRO")), Some(8));
//! ```
//!
//! ## Money
//!
//! Amounts are [`i64`] cents everywhere past the broker boundary
//! (`100_00` = $100.00). Percentages stay `f64`.

pub mod audit;
pub mod config;
pub mod convert;
pub mod cycle;
pub mod diff;
pub mod error;
pub mod reconcile;
pub mod retry;
pub mod sequencer;
pub mod snapshot;
pub mod target;
pub mod watch;

pub use cycle::{CycleOutcome, CycleSettings, ExecutionReport, Reconciler};
pub use error::{Error, Result};
