//! JSON-file backed paper brokerage.
//!
//! Holds cash, positions and mark prices for any number of accounts in a
//! single JSON document. Market orders fill immediately at the stored mark
//! price and the document is rewritten after every fill, so consecutive
//! runs see the effect of earlier ones.
//!
//! ```json
//! {
//!   "quotes": { "TQQQ": 9305, "UPRO": 10162 },
//!   "accounts": {
//!     "PAPER-1": { "cash_cents": 10000000, "positions": { "TQQQ": 300 } }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::Brokerage;
use crate::error::BrokerError;
use crate::types::*;

/// Serialized paper-trading state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperState {
    #[serde(default)]
    pub quotes: BTreeMap<Symbol, i64>,
    #[serde(default)]
    pub accounts: BTreeMap<String, PaperAccount>,
    #[serde(default)]
    pub orders: Vec<PaperOrder>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperAccount {
    pub cash_cents: i64,
    #[serde(default)]
    pub positions: BTreeMap<Symbol, u64>,
}

/// A filled or rejected paper order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperOrder {
    pub id: OrderId,
    pub account_id: String,
    pub intent: OrderIntent,
    pub state: OrderState,
    pub fill_price_cents: i64,
}

impl PaperState {
    fn equity_cents(&self, account: &PaperAccount) -> i64 {
        let mut equity = account.cash_cents;
        for (sym, &qty) in &account.positions {
            match self.quotes.get(sym) {
                Some(&price) => equity += qty as i64 * price,
                None => warn!("paper: no quote for held symbol {sym}, valued at $0"),
            }
        }
        equity
    }

    /// Apply a market order against `account_id`, returning the new order id.
    fn fill(&mut self, account_id: &str, intent: &OrderIntent) -> Result<OrderId, BrokerError> {
        let price = *self
            .quotes
            .get(&intent.symbol)
            .ok_or_else(|| BrokerError::InvalidSymbol(intent.symbol.to_string()))?;
        let id = OrderId(self.orders.len() as u64 + 1);
        let account = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| BrokerError::UnknownAccount(account_id.to_string()))?;

        let notional = intent.quantity as i64 * price;
        match intent.side {
            Side::Buy => {
                if notional > account.cash_cents {
                    return Err(BrokerError::InsufficientFunds(format!(
                        "{intent} needs ${:.2}, cash is ${:.2}",
                        notional as f64 / 100.0,
                        account.cash_cents as f64 / 100.0,
                    )));
                }
                account.cash_cents -= notional;
                *account.positions.entry(intent.symbol.clone()).or_insert(0) += intent.quantity;
            }
            Side::Sell => {
                let held = account.positions.get(&intent.symbol).copied().unwrap_or(0);
                if held < intent.quantity {
                    return Err(BrokerError::Rejected(format!(
                        "{intent}: only {held} shares held"
                    )));
                }
                account.cash_cents += notional;
                if held == intent.quantity {
                    account.positions.remove(&intent.symbol);
                } else {
                    account.positions.insert(intent.symbol.clone(), held - intent.quantity);
                }
            }
        }

        self.orders.push(PaperOrder {
            id,
            account_id: account_id.to_string(),
            intent: intent.clone(),
            state: OrderState::Filled,
            fill_price_cents: price,
        });
        Ok(id)
    }
}

/// Paper broker persisted to a JSON file.
pub struct PaperBroker {
    path: PathBuf,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    /// Open the paper account file.
    pub fn open(path: &Path) -> Result<Self, BrokerError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            BrokerError::Other(format!("failed to read paper account {}: {e}", path.display()))
        })?;
        let state: PaperState = serde_json::from_str(&contents).map_err(|e| {
            BrokerError::Other(format!("failed to parse paper account {}: {e}", path.display()))
        })?;
        info!(
            "Opened paper account file {} ({} accounts, {} quotes)",
            path.display(),
            state.accounts.len(),
            state.quotes.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> PaperState {
        self.state.lock().unwrap().clone()
    }

    fn persist(&self, state: &PaperState) -> Result<(), BrokerError> {
        let io_err =
            |e: std::io::Error| BrokerError::Other(format!("paper account write failed: {e}"));
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| BrokerError::Other(format!("paper account encode failed: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl Brokerage for PaperBroker {
    fn account(&self, account_id: &str) -> Result<Account, BrokerError> {
        let state = self.state.lock().unwrap();
        let account = state
            .accounts
            .get(account_id)
            .ok_or_else(|| BrokerError::UnknownAccount(account_id.to_string()))?;
        Ok(Account {
            equity_cents: state.equity_cents(account),
            cash_cents: account.cash_cents,
        })
    }

    fn quotes(&self, symbols: &[Symbol]) -> Result<Vec<Quote>, BrokerError> {
        let state = self.state.lock().unwrap();
        Ok(symbols
            .iter()
            .filter_map(|sym| {
                state.quotes.get(sym).map(|&price_cents| Quote {
                    symbol: sym.clone(),
                    price_cents,
                })
            })
            .collect())
    }

    fn place_order(&self, account_id: &str, intent: &OrderIntent) -> Result<OrderId, BrokerError> {
        let mut state = self.state.lock().unwrap();
        // The fill only takes effect once it is on disk.
        let mut next = state.clone();
        let id = next.fill(account_id, intent)?;
        self.persist(&next)?;
        *state = next;
        debug!("paper: filled {intent} for {account_id} as {id}");
        Ok(id)
    }

    fn order_status(&self, account_id: &str, id: OrderId) -> Result<OrderState, BrokerError> {
        let state = self.state.lock().unwrap();
        state
            .orders
            .iter()
            .find(|o| o.id == id && o.account_id == account_id)
            .map(|o| o.state)
            .ok_or_else(|| BrokerError::Other(format!("paper: unknown order {id}")))
    }

    fn positions(&self, account_id: &str) -> Result<Vec<Position>, BrokerError> {
        let state = self.state.lock().unwrap();
        let account = state
            .accounts
            .get(account_id)
            .ok_or_else(|| BrokerError::UnknownAccount(account_id.to_string()))?;
        Ok(account
            .positions
            .iter()
            .map(|(symbol, &quantity)| Position {
                symbol: symbol.clone(),
                quantity,
            })
            .collect())
    }
}
