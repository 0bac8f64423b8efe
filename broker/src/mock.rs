//! Mock broker for testing: implements `Brokerage` with scripted behavior.
//!
//! Use this in integration tests to simulate broker responses without network calls.
//!
//! ```
//! use copytrade_broker::mock::{FillMode, MockBroker};
//! use copytrade_broker::{Brokerage, Symbol};
//!
//! let broker = MockBroker::builder()
//!     .fill_mode(FillMode::ImmediateFull)
//!     .with_account("ACC-1", 100_000_00, 100_000_00)
//!     .with_quote(Symbol::new("TQQQ"), 93_05)
//!     .build();
//!
//! assert_eq!(broker.account("ACC-1").unwrap().equity_cents, 100_000_00);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::Brokerage;
use crate::error::BrokerError;
use crate::types::*;

/// How the mock broker progresses accepted orders.
#[derive(Clone, Debug)]
pub enum FillMode {
    /// Orders report `Filled` on the first status check.
    ImmediateFull,
    /// Orders report `Working` for the given number of status checks, then `Filled`.
    FillAfterPolls(u32),
    /// Orders stay `Working` forever.
    NeverFill,
    /// Every order is rejected at submission.
    Reject,
    /// Orders are accepted, then report `Cancelled` on the first status check.
    CancelAfterAccept,
}

/// A broker call, recorded in order for sequencing assertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Account(String),
    Quotes(Vec<Symbol>),
    PlaceOrder(OrderIntent),
    OrderStatus(OrderId),
    Positions(String),
}

/// A recorded order submission for assertion in tests.
#[derive(Clone, Debug)]
pub struct RecordedOrder {
    pub account_id: String,
    pub intent: OrderIntent,
    pub id: OrderId,
}

/// Builder for `MockBroker`.
pub struct MockBrokerBuilder {
    fill_mode: FillMode,
    accounts: HashMap<String, Account>,
    positions: HashMap<String, Vec<Position>>,
    quotes: Vec<Quote>,
    account_failures: Vec<BrokerError>,
    quote_failures: Vec<BrokerError>,
    order_failures: HashMap<Symbol, Vec<BrokerError>>,
    status_failures: Vec<BrokerError>,
}

impl MockBrokerBuilder {
    pub fn fill_mode(mut self, mode: FillMode) -> Self {
        self.fill_mode = mode;
        self
    }

    pub fn with_account(mut self, account_id: &str, equity_cents: i64, cash_cents: i64) -> Self {
        self.accounts.insert(
            account_id.to_string(),
            Account {
                equity_cents,
                cash_cents,
            },
        );
        self
    }

    pub fn with_position(mut self, account_id: &str, symbol: Symbol, quantity: u64) -> Self {
        self.positions
            .entry(account_id.to_string())
            .or_default()
            .push(Position { symbol, quantity });
        self
    }

    pub fn with_quote(mut self, symbol: Symbol, price_cents: i64) -> Self {
        self.quotes.push(Quote {
            symbol,
            price_cents,
        });
        self
    }

    /// Fail the next `account` calls with these errors, in order.
    pub fn fail_account(mut self, errors: Vec<BrokerError>) -> Self {
        self.account_failures = errors;
        self
    }

    /// Fail the next `quotes` calls with these errors, in order.
    pub fn fail_quotes(mut self, errors: Vec<BrokerError>) -> Self {
        self.quote_failures = errors;
        self
    }

    /// Fail the next order placements for `symbol` with these errors, in order.
    pub fn fail_orders(mut self, symbol: Symbol, errors: Vec<BrokerError>) -> Self {
        self.order_failures.insert(symbol, errors);
        self
    }

    /// Fail the next `order_status` calls with these errors, in order.
    pub fn fail_status(mut self, errors: Vec<BrokerError>) -> Self {
        self.status_failures = errors;
        self
    }

    pub fn build(self) -> MockBroker {
        MockBroker {
            fill_mode: self.fill_mode,
            accounts: self.accounts,
            positions: self.positions,
            quotes: self.quotes,
            state: Mutex::new(MockState {
                next_order_id: 1,
                account_failures: self.account_failures.into(),
                quote_failures: self.quote_failures.into(),
                order_failures: self
                    .order_failures
                    .into_iter()
                    .map(|(sym, errs)| (sym, VecDeque::from(errs)))
                    .collect(),
                status_failures: self.status_failures.into(),
                status_polls: HashMap::new(),
                submitted: Vec::new(),
                calls: Vec::new(),
            }),
        }
    }
}

struct MockState {
    next_order_id: u64,
    account_failures: VecDeque<BrokerError>,
    quote_failures: VecDeque<BrokerError>,
    order_failures: HashMap<Symbol, VecDeque<BrokerError>>,
    status_failures: VecDeque<BrokerError>,
    status_polls: HashMap<OrderId, u32>,
    submitted: Vec<RecordedOrder>,
    calls: Vec<Call>,
}

/// A mock broker that records every call and returns configurable responses.
pub struct MockBroker {
    fill_mode: FillMode,
    accounts: HashMap<String, Account>,
    positions: HashMap<String, Vec<Position>>,
    quotes: Vec<Quote>,
    state: Mutex<MockState>,
}

impl MockBroker {
    pub fn builder() -> MockBrokerBuilder {
        MockBrokerBuilder {
            fill_mode: FillMode::ImmediateFull,
            accounts: HashMap::new(),
            positions: HashMap::new(),
            quotes: Vec::new(),
            account_failures: Vec::new(),
            quote_failures: Vec::new(),
            order_failures: HashMap::new(),
            status_failures: Vec::new(),
        }
    }

    /// Orders that the broker accepted (for assertion in tests).
    pub fn submitted_orders(&self) -> Vec<RecordedOrder> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Every call made against the broker, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of `place_order` attempts, accepted or not.
    pub fn order_attempts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::PlaceOrder(_)))
            .count()
    }
}

impl Brokerage for MockBroker {
    fn account(&self, account_id: &str) -> Result<Account, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Account(account_id.to_string()));
        if let Some(err) = state.account_failures.pop_front() {
            return Err(err);
        }
        self.accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownAccount(account_id.to_string()))
    }

    fn quotes(&self, symbols: &[Symbol]) -> Result<Vec<Quote>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Quotes(symbols.to_vec()));
        if let Some(err) = state.quote_failures.pop_front() {
            return Err(err);
        }
        Ok(self
            .quotes
            .iter()
            .filter(|q| symbols.contains(&q.symbol))
            .cloned()
            .collect())
    }

    fn place_order(&self, account_id: &str, intent: &OrderIntent) -> Result<OrderId, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::PlaceOrder(intent.clone()));

        if let Some(err) = state
            .order_failures
            .get_mut(&intent.symbol)
            .and_then(|errs| errs.pop_front())
        {
            return Err(err);
        }
        if let FillMode::Reject = self.fill_mode {
            return Err(BrokerError::Rejected("mock: order rejected".into()));
        }

        let id = OrderId(state.next_order_id);
        state.next_order_id += 1;
        state.submitted.push(RecordedOrder {
            account_id: account_id.to_string(),
            intent: intent.clone(),
            id,
        });
        Ok(id)
    }

    fn order_status(&self, _account_id: &str, id: OrderId) -> Result<OrderState, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::OrderStatus(id));

        if !state.submitted.iter().any(|o| o.id == id) {
            return Err(BrokerError::Other(format!("mock: unknown order {id}")));
        }
        if let Some(err) = state.status_failures.pop_front() {
            return Err(err);
        }

        let polls = state.status_polls.entry(id).or_insert(0);
        *polls += 1;
        let status = match &self.fill_mode {
            FillMode::ImmediateFull => OrderState::Filled,
            FillMode::FillAfterPolls(n) if *polls > *n => OrderState::Filled,
            FillMode::FillAfterPolls(_) | FillMode::NeverFill => OrderState::Working,
            FillMode::Reject => OrderState::Rejected,
            FillMode::CancelAfterAccept => OrderState::Cancelled,
        };
        Ok(status)
    }

    fn positions(&self, account_id: &str) -> Result<Vec<Position>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Positions(account_id.to_string()));
        Ok(self.positions.get(account_id).cloned().unwrap_or_default())
    }
}
