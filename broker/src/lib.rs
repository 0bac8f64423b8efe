//! Brokerage trait and shared order types for copytrade.
//!
//! Provides a generic `Brokerage` trait that abstracts over the brokerage the
//! reconciliation engine trades against. Implementations:
//!
//! - **MockBroker**: scriptable in-memory broker for tests
//! - **PaperBroker**: JSON-file backed paper account for local runs

pub mod error;
pub mod mock;
pub mod paper;
pub mod types;

pub use error::BrokerError;
pub use types::*;

/// A brokerage connection that can value accounts, quote symbols and place orders.
///
/// Every method is a single external call; callers wrap them with their own
/// retry policy, so implementations must not retry internally.
pub trait Brokerage {
    /// Account balances (equity, cash).
    fn account(&self, account_id: &str) -> Result<Account, BrokerError>;

    /// Current mark prices for `symbols`. Symbols the broker does not know are
    /// omitted from the result rather than failing the whole request.
    fn quotes(&self, symbols: &[Symbol]) -> Result<Vec<Quote>, BrokerError>;

    /// Submit a market order. Returns the broker-assigned order id.
    fn place_order(&self, account_id: &str, intent: &OrderIntent) -> Result<OrderId, BrokerError>;

    /// Lifecycle state of a previously placed order.
    fn order_status(&self, account_id: &str, id: OrderId) -> Result<OrderState, BrokerError>;

    /// Long positions currently held in the account.
    fn positions(&self, account_id: &str) -> Result<Vec<Position>, BrokerError>;
}

impl<B: Brokerage + ?Sized> Brokerage for &B {
    fn account(&self, account_id: &str) -> Result<Account, BrokerError> {
        (**self).account(account_id)
    }

    fn quotes(&self, symbols: &[Symbol]) -> Result<Vec<Quote>, BrokerError> {
        (**self).quotes(symbols)
    }

    fn place_order(&self, account_id: &str, intent: &OrderIntent) -> Result<OrderId, BrokerError> {
        (**self).place_order(account_id, intent)
    }

    fn order_status(&self, account_id: &str, id: OrderId) -> Result<OrderState, BrokerError> {
        (**self).order_status(account_id, id)
    }

    fn positions(&self, account_id: &str) -> Result<Vec<Position>, BrokerError> {
        (**self).positions(account_id)
    }
}
