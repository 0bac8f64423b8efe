//! Broker error types.

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limit exceeded")]
    RateLimit,

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("not connected")]
    NotConnected,

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// True for failures that may succeed when the same call is repeated:
    /// network trouble, timeouts, rate limiting and 5xx responses.
    ///
    /// Authentication failures, rejections and insufficient funds never
    /// improve by retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Connection(_)
            | BrokerError::Timeout(_)
            | BrokerError::RateLimit
            | BrokerError::NotConnected => true,
            BrokerError::Server { status, .. } => *status >= 500,
            BrokerError::Auth(_)
            | BrokerError::Rejected(_)
            | BrokerError::InsufficientFunds(_)
            | BrokerError::InvalidSymbol(_)
            | BrokerError::UnknownAccount(_)
            | BrokerError::Other(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Connection("reset".into()).is_transient());
        assert!(BrokerError::Timeout("30s".into()).is_transient());
        assert!(BrokerError::RateLimit.is_transient());
        assert!(BrokerError::NotConnected.is_transient());
        assert!(
            BrokerError::Server {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn permanent_classification() {
        assert!(!BrokerError::Auth("invalid token".into()).is_transient());
        assert!(!BrokerError::Rejected("halted".into()).is_transient());
        assert!(!BrokerError::InsufficientFunds("need $10".into()).is_transient());
        assert!(!BrokerError::InvalidSymbol("ZZZZ".into()).is_transient());
        assert!(
            !BrokerError::Server {
                status: 400,
                message: "bad request".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn display() {
        assert_eq!(BrokerError::RateLimit.to_string(), "rate limit exceeded");
        assert_eq!(
            BrokerError::Server {
                status: 502,
                message: "bad gateway".into()
            }
            .to_string(),
            "server error (HTTP 502): bad gateway"
        );
    }
}
