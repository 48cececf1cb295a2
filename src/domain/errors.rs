use std::time::Duration;
use thiserror::Error;

/// Typed rejection reasons carried on failed orders and API error envelopes.
///
/// The wire codes (`RISK_CHECK_FAILED`, ...) are part of the administrative
/// API contract and must not change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RejectReason {
    RiskCheckFailed,
    InsufficientMargin,
    LeverageExceeded,
    PositionLimitExceeded,
    PriceDeviation,
    MarketSuspended,
    ApiError,
    Timeout,
    RateLimit,
    DuplicateOrder,
    BreakerTriggered,
    AuditFailure,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::RiskCheckFailed => "RISK_CHECK_FAILED",
            RejectReason::InsufficientMargin => "INSUFFICIENT_MARGIN",
            RejectReason::LeverageExceeded => "LEVERAGE_EXCEEDED",
            RejectReason::PositionLimitExceeded => "POSITION_LIMIT_EXCEEDED",
            RejectReason::PriceDeviation => "PRICE_DEVIATION",
            RejectReason::MarketSuspended => "MARKET_SUSPENDED",
            RejectReason::ApiError => "API_ERROR",
            RejectReason::Timeout => "TIMEOUT",
            RejectReason::RateLimit => "RATE_LIMIT",
            RejectReason::DuplicateOrder => "DUPLICATE_ORDER",
            RejectReason::BreakerTriggered => "BREAKER_TRIGGERED",
            RejectReason::AuditFailure => "AUDIT_FAILURE",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors crossing the network boundary of an execution adapter or data source.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("exchange rejected request: {0}")]
    Rejected(String),
}

impl NetworkError {
    /// Timeouts, connection failures and 5xx are worth retrying; 4xx (except
    /// 429, which maps to `RateLimited`) and explicit rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetworkError::Timeout(_) | NetworkError::Connection(_) | NetworkError::Server { .. }
        )
    }

    pub fn reject_reason(&self) -> RejectReason {
        match self {
            NetworkError::Timeout(_) => RejectReason::Timeout,
            NetworkError::RateLimited { .. } => RejectReason::RateLimit,
            _ => RejectReason::ApiError,
        }
    }
}

/// Errors raised while assembling a market snapshot.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("insufficient history for {symbol}: have {have} bars, need {need}")]
    InsufficientHistory {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("invalid market data for {symbol}: {reason}")]
    InvalidData { symbol: String, reason: String },

    #[error(transparent)]
    Network(#[from] NetworkError),
}
