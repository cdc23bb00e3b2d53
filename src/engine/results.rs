// 6.0.1: market engine errors. Risk errors pass through unchanged; everything
// else names the market, the offending value, and the violated predicate.

use crate::market::MarketStatus;
use crate::risk::RiskError;
use crate::types::MarketId;
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("market {0:?} not found")]
    MarketNotFound(MarketId),

    #[error("market {market:?} is {status}, must be open")]
    MarketClosed {
        market: MarketId,
        status: MarketStatus,
    },

    #[error("market {market:?}: unknown outcome {outcome:?}")]
    InvalidOutcome { market: MarketId, outcome: String },

    #[error("market {market:?}: invalid amount {amount}: {predicate}")]
    InvalidAmount {
        market: MarketId,
        amount: Decimal,
        predicate: &'static str,
    },

    #[error("market params: {predicate}")]
    InvalidMarketParams { predicate: String },

    #[error("market {market:?}: budget {budget} buys no tokens at this precision")]
    BudgetTooSmall { market: MarketId, budget: Decimal },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("ledger error: {0}")]
    Risk(#[from] RiskError),
}
