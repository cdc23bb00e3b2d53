// 5.0: market state. Each market owns its LMSR book (b, q), the position map,
// and the trade log. All credit motion is delegated to the risk engine; the
// market engine is the only writer of anything here.
//
// Outcomes are a closed indexed set: q, positions, and prices are fixed-length
// vectors keyed by outcome index. Names resolve to indices at the API boundary.

use crate::lmsr;
use crate::types::{AccountId, LockId, MarketId, TradeId, TxId};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Resolved,
    Void,
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketStatus::Open => write!(f, "open"),
            MarketStatus::Resolved => write!(f, "resolved"),
            MarketStatus::Void => write!(f, "void"),
        }
    }
}

// 5.1: one side of a trade. Net balance movement for one account, plus the
// lock and ledger entry that witness it. The AMM side of a buy carries no
// deltas; the trade is witnessed by the trader leg's tx.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeLeg {
    pub account_id: AccountId,
    pub available_delta: Decimal,
    pub frozen_delta: Decimal,
    pub lock_id: Option<LockId>,
    pub tx_id: Option<TxId>,
}

impl TradeLeg {
    pub fn flat(account_id: AccountId) -> Self {
        Self {
            account_id,
            available_delta: Decimal::ZERO,
            frozen_delta: Decimal::ZERO,
            lock_id: None,
            tx_id: None,
        }
    }
}

// 5.2: an executed trade. One side is always the AMM.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub id: TradeId,
    pub market_id: MarketId,
    pub outcome: String,
    pub amount: Decimal,
    pub price: Decimal,
    pub buyer: TradeLeg,
    pub seller: TradeLeg,
    pub created_at: DateTime<Utc>,
}

// 5.3: how a new market's depth is specified: the liquidity parameter
// directly, or the subsidy to derive it from (b = funding / ln n).
#[derive(Debug, Clone, PartialEq)]
pub enum Liquidity {
    B(Decimal),
    Funding(Decimal),
}

// 5.4: creation parameters. `funding_account` pays the subsidy when set;
// otherwise the subsidy is minted to the AMM.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketParams {
    pub question: String,
    pub category: String,
    pub category_id: String,
    pub metadata: serde_json::Value,
    pub outcomes: Vec<String>,
    pub liquidity: Liquidity,
    pub funding_account: Option<AccountId>,
    pub deadline: Option<DateTime<Utc>>,
    pub price_precision: u32,
    pub amount_precision: u32,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            question: String::new(),
            category: String::new(),
            category_id: String::new(),
            metadata: serde_json::Value::Null,
            outcomes: vec!["yes".to_string(), "no".to_string()],
            liquidity: Liquidity::B(Decimal::ONE_HUNDRED),
            funding_account: None,
            deadline: None,
            price_precision: 4,
            amount_precision: 2,
        }
    }
}

impl MarketParams {
    /// A plain yes/no market with default depth and precisions.
    pub fn yes_no(question: &str) -> Self {
        Self {
            question: question.to_string(),
            ..Self::default()
        }
    }
}

// 5.5: the market itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Market {
    pub id: MarketId,
    pub amm_account_id: AccountId,
    pub kind: String,
    pub category: String,
    pub category_id: String,
    pub question: String,
    pub price_precision: u32,
    pub amount_precision: u32,
    pub status: MarketStatus,
    pub outcomes: Vec<String>,
    pub resolution: Option<String>,
    pub metadata: serde_json::Value,
    pub b: Decimal,
    pub q: Vec<Decimal>,
    pub positions: BTreeMap<AccountId, Vec<Decimal>>,
    pub trades: Vec<Trade>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Market {
    pub(crate) fn new(
        id: MarketId,
        amm_account_id: AccountId,
        params: &MarketParams,
        b: Decimal,
    ) -> Self {
        Self {
            id,
            amm_account_id,
            kind: "conditional_prediction_market".to_string(),
            category: params.category.clone(),
            category_id: params.category_id.clone(),
            question: params.question.clone(),
            price_precision: params.price_precision,
            amount_precision: params.amount_precision,
            status: MarketStatus::Open,
            outcomes: params.outcomes.clone(),
            resolution: None,
            metadata: params.metadata.clone(),
            b,
            q: vec![Decimal::ZERO; params.outcomes.len()],
            positions: BTreeMap::new(),
            trades: Vec::new(),
            deadline: params.deadline,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == MarketStatus::Open
    }

    pub fn outcome_index(&self, outcome: &str) -> Option<usize> {
        self.outcomes.iter().position(|o| o == outcome)
    }

    /// Decimal places for credit amounts in this market. A trade value is the
    /// exact product of a quantized token count and a quantized price, so it
    /// needs price + amount digits.
    pub fn asset_precision(&self) -> u32 {
        self.price_precision + self.amount_precision
    }

    /// Current LMSR prices by outcome index.
    pub fn prices(&self) -> Vec<Decimal> {
        lmsr::prices(&self.q, self.b)
    }

    /// Tokens held per outcome for one account (zeros when it never traded).
    pub fn position(&self, account_id: AccountId) -> Vec<Decimal> {
        self.positions
            .get(&account_id)
            .cloned()
            .unwrap_or_else(|| vec![Decimal::ZERO; self.outcomes.len()])
    }

    pub(crate) fn position_mut(&mut self, account_id: AccountId) -> &mut Vec<Decimal> {
        let n = self.outcomes.len();
        self.positions
            .entry(account_id)
            .or_insert_with(|| vec![Decimal::ZERO; n])
    }

    // Rounding always favors the AMM: token counts round down, buy prices
    // round up, sell prices round down, and close margins round down.

    pub fn quantize_amount_floor(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.amount_precision, RoundingStrategy::ToNegativeInfinity)
    }

    pub fn quantize_price_ceil(&self, price: Decimal) -> Decimal {
        price.round_dp_with_strategy(self.price_precision, RoundingStrategy::ToPositiveInfinity)
    }

    pub fn quantize_price_floor(&self, price: Decimal) -> Decimal {
        price.round_dp_with_strategy(self.price_precision, RoundingStrategy::ToNegativeInfinity)
    }

    pub fn quantize_credit_ceil(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.asset_precision(), RoundingStrategy::ToPositiveInfinity)
    }

    pub fn quantize_credit_floor(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.asset_precision(), RoundingStrategy::ToNegativeInfinity)
    }

    /// Round-half-even at asset precision, for amounts with no adversarial
    /// direction (liquidity changes).
    pub fn quantize_credit(&self, amount: Decimal) -> Decimal {
        amount.round_dp(self.asset_precision())
    }

    /// One token quantum at this market's amount precision.
    pub fn amount_quantum(&self) -> Decimal {
        Decimal::new(1, self.amount_precision)
    }
}
