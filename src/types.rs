// 1.0: primitives shared by both engines. IDs, lock kinds, the counter service.
// each id is a newtype so the compiler catches type mixups.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub u64);

// 1.1: what a chunk of frozen credits is for. The risk engine treats the kind
// as an opaque tag; only the market engine assigns meaning.
//
// At most one lock exists per (account, market, kind). OutcomePosition carries
// the outcome name so a trader holds one margin lock per outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockKind {
    /// The AMM's subsidy and liquidity backing.
    Position,
    /// A trader's margin behind an open position in one outcome.
    OutcomePosition(String),
    /// Realized-but-unsettled profit from a partial close.
    ConditionalProfit,
    /// Realized-but-unsettled loss from a partial close.
    ConditionalLoss,
}

impl LockKind {
    pub fn outcome_position(outcome: &str) -> Self {
        LockKind::OutcomePosition(outcome.to_string())
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Position => write!(f, "position"),
            LockKind::OutcomePosition(outcome) => write!(f, "position:{outcome}"),
            LockKind::ConditionalProfit => write!(f, "conditional_profit"),
            LockKind::ConditionalLoss => write!(f, "conditional_loss"),
        }
    }
}

impl FromStr for LockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "position" => Ok(LockKind::Position),
            "conditional_profit" => Ok(LockKind::ConditionalProfit),
            "conditional_loss" => Ok(LockKind::ConditionalLoss),
            other => match other.strip_prefix("position:") {
                Some(outcome) if !outcome.is_empty() => {
                    Ok(LockKind::OutcomePosition(outcome.to_string()))
                }
                _ => Err(format!("unknown lock kind: {other:?}")),
            },
        }
    }
}

// 1.2: monotonic id source for every entity kind. Owned by the risk engine,
// drawn on by the market engine, serialized in the snapshot so ids resume
// after restart. Each field holds the last issued value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub account: u64,
    pub market: u64,
    pub lock: u64,
    pub trade: u64,
    pub tx: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_account(&mut self) -> AccountId {
        self.account += 1;
        AccountId(self.account)
    }

    pub fn next_market(&mut self) -> MarketId {
        self.market += 1;
        MarketId(self.market)
    }

    pub fn next_lock(&mut self) -> LockId {
        self.lock += 1;
        LockId(self.lock)
    }

    pub fn next_trade(&mut self) -> TradeId {
        self.trade += 1;
        TradeId(self.trade)
    }

    pub fn next_tx(&mut self) -> TxId {
        self.tx += 1;
        TxId(self.tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_kind_round_trips_through_strings() {
        let kinds = [
            LockKind::Position,
            LockKind::outcome_position("yes"),
            LockKind::ConditionalProfit,
            LockKind::ConditionalLoss,
        ];
        for kind in kinds {
            let rendered = kind.to_string();
            assert_eq!(rendered.parse::<LockKind>().unwrap(), kind);
        }
    }

    #[test]
    fn lock_kind_rejects_garbage() {
        assert!("".parse::<LockKind>().is_err());
        assert!("position:".parse::<LockKind>().is_err());
        assert!("margin".parse::<LockKind>().is_err());
    }

    #[test]
    fn counters_are_monotonic_per_kind() {
        let mut counters = Counters::new();
        assert_eq!(counters.next_account(), AccountId(1));
        assert_eq!(counters.next_account(), AccountId(2));
        // other kinds have independent sequences
        assert_eq!(counters.next_lock(), LockId(1));
        assert_eq!(counters.next_tx(), TxId(1));
        assert_eq!(counters.next_account(), AccountId(3));
    }
}
