// 6.1 engine/core.rs: engine struct, market lifecycle, queries.

use super::results::EngineError;
use crate::lmsr;
use crate::market::{Liquidity, Market, MarketParams};
use crate::risk::{RiskEngine, RiskError};
use crate::types::{LockKind, MarketId};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{BTreeMap, BTreeSet};

/** 6.1.0: all market state lives here; all balance state lives in `risk`. */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketEngine {
    pub(super) risk: RiskEngine,
    pub(super) markets: BTreeMap<MarketId, Market>,
}

impl MarketEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(risk: RiskEngine, markets: BTreeMap<MarketId, Market>) -> Self {
        Self { risk, markets }
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    /// Direct ledger access for the operations that live outside markets:
    /// account creation, minting, plain transfers.
    pub fn risk_mut(&mut self) -> &mut RiskEngine {
        &mut self.risk
    }

    pub fn market(&self, market_id: MarketId) -> Result<&Market, EngineError> {
        self.markets
            .get(&market_id)
            .ok_or(EngineError::MarketNotFound(market_id))
    }

    pub fn markets(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }

    pub(super) fn open_market(&self, market_id: MarketId) -> Result<&Market, EngineError> {
        let market = self.market(market_id)?;
        if !market.is_open() {
            return Err(EngineError::MarketClosed {
                market: market_id,
                status: market.status,
            });
        }
        Ok(market)
    }

    // ------------------------------------------------------------------
    // Market creation
    // ------------------------------------------------------------------

    /// Create a market with a funded AMM. The subsidy (the AMM's worst-case
    /// loss, b * ln n) is minted to the AMM account — or transferred from
    /// `funding_account` — and locked under the AMM's position lock.
    pub fn create_market(&mut self, params: MarketParams) -> Result<MarketId, EngineError> {
        let n = params.outcomes.len();
        if n < 2 {
            return Err(EngineError::InvalidMarketParams {
                predicate: format!("need at least 2 outcomes, got {n}"),
            });
        }
        let distinct: BTreeSet<&String> = params.outcomes.iter().collect();
        if distinct.len() != n || params.outcomes.iter().any(|o| o.is_empty()) {
            return Err(EngineError::InvalidMarketParams {
                predicate: "outcome names must be distinct and non-empty".to_string(),
            });
        }

        let b = match params.liquidity {
            Liquidity::B(b) => {
                if b <= Decimal::ZERO {
                    return Err(EngineError::InvalidMarketParams {
                        predicate: format!("liquidity parameter b must be positive, got {b}"),
                    });
                }
                b
            }
            Liquidity::Funding(funding) => {
                if funding <= Decimal::ZERO {
                    return Err(EngineError::InvalidMarketParams {
                        predicate: format!("funding must be positive, got {funding}"),
                    });
                }
                // b = funding / ln(n); max_loss(1, n) is exactly ln(n)
                funding / lmsr::max_loss(Decimal::ONE, n)
            }
        };

        // ceiling so the lock fully covers the theoretical loss
        let asset_precision = params.price_precision + params.amount_precision;
        let subsidy = lmsr::max_loss(b, n)
            .round_dp_with_strategy(asset_precision, RoundingStrategy::ToPositiveInfinity);

        // nothing may mutate before this check
        if let Some(funder) = params.funding_account {
            let acc = self.risk.account(funder)?;
            if acc.available_balance < subsidy {
                return Err(RiskError::InsufficientBalance {
                    account: funder,
                    needed: subsidy,
                    available: acc.available_balance,
                }
                .into());
            }
        }

        let amm = self.risk.create_account();
        let market_id = self.risk.counters_mut().next_market();
        let market = Market::new(market_id, amm, &params, b);

        match params.funding_account {
            Some(funder) => {
                self.risk
                    .transfer_available(funder, amm, subsidy, Some(market_id), None)?;
            }
            None => {
                self.risk.mint(amm, subsidy)?;
            }
        }
        self.risk
            .lock(amm, market_id, subsidy, LockKind::Position, None)?;

        self.markets.insert(market_id, market);
        Ok(market_id)
    }

    // ------------------------------------------------------------------
    // Deadlines
    // ------------------------------------------------------------------

    /// Void every open market whose deadline has passed. Returns the ids that
    /// were voided.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Result<Vec<MarketId>, EngineError> {
        let due: Vec<MarketId> = self
            .markets
            .values()
            .filter(|m| m.is_open() && m.deadline.is_some_and(|d| d <= now))
            .map(|m| m.id)
            .collect();
        for market_id in &due {
            self.void(*market_id)?;
        }
        Ok(due)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current price per outcome, by name.
    pub fn prices(&self, market_id: MarketId) -> Result<Vec<(String, Decimal)>, EngineError> {
        let market = self.market(market_id)?;
        Ok(market
            .outcomes
            .iter()
            .cloned()
            .zip(market.prices())
            .collect())
    }

    /// Tokens to trade (positive buys, negative sells) and their cost to move
    /// an outcome's price to `target`, exclusive of rounding. Quote only.
    pub fn quote_price_move(
        &self,
        market_id: MarketId,
        outcome: &str,
        target: Decimal,
    ) -> Result<(Decimal, Decimal), EngineError> {
        let market = self.market(market_id)?;
        let ix = market
            .outcome_index(outcome)
            .ok_or_else(|| EngineError::InvalidOutcome {
                market: market_id,
                outcome: outcome.to_string(),
            })?;
        if target <= Decimal::ZERO || target >= Decimal::ONE {
            return Err(EngineError::InvalidAmount {
                market: market_id,
                amount: target,
                predicate: "target price must be strictly between 0 and 1",
            });
        }
        Ok(lmsr::cost_to_move_price(&market.q, market.b, ix, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketStatus;
    use rust_decimal_macros::dec;

    #[test]
    fn create_market_locks_the_subsidy() {
        let mut engine = MarketEngine::new();
        let market_id = engine
            .create_market(MarketParams::yes_no("Will PR #1 merge?"))
            .unwrap();

        let market = engine.market(market_id).unwrap();
        assert_eq!(market.status, MarketStatus::Open);
        assert_eq!(market.q, vec![dec!(0), dec!(0)]);

        let amm = engine.risk().account(market.amm_account_id).unwrap();
        assert_eq!(amm.available_balance, dec!(0));
        // subsidy = 100 * ln 2, ceiling at 6 dp
        assert_eq!(amm.frozen_balance, dec!(69.314719));
        let lock = amm.lock_for(market_id, &LockKind::Position).unwrap();
        assert_eq!(lock.amount, dec!(69.314719));
        assert_eq!(engine.risk().total_minted(), dec!(69.314719));
    }

    #[test]
    fn create_market_from_funding_derives_b() {
        let mut engine = MarketEngine::new();
        let market_id = engine
            .create_market(MarketParams {
                liquidity: Liquidity::Funding(dec!(69.314718055994531)),
                ..MarketParams::yes_no("funded")
            })
            .unwrap();
        let market = engine.market(market_id).unwrap();
        assert!((market.b - dec!(100)).abs() < dec!(0.000001));
    }

    #[test]
    fn create_market_from_named_funder() {
        let mut engine = MarketEngine::new();
        let funder = engine.risk_mut().create_account();
        engine.risk_mut().mint(funder, dec!(1000)).unwrap();

        let market_id = engine
            .create_market(MarketParams {
                funding_account: Some(funder),
                ..MarketParams::yes_no("externally funded")
            })
            .unwrap();

        // no fresh credits were minted; the subsidy moved from the funder
        assert_eq!(engine.risk().total_minted(), dec!(1000));
        assert_eq!(
            engine.risk().account(funder).unwrap().available_balance,
            dec!(1000) - dec!(69.314719)
        );
        let market = engine.market(market_id).unwrap();
        let amm = engine.risk().account(market.amm_account_id).unwrap();
        assert_eq!(amm.frozen_balance, dec!(69.314719));
    }

    #[test]
    fn create_market_underfunded_funder_leaves_no_trace() {
        let mut engine = MarketEngine::new();
        let funder = engine.risk_mut().create_account();
        engine.risk_mut().mint(funder, dec!(1)).unwrap();
        let before = engine.clone();

        let err = engine
            .create_market(MarketParams {
                funding_account: Some(funder),
                ..MarketParams::yes_no("underfunded")
            })
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Risk(RiskError::InsufficientBalance { .. })
        ));
        assert_eq!(engine, before);
    }

    #[test]
    fn create_market_rejects_bad_params() {
        let mut engine = MarketEngine::new();
        let one_outcome = MarketParams {
            outcomes: vec!["yes".to_string()],
            ..MarketParams::yes_no("half a question")
        };
        assert!(matches!(
            engine.create_market(one_outcome),
            Err(EngineError::InvalidMarketParams { .. })
        ));

        let duplicate = MarketParams {
            outcomes: vec!["yes".to_string(), "yes".to_string()],
            ..MarketParams::yes_no("twice yes")
        };
        assert!(matches!(
            engine.create_market(duplicate),
            Err(EngineError::InvalidMarketParams { .. })
        ));

        let zero_b = MarketParams {
            liquidity: Liquidity::B(dec!(0)),
            ..MarketParams::yes_no("no depth")
        };
        assert!(matches!(
            engine.create_market(zero_b),
            Err(EngineError::InvalidMarketParams { .. })
        ));
    }

    #[test]
    fn expire_due_voids_past_deadlines_only() {
        let mut engine = MarketEngine::new();
        let now = Utc::now();
        let stale = engine
            .create_market(MarketParams {
                deadline: Some(now - chrono::Duration::hours(1)),
                ..MarketParams::yes_no("stale")
            })
            .unwrap();
        let fresh = engine
            .create_market(MarketParams {
                deadline: Some(now + chrono::Duration::hours(1)),
                ..MarketParams::yes_no("fresh")
            })
            .unwrap();
        let open_ended = engine
            .create_market(MarketParams::yes_no("open ended"))
            .unwrap();

        let voided = engine.expire_due(now).unwrap();
        assert_eq!(voided, vec![stale]);
        assert_eq!(engine.market(stale).unwrap().status, MarketStatus::Void);
        assert!(engine.market(fresh).unwrap().is_open());
        assert!(engine.market(open_ended).unwrap().is_open());
    }

    #[test]
    fn prices_by_name() {
        let mut engine = MarketEngine::new();
        let market_id = engine
            .create_market(MarketParams::yes_no("even odds"))
            .unwrap();
        let prices = engine.prices(market_id).unwrap();
        assert_eq!(prices[0].0, "yes");
        assert!((prices[0].1 - dec!(0.5)).abs() < dec!(0.0001));
    }

    #[test]
    fn quote_price_move_validates_target() {
        let mut engine = MarketEngine::new();
        let market_id = engine.create_market(MarketParams::yes_no("q")).unwrap();
        assert!(engine.quote_price_move(market_id, "yes", dec!(0.75)).is_ok());
        assert!(engine.quote_price_move(market_id, "yes", dec!(1)).is_err());
        assert!(engine.quote_price_move(market_id, "maybe", dec!(0.5)).is_err());
    }
}
