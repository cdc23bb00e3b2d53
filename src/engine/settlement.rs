// 6.3 engine/settlement.rs: terminal market states.
//
// Resolve pays winners and hands the AMM whatever the pool has left; void
// unwinds every lock at face value. Both compute their full settlement plan
// before the first ledger mutation, so a failure means nothing moved.

use super::core::MarketEngine;
use super::results::EngineError;
use crate::market::MarketStatus;
use crate::types::{AccountId, LockId, LockKind, MarketId};
use chrono::Utc;
use rust_decimal::Decimal;

impl MarketEngine {
    // ------------------------------------------------------------------
    // Resolve
    // ------------------------------------------------------------------

    /// Resolve the market on `winning_outcome`. Each winning token pays one
    /// credit; conditional profits pay face value; conditional losses pay
    /// zero. The AMM's position lock settles for whatever remains of the
    /// market's pool, so trader payouts + AMM payout = pool exactly.
    pub fn resolve(
        &mut self,
        market_id: MarketId,
        winning_outcome: &str,
    ) -> Result<(), EngineError> {
        let market = self.open_market(market_id)?;
        let win_ix = market
            .outcome_index(winning_outcome)
            .ok_or_else(|| EngineError::InvalidOutcome {
                market: market_id,
                outcome: winning_outcome.to_string(),
            })?;
        let amm_account_id = market.amm_account_id;

        // plan first: (lock, payout) per trader lock, pool total, AMM handle
        let mut total_pool = Decimal::ZERO;
        let mut trader_payouts: Vec<(LockId, Decimal)> = Vec::new();
        let mut amm_lock: Option<LockId> = None;

        for acc in self.risk.accounts() {
            for lk in acc.locks_for_market(market_id) {
                total_pool += lk.amount;
                if acc.id == amm_account_id {
                    match lk.kind {
                        LockKind::Position => amm_lock = Some(lk.lock_id),
                        _ => {
                            return Err(EngineError::InvalidState(format!(
                                "market {market_id:?}: AMM holds a {} lock",
                                lk.kind
                            )))
                        }
                    }
                    continue;
                }
                let payout = match &lk.kind {
                    LockKind::OutcomePosition(outcome) => {
                        let ix = market.outcome_index(outcome).ok_or_else(|| {
                            EngineError::InvalidState(format!(
                                "market {market_id:?}: lock on unknown outcome {outcome:?}"
                            ))
                        })?;
                        if ix == win_ix {
                            // one credit per winning token
                            market.position(acc.id)[ix]
                        } else {
                            Decimal::ZERO
                        }
                    }
                    LockKind::ConditionalProfit => lk.amount,
                    LockKind::ConditionalLoss => Decimal::ZERO,
                    LockKind::Position => {
                        return Err(EngineError::InvalidState(format!(
                            "market {market_id:?}: account {:?} holds an AMM position lock",
                            acc.id
                        )))
                    }
                };
                trader_payouts.push((lk.lock_id, payout));
            }
        }

        let amm_lock = amm_lock.ok_or_else(|| {
            EngineError::InvalidState(format!("market {market_id:?}: AMM has no position lock"))
        })?;
        let paid_out: Decimal = trader_payouts.iter().map(|(_, p)| *p).sum();
        let amm_payout = total_pool - paid_out;
        if amm_payout < Decimal::ZERO {
            return Err(EngineError::InvalidState(format!(
                "market {market_id:?}: payouts {paid_out} exceed pool {total_pool}"
            )));
        }

        // -- plan is consistent; nothing below can fail --

        for (lock_id, payout) in trader_payouts {
            self.risk.settle_lock(lock_id, payout, None)?;
        }
        self.risk.settle_lock(amm_lock, amm_payout, None)?;

        let market = self
            .markets
            .get_mut(&market_id)
            .ok_or(EngineError::MarketNotFound(market_id))?;
        market.status = MarketStatus::Resolved;
        market.resolution = Some(winning_outcome.to_string());
        market.resolved_at = Some(Utc::now());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Void
    // ------------------------------------------------------------------

    /// Void the market: every trade reverts. Position and conditional-loss
    /// locks release at face value to their owners; conditional profits were
    /// carved out of the AMM's backing, so they release and then return to
    /// the AMM. Afterwards every participant holds exactly what it held
    /// before the market existed.
    pub fn void(&mut self, market_id: MarketId) -> Result<(), EngineError> {
        let market = self.open_market(market_id)?;
        let amm_account_id = market.amm_account_id;

        struct Unwind {
            lock_id: LockId,
            owner: AccountId,
            amount: Decimal,
            return_to_amm: bool,
        }

        let plan: Vec<Unwind> = self
            .risk
            .accounts()
            .flat_map(|acc| {
                acc.locks_for_market(market_id).map(|lk| Unwind {
                    lock_id: lk.lock_id,
                    owner: acc.id,
                    amount: lk.amount,
                    return_to_amm: lk.kind == LockKind::ConditionalProfit
                        && acc.id != amm_account_id,
                })
            })
            .collect();

        for unwind in plan {
            self.risk.release_lock(unwind.lock_id, None)?;
            if unwind.return_to_amm {
                self.risk.transfer_available(
                    unwind.owner,
                    amm_account_id,
                    unwind.amount,
                    Some(market_id),
                    None,
                )?;
            }
        }

        let market = self
            .markets
            .get_mut(&market_id)
            .ok_or(EngineError::MarketNotFound(market_id))?;
        market.status = MarketStatus::Void;
        market.resolved_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketParams;
    use rust_decimal_macros::dec;

    fn system_with_trader(balance: Decimal) -> (MarketEngine, MarketId, AccountId) {
        let mut engine = MarketEngine::new();
        let trader = engine.risk_mut().create_account();
        engine.risk_mut().mint(trader, balance).unwrap();
        let market_id = engine
            .create_market(MarketParams::yes_no("Will PR #1 merge?"))
            .unwrap();
        (engine, market_id, trader)
    }

    fn no_market_locks_remain(engine: &MarketEngine, market_id: MarketId) {
        for acc in engine.risk().accounts() {
            assert_eq!(
                acc.locks_for_market(market_id).count(),
                0,
                "account {:?} still has locks",
                acc.id
            );
        }
    }

    #[test]
    fn resolve_empty_market_returns_subsidy() {
        let (mut engine, market_id, _) = system_with_trader(dec!(1000));
        let amm = engine.market(market_id).unwrap().amm_account_id;
        engine.resolve(market_id, "yes").unwrap();

        let market = engine.market(market_id).unwrap();
        assert_eq!(market.status, MarketStatus::Resolved);
        assert_eq!(market.resolution.as_deref(), Some("yes"));
        assert!(market.resolved_at.is_some());

        let amm_acc = engine.risk().account(amm).unwrap();
        assert_eq!(amm_acc.available_balance, dec!(69.314719));
        assert_eq!(amm_acc.frozen_balance, dec!(0));
        no_market_locks_remain(&engine, market_id);
        assert_eq!(engine.risk().system_total(), engine.risk().total_minted());
    }

    #[test]
    fn resolve_pays_winning_tokens_one_credit_each() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        let trade = engine.buy(market_id, trader, "yes", dec!(50)).unwrap();
        let trade_value = trade.amount * trade.price;
        engine.resolve(market_id, "yes").unwrap();

        let acc = engine.risk().account(trader).unwrap();
        assert_eq!(acc.available_balance, dec!(1000) - trade_value + trade.amount);
        assert_eq!(acc.frozen_balance, dec!(0));
        no_market_locks_remain(&engine, market_id);
        assert_eq!(engine.risk().system_total(), engine.risk().total_minted());
    }

    #[test]
    fn resolve_zeroes_losing_tokens() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        let trade = engine.buy(market_id, trader, "yes", dec!(50)).unwrap();
        let trade_value = trade.amount * trade.price;
        engine.resolve(market_id, "no").unwrap();

        let acc = engine.risk().account(trader).unwrap();
        assert_eq!(acc.available_balance, dec!(1000) - trade_value);
        no_market_locks_remain(&engine, market_id);
        assert_eq!(engine.risk().system_total(), engine.risk().total_minted());
    }

    #[test]
    fn amm_loss_is_bounded_by_subsidy() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(10000));
        let amm = engine.market(market_id).unwrap().amm_account_id;
        // push hard in one direction, then resolve that way: worst case for
        // the AMM
        engine.buy(market_id, trader, "yes", dec!(5000)).unwrap();
        engine.resolve(market_id, "yes").unwrap();

        let subsidy = dec!(69.314719);
        let amm_total = engine.risk().account(amm).unwrap().total();
        let loss = subsidy - amm_total;
        assert!(loss <= subsidy, "loss {loss} exceeds subsidy");
        assert_eq!(engine.risk().system_total(), engine.risk().total_minted());
    }

    #[test]
    fn resolve_settles_conditional_profit_at_face() {
        let (mut engine, market_id, early) = system_with_trader(dec!(1000));
        let whale = engine.risk_mut().create_account();
        engine.risk_mut().mint(whale, dec!(1000)).unwrap();

        let bought = engine.buy(market_id, early, "yes", dec!(20)).unwrap();
        engine.buy(market_id, whale, "yes", dec!(500)).unwrap();
        engine.sell(market_id, early, "yes", bought.amount).unwrap();

        let cp_amount = engine
            .risk()
            .account(early)
            .unwrap()
            .lock_for(market_id, &LockKind::ConditionalProfit)
            .unwrap()
            .amount;
        let available_before = engine
            .risk()
            .account(early)
            .unwrap()
            .available_balance;

        // resolution direction doesn't matter for an already-closed position
        engine.resolve(market_id, "no").unwrap();

        let acc = engine.risk().account(early).unwrap();
        assert_eq!(acc.available_balance, available_before + cp_amount);
        no_market_locks_remain(&engine, market_id);
        assert_eq!(engine.risk().system_total(), engine.risk().total_minted());
    }

    #[test]
    fn resolve_rejects_unknown_outcome_and_closed_market() {
        let (mut engine, market_id, _) = system_with_trader(dec!(1000));
        assert!(matches!(
            engine.resolve(market_id, "maybe"),
            Err(EngineError::InvalidOutcome { .. })
        ));
        engine.resolve(market_id, "yes").unwrap();
        assert!(matches!(
            engine.resolve(market_id, "yes"),
            Err(EngineError::MarketClosed { .. })
        ));
        assert!(matches!(
            engine.void(market_id),
            Err(EngineError::MarketClosed { .. })
        ));
    }

    #[test]
    fn void_restores_every_participant_exactly() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        let amm = engine.market(market_id).unwrap().amm_account_id;
        let subsidy = engine.risk().account(amm).unwrap().total();

        let bought = engine.buy(market_id, trader, "yes", dec!(120)).unwrap();
        engine.buy(market_id, trader, "no", dec!(45)).unwrap();
        let third = {
            let market = engine.market(market_id).unwrap();
            market.quantize_amount_floor(bought.amount / dec!(3))
        };
        engine.sell(market_id, trader, "yes", third).unwrap();

        engine.void(market_id).unwrap();

        assert_eq!(engine.risk().account(trader).unwrap().total(), dec!(1000));
        assert_eq!(
            engine.risk().account(trader).unwrap().frozen_balance,
            dec!(0)
        );
        assert_eq!(engine.risk().account(amm).unwrap().total(), subsidy);
        no_market_locks_remain(&engine, market_id);
        assert_eq!(engine.risk().system_total(), engine.risk().total_minted());
        assert_eq!(
            engine.market(market_id).unwrap().status,
            MarketStatus::Void
        );
    }

    #[test]
    fn void_returns_conditional_profit_to_the_amm() {
        let (mut engine, market_id, early) = system_with_trader(dec!(1000));
        let whale = engine.risk_mut().create_account();
        engine.risk_mut().mint(whale, dec!(1000)).unwrap();
        let amm = engine.market(market_id).unwrap().amm_account_id;
        let subsidy = engine.risk().account(amm).unwrap().total();

        let bought = engine.buy(market_id, early, "yes", dec!(20)).unwrap();
        engine.buy(market_id, whale, "yes", dec!(500)).unwrap();
        engine.sell(market_id, early, "yes", bought.amount).unwrap();
        assert!(engine
            .risk()
            .account(early)
            .unwrap()
            .lock_for(market_id, &LockKind::ConditionalProfit)
            .is_some());

        engine.void(market_id).unwrap();

        assert_eq!(engine.risk().account(early).unwrap().total(), dec!(1000));
        assert_eq!(engine.risk().account(whale).unwrap().total(), dec!(1000));
        assert_eq!(engine.risk().account(amm).unwrap().total(), subsidy);
        no_market_locks_remain(&engine, market_id);
    }
}
