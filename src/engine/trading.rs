// 6.2 engine/trading.rs: trade execution against the AMM.
//
// Rounding always favors the AMM: token counts floor, buy prices ceil, sell
// prices floor. Every precondition is checked before the first balance
// mutation, so a failed trade leaves no trace; once the ledger is touched the
// remaining steps cannot fail.

use super::core::MarketEngine;
use super::results::EngineError;
use crate::lmsr;
use crate::market::{Trade, TradeLeg};
use crate::risk::RiskError;
use crate::types::{AccountId, LockKind, MarketId};
use chrono::Utc;
use rust_decimal::Decimal;

impl MarketEngine {
    // ------------------------------------------------------------------
    // Buy
    // ------------------------------------------------------------------

    /// Spend up to `budget` credits on `outcome` tokens. The token count is
    /// the LMSR inverse of the budget, floored to the market's amount
    /// precision; the average price is the exact cost of that count, ceiled
    /// to price precision. The trader pays tokens * price exactly, locked as
    /// margin under its per-outcome position lock.
    pub fn buy(
        &mut self,
        market_id: MarketId,
        account_id: AccountId,
        outcome: &str,
        budget: Decimal,
    ) -> Result<Trade, EngineError> {
        let market = self.open_market(market_id)?;
        let ix = market
            .outcome_index(outcome)
            .ok_or_else(|| EngineError::InvalidOutcome {
                market: market_id,
                outcome: outcome.to_string(),
            })?;
        if budget <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount {
                market: market_id,
                amount: budget,
                predicate: "budget must be positive",
            });
        }

        let b = market.b;
        let q = market.q.clone();
        let amm_account_id = market.amm_account_id;
        let quantum = market.amount_quantum();

        let available = self.risk.account(account_id)?.available_balance;
        if budget > available {
            return Err(RiskError::InsufficientBalance {
                account: account_id,
                needed: budget,
                available,
            }
            .into());
        }

        let market = self.market(market_id)?;
        let mut tokens = market.quantize_amount_floor(lmsr::amount_for_cost(&q, b, ix, budget));
        if tokens <= Decimal::ZERO {
            return Err(EngineError::BudgetTooSmall {
                market: market_id,
                budget,
            });
        }

        let reprice = |tokens: Decimal| -> (Decimal, Decimal) {
            let exact_cost = lmsr::cost_to_buy(&q, b, ix, tokens);
            let avg_price = market.quantize_price_ceil(exact_cost / tokens);
            // tokens * avg_price is exact at asset precision: no further rounding
            (avg_price, tokens * avg_price)
        };

        let (mut avg_price, mut trade_value) = reprice(tokens);
        if trade_value > available {
            // the price ceiling can push the total past the balance; give up
            // one quantum and re-price once
            tokens -= quantum;
            if tokens <= Decimal::ZERO {
                return Err(EngineError::BudgetTooSmall {
                    market: market_id,
                    budget,
                });
            }
            (avg_price, trade_value) = reprice(tokens);
            if trade_value > available {
                return Err(RiskError::InsufficientBalance {
                    account: account_id,
                    needed: trade_value,
                    available,
                }
                .into());
            }
        }

        // -- all checks passed; nothing below can fail --

        let trade_id = self.risk.counters_mut().next_trade();
        let kind = LockKind::outcome_position(outcome);
        let existing = self
            .risk
            .account(account_id)?
            .lock_for(market_id, &kind)
            .map(|l| l.lock_id);
        let (lock_id, tx_id) = match existing {
            Some(lock_id) => {
                let tx_id = self.risk.increase_lock(lock_id, trade_value, Some(trade_id))?;
                (lock_id, tx_id)
            }
            None => self
                .risk
                .lock(account_id, market_id, trade_value, kind, Some(trade_id))?,
        };

        let market = self
            .markets
            .get_mut(&market_id)
            .ok_or(EngineError::MarketNotFound(market_id))?;
        market.q[ix] += tokens;
        market.position_mut(account_id)[ix] += tokens;

        let trade = Trade {
            id: trade_id,
            market_id,
            outcome: outcome.to_string(),
            amount: tokens,
            price: avg_price,
            buyer: TradeLeg {
                account_id,
                available_delta: -trade_value,
                frozen_delta: trade_value,
                lock_id: Some(lock_id),
                tx_id: Some(tx_id),
            },
            seller: TradeLeg::flat(amm_account_id),
            created_at: Utc::now(),
        };
        market.trades.push(trade.clone());
        Ok(trade)
    }

    // ------------------------------------------------------------------
    // Sell
    // ------------------------------------------------------------------

    /// Sell `amount` tokens of `outcome` back to the AMM. A proportional
    /// share of the position's margin is released; the difference between the
    /// sale value and that share is realized as a conditional-profit lock
    /// (funded from the AMM's backing) or a conditional-loss lock (funded
    /// from the trader's available). If both conditional locks would exist,
    /// they net against each other so at most one survives.
    pub fn sell(
        &mut self,
        market_id: MarketId,
        account_id: AccountId,
        outcome: &str,
        amount: Decimal,
    ) -> Result<Trade, EngineError> {
        let market = self.open_market(market_id)?;
        let ix = market
            .outcome_index(outcome)
            .ok_or_else(|| EngineError::InvalidOutcome {
                market: market_id,
                outcome: outcome.to_string(),
            })?;
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount {
                market: market_id,
                amount,
                predicate: "must be positive",
            });
        }
        if market.quantize_amount_floor(amount) != amount {
            return Err(EngineError::InvalidAmount {
                market: market_id,
                amount,
                predicate: "not at the market's amount precision",
            });
        }

        let b = market.b;
        let q = market.q.clone();
        let amm_account_id = market.amm_account_id;

        let held = market
            .positions
            .get(&account_id)
            .map(|p| p[ix])
            .unwrap_or(Decimal::ZERO);
        if amount > held {
            return Err(EngineError::InvalidAmount {
                market: market_id,
                amount,
                predicate: "exceeds tokens held",
            });
        }

        let exact_revenue = -lmsr::cost_to_buy(&q, b, ix, -amount);
        let avg_price = market
            .quantize_price_floor(exact_revenue / amount)
            .max(Decimal::ZERO);
        let trade_value = amount * avg_price;

        let kind = LockKind::outcome_position(outcome);
        let trader = self.risk.account(account_id)?;
        let position_lock = trader.lock_for(market_id, &kind).ok_or_else(|| {
            EngineError::InvalidState(format!(
                "account {account_id:?} holds {held} {outcome} in market {market_id:?} with no margin lock"
            ))
        })?;
        let position_lock_id = position_lock.lock_id;
        let margin_locked = position_lock.amount;

        let close_margin = if held == amount {
            margin_locked
        } else {
            self.market(market_id)?
                .quantize_credit_floor(margin_locked * amount / held)
        };
        let pnl = trade_value - close_margin;

        // a profit is paid out of the AMM's backing, which must also outlive
        // the transfer: the position lock survives every open-market
        // operation. Checked before any mutation.
        let amm_lock_id = if pnl > Decimal::ZERO {
            let amm = self.risk.account(amm_account_id)?;
            let amm_lock = amm.lock_for(market_id, &LockKind::Position).ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "market {market_id:?}: AMM has no position lock"
                ))
            })?;
            if amm_lock.amount <= pnl {
                return Err(EngineError::InvalidState(format!(
                    "market {market_id:?}: AMM backing {} cannot cover profit {pnl}",
                    amm_lock.amount
                )));
            }
            Some(amm_lock.lock_id)
        } else {
            None
        };

        // -- all checks passed; nothing below can fail --

        let trade_id = self.risk.counters_mut().next_trade();
        let trader_before = balances(&self.risk, account_id)?;
        let amm_before = balances(&self.risk, amm_account_id)?;
        let mut witness = None;

        // (a) return the closed share of the margin
        if close_margin > Decimal::ZERO {
            let tx = self
                .risk
                .decrease_lock(position_lock_id, close_margin, Some(trade_id))?;
            witness = Some(tx);
        }

        // (b) realize the PnL
        if pnl > Decimal::ZERO {
            let amm_lock_id = amm_lock_id.ok_or_else(|| {
                EngineError::InvalidState("profit without an AMM lock handle".to_string())
            })?;
            let (_, credit) = self.risk.transfer_frozen(
                amm_lock_id,
                account_id,
                pnl,
                LockKind::ConditionalProfit,
                Some(trade_id),
            )?;
            witness = witness.or(Some(credit));
        } else if pnl < Decimal::ZERO {
            let loss = -pnl;
            let existing = self
                .risk
                .account(account_id)?
                .lock_for(market_id, &LockKind::ConditionalLoss)
                .map(|l| l.lock_id);
            let tx = match existing {
                Some(cl) => self.risk.increase_lock(cl, loss, Some(trade_id))?,
                None => {
                    let (_, tx) = self.risk.lock(
                        account_id,
                        market_id,
                        loss,
                        LockKind::ConditionalLoss,
                        Some(trade_id),
                    )?;
                    tx
                }
            };
            witness = witness.or(Some(tx));
        }

        // (c) net conditional profit against conditional loss so at most one
        // survives per (trader, market)
        let trader_acc = self.risk.account(account_id)?;
        let cp = trader_acc
            .lock_for(market_id, &LockKind::ConditionalProfit)
            .map(|l| (l.lock_id, l.amount));
        let cl = trader_acc
            .lock_for(market_id, &LockKind::ConditionalLoss)
            .map(|l| (l.lock_id, l.amount));
        if let (Some((cp_lock, cp_amount)), Some((cl_lock, cl_amount))) = (cp, cl) {
            let net = cp_amount.min(cl_amount);
            self.risk
                .transfer_frozen(cp_lock, amm_account_id, net, LockKind::Position, Some(trade_id))?;
            self.risk.decrease_lock(cl_lock, net, Some(trade_id))?;
        }

        let trader_after = balances(&self.risk, account_id)?;
        let amm_after = balances(&self.risk, amm_account_id)?;

        let market = self
            .markets
            .get_mut(&market_id)
            .ok_or(EngineError::MarketNotFound(market_id))?;
        market.q[ix] -= amount;
        market.position_mut(account_id)[ix] -= amount;

        let trade = Trade {
            id: trade_id,
            market_id,
            outcome: outcome.to_string(),
            amount,
            price: avg_price,
            buyer: TradeLeg {
                account_id: amm_account_id,
                available_delta: amm_after.0 - amm_before.0,
                frozen_delta: amm_after.1 - amm_before.1,
                lock_id: None,
                tx_id: None,
            },
            seller: TradeLeg {
                account_id,
                available_delta: trader_after.0 - trader_before.0,
                frozen_delta: trader_after.1 - trader_before.1,
                lock_id: Some(position_lock_id),
                tx_id: witness,
            },
            created_at: Utc::now(),
        };
        market.trades.push(trade.clone());
        Ok(trade)
    }
}

fn balances(
    risk: &crate::risk::RiskEngine,
    account_id: AccountId,
) -> Result<(Decimal, Decimal), EngineError> {
    let acc = risk.account(account_id)?;
    Ok((acc.available_balance, acc.frozen_balance))
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

    #[test]
    fn buy_locks_margin_and_moves_q() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        let trade = engine.buy(market_id, trader, "yes", dec!(50)).unwrap();

        assert!(trade.amount > dec!(80) && trade.amount < dec!(85));
        assert!(trade.price > dec!(0.5) && trade.price < dec!(0.65));
        let trade_value = trade.amount * trade.price;
        assert_eq!(trade.buyer.available_delta, -trade_value);
        assert_eq!(trade.buyer.frozen_delta, trade_value);

        let market = engine.market(market_id).unwrap();
        assert_eq!(market.q[0], trade.amount);
        assert_eq!(market.q[1], dec!(0));
        assert_eq!(market.position(trader)[0], trade.amount);

        let acc = engine.risk().account(trader).unwrap();
        assert_eq!(acc.available_balance, dec!(1000) - trade_value);
        let lock = acc
            .lock_for(market_id, &LockKind::outcome_position("yes"))
            .unwrap();
        assert_eq!(lock.amount, trade_value);
        // the price moved
        assert!(market.prices()[0] > dec!(0.5));
    }

    #[test]
    fn second_buy_pays_a_higher_price() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        let first = engine.buy(market_id, trader, "yes", dec!(50)).unwrap();
        let second = engine.buy(market_id, trader, "yes", dec!(50)).unwrap();
        assert!(second.price > first.price);
    }

    #[test]
    fn repeat_buys_grow_one_lock() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        engine.buy(market_id, trader, "yes", dec!(30)).unwrap();
        engine.buy(market_id, trader, "yes", dec!(30)).unwrap();
        let acc = engine.risk().account(trader).unwrap();
        let yes_locks = acc
            .locks
            .iter()
            .filter(|l| l.kind == LockKind::outcome_position("yes"))
            .count();
        assert_eq!(yes_locks, 1);
    }

    #[test]
    fn buy_rejects_bad_inputs() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        assert!(matches!(
            engine.buy(MarketId(99), trader, "yes", dec!(10)),
            Err(EngineError::MarketNotFound(_))
        ));
        assert!(matches!(
            engine.buy(market_id, trader, "maybe", dec!(10)),
            Err(EngineError::InvalidOutcome { .. })
        ));
        assert!(matches!(
            engine.buy(market_id, trader, "yes", dec!(0)),
            Err(EngineError::InvalidAmount { .. })
        ));
        assert!(matches!(
            engine.buy(market_id, trader, "yes", dec!(0.000001)),
            Err(EngineError::BudgetTooSmall { .. })
        ));
    }

    #[test]
    fn buy_beyond_balance_leaves_no_trace() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1));
        let before = engine.clone();
        let err = engine.buy(market_id, trader, "yes", dec!(9999)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Risk(RiskError::InsufficientBalance { .. })
        ));
        assert_eq!(engine, before);
    }

    #[test]
    fn sell_full_position_releases_margin() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        let bought = engine.buy(market_id, trader, "yes", dec!(50)).unwrap();
        let sold = engine
            .sell(market_id, trader, "yes", bought.amount)
            .unwrap();

        // the round trip costs the trader a little (rounding favors the AMM)
        let acc = engine.risk().account(trader).unwrap();
        assert!(acc.available_balance < dec!(1000));
        assert!(acc.available_balance > dec!(999));

        // position and margin lock are gone; the dust sits in a
        // conditional-loss lock
        let market = engine.market(market_id).unwrap();
        assert_eq!(market.position(trader)[0], dec!(0));
        assert!(acc
            .lock_for(market_id, &LockKind::outcome_position("yes"))
            .is_none());
        let cl = acc
            .lock_for(market_id, &LockKind::ConditionalLoss)
            .unwrap();
        assert!(cl.amount > dec!(0));
        assert!(sold.price <= bought.price);
        assert_eq!(market.q[0], dec!(0));
    }

    #[test]
    fn partial_sell_releases_proportional_margin() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        let bought = engine.buy(market_id, trader, "yes", dec!(50)).unwrap();
        let margin_before = engine
            .risk()
            .account(trader)
            .unwrap()
            .lock_for(market_id, &LockKind::outcome_position("yes"))
            .unwrap()
            .amount;

        let half = {
            let market = engine.market(market_id).unwrap();
            market.quantize_amount_floor(bought.amount / dec!(2))
        };
        engine.sell(market_id, trader, "yes", half).unwrap();

        let acc = engine.risk().account(trader).unwrap();
        let margin_after = acc
            .lock_for(market_id, &LockKind::outcome_position("yes"))
            .unwrap()
            .amount;
        assert!(margin_after < margin_before);
        assert!(margin_after > dec!(0));
        let market = engine.market(market_id).unwrap();
        assert_eq!(market.position(trader)[0], bought.amount - half);
    }

    #[test]
    fn profitable_sell_forms_conditional_profit() {
        let (mut engine, market_id, early) = system_with_trader(dec!(1000));
        let whale = engine.risk_mut().create_account();
        engine.risk_mut().mint(whale, dec!(1000)).unwrap();

        let bought = engine.buy(market_id, early, "yes", dec!(20)).unwrap();
        // the whale pushes the price up, then the early buyer exits at a profit
        engine.buy(market_id, whale, "yes", dec!(500)).unwrap();
        engine.sell(market_id, early, "yes", bought.amount).unwrap();

        let acc = engine.risk().account(early).unwrap();
        let cp = acc
            .lock_for(market_id, &LockKind::ConditionalProfit)
            .unwrap();
        assert!(cp.amount > dec!(0));
        assert!(acc.lock_for(market_id, &LockKind::ConditionalLoss).is_none());
        // profit is frozen until resolution, not spendable
        assert!(acc.available_balance > dec!(980));
    }

    #[test]
    fn conditional_locks_never_coexist() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        let whale = engine.risk_mut().create_account();
        engine.risk_mut().mint(whale, dec!(1000)).unwrap();

        // profit first
        let bought = engine.buy(market_id, trader, "yes", dec!(20)).unwrap();
        engine.buy(market_id, whale, "yes", dec!(400)).unwrap();
        let quarter = {
            let market = engine.market(market_id).unwrap();
            market.quantize_amount_floor(bought.amount / dec!(4))
        };
        engine.sell(market_id, trader, "yes", quarter).unwrap();

        // then a loss-making round trip on the other outcome
        let no_trade = engine.buy(market_id, trader, "no", dec!(30)).unwrap();
        engine
            .sell(market_id, trader, "no", no_trade.amount)
            .unwrap();

        let acc = engine.risk().account(trader).unwrap();
        let has_cp = acc
            .lock_for(market_id, &LockKind::ConditionalProfit)
            .is_some();
        let has_cl = acc
            .lock_for(market_id, &LockKind::ConditionalLoss)
            .is_some();
        assert!(!(has_cp && has_cl), "CP and CL must never coexist");
    }

    #[test]
    fn sell_rejects_bad_inputs() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        engine.buy(market_id, trader, "yes", dec!(50)).unwrap();

        assert!(matches!(
            engine.sell(market_id, trader, "maybe", dec!(1)),
            Err(EngineError::InvalidOutcome { .. })
        ));
        assert!(matches!(
            engine.sell(market_id, trader, "yes", dec!(0)),
            Err(EngineError::InvalidAmount { .. })
        ));
        // off-precision amount
        assert!(matches!(
            engine.sell(market_id, trader, "yes", dec!(0.001)),
            Err(EngineError::InvalidAmount { .. })
        ));
        // more than held
        assert!(matches!(
            engine.sell(market_id, trader, "yes", dec!(5000)),
            Err(EngineError::InvalidAmount { .. })
        ));
        // never held the other outcome
        assert!(matches!(
            engine.sell(market_id, trader, "no", dec!(1)),
            Err(EngineError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn conservation_holds_through_trading() {
        let (mut engine, market_id, trader) = system_with_trader(dec!(1000));
        let total = engine.risk().total_minted();
        let bought = engine.buy(market_id, trader, "yes", dec!(80)).unwrap();
        assert_eq!(engine.risk().system_total(), total);
        engine.sell(market_id, trader, "yes", bought.amount).unwrap();
        assert_eq!(engine.risk().system_total(), total);
    }
}
