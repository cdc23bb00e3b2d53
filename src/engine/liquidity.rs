// 6.4 engine/liquidity.rs: market depth changes.
//
// Changing b rescales q by new_b/b so prices are untouched; the credit
// difference moves through the AMM's position lock.

use super::core::MarketEngine;
use super::results::EngineError;
use crate::lmsr;
use crate::risk::RiskError;
use crate::types::{AccountId, LockKind, MarketId};
use rust_decimal::Decimal;

impl MarketEngine {
    /// Deepen the market by `amount` credits. The funding comes from
    /// `funding_account` when given, otherwise from the AMM's own available
    /// balance, and lands in the AMM's position lock.
    pub fn add_liquidity(
        &mut self,
        market_id: MarketId,
        amount: Decimal,
        funding_account: Option<AccountId>,
    ) -> Result<(), EngineError> {
        let market = self.open_market(market_id)?;
        let amount = market.quantize_credit(amount);
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount {
                market: market_id,
                amount,
                predicate: "must be positive",
            });
        }
        let amm_account_id = market.amm_account_id;
        let (new_b, new_q) = lmsr::b_for_funding(&market.q, market.b, amount);

        let amm_lock = market_position_lock(self, market_id, amm_account_id)?;
        let source = funding_account.unwrap_or(amm_account_id);
        let available = self.risk.account(source)?.available_balance;
        if available < amount {
            return Err(RiskError::InsufficientBalance {
                account: source,
                needed: amount,
                available,
            }
            .into());
        }

        // -- all checks passed --

        if let Some(funder) = funding_account {
            self.risk
                .transfer_available(funder, amm_account_id, amount, Some(market_id), None)?;
        }
        self.risk.increase_lock(amm_lock, amount, None)?;

        let market = self
            .markets
            .get_mut(&market_id)
            .ok_or(EngineError::MarketNotFound(market_id))?;
        market.b = new_b;
        market.q = new_q;
        Ok(())
    }

    /// Withdraw `amount` credits of depth into the AMM's available balance.
    /// The AMM's backing must stay positive, on both sides of the ledger:
    /// the new b must be positive and the position lock must not empty.
    pub fn remove_liquidity(
        &mut self,
        market_id: MarketId,
        amount: Decimal,
    ) -> Result<(), EngineError> {
        let market = self.open_market(market_id)?;
        let amount = market.quantize_credit(amount);
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount {
                market: market_id,
                amount,
                predicate: "must be positive",
            });
        }
        let amm_account_id = market.amm_account_id;
        let (new_b, new_q) = lmsr::b_for_funding(&market.q, market.b, -amount);
        if new_b <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount {
                market: market_id,
                amount,
                predicate: "would drain the market's liquidity",
            });
        }

        let amm_lock = market_position_lock(self, market_id, amm_account_id)?;
        let backing = self
            .risk
            .find_lock(amm_lock)
            .map(|l| l.amount)
            .unwrap_or(Decimal::ZERO);
        if amount >= backing {
            return Err(EngineError::InvalidAmount {
                market: market_id,
                amount,
                predicate: "would empty the AMM's position lock",
            });
        }

        // -- all checks passed --

        self.risk.decrease_lock(amm_lock, amount, None)?;
        let market = self
            .markets
            .get_mut(&market_id)
            .ok_or(EngineError::MarketNotFound(market_id))?;
        market.b = new_b;
        market.q = new_q;
        Ok(())
    }
}

fn market_position_lock(
    engine: &MarketEngine,
    market_id: MarketId,
    amm_account_id: AccountId,
) -> Result<crate::types::LockId, EngineError> {
    engine
        .risk
        .account(amm_account_id)?
        .lock_for(market_id, &LockKind::Position)
        .map(|l| l.lock_id)
        .ok_or_else(|| {
            EngineError::InvalidState(format!("market {market_id:?}: AMM has no position lock"))
        })
}
