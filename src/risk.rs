//! The risk engine. Single source of truth for balances.
//!
//! Accounts, locks, and the append-only transaction ledger live here. Every
//! balance mutation appends a Transaction; balances are the folded result of
//! the log. The risk engine knows nothing about markets, positions, or LMSR —
//! market structure belongs to the market engine, which is this engine's only
//! client for mutations.
//!
//! Amounts are stored at full Decimal precision. Quantization is the market
//! engine's job; by the time credits move here they are exact.
//!
//! Every operation checks its preconditions before touching state, so a
//! returned error means nothing changed.

use crate::account::{Account, Lock};
use crate::types::{AccountId, Counters, LockId, LockKind, MarketId, TradeId, TxId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

// 4.0: one ledger entry. available_delta and frozen_delta are signed; a lock
// shows up as (-x, +x), a release as (+x, -x), a settlement as (+payout, -locked).
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TxId,
    pub account_id: AccountId,
    pub available_delta: Decimal,
    pub frozen_delta: Decimal,
    pub reason: String,
    pub market_id: Option<MarketId>,
    pub trade_id: Option<TradeId>,
    pub lock_id: Option<LockId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskError {
    #[error("account {0:?} not found")]
    AccountNotFound(AccountId),

    #[error("lock {0:?} not found")]
    LockNotFound(LockId),

    #[error("account {account:?}: need {needed}, have {available} available")]
    InsufficientBalance {
        account: AccountId,
        needed: Decimal,
        available: Decimal,
    },

    #[error("{entity} {id}: invalid amount {amount}: {predicate}")]
    InvalidAmount {
        entity: &'static str,
        id: u64,
        amount: Decimal,
        predicate: &'static str,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),
}

// 4.1: the engine. BTreeMap keeps account iteration in id order, which keeps
// settlement and snapshots deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskEngine {
    accounts: BTreeMap<AccountId, Account>,
    transactions: Vec<Transaction>,
    counters: Counters,
}

impl RiskEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        accounts: BTreeMap<AccountId, Account>,
        transactions: Vec<Transaction>,
        counters: Counters,
    ) -> Self {
        Self {
            accounts,
            transactions,
            counters,
        }
    }

    pub fn create_account(&mut self) -> AccountId {
        let id = self.counters.next_account();
        self.accounts.insert(id, Account::new(id, Utc::now()));
        id
    }

    // ------------------------------------------------------------------
    // Minting
    // ------------------------------------------------------------------

    /// Create credits from nothing. The only way money enters the system.
    pub fn mint(&mut self, account_id: AccountId, amount: Decimal) -> Result<TxId, RiskError> {
        require_positive("account", account_id.0, amount)?;
        let acc = self.account_mut(account_id)?;
        acc.available_balance += amount;
        Ok(self.push_tx(
            account_id,
            amount,
            Decimal::ZERO,
            "mint".to_string(),
            None,
            None,
            None,
        ))
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Move credits from available to frozen under a fresh lock.
    pub fn lock(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        amount: Decimal,
        kind: LockKind,
        trade_id: Option<TradeId>,
    ) -> Result<(LockId, TxId), RiskError> {
        require_positive("account", account_id.0, amount)?;
        let acc = self.account(account_id)?;
        if acc.available_balance < amount {
            return Err(RiskError::InsufficientBalance {
                account: account_id,
                needed: amount,
                available: acc.available_balance,
            });
        }

        let lock_id = self.counters.next_lock();
        let reason = format!("lock:{kind}");
        let acc = self.account_mut(account_id)?;
        acc.available_balance -= amount;
        acc.frozen_balance += amount;
        acc.locks.push(Lock {
            lock_id,
            account_id,
            market_id,
            amount,
            kind,
        });
        let tx_id = self.push_tx(
            account_id,
            -amount,
            amount,
            reason,
            Some(market_id),
            trade_id,
            Some(lock_id),
        );
        Ok((lock_id, tx_id))
    }

    /// Grow an existing lock from the owner's available balance.
    pub fn increase_lock(
        &mut self,
        lock_id: LockId,
        amount: Decimal,
        trade_id: Option<TradeId>,
    ) -> Result<TxId, RiskError> {
        require_positive("lock", lock_id.0, amount)?;
        let (account_id, market_id, kind) = self.lock_summary(lock_id)?;
        let acc = self.account(account_id)?;
        if acc.available_balance < amount {
            return Err(RiskError::InsufficientBalance {
                account: account_id,
                needed: amount,
                available: acc.available_balance,
            });
        }

        let acc = self.account_mut(account_id)?;
        acc.available_balance -= amount;
        acc.frozen_balance += amount;
        if let Some(lk) = acc.lock_by_id_mut(lock_id) {
            lk.amount += amount;
        }
        Ok(self.push_tx(
            account_id,
            -amount,
            amount,
            format!("increase_lock:{kind}"),
            Some(market_id),
            trade_id,
            Some(lock_id),
        ))
    }

    /// Shrink a lock, returning frozen credits to available. A lock that
    /// reaches zero is removed.
    pub fn decrease_lock(
        &mut self,
        lock_id: LockId,
        amount: Decimal,
        trade_id: Option<TradeId>,
    ) -> Result<TxId, RiskError> {
        require_positive("lock", lock_id.0, amount)?;
        let (account_id, market_id, kind) = self.lock_summary(lock_id)?;
        let locked = self.lock_amount(lock_id)?;
        if amount > locked {
            return Err(RiskError::InvalidAmount {
                entity: "lock",
                id: lock_id.0,
                amount,
                predicate: "exceeds locked amount",
            });
        }

        let acc = self.account_mut(account_id)?;
        acc.frozen_balance -= amount;
        acc.available_balance += amount;
        let mut emptied = false;
        if let Some(lk) = acc.lock_by_id_mut(lock_id) {
            lk.amount -= amount;
            emptied = lk.amount.is_zero();
        }
        if emptied {
            acc.remove_lock(lock_id);
        }
        Ok(self.push_tx(
            account_id,
            amount,
            -amount,
            format!("decrease_lock:{kind}"),
            Some(market_id),
            trade_id,
            Some(lock_id),
        ))
    }

    /// Release an entire lock back to available.
    pub fn release_lock(
        &mut self,
        lock_id: LockId,
        trade_id: Option<TradeId>,
    ) -> Result<TxId, RiskError> {
        let amount = self.lock_amount(lock_id)?;
        self.decrease_lock(lock_id, amount, trade_id)
    }

    /// Settle a lock: the frozen amount leaves, the payout arrives in
    /// available. Payout may be below, at, or above the locked amount.
    pub fn settle_lock(
        &mut self,
        lock_id: LockId,
        payout: Decimal,
        trade_id: Option<TradeId>,
    ) -> Result<TxId, RiskError> {
        if payout < Decimal::ZERO {
            return Err(RiskError::InvalidAmount {
                entity: "lock",
                id: lock_id.0,
                amount: payout,
                predicate: "settlement payout must be non-negative",
            });
        }
        let (account_id, market_id, _) = self.lock_summary(lock_id)?;
        let released = self.lock_amount(lock_id)?;

        let acc = self.account_mut(account_id)?;
        acc.frozen_balance -= released;
        acc.available_balance += payout;
        acc.remove_lock(lock_id);
        Ok(self.push_tx(
            account_id,
            payout,
            -released,
            "settlement".to_string(),
            Some(market_id),
            trade_id,
            Some(lock_id),
        ))
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Move available credits between two accounts. Two ledger entries with a
    /// shared reason.
    pub fn transfer_available(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        market_id: Option<MarketId>,
        trade_id: Option<TradeId>,
    ) -> Result<(TxId, TxId), RiskError> {
        require_positive("account", from.0, amount)?;
        self.account(to)?;
        let src = self.account(from)?;
        if src.available_balance < amount {
            return Err(RiskError::InsufficientBalance {
                account: from,
                needed: amount,
                available: src.available_balance,
            });
        }

        let src = self.account_mut(from)?;
        src.available_balance -= amount;
        let debit = self.push_tx(
            from,
            -amount,
            Decimal::ZERO,
            "transfer".to_string(),
            market_id,
            trade_id,
            None,
        );
        let dst = self.account_mut(to)?;
        dst.available_balance += amount;
        let credit = self.push_tx(
            to,
            amount,
            Decimal::ZERO,
            "transfer".to_string(),
            market_id,
            trade_id,
            None,
        );
        Ok((debit, credit))
    }

    /// Move frozen credits from one account's lock into another account's
    /// lock of the given kind, creating the destination lock if needed.
    /// Neither side's available balance changes.
    pub fn transfer_frozen(
        &mut self,
        from_lock: LockId,
        to_account: AccountId,
        amount: Decimal,
        to_kind: LockKind,
        trade_id: Option<TradeId>,
    ) -> Result<(TxId, TxId), RiskError> {
        require_positive("lock", from_lock.0, amount)?;
        let (from_account, market_id, from_kind) = self.lock_summary(from_lock)?;
        let locked = self.lock_amount(from_lock)?;
        if amount > locked {
            return Err(RiskError::InvalidAmount {
                entity: "lock",
                id: from_lock.0,
                amount,
                predicate: "exceeds locked amount",
            });
        }
        self.account(to_account)?;
        let reason = format!("transfer_frozen:{from_kind}->{to_kind}");

        // source side
        let src = self.account_mut(from_account)?;
        src.frozen_balance -= amount;
        let mut emptied = false;
        if let Some(lk) = src.lock_by_id_mut(from_lock) {
            lk.amount -= amount;
            emptied = lk.amount.is_zero();
        }
        if emptied {
            src.remove_lock(from_lock);
        }
        let debit = self.push_tx(
            from_account,
            Decimal::ZERO,
            -amount,
            reason.clone(),
            Some(market_id),
            trade_id,
            Some(from_lock),
        );

        // destination side
        let dest_lock = match self
            .account(to_account)?
            .lock_for(market_id, &to_kind)
            .map(|l| l.lock_id)
        {
            Some(existing) => {
                let dst = self.account_mut(to_account)?;
                dst.frozen_balance += amount;
                if let Some(lk) = dst.lock_by_id_mut(existing) {
                    lk.amount += amount;
                }
                existing
            }
            None => {
                let lock_id = self.counters.next_lock();
                let dst = self.account_mut(to_account)?;
                dst.frozen_balance += amount;
                dst.locks.push(Lock {
                    lock_id,
                    account_id: to_account,
                    market_id,
                    amount,
                    kind: to_kind,
                });
                lock_id
            }
        };
        let credit = self.push_tx(
            to_account,
            Decimal::ZERO,
            amount,
            reason,
            Some(market_id),
            trade_id,
            Some(dest_lock),
        );
        Ok((debit, credit))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn account(&self, account_id: AccountId) -> Result<&Account, RiskError> {
        self.accounts
            .get(&account_id)
            .ok_or(RiskError::AccountNotFound(account_id))
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn check_available(&self, account_id: AccountId, amount: Decimal) -> Result<bool, RiskError> {
        Ok(self.account(account_id)?.available_balance >= amount)
    }

    /// Sum of all mint transactions: the total money in the system.
    pub fn total_minted(&self) -> Decimal {
        self.transactions
            .iter()
            .filter(|tx| tx.reason == "mint")
            .map(|tx| tx.available_delta)
            .sum()
    }

    /// Sum of available + frozen across all accounts. Must always equal
    /// `total_minted`.
    pub fn system_total(&self) -> Decimal {
        self.accounts.values().map(|a| a.total()).sum()
    }

    pub fn find_lock(&self, lock_id: LockId) -> Option<&Lock> {
        self.accounts
            .values()
            .find_map(|acc| acc.lock_by_id(lock_id))
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn counters_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------

    fn account_mut(&mut self, account_id: AccountId) -> Result<&mut Account, RiskError> {
        self.accounts
            .get_mut(&account_id)
            .ok_or(RiskError::AccountNotFound(account_id))
    }

    fn lock_summary(&self, lock_id: LockId) -> Result<(AccountId, MarketId, LockKind), RiskError> {
        let lk = self
            .find_lock(lock_id)
            .ok_or(RiskError::LockNotFound(lock_id))?;
        Ok((lk.account_id, lk.market_id, lk.kind.clone()))
    }

    fn lock_amount(&self, lock_id: LockId) -> Result<Decimal, RiskError> {
        Ok(self
            .find_lock(lock_id)
            .ok_or(RiskError::LockNotFound(lock_id))?
            .amount)
    }

    #[allow(clippy::too_many_arguments)]
    fn push_tx(
        &mut self,
        account_id: AccountId,
        available_delta: Decimal,
        frozen_delta: Decimal,
        reason: String,
        market_id: Option<MarketId>,
        trade_id: Option<TradeId>,
        lock_id: Option<LockId>,
    ) -> TxId {
        let id = self.counters.next_tx();
        self.transactions.push(Transaction {
            id,
            account_id,
            available_delta,
            frozen_delta,
            reason,
            market_id,
            trade_id,
            lock_id,
            created_at: Utc::now(),
        });
        id
    }
}

fn require_positive(entity: &'static str, id: u64, amount: Decimal) -> Result<(), RiskError> {
    if amount <= Decimal::ZERO {
        return Err(RiskError::InvalidAmount {
            entity,
            id,
            amount,
            predicate: "must be positive",
        });
    }
    Ok(())
}
