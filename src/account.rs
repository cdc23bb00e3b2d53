//! Accounts and locks.
//!
//! An account holds two balances: available (free to spend) and frozen
//! (committed to markets). Frozen credits are itemized as locks, one per
//! (market, kind). The AMM of every market is an ordinary account.
//!
//! Invariant: frozen_balance == sum of lock amounts. The risk engine is the
//! only writer of either side.

use crate::types::{AccountId, LockId, LockKind, MarketId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

// 3.0: a typed receipt for frozen credits. Amount is always positive; a lock
// that reaches zero is removed from its account.
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    pub lock_id: LockId,
    pub account_id: AccountId,
    pub market_id: MarketId,
    pub amount: Decimal,
    pub kind: LockKind,
}

// 3.1: an account in the risk engine. Created explicitly, never destroyed.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub available_balance: Decimal,
    pub frozen_balance: Decimal,
    pub locks: Vec<Lock>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            available_balance: Decimal::ZERO,
            frozen_balance: Decimal::ZERO,
            locks: Vec::new(),
            created_at,
        }
    }

    pub fn total(&self) -> Decimal {
        self.available_balance + self.frozen_balance
    }

    pub fn locks_for_market(&self, market_id: MarketId) -> impl Iterator<Item = &Lock> {
        self.locks.iter().filter(move |l| l.market_id == market_id)
    }

    pub fn frozen_in_market(&self, market_id: MarketId) -> Decimal {
        self.locks_for_market(market_id).map(|l| l.amount).sum()
    }

    pub fn lock_by_id(&self, lock_id: LockId) -> Option<&Lock> {
        self.locks.iter().find(|l| l.lock_id == lock_id)
    }

    pub(crate) fn lock_by_id_mut(&mut self, lock_id: LockId) -> Option<&mut Lock> {
        self.locks.iter_mut().find(|l| l.lock_id == lock_id)
    }

    pub fn lock_for(&self, market_id: MarketId, kind: &LockKind) -> Option<&Lock> {
        self.locks
            .iter()
            .find(|l| l.market_id == market_id && l.kind == *kind)
    }

    pub(crate) fn remove_lock(&mut self, lock_id: LockId) {
        self.locks.retain(|l| l.lock_id != lock_id);
    }
}
