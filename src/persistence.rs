//! Snapshot persistence. Versioned JSON, atomic writes, forward migrations.
//!
//! A snapshot is the complete state of both engines plus the id counters:
//! `{version, counters, accounts, transactions, markets}`. Decimals are
//! strings; in-memory outcome vectors are keyed by outcome name on disk.
//!
//! The caller saves after every successful mutating operation and loads once
//! at startup; there is no replay. Writes go to `<path>.tmp` and then rename
//! over `<path>`, which POSIX filesystems make crash-consistent: a crash
//! mid-write leaves the previous snapshot intact.
//!
//! Older snapshots migrate forward one version at a time on the raw JSON,
//! before typed decoding.

use crate::account::{Account, Lock};
use crate::engine::MarketEngine;
use crate::market::{Market, MarketStatus, Trade, TradeLeg};
use crate::risk::{RiskEngine, Transaction};
use crate::types::{AccountId, Counters, LockId, MarketId, TradeId, TxId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CURRENT_VERSION: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot version {found}: no migration path to {target}")]
    UnsupportedVersion { found: u64, target: u64 },

    #[error("snapshot corrupt: {0}")]
    Corrupt(String),
}

// 7.0: the on-disk document. Field-by-field projections of the in-memory
// records, so the engine types stay free to change shape without breaking
// old snapshots (that is what migrations are for).

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDoc {
    version: u64,
    counters: Counters,
    accounts: Vec<AccountRecord>,
    transactions: Vec<TransactionRecord>,
    markets: Vec<MarketRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    lock_id: LockId,
    account_id: AccountId,
    market_id: MarketId,
    amount: Decimal,
    lock_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountRecord {
    id: AccountId,
    available_balance: Decimal,
    frozen_balance: Decimal,
    locks: Vec<LockRecord>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransactionRecord {
    id: TxId,
    account_id: AccountId,
    available_delta: Decimal,
    frozen_delta: Decimal,
    reason: String,
    market_id: Option<MarketId>,
    trade_id: Option<TradeId>,
    lock_id: Option<LockId>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TradeLegRecord {
    account_id: AccountId,
    available_delta: Decimal,
    frozen_delta: Decimal,
    lock_id: Option<LockId>,
    tx_id: Option<TxId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TradeRecord {
    id: TradeId,
    market_id: MarketId,
    outcome: String,
    amount: Decimal,
    price: Decimal,
    buyer: TradeLegRecord,
    seller: TradeLegRecord,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarketRecord {
    id: MarketId,
    amm_account_id: AccountId,
    #[serde(rename = "type")]
    kind: String,
    category: String,
    category_id: String,
    question: String,
    price_precision: u32,
    amount_precision: u32,
    status: MarketStatus,
    outcomes: Vec<String>,
    resolution: Option<String>,
    metadata: Value,
    b: Decimal,
    q: BTreeMap<String, Decimal>,
    positions: BTreeMap<String, BTreeMap<String, Decimal>>,
    trades: Vec<TradeRecord>,
    deadline: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

fn account_record(acc: &Account) -> AccountRecord {
    AccountRecord {
        id: acc.id,
        available_balance: acc.available_balance,
        frozen_balance: acc.frozen_balance,
        locks: acc
            .locks
            .iter()
            .map(|lk| LockRecord {
                lock_id: lk.lock_id,
                account_id: lk.account_id,
                market_id: lk.market_id,
                amount: lk.amount,
                lock_type: lk.kind.to_string(),
            })
            .collect(),
        created_at: acc.created_at,
    }
}

fn transaction_record(tx: &Transaction) -> TransactionRecord {
    TransactionRecord {
        id: tx.id,
        account_id: tx.account_id,
        available_delta: tx.available_delta,
        frozen_delta: tx.frozen_delta,
        reason: tx.reason.clone(),
        market_id: tx.market_id,
        trade_id: tx.trade_id,
        lock_id: tx.lock_id,
        created_at: tx.created_at,
    }
}

fn leg_record(leg: &TradeLeg) -> TradeLegRecord {
    TradeLegRecord {
        account_id: leg.account_id,
        available_delta: leg.available_delta,
        frozen_delta: leg.frozen_delta,
        lock_id: leg.lock_id,
        tx_id: leg.tx_id,
    }
}

fn trade_record(trade: &Trade) -> TradeRecord {
    TradeRecord {
        id: trade.id,
        market_id: trade.market_id,
        outcome: trade.outcome.clone(),
        amount: trade.amount,
        price: trade.price,
        buyer: leg_record(&trade.buyer),
        seller: leg_record(&trade.seller),
        created_at: trade.created_at,
    }
}

fn market_record(market: &Market) -> MarketRecord {
    let q = market
        .outcomes
        .iter()
        .cloned()
        .zip(market.q.iter().copied())
        .collect();
    let positions = market
        .positions
        .iter()
        .map(|(account_id, tokens)| {
            let by_outcome = market
                .outcomes
                .iter()
                .cloned()
                .zip(tokens.iter().copied())
                .collect();
            (account_id.0.to_string(), by_outcome)
        })
        .collect();
    MarketRecord {
        id: market.id,
        amm_account_id: market.amm_account_id,
        kind: market.kind.clone(),
        category: market.category.clone(),
        category_id: market.category_id.clone(),
        question: market.question.clone(),
        price_precision: market.price_precision,
        amount_precision: market.amount_precision,
        status: market.status,
        outcomes: market.outcomes.clone(),
        resolution: market.resolution.clone(),
        metadata: market.metadata.clone(),
        b: market.b,
        q,
        positions,
        trades: market.trades.iter().map(trade_record).collect(),
        deadline: market.deadline,
        created_at: market.created_at,
        resolved_at: market.resolved_at,
    }
}

// ---------------------------------------------------------------------------
// Deserialization
// ---------------------------------------------------------------------------

fn load_account(record: AccountRecord) -> Result<Account, SnapshotError> {
    let locks = record
        .locks
        .into_iter()
        .map(|lk| {
            let kind = lk
                .lock_type
                .parse()
                .map_err(|e: String| SnapshotError::Corrupt(e))?;
            Ok(Lock {
                lock_id: lk.lock_id,
                account_id: lk.account_id,
                market_id: lk.market_id,
                amount: lk.amount,
                kind,
            })
        })
        .collect::<Result<Vec<_>, SnapshotError>>()?;
    Ok(Account {
        id: record.id,
        available_balance: record.available_balance,
        frozen_balance: record.frozen_balance,
        locks,
        created_at: record.created_at,
    })
}

fn load_transaction(record: TransactionRecord) -> Transaction {
    Transaction {
        id: record.id,
        account_id: record.account_id,
        available_delta: record.available_delta,
        frozen_delta: record.frozen_delta,
        reason: record.reason,
        market_id: record.market_id,
        trade_id: record.trade_id,
        lock_id: record.lock_id,
        created_at: record.created_at,
    }
}

fn load_leg(record: TradeLegRecord) -> TradeLeg {
    TradeLeg {
        account_id: record.account_id,
        available_delta: record.available_delta,
        frozen_delta: record.frozen_delta,
        lock_id: record.lock_id,
        tx_id: record.tx_id,
    }
}

fn load_trade(record: TradeRecord) -> Trade {
    Trade {
        id: record.id,
        market_id: record.market_id,
        outcome: record.outcome,
        amount: record.amount,
        price: record.price,
        buyer: load_leg(record.buyer),
        seller: load_leg(record.seller),
        created_at: record.created_at,
    }
}

fn load_market(record: MarketRecord) -> Result<Market, SnapshotError> {
    let q = record
        .outcomes
        .iter()
        .map(|outcome| {
            record.q.get(outcome).copied().ok_or_else(|| {
                SnapshotError::Corrupt(format!(
                    "market {:?}: q missing outcome {outcome:?}",
                    record.id
                ))
            })
        })
        .collect::<Result<Vec<_>, SnapshotError>>()?;

    let mut positions = BTreeMap::new();
    for (raw_account, by_outcome) in record.positions {
        let account_id = raw_account.parse::<u64>().map(AccountId).map_err(|_| {
            SnapshotError::Corrupt(format!(
                "market {:?}: bad account key {raw_account:?} in positions",
                record.id
            ))
        })?;
        let tokens = record
            .outcomes
            .iter()
            .map(|outcome| by_outcome.get(outcome).copied().unwrap_or(Decimal::ZERO))
            .collect();
        positions.insert(account_id, tokens);
    }

    Ok(Market {
        id: record.id,
        amm_account_id: record.amm_account_id,
        kind: record.kind,
        category: record.category,
        category_id: record.category_id,
        question: record.question,
        price_precision: record.price_precision,
        amount_precision: record.amount_precision,
        status: record.status,
        outcomes: record.outcomes,
        resolution: record.resolution,
        metadata: record.metadata,
        b: record.b,
        q,
        positions,
        trades: record.trades.into_iter().map(load_trade).collect(),
        deadline: record.deadline,
        created_at: record.created_at,
        resolved_at: record.resolved_at,
    })
}

// ---------------------------------------------------------------------------
// Schema migrations
// ---------------------------------------------------------------------------

/// v1 markets carried one `precision` for prices and token amounts alike.
/// v2 splits it into `price_precision` and `amount_precision`.
fn migrate_1_to_2(doc: &mut Value) -> Result<(), SnapshotError> {
    if let Some(markets) = doc.get_mut("markets").and_then(Value::as_array_mut) {
        for market in markets {
            let precision = market
                .get("precision")
                .and_then(Value::as_u64)
                .unwrap_or(4);
            let obj = market.as_object_mut().ok_or_else(|| {
                SnapshotError::Corrupt("market entry is not an object".to_string())
            })?;
            obj.remove("precision");
            obj.insert("price_precision".to_string(), precision.into());
            obj.insert("amount_precision".to_string(), precision.into());
        }
    }
    Ok(())
}

fn apply_migrations(doc: &mut Value) -> Result<(), SnapshotError> {
    let mut version = doc.get("version").and_then(Value::as_u64).unwrap_or(1);
    if version > CURRENT_VERSION {
        return Err(SnapshotError::UnsupportedVersion {
            found: version,
            target: CURRENT_VERSION,
        });
    }
    while version < CURRENT_VERSION {
        match version {
            1 => migrate_1_to_2(doc)?,
            _ => {
                return Err(SnapshotError::UnsupportedVersion {
                    found: version,
                    target: CURRENT_VERSION,
                })
            }
        }
        version += 1;
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("version".to_string(), version.into());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Write the complete engine state to `path`, atomically.
pub fn save_snapshot(engine: &MarketEngine, path: &Path) -> Result<(), SnapshotError> {
    let risk = engine.risk();
    let doc = SnapshotDoc {
        version: CURRENT_VERSION,
        counters: risk.counters().clone(),
        accounts: risk.accounts().map(account_record).collect(),
        transactions: risk.transactions().iter().map(transaction_record).collect(),
        markets: engine.markets().map(market_record).collect(),
    };
    let bytes = serde_json::to_vec_pretty(&doc)?;

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load engine state from `path`, migrating older snapshots forward.
pub fn load_snapshot(path: &Path) -> Result<MarketEngine, SnapshotError> {
    let bytes = fs::read(path)?;
    let mut doc: Value = serde_json::from_slice(&bytes)?;
    apply_migrations(&mut doc)?;
    let doc: SnapshotDoc = serde_json::from_value(doc)?;

    let accounts = doc
        .accounts
        .into_iter()
        .map(|record| load_account(record).map(|acc| (acc.id, acc)))
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    let transactions = doc.transactions.into_iter().map(load_transaction).collect();
    let risk = RiskEngine::from_parts(accounts, transactions, doc.counters);

    let markets = doc
        .markets
        .into_iter()
        .map(|record| load_market(record).map(|m| (m.id, m)))
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(MarketEngine::from_parts(risk, markets))
}
