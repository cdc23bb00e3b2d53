// prediction-core: prediction market engine.
// ledger-first architecture: every credit motion is a risk-engine transaction.
// all computation is deterministic; the only I/O is the snapshot file.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: ids, lock kinds, the counter service
//   2.x  lmsr.rs: cost function, prices, inverse cost, liquidity rescale
//   3.x  account.rs: accounts and itemized locks
//   4.x  risk.rs: the risk engine: balances, locks, transaction ledger
//   5.x  market.rs: market state, trades, outcome indexing, rounding policy
//   6.x  engine/: the market engine: lifecycle, trading, settlement, liquidity
//   7.x  persistence.rs: versioned JSON snapshots, atomic writes, migrations
//   8.x  store.rs: single-writer mutate-persist cycle

pub mod account;
pub mod engine;
pub mod lmsr;
pub mod market;
pub mod persistence;
pub mod risk;
pub mod store;
pub mod types;

pub use account::{Account, Lock};
pub use engine::{EngineError, MarketEngine};
pub use market::{Liquidity, Market, MarketParams, MarketStatus, Trade, TradeLeg};
pub use persistence::{load_snapshot, save_snapshot, SnapshotError};
pub use risk::{RiskEngine, RiskError, Transaction};
pub use store::{Store, StoreError};
pub use types::{AccountId, Counters, LockId, LockKind, MarketId, TradeId, TxId};
