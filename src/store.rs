// 8.0 store.rs: the single-writer critical section.
//
// One exclusive lock guards the whole mutate-persist cycle:
// acquire -> execute one operation -> save snapshot -> release. Readers take
// the same lock briefly to snapshot a consistent view; they can never observe
// a partial mutation. Callers are serialized in lock-acquisition order; there
// is no other priority or fairness.

use crate::engine::{EngineError, MarketEngine};
use crate::persistence::{load_snapshot, save_snapshot, SnapshotError};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug)]
pub struct Store {
    engine: Mutex<MarketEngine>,
    path: PathBuf,
}

impl Store {
    /// Open the store at `path`: load the snapshot if one exists, otherwise
    /// start empty and write the initial snapshot.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let path = path.into();
        let engine = if path.exists() {
            load_snapshot(&path)?
        } else {
            let engine = MarketEngine::new();
            save_snapshot(&engine, &path)?;
            engine
        };
        Ok(Self {
            engine: Mutex::new(engine),
            path,
        })
    }

    /// Run one mutating operation and persist the result. The snapshot is
    /// only written when the operation succeeds; a failed operation changes
    /// neither memory nor disk. If the write itself fails, the on-disk
    /// snapshot stays authoritative.
    pub fn mutate<T>(
        &self,
        op: impl FnOnce(&mut MarketEngine) -> Result<T, EngineError>,
    ) -> Result<T, StoreError> {
        let mut engine = self.lock_engine();
        let value = op(&mut engine)?;
        save_snapshot(&engine, &self.path)?;
        Ok(value)
    }

    /// Run a query against a consistent view of the engine.
    pub fn read<T>(&self, op: impl FnOnce(&MarketEngine) -> T) -> T {
        let engine = self.lock_engine();
        op(&engine)
    }

    fn lock_engine(&self) -> MutexGuard<'_, MarketEngine> {
        match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // a panic escaped mid-mutation; discard the in-memory state
                // and fall back to the persisted snapshot
                let mut guard = poisoned.into_inner();
                if let Ok(fresh) = load_snapshot(&self.path) {
                    *guard = fresh;
                }
                guard
            }
        }
    }
}
