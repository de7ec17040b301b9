// =============================================================================
// Position Store — ledger-backed, per-key locked position index
// =============================================================================
//
// Life-cycle:
//   Open  ->  Closing  ->  Closed
//   Open  ->  Closed
//
// Invariants:
//   - at most one Open/Closing position per (symbol, direction) key
//   - size > 0 and entry_price > 0 while Open or Closing
//
// Locking (every acquisition bounded by `lock_timeout`):
//   per-key mutex  ->  ledger lock  ->  index write lock
// Reads take only the index read lock. A timeout surfaces as
// `StoreError::LockTimeout`; it is never papered over with a default value.
//
// Every mutation is appended (and fsynced) to the ledger before the index is
// touched, so the index can always be rebuilt from snapshot + ledger tail.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::{EventKind, Ledger, LedgerEvent};
use crate::types::Direction;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Identity of a position: one symbol traded in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: String,
    pub direction: Direction,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, direction: Direction) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.symbol, self.direction)
    }
}

/// Current state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A single tracked position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub key: PositionKey,
    pub entry_price: f64,
    pub size: f64,
    pub opened_at: DateTime<Utc>,
    pub state: PositionState,
    /// Set while Closing; the holder of the token owns the close.
    #[serde(default)]
    pub lock_token: Option<String>,
    /// Signal that opened the position.
    #[serde(default)]
    pub signal_id: Option<String>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub realized_pnl: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// A fresh Open position stamped with the current time.
    pub fn new_open(
        symbol: &str,
        direction: Direction,
        entry_price: f64,
        size: f64,
        signal_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            key: PositionKey::new(symbol, direction),
            entry_price,
            size,
            opened_at: now,
            state: PositionState::Open,
            lock_token: None,
            signal_id,
            closed_at: None,
            exit_price: None,
            realized_pnl: 0.0,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, PositionState::Open | PositionState::Closing)
    }

    /// Check the per-position invariants. Returns a human-readable detail on
    /// failure.
    pub fn check(&self) -> Result<(), String> {
        if self.key.direction == Direction::Neutral {
            return Err("direction must be long or short".into());
        }
        if self.is_live() {
            if !(self.size.is_finite() && self.size > 0.0) {
                return Err(format!("size must be > 0 (got {})", self.size));
            }
            if !(self.entry_price.is_finite() && self.entry_price > 0.0) {
                return Err(format!("entry_price must be > 0 (got {})", self.entry_price));
            }
        }
        if self.state == PositionState::Closing && self.lock_token.is_none() {
            return Err("closing position has no lock token".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Position index (derived from the ledger)
// ---------------------------------------------------------------------------

/// In-memory view of positions, rebuilt from snapshot + ledger on start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionIndex {
    live: HashMap<PositionKey, Position>,
    /// Closed positions in close order (oldest first).
    closed: Vec<Position>,
    /// Highest ledger sequence applied. Replays skip anything at or below it.
    last_seq: u64,
}

impl PositionIndex {
    /// Build from a snapshot's position list. Fails if two live positions
    /// share a key or any position breaks its invariants.
    pub fn from_positions(positions: Vec<Position>, last_seq: u64) -> Result<Self, String> {
        let mut index = Self {
            last_seq,
            ..Self::default()
        };
        for p in positions {
            p.check().map_err(|d| format!("{}: {d}", p.key))?;
            if p.is_live() {
                if index.live.contains_key(&p.key) {
                    return Err(format!("duplicate live position for {}", p.key));
                }
                index.live.insert(p.key.clone(), p);
            } else {
                index.closed.push(p);
            }
        }
        index
            .closed
            .sort_by(|a, b| a.closed_at.cmp(&b.closed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(index)
    }

    /// Apply one ledger event. Returns `false` if it was already applied or
    /// does not concern positions.
    pub fn apply(&mut self, event: &LedgerEvent) -> bool {
        if event.seq <= self.last_seq {
            return false;
        }
        self.last_seq = event.seq;

        match &event.event {
            EventKind::PositionOpened(p) => {
                if let Some(existing) = self.live.get(&p.key) {
                    warn!(key = %p.key, existing = %existing.id, seq = event.seq, "ledger opens a key that is already live");
                }
                self.live.insert(p.key.clone(), p.clone());
                true
            }
            EventKind::PositionUpdated(p) => {
                self.live.insert(p.key.clone(), p.clone());
                true
            }
            EventKind::PositionClosed(p) => {
                self.live.remove(&p.key);
                self.closed.push(p.clone());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &PositionKey) -> Option<&Position> {
        self.live.get(key)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Open and Closing positions, ordered by key.
    pub fn live_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self.live.values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// The `n` most recently closed positions, newest first.
    pub fn recently_closed(&self, n: usize) -> Vec<Position> {
        self.closed.iter().rev().take(n).cloned().collect()
    }

    /// Every position, live first, for snapshots.
    pub fn all_positions(&self) -> Vec<Position> {
        let mut out = self.live_positions();
        out.extend(self.closed.iter().cloned());
        out
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }

    /// Drop closed positions that closed before `cutoff`. Returns how many.
    pub fn prune_closed(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.closed.len();
        self.closed
            .retain(|p| p.closed_at.unwrap_or(p.updated_at) >= cutoff);
        before - self.closed.len()
    }
}

// ---------------------------------------------------------------------------
// Position Store
// ---------------------------------------------------------------------------

/// Thread-safe store that owns the position index and journals every change.
pub struct PositionStore {
    ledger: Arc<Ledger>,
    index: RwLock<PositionIndex>,
    key_locks: Mutex<HashMap<PositionKey, Arc<Mutex<()>>>>,
    lock_timeout: Duration,
    read_only: AtomicBool,
}

impl PositionStore {
    pub fn new(ledger: Arc<Ledger>, index: PositionIndex, lock_timeout: Duration) -> Self {
        info!(
            live = index.live_count(),
            closed = index.closed_count(),
            last_seq = index.last_seq(),
            "position store ready"
        );
        Self {
            ledger,
            index: RwLock::new(index),
            key_locks: Mutex::new(HashMap::new()),
            lock_timeout,
            read_only: AtomicBool::new(false),
        }
    }

    /// Refuse all mutations until cleared (fatal recovery outcome or halt).
    pub fn set_read_only(&self, read_only: bool) {
        let was = self.read_only.swap(read_only, Ordering::SeqCst);
        if was != read_only {
            warn!(read_only, "position store write mode changed");
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Writers
    // -------------------------------------------------------------------------

    /// Open `position`. Fails with `AlreadyOpen` if its key is live.
    pub fn open(&self, position: Position) -> Result<Position, StoreError> {
        self.ensure_writable()?;
        if position.state != PositionState::Open {
            return Err(StoreError::InvalidPosition {
                key: position.key.clone(),
                detail: format!("new position must be OPEN (got {})", position.state),
            });
        }
        position.check().map_err(|detail| StoreError::InvalidPosition {
            key: position.key.clone(),
            detail,
        })?;

        let key = position.key.clone();
        let key_lock = self.key_lock(&key);
        let _guard = self.lock_key(&key, &key_lock)?;

        self.ledger.transact(|tx| {
            let mut index = self.write_index()?;
            if index.get(&key).is_some() {
                return Err(StoreError::AlreadyOpen(key.clone()));
            }
            let event = tx.append(position.id.clone(), EventKind::PositionOpened(position.clone()))?;
            index.apply(&event);
            info!(
                key = %key,
                id = %position.id,
                entry = position.entry_price,
                size = position.size,
                "position opened"
            );
            Ok(position)
        })
    }

    /// Read the live position for `key`, if any.
    pub fn read(&self, key: &PositionKey) -> Result<Option<Position>, StoreError> {
        Ok(self.read_index()?.get(key).cloned())
    }

    /// Apply `mutator` to the live position for `key`.
    ///
    /// The mutator may not change the identity, key or state; use
    /// `begin_close` / `close` for that. The result must still satisfy the
    /// position invariants.
    pub fn update(
        &self,
        key: &PositionKey,
        mutator: impl FnOnce(&mut Position),
    ) -> Result<Position, StoreError> {
        self.ensure_writable()?;
        let key_lock = self.key_lock(key);
        let _guard = self.lock_key(key, &key_lock)?;

        self.ledger.transact(|tx| {
            let mut index = self.write_index()?;
            let current = index
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;

            let mut next = current.clone();
            mutator(&mut next);
            if next.id != current.id || next.key != current.key || next.state != current.state {
                return Err(StoreError::InvalidPosition {
                    key: key.clone(),
                    detail: "update may not change id, key or state".into(),
                });
            }
            next.check().map_err(|detail| StoreError::InvalidPosition {
                key: key.clone(),
                detail,
            })?;
            next.updated_at = Utc::now();

            let event = tx.append(next.id.clone(), EventKind::PositionUpdated(next.clone()))?;
            index.apply(&event);
            debug!(key = %key, size = next.size, entry = next.entry_price, "position updated");
            Ok(next)
        })
    }

    /// Fold an additional fill into an existing live position, averaging the
    /// entry price.
    pub fn merge_fill(&self, key: &PositionKey, fill_price: f64, fill_size: f64) -> Result<Position, StoreError> {
        if !(fill_price > 0.0 && fill_size > 0.0) {
            return Err(StoreError::InvalidPosition {
                key: key.clone(),
                detail: format!("fill must be positive (price {fill_price}, size {fill_size})"),
            });
        }
        self.update(key, |p| {
            let total = p.size + fill_size;
            p.entry_price = (p.entry_price * p.size + fill_price * fill_size) / total;
            p.size = total;
        })
    }

    /// Mark the position for `key` as Closing and return the lock token that
    /// owns the close.
    pub fn begin_close(&self, key: &PositionKey) -> Result<String, StoreError> {
        self.ensure_writable()?;
        let key_lock = self.key_lock(key);
        let _guard = self.lock_key(key, &key_lock)?;

        self.ledger.transact(|tx| {
            let mut index = self.write_index()?;
            let mut next = index
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if next.state != PositionState::Open {
                return Err(StoreError::InvalidPosition {
                    key: key.clone(),
                    detail: format!("cannot begin close from {}", next.state),
                });
            }

            let token = Uuid::new_v4().to_string();
            next.state = PositionState::Closing;
            next.lock_token = Some(token.clone());
            next.updated_at = Utc::now();

            let event = tx.append(next.id.clone(), EventKind::PositionUpdated(next))?;
            index.apply(&event);
            info!(key = %key, "position closing");
            Ok(token)
        })
    }

    /// Return a Closing position to Open. Only the holder of `token` may do
    /// this.
    pub fn abort_close(&self, key: &PositionKey, token: &str) -> Result<Position, StoreError> {
        self.ensure_writable()?;
        let key_lock = self.key_lock(key);
        let _guard = self.lock_key(key, &key_lock)?;

        self.ledger.transact(|tx| {
            let mut index = self.write_index()?;
            let mut next = index
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if next.state != PositionState::Closing || next.lock_token.as_deref() != Some(token) {
                return Err(StoreError::InvalidPosition {
                    key: key.clone(),
                    detail: "lock token does not match a closing position".into(),
                });
            }
            next.state = PositionState::Open;
            next.lock_token = None;
            next.updated_at = Utc::now();

            let event = tx.append(next.id.clone(), EventKind::PositionUpdated(next.clone()))?;
            index.apply(&event);
            info!(key = %key, "position close aborted");
            Ok(next)
        })
    }

    /// Close the live position for `key` at `exit_price`.
    pub fn close(&self, key: &PositionKey, exit_price: f64) -> Result<Position, StoreError> {
        self.ensure_writable()?;
        if !(exit_price.is_finite() && exit_price > 0.0) {
            return Err(StoreError::InvalidPosition {
                key: key.clone(),
                detail: format!("exit_price must be > 0 (got {exit_price})"),
            });
        }
        let key_lock = self.key_lock(key);
        let _guard = self.lock_key(key, &key_lock)?;

        self.ledger.transact(|tx| {
            let mut index = self.write_index()?;
            let mut closed = index
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;

            let now = Utc::now();
            closed.realized_pnl =
                (exit_price - closed.entry_price) * closed.size * closed.key.direction.sign();
            closed.state = PositionState::Closed;
            closed.lock_token = None;
            closed.exit_price = Some(exit_price);
            closed.closed_at = Some(now);
            closed.updated_at = now;

            let event = tx.append(closed.id.clone(), EventKind::PositionClosed(closed.clone()))?;
            index.apply(&event);
            info!(
                key = %key,
                id = %closed.id,
                exit = exit_price,
                realized_pnl = closed.realized_pnl,
                "position closed"
            );
            Ok(closed)
        })
        .inspect(|_| self.forget_key_lock(key, &key_lock))
    }

    /// Drop closed positions older than `cutoff` from the index, along with
    /// key locks that no live position or waiter still uses.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut index = self.write_index()?;
        let pruned = index.prune_closed(cutoff);
        self.key_locks
            .lock()
            .retain(|key, lock| index.get(key).is_some() || Arc::strong_count(lock) > 1);
        if pruned > 0 {
            debug!(pruned, cutoff = %cutoff, "closed positions pruned from index");
        }
        Ok(pruned)
    }

    // -------------------------------------------------------------------------
    // Readers
    // -------------------------------------------------------------------------

    /// Open and Closing positions.
    pub fn open_positions(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.read_index()?.live_positions())
    }

    /// The `n` most recently closed positions, newest first.
    pub fn closed_positions(&self, n: usize) -> Result<Vec<Position>, StoreError> {
        Ok(self.read_index()?.recently_closed(n))
    }

    /// Clone of the full index (snapshots, reconciliation).
    pub fn index_snapshot(&self) -> Result<PositionIndex, StoreError> {
        Ok(self.read_index()?.clone())
    }

    /// Swap in an index rebuilt from the durable record.
    pub fn replace_index(&self, index: PositionIndex) -> Result<(), StoreError> {
        *self.write_index()? = index;
        Ok(())
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    // -------------------------------------------------------------------------
    // Locking helpers
    // -------------------------------------------------------------------------

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly("position store is in read-only mode".into()));
        }
        Ok(())
    }

    fn key_lock(&self, key: &PositionKey) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Remove `key`'s lock entry if only the map and the caller hold it.
    /// New lockers must go through the map, so nobody can be waiting on it.
    fn forget_key_lock(&self, key: &PositionKey, lock: &Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock();
        let sole_holder = locks.get(key).is_some_and(|l| Arc::ptr_eq(l, lock)) && Arc::strong_count(lock) == 2;
        if sole_holder {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn key_lock_count(&self) -> usize {
        self.key_locks.lock().len()
    }

    fn lock_key<'a>(
        &self,
        key: &PositionKey,
        lock: &'a Arc<Mutex<()>>,
    ) -> Result<parking_lot::MutexGuard<'a, ()>, StoreError> {
        lock.try_lock_for(self.lock_timeout).ok_or_else(|| {
            warn!(key = %key, timeout_ms = self.lock_timeout.as_millis() as u64, "position key lock timed out");
            StoreError::LockTimeout {
                key: key.to_string(),
                timeout: self.lock_timeout,
            }
        })
    }

    fn read_index(&self) -> Result<RwLockReadGuard<'_, PositionIndex>, StoreError> {
        self.index
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| StoreError::LockTimeout {
                key: "position_index".into(),
                timeout: self.lock_timeout,
            })
    }

    fn write_index(&self) -> Result<RwLockWriteGuard<'_, PositionIndex>, StoreError> {
        self.index
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| StoreError::LockTimeout {
                key: "position_index".into(),
                timeout: self.lock_timeout,
            })
    }
}

impl std::fmt::Debug for PositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self.index.try_read().map(|i| i.live_count()).unwrap_or(0);
        f.debug_struct("PositionStore")
            .field("live", &live)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::read_events;
    use std::sync::Barrier;

    fn store(dir: &tempfile::TempDir) -> PositionStore {
        let ledger = Ledger::open(dir.path().join("ledger.jsonl"), Duration::from_millis(500)).unwrap();
        PositionStore::new(Arc::new(ledger), PositionIndex::default(), Duration::from_millis(500))
    }

    fn key(symbol: &str) -> PositionKey {
        PositionKey::new(symbol, Direction::Long)
    }

    #[test]
    fn open_read_close_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let opened = store
            .open(Position::new_open("BTCUSDT", Direction::Long, 100.0, 2.0, Some("s1".into())))
            .unwrap();
        assert_eq!(store.read(&key("BTCUSDT")).unwrap(), Some(opened.clone()));

        let closed = store.close(&key("BTCUSDT"), 110.0).unwrap();
        assert_eq!(closed.state, PositionState::Closed);
        assert!((closed.realized_pnl - 20.0).abs() < 1e-9);
        assert_eq!(store.read(&key("BTCUSDT")).unwrap(), None);
        assert_eq!(store.closed_positions(5).unwrap().len(), 1);
    }

    #[test]
    fn short_pnl_is_signed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store
            .open(Position::new_open("ETHUSDT", Direction::Short, 100.0, 1.0, None))
            .unwrap();
        let closed = store
            .close(&PositionKey::new("ETHUSDT", Direction::Short), 90.0)
            .unwrap();
        assert!((closed.realized_pnl - 10.0).abs() < 1e-9);
    }

    #[test]
    fn second_open_of_same_key_is_rejected_and_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let first = store
            .open(Position::new_open("X", Direction::Long, 10.0, 1.0, None))
            .unwrap();

        let err = store
            .open(Position::new_open("X", Direction::Long, 11.0, 3.0, None))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyOpen(_)));
        assert_eq!(err.reason_code(), "position_already_open");
        assert_eq!(store.read(&key("X")).unwrap(), Some(first));
        assert_eq!(store.open_positions().unwrap().len(), 1);
    }

    #[test]
    fn long_and_short_are_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.open(Position::new_open("X", Direction::Long, 10.0, 1.0, None)).unwrap();
        store.open(Position::new_open("X", Direction::Short, 10.0, 1.0, None)).unwrap();
        assert_eq!(store.open_positions().unwrap().len(), 2);
    }

    #[test]
    fn concurrent_opens_of_one_key_admit_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(&dir));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.open(Position::new_open("RACE", Direction::Long, 10.0 + i as f64, 1.0, None))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let already = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::AlreadyOpen(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(already, threads - 1);
        assert_eq!(store.open_positions().unwrap().len(), 1);

        let scan = read_events(&dir.path().join("ledger.jsonl"), 0).unwrap();
        let opened = scan
            .events
            .iter()
            .filter(|e| matches!(e.event, EventKind::PositionOpened(_)))
            .count();
        assert_eq!(opened, 1);
    }

    #[test]
    fn update_validates_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.open(Position::new_open("X", Direction::Long, 10.0, 1.0, None)).unwrap();

        let err = store.update(&key("X"), |p| p.size = 0.0).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPosition { .. }));

        let err = store.update(&key("X"), |p| p.state = PositionState::Closed).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPosition { .. }));

        let updated = store.update(&key("X"), |p| p.size = 4.0).unwrap();
        assert_eq!(updated.size, 4.0);
        assert!(matches!(
            store.update(&key("MISSING"), |p| p.size = 1.0),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn merge_fill_averages_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.open(Position::new_open("X", Direction::Long, 10.0, 1.0, None)).unwrap();
        let merged = store.merge_fill(&key("X"), 20.0, 1.0).unwrap();
        assert!((merged.entry_price - 15.0).abs() < 1e-9);
        assert!((merged.size - 2.0).abs() < 1e-9);
    }

    #[test]
    fn begin_close_token_guards_abort() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.open(Position::new_open("X", Direction::Long, 10.0, 1.0, None)).unwrap();

        let token = store.begin_close(&key("X")).unwrap();
        let closing = store.read(&key("X")).unwrap().unwrap();
        assert_eq!(closing.state, PositionState::Closing);
        assert!(store.begin_close(&key("X")).is_err());
        assert!(matches!(
            store.open(Position::new_open("X", Direction::Long, 10.0, 1.0, None)),
            Err(StoreError::AlreadyOpen(_))
        ));

        assert!(store.abort_close(&key("X"), "wrong").is_err());
        let reopened = store.abort_close(&key("X"), &token).unwrap();
        assert_eq!(reopened.state, PositionState::Open);
        assert_eq!(reopened.lock_token, None);
    }

    #[test]
    fn invalid_open_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.open(Position::new_open("X", Direction::Long, 0.0, 1.0, None)).is_err());
        assert!(store.open(Position::new_open("X", Direction::Long, 1.0, -1.0, None)).is_err());
        assert!(store.open(Position::new_open("X", Direction::Neutral, 1.0, 1.0, None)).is_err());
        assert!(store.open_positions().unwrap().is_empty());
    }

    #[test]
    fn read_only_store_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.set_read_only(true);
        let err = store
            .open(Position::new_open("X", Direction::Long, 1.0, 1.0, None))
            .unwrap_err();
        assert_eq!(err.reason_code(), "store_degraded");
        assert!(store.open_positions().unwrap().is_empty());
    }

    #[test]
    fn held_index_lock_surfaces_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.jsonl"), Duration::from_millis(50)).unwrap();
        let store = PositionStore::new(Arc::new(ledger), PositionIndex::default(), Duration::from_millis(50));

        let _writer = store.index.write();
        let err = store.read(&key("X")).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn index_rebuilds_identically_from_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.open(Position::new_open("A", Direction::Long, 10.0, 1.0, None)).unwrap();
        store.open(Position::new_open("B", Direction::Short, 20.0, 2.0, None)).unwrap();
        store.update(&key("A"), |p| p.size = 3.0).unwrap();
        store.close(&PositionKey::new("B", Direction::Short), 19.0).unwrap();

        let scan = read_events(&dir.path().join("ledger.jsonl"), 0).unwrap();
        let mut rebuilt = PositionIndex::default();
        for e in &scan.events {
            rebuilt.apply(e);
        }
        // Applying twice changes nothing.
        for e in &scan.events {
            assert!(!rebuilt.apply(e));
        }
        assert_eq!(rebuilt, store.index_snapshot().unwrap());
    }

    #[test]
    fn close_releases_the_key_lock_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for i in 0..10 {
            let symbol = format!("S{i}");
            store.open(Position::new_open(&symbol, Direction::Long, 10.0, 1.0, None)).unwrap();
            store.close(&key(&symbol), 11.0).unwrap();
        }
        store.open(Position::new_open("LIVE", Direction::Long, 10.0, 1.0, None)).unwrap();
        assert_eq!(store.key_lock_count(), 1);
    }

    #[test]
    fn prune_drops_old_closed_positions_and_idle_locks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.open(Position::new_open("A", Direction::Long, 10.0, 1.0, None)).unwrap();
        store.open(Position::new_open("B", Direction::Long, 10.0, 1.0, None)).unwrap();
        store.close(&key("B"), 12.0).unwrap();
        // NotFound leaves an entry behind until the next prune.
        assert!(store.update(&key("GHOST"), |p| p.size = 2.0).is_err());

        assert_eq!(store.prune(Utc::now() - chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(store.closed_positions(10).unwrap().len(), 1);

        assert_eq!(store.prune(Utc::now() + chrono::Duration::seconds(1)).unwrap(), 1);
        assert!(store.closed_positions(10).unwrap().is_empty());
        assert!(store.read(&key("A")).unwrap().is_some());
        assert_eq!(store.key_lock_count(), 1);
    }

    #[test]
    fn from_positions_rejects_duplicate_live_keys() {
        let a = Position::new_open("A", Direction::Long, 10.0, 1.0, None);
        let b = Position::new_open("A", Direction::Long, 11.0, 1.0, None);
        assert!(PositionIndex::from_positions(vec![a, b], 0).is_err());
    }
}
