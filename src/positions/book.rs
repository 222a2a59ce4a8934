use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::types::{Position, Symbol};

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    timestamp: String,
    positions: HashMap<String, Position>,
}

/// Thread-safe owner of all open positions. Every mutation lands on disk
/// before the lock is released: write-temp, fsync, rename.
pub struct PositionBook {
    positions: Mutex<HashMap<Symbol, Position>>,
    snapshot_path: PathBuf,
}

impl PositionBook {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Restores the last snapshot if one exists.
    pub fn load(&self) -> usize {
        let content = match std::fs::read_to_string(&self.snapshot_path) {
            Ok(c) => c,
            Err(_) => return 0,
        };
        let snapshot: Snapshot = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!("position snapshot unreadable, starting empty: {}", e);
                return 0;
            }
        };
        let mut positions = self.positions.lock().expect("position lock");
        *positions = snapshot
            .positions
            .into_iter()
            .map(|(k, v)| (Symbol::new(k), v))
            .collect();
        let count = positions.len();
        info!("restored {} position(s) from snapshot", count);
        count
    }

    pub fn len(&self) -> usize {
        self.positions.lock().expect("position lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.positions
            .lock()
            .expect("position lock")
            .contains_key(symbol)
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Position> {
        self.positions
            .lock()
            .expect("position lock")
            .get(symbol)
            .cloned()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.positions
            .lock()
            .expect("position lock")
            .keys()
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Position> {
        self.positions
            .lock()
            .expect("position lock")
            .values()
            .cloned()
            .collect()
    }

    /// Sum of invested cost across open positions.
    pub fn total_invested_krw(&self) -> Decimal {
        self.positions
            .lock()
            .expect("position lock")
            .values()
            .map(|p| p.invested_krw())
            .sum()
    }

    pub fn open(&self, position: Position) {
        let mut positions = self.positions.lock().expect("position lock");
        info!(
            "position opened: {} {} @ {}",
            position.symbol, position.amount, position.buy_price
        );
        positions.insert(position.symbol.clone(), position);
        self.write_snapshot(&positions);
    }

    /// Applies `f` under the lock; the closure returns whether it changed
    /// anything. Only changes are snapshotted, so a no-op reconcile never
    /// rewrites the file.
    pub fn update<F>(&self, symbol: &Symbol, f: F) -> bool
    where
        F: FnOnce(&mut Position) -> bool,
    {
        let mut positions = self.positions.lock().expect("position lock");
        let changed = match positions.get_mut(symbol) {
            Some(position) => f(position),
            None => return false,
        };
        if changed {
            self.write_snapshot(&positions);
        }
        changed
    }

    pub fn remove(&self, symbol: &Symbol) -> Option<Position> {
        let mut positions = self.positions.lock().expect("position lock");
        let removed = positions.remove(symbol);
        if removed.is_some() {
            info!("position removed: {}", symbol);
            self.write_snapshot(&positions);
        }
        removed
    }

    fn write_snapshot(&self, positions: &HashMap<Symbol, Position>) {
        if let Err(e) = self.try_write_snapshot(positions) {
            warn!("position snapshot write failed: {}", e);
        }
    }

    fn try_write_snapshot(&self, positions: &HashMap<Symbol, Position>) -> anyhow::Result<()> {
        let snapshot = Snapshot {
            timestamp: Utc::now().to_rfc3339(),
            positions: positions
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        let tmp_path = self.snapshot_path.with_extension("json.tmp");
        if let Some(parent) = self.snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = std::fs::File::create(&tmp_path)?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
        drop(tmp);
        std::fs::rename(&tmp_path, &self.snapshot_path)?;
        Ok(())
    }
}
