#![allow(dead_code)]
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

use crate::types::Symbol;

/// Decision event kinds, one per JSONL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecisionKind {
    Start,
    RegimeUpdate,
    CoinRefresh,
    LoopHeartbeat,
    BuySignal,
    BuyBlocked,
    BuySizing,
    BuyExecuted,
    BuyFailed,
    BuySkipped,
    BuyCancelled,
    SellSignal,
    SellExecuted,
    FallbackAborted,
    CancelFailedUnknownState,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Start => "START",
            DecisionKind::RegimeUpdate => "REGIME_UPDATE",
            DecisionKind::CoinRefresh => "COIN_REFRESH",
            DecisionKind::LoopHeartbeat => "LOOP_HEARTBEAT",
            DecisionKind::BuySignal => "BUY_SIGNAL",
            DecisionKind::BuyBlocked => "BUY_BLOCKED",
            DecisionKind::BuySizing => "BUY_SIZING",
            DecisionKind::BuyExecuted => "BUY_EXECUTED",
            DecisionKind::BuyFailed => "BUY_FAILED",
            DecisionKind::BuySkipped => "BUY_SKIPPED",
            DecisionKind::BuyCancelled => "BUY_CANCELLED",
            DecisionKind::SellSignal => "SELL_SIGNAL",
            DecisionKind::SellExecuted => "SELL_EXECUTED",
            DecisionKind::FallbackAborted => "FALLBACK_ABORTED",
            DecisionKind::CancelFailedUnknownState => "CANCEL_FAILED_UNKNOWN_STATE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub kind: DecisionKind,
    pub payload: Value,
}

/// Identity of a BUY_BLOCKED emission; repeats are dropped until the
/// signature changes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockSignature {
    candle_ts: String,
    blocked_by: Vec<String>,
    regime: String,
}

struct Inner {
    file: Option<std::fs::File>,
    recent: Vec<DecisionRecord>,
    block_signatures: HashMap<Symbol, BlockSignature>,
}

/// Append-only JSON-lines stream of trading decisions. One writer; the
/// in-memory tail backs tests and status queries.
pub struct DecisionLog {
    inner: Mutex<Inner>,
    max_recent: usize,
}

impl DecisionLog {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                file: Some(file),
                recent: Vec::new(),
                block_signatures: HashMap::new(),
            }),
            max_recent: 500,
        })
    }

    /// Memory-only log for tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                file: None,
                recent: Vec::new(),
                block_signatures: HashMap::new(),
            }),
            max_recent: 500,
        }
    }

    pub fn record(&self, kind: DecisionKind, payload: Value) {
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "event": kind.as_str(),
            "payload": payload,
        });

        let mut inner = self.inner.lock().expect("decision log lock");
        if let Some(file) = inner.file.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                warn!("decision log write failed: {}", e);
            }
        }
        inner.recent.push(DecisionRecord { kind, payload });
        if inner.recent.len() > self.max_recent {
            inner.recent.remove(0);
        }
    }

    /// BUY_BLOCKED with (symbol, candle_ts, reason-set, regime) dedup.
    /// Returns whether the event was actually emitted.
    pub fn record_buy_blocked(
        &self,
        symbol: &Symbol,
        candle_ts: &str,
        blocked_by: &[String],
        regime: &str,
        payload: Value,
    ) -> bool {
        let mut sorted: Vec<String> = blocked_by.to_vec();
        sorted.sort();
        sorted.dedup();
        let signature = BlockSignature {
            candle_ts: candle_ts.to_string(),
            blocked_by: sorted,
            regime: regime.to_string(),
        };

        {
            let mut inner = self.inner.lock().expect("decision log lock");
            if inner.block_signatures.get(symbol) == Some(&signature) {
                return false;
            }
            inner.block_signatures.insert(symbol.clone(), signature);
        }
        self.record(DecisionKind::BuyBlocked, payload);
        true
    }

    pub fn recent(&self) -> Vec<DecisionRecord> {
        self.inner.lock().expect("decision log lock").recent.clone()
    }

    pub fn count_of(&self, kind: DecisionKind) -> usize {
        self.inner
            .lock()
            .expect("decision log lock")
            .recent
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_in_memory() {
        let log = DecisionLog::in_memory();
        log.record(DecisionKind::Start, json!({"mode": "live"}));
        log.record(DecisionKind::LoopHeartbeat, json!({}));
        assert_eq!(log.recent().len(), 2);
        assert_eq!(log.count_of(DecisionKind::Start), 1);
    }

    #[test]
    fn buy_blocked_dedup_by_signature() {
        let log = DecisionLog::in_memory();
        let sym = Symbol::new("KRW-SOL");
        let reasons = vec!["regime_bear".to_string(), "low_liquidity".to_string()];

        assert!(log.record_buy_blocked(&sym, "t1", &reasons, "BEAR", json!({})));
        // Same signature, different reason order: suppressed
        let reordered = vec!["low_liquidity".to_string(), "regime_bear".to_string()];
        assert!(!log.record_buy_blocked(&sym, "t1", &reordered, "BEAR", json!({})));
        // New candle re-emits
        assert!(log.record_buy_blocked(&sym, "t2", &reasons, "BEAR", json!({})));
        // Different symbol tracks independently
        let other = Symbol::new("KRW-ADA");
        assert!(log.record_buy_blocked(&other, "t1", &reasons, "BEAR", json!({})));

        assert_eq!(log.count_of(DecisionKind::BuyBlocked), 3);
    }

    #[test]
    fn file_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let log = DecisionLog::open(&path).unwrap();
        log.record(DecisionKind::BuyExecuted, json!({"symbol": "KRW-SOL"}));
        log.record(DecisionKind::SellExecuted, json!({"symbol": "KRW-SOL"}));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "BUY_EXECUTED");
        assert_eq!(first["payload"]["symbol"], "KRW-SOL");
    }
}
