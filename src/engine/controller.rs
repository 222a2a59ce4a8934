#![allow(dead_code)]
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::info;

/// Shared control flags between the trading loop and the external command
/// surface. Commands only flip flags here; they never touch positions or
/// place orders.
pub struct BotController {
    running: AtomicBool,
    trading_paused: AtomicBool,
    liquidate_on_stop: AtomicBool,
    cooldown_until: Mutex<Option<DateTime<Utc>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl BotController {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            trading_paused: AtomicBool::new(false),
            liquidate_on_stop: AtomicBool::new(false),
            cooldown_until: Mutex::new(None),
            started_at: Mutex::new(Some(Utc::now())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Graceful stop: the loop finishes the current tick and returns.
    pub fn request_stop(&self, liquidate: bool) {
        self.liquidate_on_stop.store(liquidate, Ordering::Release);
        self.running.store(false, Ordering::Release);
        info!("stop requested (liquidate={})", liquidate);
    }

    pub fn should_liquidate_on_stop(&self) -> bool {
        self.liquidate_on_stop.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.trading_paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        let was = self.trading_paused.swap(paused, Ordering::AcqRel);
        if was != paused {
            info!("trading {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        *self.cooldown_until.lock().expect("cooldown lock")
    }

    pub fn set_cooldown_until(&self, until: Option<DateTime<Utc>>) {
        *self.cooldown_until.lock().expect("cooldown lock") = until;
        match until {
            Some(t) => info!("trading cooldown until {}", t),
            None => info!("trading cooldown cleared"),
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until() {
            Some(until) if now < until => true,
            Some(_) => {
                // Expired: clear so the next check is cheap.
                self.set_cooldown_until(None);
                false
            }
            None => false,
        }
    }

    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.started_at
            .lock()
            .expect("started_at lock")
            .map(|s| (now - s).num_seconds().max(0))
            .unwrap_or(0)
    }
}

impl Default for BotController {
    fn default() -> Self {
        Self::new()
    }
}
