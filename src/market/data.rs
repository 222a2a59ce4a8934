use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::exchange::{with_retry, ExchangeApi};
use crate::types::{Candle, CandleSeries, Symbol};

/// Exchange page size for candle requests.
const PAGE_SIZE: u32 = 200;

/// Minimum resampled history the analyzer accepts.
pub const MIN_RESAMPLED_BARS: usize = 210;

struct CacheEntry {
    fetched_at: Instant,
    candles: Vec<Candle>,
}

/// Cached, closed-bar candle access. Shields the exchange from the loop's
/// per-symbol fan-out; transient gaps surface as `None`, never as errors.
pub struct MarketData {
    exchange: Arc<dyn ExchangeApi>,
    cache: RwLock<HashMap<(Symbol, u32), CacheEntry>>,
}

impl MarketData {
    pub fn new(exchange: Arc<dyn ExchangeApi>) -> Self {
        Self {
            exchange,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn ttl_for(unit: u32) -> Duration {
        // Short intervals churn faster; cap at 12 s either way.
        Duration::from_secs((2 + 2 * unit as u64).clamp(2, 12))
    }

    /// Up to `count` closed candles at `unit` minutes, oldest first, ending
    /// at the most recently closed bar. The in-progress bar is dropped.
    pub async fn candles(&self, symbol: &Symbol, unit: u32, count: u32) -> Option<CandleSeries> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&(symbol.clone(), unit)) {
                if entry.fetched_at.elapsed() < Self::ttl_for(unit)
                    && entry.candles.len() >= count as usize
                {
                    let skip = entry.candles.len() - count as usize;
                    return Some(CandleSeries::new(entry.candles[skip..].to_vec()));
                }
            }
        }

        let fetched = self.fetch_paged(symbol, unit, count).await?;
        let series = CandleSeries::new(fetched.clone());
        self.cache.write().await.insert(
            (symbol.clone(), unit),
            CacheEntry { fetched_at: Instant::now(), candles: fetched },
        );
        Some(series)
    }

    /// Pages backward until `count` closed candles are collected. The
    /// oldest timestamp of each page, minus one interval, becomes the next
    /// exclusive upper bound.
    async fn fetch_paged(&self, symbol: &Symbol, unit: u32, count: u32) -> Option<Vec<Candle>> {
        // One extra row covers the in-progress candle dropped below.
        let wanted = count + 1;
        let mut collected: Vec<Candle> = Vec::new();
        let mut to = None;

        while (collected.len() as u32) < wanted {
            let page_count = (wanted - collected.len() as u32).min(PAGE_SIZE);
            let page = with_retry("minute_candles", || {
                self.exchange.minute_candles(symbol, unit, page_count, to)
            })
            .await
            .ok()?;

            if page.is_empty() {
                break;
            }
            let exhausted = (page.len() as u32) < page_count;
            let oldest = page.first()?.timestamp;
            to = Some(oldest - ChronoDuration::minutes(unit as i64));

            let mut merged = page;
            merged.extend(collected);
            collected = merged;

            if exhausted
                || to.map(|t| t < Utc::now() - ChronoDuration::days(30)).unwrap_or(false)
            {
                break;
            }
        }

        if collected.is_empty() {
            debug!("{} {}m candles unavailable this tick", symbol, unit);
            return None;
        }

        // Closed-bar discipline: the newest row is the forming candle.
        collected.pop();
        if collected.is_empty() {
            return None;
        }
        if collected.len() > count as usize {
            let skip = collected.len() - count as usize;
            collected.drain(..skip);
        }
        Some(collected)
    }

    /// Resamples the 5-minute base series into right-closed `minutes`-wide
    /// bars labeled by their close time. Returns `None` unless at least
    /// `MIN_RESAMPLED_BARS` closed bars come out; the last bar is the most
    /// recently closed one.
    pub async fn resampled(
        &self,
        symbol: &Symbol,
        minutes: u32,
        count: usize,
    ) -> Option<CandleSeries> {
        debug_assert!(minutes % 5 == 0 && minutes >= 5);
        let base_needed = (count as u32) * (minutes / 5);
        let base = self.candles(symbol, 5, base_needed).await?;
        let bars = resample(&base.candles, minutes);
        if bars.len() < MIN_RESAMPLED_BARS {
            debug!(
                "{} resample to {}m too short: {} bars",
                symbol,
                minutes,
                bars.len()
            );
            return None;
        }
        Some(CandleSeries::new(bars))
    }
}

/// Right-labeled, right-closed aggregation of closed 5-minute candles.
/// A bucket is emitted only when the base series covers its full width.
pub fn resample(base: &[Candle], minutes: u32) -> Vec<Candle> {
    if base.is_empty() {
        return Vec::new();
    }
    let bucket_secs = minutes as i64 * 60;
    let base_secs = 300;
    // Coverage extends to the end of the newest closed base candle.
    let coverage_end = base.last().map(|c| c.timestamp.timestamp() + base_secs).unwrap_or(0);

    let mut bars: Vec<Candle> = Vec::new();
    let mut current_end: Option<i64> = None;

    for candle in base {
        let ts = candle.timestamp.timestamp();
        let end = (ts / bucket_secs + 1) * bucket_secs;

        match current_end {
            Some(cur) if cur == end => {
                let bar = bars.last_mut().expect("open bucket");
                bar.high = bar.high.max(candle.high);
                bar.low = bar.low.min(candle.low);
                bar.close = candle.close;
                bar.volume += candle.volume;
                bar.quote_volume += candle.quote_volume;
            }
            _ => {
                bars.push(Candle {
                    timestamp: chrono::DateTime::from_timestamp(end, 0)
                        .expect("valid bucket timestamp"),
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    volume: candle.volume,
                    quote_volume: candle.quote_volume,
                });
                current_end = Some(end);
            }
        }
    }

    // Drop a trailing partial bucket the base series has not closed yet.
    while bars
        .last()
        .map(|b| b.timestamp.timestamp() > coverage_end)
        .unwrap_or(false)
    {
        bars.pop();
    }
    bars
}
