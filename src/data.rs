//! Market data loading and alignment
//!
//! Loads OHLCV bars and liquidation prints from CSV files, validates ordering
//! and gaps, aggregates liquidations into fixed-width buckets and joins each
//! bar with the last bucket completed by its close.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use statrs::statistics::{Data, Median, Statistics};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::BacktestError;
use crate::{Bar, LiquidationBucket, LiquidationEvent, Side, Symbol};

// =============================================================================
// Timeframe
// =============================================================================

/// Bar interval, e.g. `5m`, `1h`, `1d`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timeframe {
    pub label: String,
    pub minutes: u32,
}

impl Timeframe {
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes as i64)
    }

    /// Bars per 365-day year
    pub fn periods_per_year(&self) -> f64 {
        525_600.0 / self.minutes as f64
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || format!("Unknown timeframe: '{}'. Use e.g. '5m', '1h' or '1d'", s);
        if s.len() < 2 {
            return Err(err());
        }
        let (count, unit) = s.split_at(s.len() - 1);
        let count: u32 = count.parse().map_err(|_| err())?;
        let per_unit = match unit {
            "m" => 1,
            "h" => 60,
            "d" => 1_440,
            "w" => 10_080,
            _ => return Err(err()),
        };
        if count == 0 {
            return Err(err());
        }
        Ok(Timeframe {
            label: s.to_string(),
            minutes: count * per_unit,
        })
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

// =============================================================================
// Date parsing
// =============================================================================

/// Parse RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD` (start of day) as UTC
pub fn parse_date(date_str: &str) -> Result<DateTime<Utc>, BacktestError> {
    let date_str = date_str.trim();

    if let Ok(dt) = date_str.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }

    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(date_str, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc));
    }

    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(date_str, "%Y-%m-%dT%H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc));
    }

    if let Some(ndt) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .ok()
        .and_then(|nd| nd.and_hms_opt(0, 0, 0))
    {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc));
    }

    Err(BacktestError::InvalidData(format!(
        "Failed to parse date: {}. Use YYYY-MM-DD, YYYY-MM-DD HH:MM:SS or RFC 3339",
        date_str
    )))
}

/// Epoch milliseconds or any format accepted by [`parse_date`]
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, BacktestError> {
    let value = value.trim();
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return value
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| BacktestError::InvalidData(format!("Bad epoch timestamp: {}", value)));
    }
    parse_date(value)
}

// =============================================================================
// MarketDataset
// =============================================================================

/// Immutable bars and liquidation prints for one symbol and timeframe
#[derive(Debug, Clone)]
pub struct MarketDataset {
    symbol: Symbol,
    timeframe: Timeframe,
    bars: Vec<Bar>,
    liquidations: Vec<LiquidationEvent>,
}

impl MarketDataset {
    /// Build a dataset, rejecting unordered bars and gaps above `max_missing_bars`
    pub fn from_parts(
        symbol: Symbol,
        timeframe: Timeframe,
        bars: Vec<Bar>,
        mut liquidations: Vec<LiquidationEvent>,
        max_missing_bars: usize,
    ) -> Result<Self, BacktestError> {
        let step = timeframe.duration();

        for pair in bars.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.timestamp <= prev.timestamp {
                return Err(BacktestError::InvalidData(format!(
                    "{}: bar timestamps not strictly increasing at {} -> {}",
                    symbol, prev.timestamp, next.timestamp
                )));
            }
            let missing_bars = (next.timestamp - prev.timestamp).num_minutes()
                / step.num_minutes()
                - 1;
            if missing_bars > max_missing_bars as i64 {
                return Err(BacktestError::DataGap {
                    symbol: symbol.clone(),
                    after: prev.timestamp,
                    missing_bars,
                    tolerance: max_missing_bars,
                });
            }
        }

        liquidations.sort_by_key(|e| e.timestamp);

        Ok(MarketDataset {
            symbol,
            timeframe,
            bars,
            liquidations,
        })
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }

    /// Ordered bars; call again to restart
    pub fn bars(&self) -> std::slice::Iter<'_, Bar> {
        self.bars.iter()
    }

    pub fn bar_slice(&self) -> &[Bar] {
        &self.bars
    }

    pub fn liquidations(&self) -> &[LiquidationEvent] {
        &self.liquidations
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Close time of the last bar
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.timestamp + self.timeframe.duration())
    }

    /// Lazy per-side liquidation sums over `bucket_minutes` windows.
    ///
    /// Windows start on multiples of the width since the Unix epoch. The
    /// sequence runs from the window holding the earliest bar or print up to
    /// the close of the last bar and includes empty windows.
    pub fn liquidation_buckets(&self, bucket_minutes: u32) -> LiquidationBuckets<'_> {
        let width = bucket_minutes.max(1) as i64 * 60;
        let first = match (self.bars.first(), self.liquidations.first()) {
            (Some(b), Some(e)) => Some(b.timestamp.min(e.timestamp)),
            (Some(b), None) => Some(b.timestamp),
            (None, Some(e)) => Some(e.timestamp),
            (None, None) => None,
        };
        let end = self.end_time().map(|t| t.timestamp()).unwrap_or(i64::MIN);
        let next_start = first
            .map(|t| t.timestamp().div_euclid(width) * width)
            .unwrap_or(i64::MAX);

        LiquidationBuckets {
            events: &self.liquidations,
            cursor: 0,
            next_start,
            end,
            width,
        }
    }

    /// Join every bar with the last bucket completed by its close and fill the
    /// trailing averages over `lookback_buckets` buckets.
    pub fn align(&self, bucket_minutes: u32, lookback_buckets: usize) -> AlignedFeed<'_> {
        let width = bucket_minutes.max(1) as i64 * 60;
        let tf_secs = self.timeframe.minutes as i64 * 60;
        let mut averages = TrailingAverage::new(lookback_buckets.max(1));
        let mut stream = self.liquidation_buckets(bucket_minutes).peekable();
        let mut current: Option<LiquidationBucket> = None;

        let mut buckets = Vec::with_capacity(self.bars.len());
        for bar in &self.bars {
            let close = bar.timestamp.timestamp() + tf_secs;
            let target = close.div_euclid(width) * width - width;

            while let Some(next) = stream.peek() {
                if next.bucket_start.timestamp() > target {
                    break;
                }
                let mut bucket = *next;
                stream.next();
                averages.push(bucket.buy_usd, bucket.sell_usd);
                bucket.avg_buy_usd = averages.buy_mean();
                bucket.avg_sell_usd = averages.sell_mean();
                current = Some(bucket);
            }

            let paired = match current {
                Some(bucket) if bucket.bucket_start.timestamp() == target => bucket,
                _ => {
                    let start = DateTime::from_timestamp(target, 0).unwrap_or(bar.timestamp);
                    LiquidationBucket::empty(start)
                }
            };
            buckets.push(paired);
        }

        AlignedFeed {
            symbol: &self.symbol,
            timeframe: &self.timeframe,
            bars: &self.bars,
            buckets,
        }
    }
}

/// Iterator returned by [`MarketDataset::liquidation_buckets`]
pub struct LiquidationBuckets<'a> {
    events: &'a [LiquidationEvent],
    cursor: usize,
    next_start: i64,
    end: i64,
    width: i64,
}

impl Iterator for LiquidationBuckets<'_> {
    type Item = LiquidationBucket;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_start >= self.end {
            return None;
        }
        let start = self.next_start;
        let stop = start + self.width;
        self.next_start = stop;

        let mut buy_usd = 0.0;
        let mut sell_usd = 0.0;
        while let Some(event) = self.events.get(self.cursor) {
            let ts = event.timestamp.timestamp();
            if ts >= stop {
                break;
            }
            if ts >= start {
                match event.side {
                    Side::Buy => buy_usd += event.notional_usd,
                    Side::Sell => sell_usd += event.notional_usd,
                }
            }
            self.cursor += 1;
        }

        let bucket_start = DateTime::from_timestamp(start, 0)?;
        Some(LiquidationBucket {
            bucket_start,
            buy_usd,
            sell_usd,
            avg_buy_usd: 0.0,
            avg_sell_usd: 0.0,
        })
    }
}

/// Rolling mean of the non-zero values within the last `window` buckets
struct TrailingAverage {
    window: usize,
    values: VecDeque<(f64, f64)>,
    sums: (f64, f64),
    non_zero: (usize, usize),
}

impl TrailingAverage {
    fn new(window: usize) -> Self {
        TrailingAverage {
            window,
            values: VecDeque::with_capacity(window),
            sums: (0.0, 0.0),
            non_zero: (0, 0),
        }
    }

    fn push(&mut self, buy: f64, sell: f64) {
        if self.values.len() == self.window {
            if let Some((old_buy, old_sell)) = self.values.pop_front() {
                self.sums.0 -= old_buy;
                self.sums.1 -= old_sell;
                self.non_zero.0 -= (old_buy != 0.0) as usize;
                self.non_zero.1 -= (old_sell != 0.0) as usize;
            }
        }
        self.values.push_back((buy, sell));
        self.sums.0 += buy;
        self.sums.1 += sell;
        self.non_zero.0 += (buy != 0.0) as usize;
        self.non_zero.1 += (sell != 0.0) as usize;
    }

    fn buy_mean(&self) -> f64 {
        if self.non_zero.0 == 0 {
            0.0
        } else {
            self.sums.0.max(0.0) / self.non_zero.0 as f64
        }
    }

    fn sell_mean(&self) -> f64 {
        if self.non_zero.1 == 0 {
            0.0
        } else {
            self.sums.1.max(0.0) / self.non_zero.1 as f64
        }
    }
}

/// Bars paired index by index with their liquidation bucket
#[derive(Debug, Clone)]
pub struct AlignedFeed<'a> {
    symbol: &'a Symbol,
    timeframe: &'a Timeframe,
    bars: &'a [Bar],
    buckets: Vec<LiquidationBucket>,
}

impl<'a> AlignedFeed<'a> {
    pub fn symbol(&self) -> &Symbol {
        self.symbol
    }

    pub fn timeframe(&self) -> &Timeframe {
        self.timeframe
    }

    pub fn bars(&self) -> &[Bar] {
        self.bars
    }

    pub fn buckets(&self) -> &[LiquidationBucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn steps(&self) -> impl Iterator<Item = (&Bar, &LiquidationBucket)> + '_ {
        self.bars.iter().zip(self.buckets.iter())
    }
}

// =============================================================================
// Liquidation statistics
// =============================================================================

/// Summary of the non-empty buckets on one side
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SideStats {
    pub buckets: usize,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LiquidationStats {
    pub buy: SideStats,
    pub sell: SideStats,
}

fn side_stats(values: Vec<f64>) -> SideStats {
    if values.is_empty() {
        return SideStats::default();
    }
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let mean = values.iter().copied().mean();
    let buckets = values.len();
    let median = Data::new(values).median();
    SideStats {
        buckets,
        max,
        mean,
        median,
    }
}

/// Max, mean and median of the non-empty buckets per side
pub fn liquidation_stats(buckets: impl IntoIterator<Item = LiquidationBucket>) -> LiquidationStats {
    let mut buys = Vec::new();
    let mut sells = Vec::new();
    for bucket in buckets {
        if bucket.buy_usd > 0.0 {
            buys.push(bucket.buy_usd);
        }
        if bucket.sell_usd > 0.0 {
            sells.push(bucket.sell_usd);
        }
    }
    LiquidationStats {
        buy: side_stats(buys),
        sell: side_stats(sells),
    }
}

// =============================================================================
// Dataset sources
// =============================================================================

/// Where datasets come from
pub trait DatasetSource: Send + Sync {
    /// Bars in `[start, end)` plus the liquidation prints needed to evaluate them
    fn load(
        &self,
        symbol: &Symbol,
        timeframe: &Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MarketDataset, BacktestError>;
}

/// Filter bars to the half-open range `[start, end)`
pub fn filter_bars_by_date(bars: Vec<Bar>, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Bar> {
    bars.into_iter()
        .filter(|b| b.timestamp >= start && b.timestamp < end)
        .collect()
}

/// Reads `{SYMBOL}_{timeframe}.csv` and `{SYMBOL}_liquidations.csv`
#[derive(Debug, Clone)]
pub struct CsvDataSource {
    data_dir: PathBuf,
    max_missing_bars: usize,
    liquidation_warmup: Duration,
}

impl CsvDataSource {
    pub fn new(data_dir: impl Into<PathBuf>, max_missing_bars: usize) -> Self {
        CsvDataSource {
            data_dir: data_dir.into(),
            max_missing_bars,
            liquidation_warmup: Duration::zero(),
        }
    }

    /// Also load prints this far before `start` so trailing averages are warm
    pub fn with_liquidation_warmup(mut self, warmup: Duration) -> Self {
        self.liquidation_warmup = warmup;
        self
    }

    pub fn price_path(&self, symbol: &Symbol, timeframe: &Timeframe) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}.csv", symbol.as_str(), timeframe.label))
    }

    pub fn liquidation_path(&self, symbol: &Symbol) -> PathBuf {
        self.data_dir
            .join(format!("{}_liquidations.csv", symbol.as_str()))
    }
}

impl DatasetSource for CsvDataSource {
    fn load(
        &self,
        symbol: &Symbol,
        timeframe: &Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MarketDataset, BacktestError> {
        let unavailable = || BacktestError::DataUnavailable {
            symbol: symbol.clone(),
            timeframe: timeframe.label.clone(),
            start,
            end,
        };

        let price_path = self.price_path(symbol, timeframe);
        if !price_path.exists() {
            warn!("Data file not found: {}", price_path.display());
            return Err(unavailable());
        }

        let bars = load_bars_csv(&price_path)?;
        let total = bars.len();
        let bars = filter_bars_by_date(bars, start, end);
        if bars.is_empty() {
            return Err(unavailable());
        }

        let liq_path = self.liquidation_path(symbol);
        let liquidations = if liq_path.exists() {
            let warm_start = start - self.liquidation_warmup;
            load_liquidations_csv(&liq_path)?
                .into_iter()
                .filter(|e| e.timestamp >= warm_start && e.timestamp < end)
                .collect()
        } else {
            warn!(
                "Liquidation file not found: {}; continuing without liquidations",
                liq_path.display()
            );
            Vec::new()
        };

        info!(
            "Loaded {} bars for {} {} (filtered from {} total), {} liquidation prints",
            bars.len(),
            symbol,
            timeframe,
            total,
            liquidations.len()
        );

        MarketDataset::from_parts(
            symbol.clone(),
            timeframe.clone(),
            bars,
            liquidations,
            self.max_missing_bars,
        )
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn field<'r>(record: &'r csv::StringRecord, idx: usize, name: &str) -> Result<&'r str, String> {
    record
        .get(idx)
        .ok_or_else(|| format!("missing {} column", name))
}

fn parse_bar(record: &csv::StringRecord) -> Result<Bar, String> {
    let timestamp = parse_timestamp(field(record, 0, "datetime")?).map_err(|e| e.to_string())?;
    let mut values = [0.0_f64; 5];
    for (i, name) in ["open", "high", "low", "close", "volume"].iter().enumerate() {
        values[i] = field(record, i + 1, name)?
            .trim()
            .parse()
            .map_err(|_| format!("failed to parse {}", name))?;
    }
    let [open, high, low, close, volume] = values;
    Bar::new(timestamp, open, high, low, close, volume).map_err(|e| e.to_string())
}

/// Load OHLCV bars (datetime,open,high,low,close,volume); invalid rows are skipped
pub fn load_bars_csv(path: impl AsRef<Path>) -> Result<Vec<Bar>, BacktestError> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        BacktestError::InvalidData(format!("Failed to open {}: {}", path.display(), e))
    })?;

    let mut bars = Vec::new();
    let mut invalid_count = 0;

    for (row_idx, result) in reader.records().enumerate() {
        let parsed = result
            .map_err(|e| e.to_string())
            .and_then(|record| parse_bar(&record));
        match parsed {
            Ok(bar) => bars.push(bar),
            Err(e) => {
                invalid_count += 1;
                warn!(
                    "Skipping invalid bar at row {} in {}: {}",
                    row_idx + 2,
                    file_label(path),
                    e
                );
            }
        }
    }

    if invalid_count > 0 {
        warn!(
            "Skipped {} invalid bars out of {} in {}",
            invalid_count,
            invalid_count + bars.len(),
            file_label(path)
        );
    }

    Ok(bars)
}

#[derive(Debug, Deserialize)]
struct LiquidationRow {
    timestamp: String,
    side: String,
    #[serde(alias = "cumulated_usd_size")]
    notional_usd: f64,
}

impl LiquidationRow {
    fn into_event(self) -> Result<LiquidationEvent, String> {
        let timestamp = parse_timestamp(&self.timestamp).map_err(|e| e.to_string())?;
        let side = Side::from_str(&self.side)?;
        if !(self.notional_usd >= 0.0) {
            return Err(format!("negative notional {}", self.notional_usd));
        }
        Ok(LiquidationEvent {
            timestamp,
            side,
            notional_usd: self.notional_usd,
        })
    }
}

/// Load liquidation prints (timestamp,side,notional_usd); invalid rows are skipped
pub fn load_liquidations_csv(path: impl AsRef<Path>) -> Result<Vec<LiquidationEvent>, BacktestError> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        BacktestError::InvalidData(format!("Failed to open {}: {}", path.display(), e))
    })?;

    let mut events = Vec::new();
    let mut invalid_count = 0;

    for (row_idx, result) in reader.deserialize::<LiquidationRow>().enumerate() {
        let parsed = result
            .map_err(|e| e.to_string())
            .and_then(LiquidationRow::into_event);
        match parsed {
            Ok(event) => events.push(event),
            Err(e) => {
                invalid_count += 1;
                warn!(
                    "Skipping invalid liquidation at row {} in {}: {}",
                    row_idx + 2,
                    file_label(path),
                    e
                );
            }
        }
    }

    if invalid_count > 0 {
        warn!(
            "Skipped {} invalid liquidation rows in {}",
            invalid_count,
            file_label(path)
        );
    }

    Ok(events)
}

/// Datasets held in memory, keyed by symbol
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    datasets: HashMap<Symbol, Arc<MarketDataset>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dataset: MarketDataset) {
        self.datasets
            .insert(dataset.symbol().clone(), Arc::new(dataset));
    }

    pub fn with(mut self, dataset: MarketDataset) -> Self {
        self.insert(dataset);
        self
    }
}

impl DatasetSource for InMemorySource {
    fn load(
        &self,
        symbol: &Symbol,
        timeframe: &Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MarketDataset, BacktestError> {
        let unavailable = || BacktestError::DataUnavailable {
            symbol: symbol.clone(),
            timeframe: timeframe.label.clone(),
            start,
            end,
        };

        let dataset = self
            .datasets
            .get(symbol)
            .filter(|d| d.timeframe() == timeframe)
            .ok_or_else(unavailable)?;

        let bars: Vec<Bar> = dataset
            .bars()
            .filter(|b| b.timestamp >= start && b.timestamp < end)
            .cloned()
            .collect();
        if bars.is_empty() {
            return Err(unavailable());
        }

        Ok(MarketDataset {
            symbol: dataset.symbol.clone(),
            timeframe: dataset.timeframe.clone(),
            bars,
            liquidations: dataset.liquidations.clone(),
        })
    }
}
