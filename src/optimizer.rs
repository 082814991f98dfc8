//! Parameter optimization
//!
//! Expands the configured ranges into a lazily indexed grid crossed with
//! symbols, strategies and modi, evaluates every point on a rayon pool and
//! ranks the reports once per target metric.

use indicatif::ProgressBar;
use itertools::iproduct;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::backtest::{Backtester, MetricsReport};
use crate::config::{Config, StrategyParams};
use crate::data::{AlignedFeed, DatasetSource, MarketDataset};
use crate::error::BacktestError;
use crate::strategies::StrategyKind;
use crate::{Modus, PerformanceMetrics, Symbol};

// =============================================================================
// Parameter ranges
// =============================================================================

/// One swept dimension: an inclusive stepped range or an explicit list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSweep {
    Range { start: f64, end: f64, step: f64 },
    Values { values: Vec<f64> },
}

/// Upper bound on the values a single stepped range may expand to
pub const MAX_RANGE_VALUES: usize = 100_000;

fn to_decimal(x: f64) -> Option<Decimal> {
    if !x.is_finite() {
        return None;
    }
    Decimal::from_str(&x.to_string()).ok()
}

impl ParameterSweep {
    /// Expand into concrete values.
    ///
    /// Ranges are stepped in decimal arithmetic so `0.1` steps land exactly;
    /// the count is `floor((end - start) / step) + 1`.
    pub fn values(&self, name: &str) -> Result<Vec<f64>, BacktestError> {
        match self {
            ParameterSweep::Range { start, end, step } => {
                let invalid = || BacktestError::InvalidRange {
                    param: name.to_string(),
                    start: *start,
                    end: *end,
                    step: *step,
                };
                let (s, e, st) = match (to_decimal(*start), to_decimal(*end), to_decimal(*step)) {
                    (Some(s), Some(e), Some(st)) => (s, e, st),
                    _ => return Err(invalid()),
                };
                if st <= Decimal::ZERO || s > e {
                    return Err(invalid());
                }
                let count = ((e - s) / st)
                    .floor()
                    .to_usize()
                    .ok_or_else(invalid)?
                    .saturating_add(1);
                if count > MAX_RANGE_VALUES {
                    return Err(invalid());
                }
                (0..count)
                    .map(|k| {
                        (s + st * Decimal::from(k))
                            .normalize()
                            .to_string()
                            .parse::<f64>()
                            .map_err(|_| invalid())
                    })
                    .collect()
            }
            ParameterSweep::Values { values } => {
                if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
                    return Err(BacktestError::InvalidRange {
                        param: name.to_string(),
                        start: values.first().copied().unwrap_or(f64::NAN),
                        end: values.last().copied().unwrap_or(f64::NAN),
                        step: 0.0,
                    });
                }
                Ok(values.clone())
            }
        }
    }
}

/// Strategy parameters that can be swept
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SweepParam {
    BuyThreshold,
    SellThreshold,
    StopLoss,
    TakeProfit,
    Slippage,
    PositionSizeFraction,
    AverageMultiplier,
    CooldownCandles,
}

impl SweepParam {
    pub const ALL: [SweepParam; 8] = [
        SweepParam::BuyThreshold,
        SweepParam::SellThreshold,
        SweepParam::StopLoss,
        SweepParam::TakeProfit,
        SweepParam::Slippage,
        SweepParam::PositionSizeFraction,
        SweepParam::AverageMultiplier,
        SweepParam::CooldownCandles,
    ];

    /// Key used in `optimization.ranges`
    pub fn key(self) -> &'static str {
        match self {
            SweepParam::BuyThreshold => "buy_liquidation_threshold_usd",
            SweepParam::SellThreshold => "sell_liquidation_threshold_usd",
            SweepParam::StopLoss => "stop_loss_percentage",
            SweepParam::TakeProfit => "take_profit_percentage",
            SweepParam::Slippage => "slippage_percentage_per_side",
            SweepParam::PositionSizeFraction => "position_size_fraction",
            SweepParam::AverageMultiplier => "average_liquidation_multiplier",
            SweepParam::CooldownCandles => "cooldown_candles",
        }
    }

    pub fn get(self, params: &StrategyParams) -> f64 {
        match self {
            SweepParam::BuyThreshold => params.buy_liquidation_threshold_usd,
            SweepParam::SellThreshold => params.sell_liquidation_threshold_usd,
            SweepParam::StopLoss => params.stop_loss_percentage,
            SweepParam::TakeProfit => params.take_profit_percentage,
            SweepParam::Slippage => params.slippage_percentage_per_side,
            SweepParam::PositionSizeFraction => params.position_size_fraction,
            SweepParam::AverageMultiplier => params.average_liquidation_multiplier,
            SweepParam::CooldownCandles => params.cooldown_candles as f64,
        }
    }

    pub fn set(self, params: &mut StrategyParams, value: f64) {
        match self {
            SweepParam::BuyThreshold => params.buy_liquidation_threshold_usd = value,
            SweepParam::SellThreshold => params.sell_liquidation_threshold_usd = value,
            SweepParam::StopLoss => params.stop_loss_percentage = value,
            SweepParam::TakeProfit => params.take_profit_percentage = value,
            SweepParam::Slippage => params.slippage_percentage_per_side = value,
            SweepParam::PositionSizeFraction => params.position_size_fraction = value,
            SweepParam::AverageMultiplier => params.average_liquidation_multiplier = value,
            SweepParam::CooldownCandles => params.cooldown_candles = value.round() as u32,
        }
    }

    /// Dimension collapsed to its base value under `modus`
    fn pinned_under(self, modus: Modus) -> bool {
        matches!(
            (self, modus),
            (SweepParam::SellThreshold, Modus::Buy) | (SweepParam::BuyThreshold, Modus::Sell)
        )
    }
}

impl FromStr for SweepParam {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SweepParam::ALL
            .into_iter()
            .find(|p| p.key() == s.trim())
            .ok_or_else(|| {
                let known: Vec<_> = SweepParam::ALL.iter().map(|p| p.key()).collect();
                format!(
                    "Unknown parameter '{}' in optimization ranges. Known: {}",
                    s,
                    known.join(", ")
                )
            })
    }
}

impl fmt::Display for SweepParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// =============================================================================
// Target metrics
// =============================================================================

/// Metric a ranking is ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetMetric {
    SharpeRatio,
    SortinoRatio,
    EquityFinal,
    Return,
    CalmarRatio,
    WinRate,
    ProfitFactor,
    MaxDrawdown,
}

impl TargetMetric {
    pub const ALL: [TargetMetric; 8] = [
        TargetMetric::SharpeRatio,
        TargetMetric::SortinoRatio,
        TargetMetric::EquityFinal,
        TargetMetric::Return,
        TargetMetric::CalmarRatio,
        TargetMetric::WinRate,
        TargetMetric::ProfitFactor,
        TargetMetric::MaxDrawdown,
    ];

    /// Report-style display name
    pub fn name(self) -> &'static str {
        match self {
            TargetMetric::SharpeRatio => "Sharpe Ratio",
            TargetMetric::SortinoRatio => "Sortino Ratio",
            TargetMetric::EquityFinal => "Equity Final [$]",
            TargetMetric::Return => "Return [%]",
            TargetMetric::CalmarRatio => "Calmar Ratio",
            TargetMetric::WinRate => "Win Rate [%]",
            TargetMetric::ProfitFactor => "Profit Factor",
            TargetMetric::MaxDrawdown => "Max. Drawdown [%]",
        }
    }

    /// File-name friendly id, also accepted when parsing
    pub fn slug(self) -> &'static str {
        match self {
            TargetMetric::SharpeRatio => "sharpe_ratio",
            TargetMetric::SortinoRatio => "sortino_ratio",
            TargetMetric::EquityFinal => "equity_final",
            TargetMetric::Return => "return",
            TargetMetric::CalmarRatio => "calmar_ratio",
            TargetMetric::WinRate => "win_rate",
            TargetMetric::ProfitFactor => "profit_factor",
            TargetMetric::MaxDrawdown => "max_drawdown",
        }
    }

    pub fn value(self, m: &PerformanceMetrics) -> f64 {
        match self {
            TargetMetric::SharpeRatio => m.sharpe_ratio,
            TargetMetric::SortinoRatio => m.sortino_ratio,
            TargetMetric::EquityFinal => m.equity_final,
            TargetMetric::Return => m.total_return,
            TargetMetric::CalmarRatio => m.calmar_ratio,
            TargetMetric::WinRate => m.win_rate,
            TargetMetric::ProfitFactor => m.profit_factor,
            TargetMetric::MaxDrawdown => m.max_drawdown,
        }
    }

    /// Higher is better. Drawdown is negated; NaN sorts last.
    pub fn score(self, m: &PerformanceMetrics) -> f64 {
        let v = match self {
            TargetMetric::MaxDrawdown => -self.value(m),
            _ => self.value(m),
        };
        if v.is_nan() {
            f64::NEG_INFINITY
        } else {
            v
        }
    }
}

impl FromStr for TargetMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        let alias = match wanted.as_str() {
            "sharpe" => Some(TargetMetric::SharpeRatio),
            "sortino" => Some(TargetMetric::SortinoRatio),
            "equity" | "final_equity" => Some(TargetMetric::EquityFinal),
            "total_return" | "return_pct" => Some(TargetMetric::Return),
            "calmar" => Some(TargetMetric::CalmarRatio),
            "drawdown" | "max_dd" => Some(TargetMetric::MaxDrawdown),
            _ => None,
        };
        alias
            .or_else(|| {
                TargetMetric::ALL
                    .into_iter()
                    .find(|m| m.name().to_lowercase() == wanted || m.slug() == wanted)
            })
            .ok_or_else(|| {
                let known: Vec<_> = TargetMetric::ALL.iter().map(|m| m.name()).collect();
                format!("Unknown target metric '{}'. Known: {}", s, known.join(", "))
            })
    }
}

impl fmt::Display for TargetMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for TargetMetric {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for TargetMetric {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TargetMetric::from_str(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Grid
// =============================================================================

/// Atomic unit of optimization work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    /// Position in enumeration order, used as the final ranking tie-break
    pub index: usize,
    pub symbol: Symbol,
    pub strategy: StrategyKind,
    pub modus: Modus,
    pub params: StrategyParams,
}

#[derive(Debug, Clone)]
struct Dimension {
    param: SweepParam,
    values: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Block {
    symbol: Symbol,
    strategy: StrategyKind,
    modus: Modus,
    offset: usize,
    len: usize,
}

/// Lazily indexed Cartesian grid.
///
/// Blocks are the symbol × strategy × modus combinations; inside a block the
/// swept dimensions vary with the last one fastest, then the exit flag.
#[derive(Debug, Clone)]
pub struct Grid {
    base: StrategyParams,
    dims: Vec<Dimension>,
    sweep_exit: bool,
    blocks: Vec<Block>,
    len: usize,
}

impl Grid {
    pub fn from_config(config: &Config) -> Result<Self, BacktestError> {
        let opt = config.optimization.clone().unwrap_or_default();
        let base = config.strategy.clone();

        let symbols: Vec<Symbol> = if opt.symbols.is_empty() {
            vec![config.symbol()]
        } else {
            opt.symbols.iter().map(Symbol::new).collect()
        };
        let strategies: Vec<StrategyKind> = if opt.strategies.is_empty() {
            vec![config.strategy_kind()?]
        } else {
            opt.strategies
                .iter()
                .map(|s| StrategyKind::from_str(s).map_err(BacktestError::InvalidConfig))
                .collect::<Result<_, _>>()?
        };
        let modi = if opt.modi.is_empty() {
            vec![config.backtest.modus]
        } else {
            opt.modi.clone()
        };

        let mut dims = Vec::with_capacity(opt.ranges.len());
        for (name, sweep) in &opt.ranges {
            let param = SweepParam::from_str(name).map_err(BacktestError::InvalidConfig)?;
            let values = sweep.values(name)?;
            for &value in &values {
                if param == SweepParam::CooldownCandles && (value < 0.0 || value.fract() != 0.0) {
                    return Err(BacktestError::invalid_config(format!(
                        "cooldown_candles must be a non-negative integer, got {}",
                        value
                    )));
                }
                let mut probe = base.clone();
                param.set(&mut probe, value);
                probe.validate().map_err(|e| {
                    BacktestError::invalid_config(format!("{} = {}: {}", name, value, e))
                })?;
            }
            dims.push(Dimension { param, values });
        }

        let mut grid = Grid {
            base,
            dims,
            sweep_exit: opt.optimize_exit_on_opposite_signal,
            blocks: Vec::new(),
            len: 0,
        };

        for (symbol, strategy, modus) in iproduct!(symbols, strategies, modi) {
            let len = grid.block_len(modus);
            grid.blocks.push(Block {
                symbol,
                strategy,
                modus,
                offset: grid.len,
                len,
            });
            grid.len += len;
        }

        Ok(grid)
    }

    fn dim_len(&self, dim: &Dimension, modus: Modus) -> usize {
        if dim.param.pinned_under(modus) {
            1
        } else {
            dim.values.len()
        }
    }

    fn exit_len(&self, modus: Modus) -> usize {
        if self.sweep_exit && modus == Modus::Both {
            2
        } else {
            1
        }
    }

    fn block_len(&self, modus: Modus) -> usize {
        self.dims
            .iter()
            .map(|d| self.dim_len(d, modus))
            .product::<usize>()
            * self.exit_len(modus)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Distinct symbols in enumeration order
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut seen = Vec::new();
        for block in &self.blocks {
            if !seen.contains(&block.symbol) {
                seen.push(block.symbol.clone());
            }
        }
        seen
    }

    /// Build the point at `index`, `None` past the end
    pub fn point(&self, index: usize) -> Option<GridPoint> {
        if index >= self.len {
            return None;
        }
        let block_idx = self
            .blocks
            .partition_point(|b| b.offset + b.len <= index);
        let block = self.blocks.get(block_idx)?;

        let mut rem = index - block.offset;
        let mut params = self.base.clone();

        let exit_len = self.exit_len(block.modus);
        if exit_len == 2 {
            params.exit_on_opposite_signal = rem % 2 == 1;
            rem /= 2;
        }

        for dim in self.dims.iter().rev() {
            if dim.param.pinned_under(block.modus) {
                continue;
            }
            let n = dim.values.len();
            dim.param.set(&mut params, dim.values[rem % n]);
            rem /= n;
        }

        Some(GridPoint {
            index,
            symbol: block.symbol.clone(),
            strategy: block.strategy,
            modus: block.modus,
            params,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = GridPoint> + '_ {
        (0..self.len).filter_map(move |i| self.point(i))
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Shared stop token for a running sweep
#[derive(Debug, Clone, Default)]
pub struct SweepControl {
    cancelled: Arc<AtomicBool>,
    budget: Option<Duration>,
}

impl SweepControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop dispatching new points once `budget` has elapsed
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatedPoint {
    pub point: GridPoint,
    pub report: MetricsReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedPoint {
    pub point: GridPoint,
    pub error: String,
}

/// Indices into `RankedResults::evaluations`, best first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ranking {
    pub metric: TargetMetric,
    pub order: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankedResults {
    pub total_points: usize,
    pub evaluations: Vec<EvaluatedPoint>,
    pub failures: Vec<FailedPoint>,
    pub rankings: Vec<Ranking>,
    /// Stopped before every point was evaluated
    pub cancelled: bool,
}

impl RankedResults {
    pub fn ranking(&self, metric: TargetMetric) -> Option<&Ranking> {
        self.rankings.iter().find(|r| r.metric == metric)
    }

    /// Evaluations ordered best first for `metric`
    pub fn ranked(&self, metric: TargetMetric) -> impl Iterator<Item = &EvaluatedPoint> + '_ {
        self.ranking(metric)
            .into_iter()
            .flat_map(|r| r.order.iter())
            .filter_map(|&i| self.evaluations.get(i))
    }

    pub fn best(&self, metric: TargetMetric) -> Option<&EvaluatedPoint> {
        self.ranked(metric).next()
    }

    /// Best evaluation per (symbol, strategy, modus) for `metric`
    pub fn best_per_group(&self, metric: TargetMetric) -> Vec<&EvaluatedPoint> {
        let mut best: BTreeMap<(Symbol, StrategyKind, Modus), &EvaluatedPoint> = BTreeMap::new();
        for eval in self.ranked(metric) {
            let p = &eval.point;
            best.entry((p.symbol.clone(), p.strategy, p.modus))
                .or_insert(eval);
        }
        best.into_values().collect()
    }

    pub fn completed(&self) -> usize {
        self.evaluations.len() + self.failures.len()
    }
}

/// Order evaluations by `metric` descending, then final equity, then grid order
pub fn rank(evaluations: &[EvaluatedPoint], metric: TargetMetric) -> Vec<usize> {
    let mut order: Vec<usize> = (0..evaluations.len()).collect();
    order.sort_by_key(|&i| {
        let eval = &evaluations[i];
        let equity = eval.report.metrics.equity_final;
        (
            Reverse(OrderedFloat(metric.score(&eval.report.metrics))),
            Reverse(OrderedFloat(if equity.is_nan() { f64::NEG_INFINITY } else { equity })),
            eval.point.index,
        )
    });
    order
}

// =============================================================================
// Optimizer
// =============================================================================

/// Grid-search driver
pub struct Optimizer {
    config: Config,
    control: SweepControl,
    progress: Option<ProgressBar>,
    keep_equity_curves: bool,
}

impl Optimizer {
    pub fn new(config: Config) -> Self {
        let control = match config.optimization.as_ref().and_then(|o| o.max_duration_secs) {
            Some(secs) => SweepControl::new().with_budget(Duration::from_secs(secs)),
            None => SweepControl::new(),
        };
        Optimizer {
            config,
            control,
            progress: None,
            keep_equity_curves: false,
        }
    }

    pub fn with_control(mut self, control: SweepControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_progress(mut self, progress_bar: ProgressBar) -> Self {
        self.progress = Some(progress_bar);
        self
    }

    /// Keep every point's equity curve (memory grows with grid × bars)
    pub fn keep_equity_curves(mut self, keep: bool) -> Self {
        self.keep_equity_curves = keep;
        self
    }

    pub fn control(&self) -> &SweepControl {
        &self.control
    }

    pub fn grid(&self) -> Result<Grid, BacktestError> {
        Grid::from_config(&self.config)
    }

    pub fn run(&self, source: &dyn DatasetSource) -> Result<RankedResults, BacktestError> {
        self.config.validate()?;
        let metrics = match &self.config.optimization {
            Some(opt) => opt.parsed_target_metrics()?,
            None => vec![TargetMetric::SharpeRatio],
        };
        let sequential = self
            .config
            .optimization
            .as_ref()
            .is_some_and(|o| o.sequential);
        let grid = self.grid()?;
        let timeframe = self.config.timeframe()?;
        let (start, end) = self.config.date_range()?;
        let settings = &self.config.backtest;

        info!(
            "Testing {} parameter combinations across {} symbol(s)",
            grid.len(),
            grid.symbols().len()
        );

        let mut datasets: HashMap<Symbol, Result<Arc<MarketDataset>, String>> = HashMap::new();
        let mut first_error = None;
        for symbol in grid.symbols() {
            let loaded = source.load(&symbol, &timeframe, start, end);
            let entry = match loaded {
                Ok(ds) => Ok(Arc::new(ds)),
                Err(e) => {
                    warn!("Data for {} unavailable, its grid points fail: {}", symbol, e);
                    let msg = e.to_string();
                    first_error.get_or_insert(e);
                    Err(msg)
                }
            };
            datasets.insert(symbol, entry);
        }
        if let Some(e) = first_error {
            if datasets.values().all(|d| d.is_err()) {
                return Err(e);
            }
        }

        let lookback = settings.lookback_buckets();
        let feeds: HashMap<&Symbol, Result<AlignedFeed<'_>, &String>> = datasets
            .iter()
            .map(|(symbol, ds)| {
                let feed = ds
                    .as_ref()
                    .map(|d| d.align(settings.liquidation_aggregation_minutes, lookback));
                (symbol, feed)
            })
            .collect();

        let started = Instant::now();
        let timed_out = AtomicBool::new(false);
        let done = AtomicUsize::new(0);

        let evaluate = |index: usize| -> Option<Result<EvaluatedPoint, FailedPoint>> {
            if self.control.is_cancelled() {
                return None;
            }
            if let Some(budget) = self.control.budget() {
                if started.elapsed() >= budget {
                    timed_out.store(true, Ordering::SeqCst);
                    return None;
                }
            }

            let point = grid.point(index)?;
            let outcome = match feeds.get(&point.symbol) {
                Some(Ok(feed)) => {
                    let mut report = Backtester::new(
                        settings,
                        point.params.clone(),
                        point.strategy.resolve(),
                    )
                    .with_modus(point.modus)
                    .run(feed);
                    if !self.keep_equity_curves {
                        report.equity_curve = Vec::new();
                    }
                    Ok(EvaluatedPoint { point, report })
                }
                Some(Err(msg)) => Err(FailedPoint {
                    error: msg.to_string(),
                    point,
                }),
                None => Err(FailedPoint {
                    error: format!("no dataset for {}", point.symbol),
                    point,
                }),
            };

            done.fetch_add(1, Ordering::Relaxed);
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
            Some(outcome)
        };

        let outcomes: Vec<Result<EvaluatedPoint, FailedPoint>> = if sequential {
            (0..grid.len()).filter_map(evaluate).collect()
        } else {
            (0..grid.len()).into_par_iter().filter_map(evaluate).collect()
        };

        let mut evaluations = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(eval) => evaluations.push(eval),
                Err(failed) => failures.push(failed),
            }
        }

        let rankings = metrics
            .iter()
            .map(|&metric| Ranking {
                metric,
                order: rank(&evaluations, metric),
            })
            .collect();

        let completed = done.load(Ordering::Relaxed);
        let results = RankedResults {
            total_points: grid.len(),
            evaluations,
            failures,
            rankings,
            cancelled: completed < grid.len(),
        };

        info!(
            "Evaluated {}/{} grid points ({} failed) in {:.1}s",
            completed,
            grid.len(),
            results.failures.len(),
            started.elapsed().as_secs_f64()
        );

        if timed_out.load(Ordering::SeqCst) {
            return Err(BacktestError::SweepTimeout {
                budget: self.control.budget().unwrap_or_default(),
                completed,
                total: grid.len(),
                partial: Box::new(results),
            });
        }

        Ok(results)
    }
}
