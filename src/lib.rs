//! Liquidation Backtester
//!
//! Backtests liquidation-driven crypto strategies and grid-searches their
//! parameters. Strategies read forced-liquidation flow aggregated into fixed
//! windows and either fade it (`counter-trade`) or ride it
//! (`follow-the-flow`).
//!
//! ## Single run
//! ```no_run
//! use liquidation_backtester::data::{CsvDataSource, DatasetSource};
//! use liquidation_backtester::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("configs/ethusdt_5m.json")?;
//!     let (start, end) = config.date_range()?;
//!     let source = CsvDataSource::new(&config.data.data_dir, config.data.max_missing_bars);
//!     let dataset = source.load(&config.symbol(), &config.timeframe()?, start, end)?;
//!     let report = liquidation_backtester::simulate(&config, &dataset)?;
//!     println!("Sharpe {:.2}", report.metrics.sharpe_ratio);
//!     Ok(())
//! }
//! ```

pub mod backtest;
pub mod config;
pub mod costs;
pub mod data;
pub mod error;
pub mod optimizer;
pub mod strategies;
pub mod types;

pub use backtest::{Backtester, MetricsReport};
pub use config::{Config, StrategyParams};
pub use data::{CsvDataSource, DatasetSource, MarketDataset};
pub use error::BacktestError;
pub use optimizer::{Optimizer, RankedResults, TargetMetric};
pub use strategies::{Strategy, StrategyKind};
pub use types::*;

/// Run one backtest of `config` over `dataset`
pub fn simulate(config: &Config, dataset: &MarketDataset) -> Result<MetricsReport, BacktestError> {
    config.validate_run()?;
    let strategy = config.strategy_kind()?.resolve();
    let feed = dataset.align(
        config.backtest.liquidation_aggregation_minutes,
        config.backtest.lookback_buckets(),
    );
    Ok(Backtester::new(&config.backtest, config.strategy.clone(), strategy).run(&feed))
}

/// Grid-search `config.optimization` over datasets from `source`.
///
/// Reports keep their equity curves. Use [`Optimizer`] directly to drop them
/// on large grids.
pub fn optimize(config: &Config, source: &dyn DatasetSource) -> Result<RankedResults, BacktestError> {
    Optimizer::new(config.clone())
        .keep_equity_curves(true)
        .run(source)
}
