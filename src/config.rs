//! Configuration management
//!
//! Loads the sectioned JSON configuration, applies environment overrides for
//! the data directories, and validates everything that must be rejected before
//! a single bar is simulated.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::data::{parse_date, Timeframe};
use crate::error::BacktestError;
use crate::optimizer::{ParameterSweep, SweepParam, TargetMetric};
use crate::strategies::StrategyKind;
use crate::{LiquidationBucket, Modus, Side, Symbol};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backtest: BacktestSettings,
    #[serde(default = "default_strategy_name")]
    pub strategy_name: String,
    #[serde(default)]
    pub strategy: StrategyParams,
    #[serde(default)]
    pub data: DataConfig,
    /// Sweep definition (optional, only used by `optimize`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizationConfig>,
}

fn default_strategy_name() -> String {
    StrategyKind::CounterTrade.to_string()
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides();

        Ok(config)
    }

    /// Data locations can be redirected without editing the config file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("LIQBT_DATA_DIR") {
            self.data.data_dir = dir;
        }
        if let Ok(dir) = std::env::var("LIQBT_RESULTS_DIR") {
            self.data.results_dir = dir;
        }
    }

    pub fn strategy_kind(&self) -> Result<StrategyKind, BacktestError> {
        StrategyKind::from_str(&self.strategy_name).map_err(BacktestError::InvalidConfig)
    }

    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.backtest.symbol)
    }

    pub fn timeframe(&self) -> Result<Timeframe, BacktestError> {
        Timeframe::from_str(&self.backtest.timeframe).map_err(BacktestError::InvalidConfig)
    }

    /// Half-open `[start, end)` window of the run
    pub fn date_range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), BacktestError> {
        let start = parse_date(&self.backtest.start_date_iso)
            .map_err(|e| BacktestError::invalid_config(format!("start_date_iso: {}", e)))?;
        let end = parse_date(&self.backtest.end_date_iso)
            .map_err(|e| BacktestError::invalid_config(format!("end_date_iso: {}", e)))?;
        if start >= end {
            return Err(BacktestError::invalid_config(format!(
                "start date {} must be before end date {}",
                start, end
            )));
        }
        Ok((start, end))
    }

    /// Checks needed for a single run; the optimization section is ignored
    pub fn validate_run(&self) -> Result<(), BacktestError> {
        self.strategy_kind()?;
        self.timeframe()?;
        self.date_range()?;
        self.backtest.validate()?;
        self.strategy.validate()
    }

    /// Every check that has to pass before any simulation starts
    pub fn validate(&self) -> Result<(), BacktestError> {
        self.validate_run()?;

        if let Some(opt) = &self.optimization {
            opt.validate()?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backtest: BacktestSettings::default(),
            strategy_name: default_strategy_name(),
            strategy: StrategyParams::default(),
            data: DataConfig::default(),
            optimization: None,
        }
    }
}

/// Run-level settings shared by every grid point
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestSettings {
    pub symbol: String,
    pub timeframe: String,
    pub start_date_iso: String,
    pub end_date_iso: String,
    pub initial_cash: f64,
    /// Percent of notional charged per side
    pub commission_percentage: f64,
    pub leverage: f64,
    pub modus: Modus,
    pub liquidation_aggregation_minutes: u32,
    pub average_lookback_period_days: u32,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        BacktestSettings {
            symbol: "ETHUSDT".to_string(),
            timeframe: "5m".to_string(),
            start_date_iso: "2025-01-01T00:00:00Z".to_string(),
            end_date_iso: "2025-04-01T00:00:00Z".to_string(),
            initial_cash: 10_000.0,
            commission_percentage: 0.04,
            leverage: 1.0,
            modus: Modus::Both,
            liquidation_aggregation_minutes: 5,
            average_lookback_period_days: 14,
        }
    }
}

impl BacktestSettings {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.symbol.trim().is_empty() {
            return Err(BacktestError::invalid_config("symbol must not be empty"));
        }
        if !(self.initial_cash > 0.0) {
            return Err(BacktestError::invalid_config(format!(
                "initial_cash must be positive, got {}",
                self.initial_cash
            )));
        }
        if !(self.leverage > 0.0) {
            return Err(BacktestError::invalid_config(format!(
                "leverage must be positive, got {}",
                self.leverage
            )));
        }
        if !(self.commission_percentage >= 0.0) {
            return Err(BacktestError::invalid_config(format!(
                "commission_percentage must be >= 0, got {}",
                self.commission_percentage
            )));
        }
        if self.liquidation_aggregation_minutes == 0 {
            return Err(BacktestError::invalid_config(
                "liquidation_aggregation_minutes must be at least 1",
            ));
        }
        Ok(())
    }

    /// Number of aggregation buckets covered by the average lookback
    pub fn lookback_buckets(&self) -> usize {
        let minutes = self.average_lookback_period_days as usize * 24 * 60;
        minutes / self.liquidation_aggregation_minutes.max(1) as usize
    }
}

/// How entry thresholds are derived from the liquidation flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Fixed USD thresholds
    #[default]
    Absolute,
    /// Trailing average of non-empty buckets times `average_liquidation_multiplier`
    AverageMultiple,
}

/// Strategy parameter set. One of these is produced per grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub buy_liquidation_threshold_usd: f64,
    pub sell_liquidation_threshold_usd: f64,
    pub stop_loss_percentage: f64,
    pub take_profit_percentage: f64,
    /// Percent, applied on entry and on exit
    pub slippage_percentage_per_side: f64,
    pub position_size_fraction: f64,
    pub exit_on_opposite_signal: bool,
    pub threshold_mode: ThresholdMode,
    pub average_liquidation_multiplier: f64,
    /// Bars between a detected signal and the entry
    pub cooldown_candles: u32,
}

impl Default for StrategyParams {
    fn default() -> Self {
        StrategyParams {
            buy_liquidation_threshold_usd: 100_000.0,
            sell_liquidation_threshold_usd: 100_000.0,
            stop_loss_percentage: 1.0,
            take_profit_percentage: 2.0,
            slippage_percentage_per_side: 0.0,
            position_size_fraction: 0.1,
            exit_on_opposite_signal: false,
            threshold_mode: ThresholdMode::Absolute,
            average_liquidation_multiplier: 4.0,
            cooldown_candles: 0,
        }
    }
}

impl StrategyParams {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if !(self.position_size_fraction > 0.0 && self.position_size_fraction <= 1.0) {
            return Err(BacktestError::invalid_config(format!(
                "position_size_fraction must be in (0, 1], got {}",
                self.position_size_fraction
            )));
        }
        if !(self.stop_loss_percentage > 0.0) || !(self.take_profit_percentage > 0.0) {
            return Err(BacktestError::invalid_config(format!(
                "stop_loss_percentage ({}) and take_profit_percentage ({}) must be positive",
                self.stop_loss_percentage, self.take_profit_percentage
            )));
        }
        if self.stop_loss_percentage >= 100.0 {
            return Err(BacktestError::invalid_config(format!(
                "stop_loss_percentage must be below 100, got {}",
                self.stop_loss_percentage
            )));
        }
        if !(self.slippage_percentage_per_side >= 0.0) || self.slippage_percentage_per_side >= 100.0
        {
            return Err(BacktestError::invalid_config(format!(
                "slippage_percentage_per_side must be in [0, 100), got {}",
                self.slippage_percentage_per_side
            )));
        }
        if !(self.buy_liquidation_threshold_usd >= 0.0)
            || !(self.sell_liquidation_threshold_usd >= 0.0)
        {
            return Err(BacktestError::invalid_config(
                "liquidation thresholds must be >= 0",
            ));
        }
        if self.threshold_mode == ThresholdMode::AverageMultiple
            && !(self.average_liquidation_multiplier > 0.0)
        {
            return Err(BacktestError::invalid_config(format!(
                "average_liquidation_multiplier must be positive, got {}",
                self.average_liquidation_multiplier
            )));
        }
        Ok(())
    }

    /// Threshold an entry on `entry` side has to reach, given the liquidation
    /// flow `observed` that triggers it.
    ///
    /// In average mode an observed side with no history yet never triggers.
    pub fn entry_threshold(&self, entry: Side, observed: Side, bucket: &LiquidationBucket) -> f64 {
        match self.threshold_mode {
            ThresholdMode::Absolute => match entry {
                Side::Buy => self.buy_liquidation_threshold_usd,
                Side::Sell => self.sell_liquidation_threshold_usd,
            },
            ThresholdMode::AverageMultiple => {
                let avg = match observed {
                    Side::Buy => bucket.avg_buy_usd,
                    Side::Sell => bucket.avg_sell_usd,
                };
                if avg > 0.0 {
                    avg * self.average_liquidation_multiplier
                } else {
                    f64::INFINITY
                }
            }
        }
    }

    /// Slippage as a fraction of price
    pub fn slippage_fraction(&self) -> f64 {
        self.slippage_percentage_per_side / 100.0
    }
}

/// Data locations and integrity tolerance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub data_dir: String,
    pub results_dir: String,
    /// Largest tolerated run of missing bars between two consecutive bars
    pub max_missing_bars: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
            max_missing_bars: 0,
        }
    }
}

/// Sweep definition for the optimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    /// Defaults to `backtest.symbol` when empty
    pub symbols: Vec<String>,
    /// Defaults to `strategy_name` when empty
    pub strategies: Vec<String>,
    /// Defaults to `backtest.modus` when empty
    pub modi: Vec<Modus>,
    pub target_metrics: Vec<String>,
    pub optimize_exit_on_opposite_signal: bool,
    /// Parameter name to range or explicit value list
    pub ranges: BTreeMap<String, ParameterSweep>,
    pub max_duration_secs: Option<u64>,
    pub sequential: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        OptimizationConfig {
            symbols: Vec::new(),
            strategies: Vec::new(),
            modi: Vec::new(),
            target_metrics: vec![TargetMetric::SharpeRatio.to_string()],
            optimize_exit_on_opposite_signal: false,
            ranges: BTreeMap::new(),
            max_duration_secs: None,
            sequential: false,
        }
    }
}

impl OptimizationConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        for name in &self.strategies {
            StrategyKind::from_str(name).map_err(BacktestError::InvalidConfig)?;
        }
        if self.target_metrics.is_empty() {
            return Err(BacktestError::invalid_config(
                "at least one target metric is required",
            ));
        }
        self.parsed_target_metrics()?;
        for (name, sweep) in &self.ranges {
            SweepParam::from_str(name).map_err(BacktestError::InvalidConfig)?;
            sweep.values(name)?;
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(BacktestError::invalid_config("symbols must not be empty"));
        }
        Ok(())
    }

    pub fn parsed_target_metrics(&self) -> Result<Vec<TargetMetric>, BacktestError> {
        self.target_metrics
            .iter()
            .map(|m| TargetMetric::from_str(m).map_err(BacktestError::InvalidConfig))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sectioned_json() {
        let json = r#"{
            "backtest": {
                "symbol": "SUIUSDT",
                "timeframe": "15m",
                "start_date_iso": "2025-02-01T00:00:00Z",
                "end_date_iso": "2025-03-01T00:00:00Z",
                "modus": "buy"
            },
            "strategy_name": "follow-the-flow",
            "strategy": { "buy_liquidation_threshold_usd": 250000, "cooldown_candles": 2 },
            "optimization": {
                "target_metrics": ["Sortino Ratio", "equity_final"],
                "ranges": {
                    "stop_loss_percentage": { "start": 0.5, "end": 2.0, "step": 0.5 },
                    "take_profit_percentage": { "values": [1.0, 3.0] }
                }
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.backtest.modus, Modus::Buy);
        assert_eq!(config.strategy_kind().unwrap(), StrategyKind::FollowTheFlow);
        assert_eq!(config.strategy.cooldown_candles, 2);
        assert_eq!(config.strategy.stop_loss_percentage, 1.0);
        assert_eq!(config.timeframe().unwrap().minutes, 15);
        assert!(config.validate().is_ok());

        let (start, end) = config.date_range().unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_rejects_non_positive_leverage() {
        let mut config = Config::default();
        config.backtest.leverage = 0.0;
        assert!(matches!(
            config.validate(),
            Err(BacktestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_position_fraction_out_of_range() {
        let mut config = Config::default();
        config.strategy.position_size_fraction = 1.5;
        assert!(config.validate().is_err());
        config.strategy.position_size_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_strategy_and_metric() {
        let mut config = Config::default();
        config.strategy_name = "martingale".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.optimization = Some(OptimizationConfig {
            target_metrics: vec!["Luck Ratio".to_string()],
            ..OptimizationConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_swept_parameter() {
        let mut config = Config::default();
        let mut ranges = BTreeMap::new();
        ranges.insert(
            "moon_phase".to_string(),
            ParameterSweep::Values { values: vec![1.0] },
        );
        config.optimization = Some(OptimizationConfig {
            ranges,
            ..OptimizationConfig::default()
        });
        assert!(matches!(
            config.validate(),
            Err(BacktestError::InvalidConfig(_))
        ));
        // a single run does not care about the sweep
        assert!(config.validate_run().is_ok());
    }

    #[test]
    fn test_rejects_inverted_dates() {
        let mut config = Config::default();
        config.backtest.start_date_iso = "2025-05-01".to_string();
        config.backtest.end_date_iso = "2025-04-01".to_string();
        assert!(config.date_range().is_err());
    }

    #[test]
    fn test_average_threshold_without_history_never_triggers() {
        let params = StrategyParams {
            threshold_mode: ThresholdMode::AverageMultiple,
            average_liquidation_multiplier: 3.0,
            ..StrategyParams::default()
        };
        let mut bucket = LiquidationBucket::empty(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert!(params
            .entry_threshold(Side::Buy, Side::Sell, &bucket)
            .is_infinite());

        bucket.avg_sell_usd = 1_000.0;
        assert_eq!(params.entry_threshold(Side::Buy, Side::Sell, &bucket), 3_000.0);
    }

    #[test]
    fn test_lookback_buckets() {
        let settings = BacktestSettings {
            average_lookback_period_days: 1,
            liquidation_aggregation_minutes: 5,
            ..BacktestSettings::default()
        };
        assert_eq!(settings.lookback_buckets(), 288);
    }
}
