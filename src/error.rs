//! Error taxonomy for data loading, simulation and optimization

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::optimizer::RankedResults;
use crate::Symbol;

/// Errors raised by the backtesting core.
///
/// Data and configuration errors are fatal for the caller. `InsufficientEquity`
/// is recovered inside a run (the run terminates early) and `SweepTimeout`
/// carries whatever the sweep finished before the budget ran out.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("no {timeframe} bars for {symbol} between {start} and {end}")]
    DataUnavailable {
        symbol: Symbol,
        timeframe: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("gap of {missing_bars} missing bars for {symbol} after {after} (tolerance {tolerance})")]
    DataGap {
        symbol: Symbol,
        after: DateTime<Utc>,
        missing_bars: i64,
        tolerance: usize,
    },

    #[error("invalid market data: {0}")]
    InvalidData(String),

    #[error("invalid range for '{param}': start={start}, end={end}, step={step}")]
    InvalidRange {
        param: String,
        start: f64,
        end: f64,
        step: f64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("insufficient equity: required {required:.2}, available {available:.2}")]
    InsufficientEquity { required: f64, available: f64 },

    #[error("sweep exceeded {budget:?}: {completed}/{total} grid points evaluated")]
    SweepTimeout {
        budget: Duration,
        completed: usize,
        total: usize,
        partial: Box<RankedResults>,
    },
}

impl BacktestError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        BacktestError::InvalidConfig(msg.into())
    }
}

pub type BacktestResult<T> = std::result::Result<T, BacktestError>;
