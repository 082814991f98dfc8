//! Subcommand implementations

pub mod backtest;
pub mod optimize;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Args;
use liquidation_backtester::{Config, CsvDataSource, Modus};
use tracing::info;

/// Config overrides shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Symbol (overrides backtest.symbol)
    #[arg(long)]
    pub symbol: Option<String>,

    /// Strategy name (overrides strategy_name)
    #[arg(short, long)]
    pub strategy: Option<String>,

    /// Trade direction: buy, sell or both
    #[arg(long)]
    pub modus: Option<Modus>,

    /// Initial capital
    #[arg(long)]
    pub capital: Option<f64>,

    /// Start date (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub start: Option<String>,

    /// End date, exclusive (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub end: Option<String>,
}

impl Overrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(symbol) = self.symbol {
            info!("Overriding symbol to: {}", symbol);
            config.backtest.symbol = symbol.to_uppercase();
        }
        if let Some(strategy) = self.strategy {
            info!("Overriding strategy to: {}", strategy);
            config.strategy_name = strategy;
        }
        if let Some(modus) = self.modus {
            info!("Overriding modus to: {}", modus);
            config.backtest.modus = modus;
        }
        if let Some(capital) = self.capital {
            info!("Overriding initial capital to: ${:.2}", capital);
            config.backtest.initial_cash = capital;
        }
        if let Some(start) = self.start {
            config.backtest.start_date_iso = start;
        }
        if let Some(end) = self.end {
            config.backtest.end_date_iso = end;
        }
    }
}

/// Load, override and validate the configuration
pub fn load_config(config_path: &str, overrides: Overrides) -> Result<Config> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config {}", config_path))?;
    info!("Loaded configuration from: {}", config_path);
    overrides.apply(&mut config);
    Ok(config)
}

/// CSV source that also reads the average lookback before the start date
pub fn csv_source(config: &Config) -> CsvDataSource {
    CsvDataSource::new(&config.data.data_dir, config.data.max_missing_bars).with_liquidation_warmup(
        Duration::days(config.backtest.average_lookback_period_days as i64),
    )
}
