//! Core data types used across the backtester

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Validation errors for bar data
#[derive(Debug, Error)]
pub enum BarValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV bar. `timestamp` is the bar open time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Create a new bar with validation
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, BarValidationError> {
        let bar = Self::new_unchecked(timestamp, open, high, low, close, volume);
        bar.validate()?;
        Ok(bar)
    }

    /// Create a bar without validation (trusted sources, test fixtures)
    pub fn new_unchecked(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn validate(&self) -> Result<(), BarValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(BarValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(BarValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(BarValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(BarValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(BarValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned into every grid point and trade record, so clones
/// must not allocate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction. `Buy` is long, `Sell` is short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for longs, -1 for shorts
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "long" => Ok(Side::Buy),
            "sell" | "short" => Ok(Side::Sell),
            other => Err(format!("Unknown side: '{}'. Use 'buy' or 'sell'", other)),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Permitted trade direction for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modus {
    Buy,
    Sell,
    Both,
}

impl Modus {
    pub fn allows(self, side: Side) -> bool {
        matches!(
            (self, side),
            (Modus::Both, _) | (Modus::Buy, Side::Buy) | (Modus::Sell, Side::Sell)
        )
    }
}

impl Default for Modus {
    fn default() -> Self {
        Modus::Both
    }
}

impl FromStr for Modus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(Modus::Buy),
            "sell" => Ok(Modus::Sell),
            "both" => Ok(Modus::Both),
            other => Err(format!(
                "Unknown modus: '{}'. Use 'buy', 'sell' or 'both'",
                other
            )),
        }
    }
}

impl fmt::Display for Modus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modus::Buy => write!(f, "buy"),
            Modus::Sell => write!(f, "sell"),
            Modus::Both => write!(f, "both"),
        }
    }
}

/// A single forced-liquidation print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub notional_usd: f64,
}

/// Liquidation notional summed per side over one fixed-width window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquidationBucket {
    pub bucket_start: DateTime<Utc>,
    pub buy_usd: f64,
    pub sell_usd: f64,
    /// Trailing mean of the non-empty buy buckets over the average lookback.
    /// Zero on the raw stream from `MarketDataset::liquidation_buckets`.
    pub avg_buy_usd: f64,
    pub avg_sell_usd: f64,
}

impl LiquidationBucket {
    pub fn empty(bucket_start: DateTime<Utc>) -> Self {
        Self {
            bucket_start,
            buy_usd: 0.0,
            sell_usd: 0.0,
            avg_buy_usd: 0.0,
            avg_sell_usd: 0.0,
        }
    }
}

/// Trading signal emitted by a strategy for one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    None,
    EnterLong,
    EnterShort,
    Exit,
}

impl Signal {
    /// Side an entry signal asks for, if any
    pub fn entry_side(self) -> Option<Side> {
        match self {
            Signal::EnterLong => Some(Side::Buy),
            Signal::EnterShort => Some(Side::Sell),
            Signal::None | Signal::Exit => None,
        }
    }
}

/// Open position state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub size: f64,
    pub stop_price: f64,
    pub take_profit_price: f64,
    pub entry_commission: f64,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.size * self.entry_price
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.size * self.side.sign()
    }

    /// Whether `bar` trades through the stop level
    pub fn stop_crossed(&self, bar: &Bar) -> bool {
        match self.side {
            Side::Buy => bar.low <= self.stop_price,
            Side::Sell => bar.high >= self.stop_price,
        }
    }

    /// Whether `bar` trades through the take-profit level
    pub fn take_profit_crossed(&self, bar: &Bar) -> bool {
        match self.side {
            Side::Buy => bar.high >= self.take_profit_price,
            Side::Sell => bar.low <= self.take_profit_price,
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    SignalExit,
    EndOfData,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "Stop Loss",
            ExitReason::TakeProfit => "Take Profit",
            ExitReason::SignalExit => "Signal",
            ExitReason::EndOfData => "End of backtest",
        };
        f.write_str(s)
    }
}

/// Completed trade record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    /// Net of both commissions
    pub pnl: f64,
    pub commission: f64,
    pub exit_reason: ExitReason,
}

impl Trade {
    /// Price return in percent, signed for the trade direction
    pub fn return_pct(&self) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        (self.exit_price - self.entry_price) / self.entry_price * self.side.sign() * 100.0
    }
}

/// Portfolio statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub equity_final: f64,
    pub equity_peak: f64,
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    /// Positive percent
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub best_trade_pct: f64,
    pub worst_trade_pct: f64,
    pub avg_trade_pct: f64,
    pub total_commission: f64,
    /// Share of bars spent in a position, percent
    pub exposure: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_bar_validation() {
        assert!(Bar::new(ts(), 100.0, 105.0, 95.0, 102.0, 10.0).is_ok());
        assert!(matches!(
            Bar::new(ts(), 100.0, 95.0, 105.0, 100.0, 10.0),
            Err(BarValidationError::HighLessThanLow { .. })
        ));
        assert!(matches!(
            Bar::new(ts(), 100.0, 105.0, 95.0, 110.0, 10.0),
            Err(BarValidationError::CloseOutOfRange { .. })
        ));
        assert!(matches!(
            Bar::new(ts(), 0.0, 105.0, 95.0, 100.0, 10.0),
            Err(BarValidationError::NonPositivePrice { .. })
        ));
    }

    #[test]
    fn test_modus_allows() {
        assert!(Modus::Buy.allows(Side::Buy));
        assert!(!Modus::Buy.allows(Side::Sell));
        assert!(Modus::Sell.allows(Side::Sell));
        assert!(!Modus::Sell.allows(Side::Buy));
        assert!(Modus::Both.allows(Side::Buy) && Modus::Both.allows(Side::Sell));
    }

    #[test]
    fn test_modus_parse() {
        assert_eq!("BOTH".parse::<Modus>().unwrap(), Modus::Both);
        assert!("sideways".parse::<Modus>().is_err());
    }

    #[test]
    fn test_short_position_levels() {
        let pos = Position {
            side: Side::Sell,
            entry_time: ts(),
            entry_price: 100.0,
            size: 2.0,
            stop_price: 101.0,
            take_profit_price: 98.0,
            entry_commission: 0.0,
        };
        let bar = Bar::new_unchecked(ts(), 100.0, 101.5, 99.0, 100.5, 1.0);
        assert!(pos.stop_crossed(&bar));
        assert!(!pos.take_profit_crossed(&bar));
        assert_eq!(pos.unrealized_pnl(99.0), 2.0);
    }

    #[test]
    fn test_trade_return_pct_short() {
        let trade = Trade {
            symbol: Symbol::new("SUIUSDT"),
            side: Side::Sell,
            entry_time: ts(),
            exit_time: ts(),
            entry_price: 100.0,
            exit_price: 90.0,
            size: 1.0,
            pnl: 10.0,
            commission: 0.0,
            exit_reason: ExitReason::TakeProfit,
        };
        assert!((trade.return_pct() - 10.0).abs() < 1e-12);
    }
}
