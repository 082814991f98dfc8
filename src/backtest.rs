//! Backtesting engine
//!
//! Single-symbol, single-position simulation over an aligned bar/bucket feed.
//! Entries fill at the bar close with slippage; stops and targets are checked
//! intrabar from the bar after entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, warn};

use crate::config::{BacktestSettings, StrategyParams};
use crate::costs::{apply_slippage, commission, position_size};
use crate::data::AlignedFeed;
use crate::error::BacktestError;
use crate::strategies::Strategy;
use crate::{Bar, ExitReason, Modus, PerformanceMetrics, Position, Side, Signal, Trade};

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub metrics: PerformanceMetrics,
    pub trades: Vec<Trade>,
    /// Mark-to-market equity at every bar close
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    /// The run stopped because equity could no longer fund a position
    pub terminated_early: bool,
}

/// Entry waiting out `cooldown_candles`
#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    side: Side,
    execute_at: usize,
}

/// Backtest engine
pub struct Backtester {
    initial_cash: f64,
    commission_pct: f64,
    leverage: f64,
    modus: Modus,
    params: StrategyParams,
    strategy: &'static dyn Strategy,
}

impl Backtester {
    pub fn new(
        settings: &BacktestSettings,
        params: StrategyParams,
        strategy: &'static dyn Strategy,
    ) -> Self {
        Backtester {
            initial_cash: settings.initial_cash,
            commission_pct: settings.commission_percentage,
            leverage: settings.leverage,
            modus: settings.modus,
            params,
            strategy,
        }
    }

    pub fn with_modus(mut self, modus: Modus) -> Self {
        self.modus = modus;
        self
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    /// Run the simulation over `feed`
    pub fn run(&self, feed: &AlignedFeed<'_>) -> MetricsReport {
        let slippage = self.params.slippage_fraction();
        let mut equity = self.initial_cash;
        let mut position: Option<Position> = None;
        let mut pending: Option<PendingEntry> = None;
        let mut trades = Vec::new();
        let mut equity_curve = Vec::with_capacity(feed.len());
        let mut bars_in_market = 0usize;
        let mut terminated_early = false;

        for (i, (bar, bucket)) in feed.steps().enumerate() {
            // Stops and targets only apply from the bar after entry
            if let Some(pos) = position.as_ref().filter(|p| p.entry_time < bar.timestamp) {
                if let Some((reason, level)) = intrabar_exit(pos, bar) {
                    if let Some(pos) = position.take() {
                        let trade = self.close_position(feed, pos, level, bar.timestamp, reason);
                        equity = (equity + trade.pnl).max(0.0);
                        trades.push(trade);
                    }
                }
            }

            let signal = self.strategy.evaluate(bar, bucket, &self.params);

            if self.params.exit_on_opposite_signal {
                let opposite = position
                    .as_ref()
                    .is_some_and(|pos| is_opposite(pos.side, signal));
                if opposite {
                    if let Some(pos) = position.take() {
                        let trade = self.close_position(
                            feed,
                            pos,
                            bar.close,
                            bar.timestamp,
                            ExitReason::SignalExit,
                        );
                        equity = (equity + trade.pnl).max(0.0);
                        trades.push(trade);
                    }
                }
            }

            if equity <= 0.0 {
                let e = BacktestError::InsufficientEquity {
                    required: 0.0,
                    available: equity,
                };
                warn!(symbol = %feed.symbol(), time = %bar.timestamp, "Stopping run: {}", e);
                terminated_early = true;
            }

            if !terminated_early && position.is_none() {
                let entry_side = match pending {
                    Some(p) if p.execute_at == i => {
                        pending = None;
                        Some(p.side)
                    }
                    Some(_) => None,
                    None => match signal.entry_side().filter(|s| self.modus.allows(*s)) {
                        Some(side) if self.params.cooldown_candles == 0 => Some(side),
                        Some(side) => {
                            pending = Some(PendingEntry {
                                side,
                                execute_at: i + self.params.cooldown_candles as usize,
                            });
                            None
                        }
                        None => None,
                    },
                };

                if let Some(side) = entry_side {
                    match self.open_position(side, bar, equity, slippage) {
                        Ok(pos) => {
                            debug!(
                                symbol = %feed.symbol(),
                                side = %pos.side,
                                price = pos.entry_price,
                                size = pos.size,
                                stop = pos.stop_price,
                                target = pos.take_profit_price,
                                "Position opened"
                            );
                            position = Some(pos);
                        }
                        Err(e) => {
                            warn!(symbol = %feed.symbol(), time = %bar.timestamp, "Stopping run: {}", e);
                            terminated_early = true;
                        }
                    }
                }
            }

            if terminated_early {
                let frozen = equity.max(0.0);
                equity_curve.extend(feed.bars()[i..].iter().map(|b| (b.timestamp, frozen)));
                break;
            }

            let marked = match &position {
                Some(pos) => {
                    bars_in_market += 1;
                    equity + pos.unrealized_pnl(bar.close) - pos.entry_commission
                }
                None => equity,
            };
            equity_curve.push((bar.timestamp, marked.max(0.0)));
        }

        if let (Some(pos), Some(last)) = (position.take(), feed.bars().last()) {
            let trade = self.close_position(feed, pos, last.close, last.timestamp, ExitReason::EndOfData);
            equity = (equity + trade.pnl).max(0.0);
            trades.push(trade);
            if let Some(point) = equity_curve.last_mut() {
                point.1 = equity;
            }
        }

        let periods_per_year = feed.timeframe().periods_per_year();
        let mut metrics =
            calculate_metrics(&trades, &equity_curve, self.initial_cash, periods_per_year);
        metrics.exposure = if feed.is_empty() {
            0.0
        } else {
            bars_in_market as f64 / feed.len() as f64 * 100.0
        };

        MetricsReport {
            metrics,
            trades,
            equity_curve,
            terminated_early,
        }
    }

    fn open_position(
        &self,
        side: Side,
        bar: &Bar,
        equity: f64,
        slippage: f64,
    ) -> Result<Position, BacktestError> {
        let entry_price = apply_slippage(bar.close, side, slippage);
        let size = position_size(
            equity,
            self.params.position_size_fraction,
            self.leverage,
            entry_price,
            self.commission_pct,
        )?;
        let (stop_price, take_profit_price) = protective_levels(
            side,
            entry_price,
            self.params.stop_loss_percentage,
            self.params.take_profit_percentage,
        );

        Ok(Position {
            side,
            entry_time: bar.timestamp,
            entry_price,
            size,
            stop_price,
            take_profit_price,
            entry_commission: commission(size * entry_price, self.commission_pct),
        })
    }

    fn close_position(
        &self,
        feed: &AlignedFeed<'_>,
        pos: Position,
        price: f64,
        time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Trade {
        let exit_price = apply_slippage(price, pos.side.opposite(), self.params.slippage_fraction());
        let exit_commission = commission(pos.size * exit_price, self.commission_pct);
        let pnl = pos.unrealized_pnl(exit_price) - pos.entry_commission - exit_commission;

        let trade = Trade {
            symbol: feed.symbol().clone(),
            side: pos.side,
            entry_time: pos.entry_time,
            exit_time: time,
            entry_price: pos.entry_price,
            exit_price,
            size: pos.size,
            pnl,
            commission: pos.entry_commission + exit_commission,
            exit_reason: reason,
        };

        debug!(
            symbol = %trade.symbol,
            side = %trade.side,
            pnl = trade.pnl,
            return_pct = format!("{:.2}%", trade.return_pct()),
            reason = %trade.exit_reason,
            "Trade closed"
        );

        trade
    }
}

/// Stop and target for an entry fill; stop below and target above for longs
pub fn protective_levels(side: Side, entry: f64, stop_loss_pct: f64, take_profit_pct: f64) -> (f64, f64) {
    match side {
        Side::Buy => (
            entry * (1.0 - stop_loss_pct / 100.0),
            entry * (1.0 + take_profit_pct / 100.0),
        ),
        Side::Sell => (
            entry * (1.0 + stop_loss_pct / 100.0),
            entry * (1.0 - take_profit_pct / 100.0),
        ),
    }
}

/// Exit triggered inside `bar`, with its raw fill price.
///
/// A bar opening beyond a level fills at the open. When both levels fall
/// inside one bar the stop wins.
fn intrabar_exit(pos: &Position, bar: &Bar) -> Option<(ExitReason, f64)> {
    let (gapped_stop, gapped_target) = match pos.side {
        Side::Buy => (
            bar.open <= pos.stop_price,
            bar.open >= pos.take_profit_price,
        ),
        Side::Sell => (
            bar.open >= pos.stop_price,
            bar.open <= pos.take_profit_price,
        ),
    };

    if gapped_stop {
        Some((ExitReason::StopLoss, bar.open))
    } else if gapped_target {
        Some((ExitReason::TakeProfit, bar.open))
    } else if pos.stop_crossed(bar) {
        Some((ExitReason::StopLoss, pos.stop_price))
    } else if pos.take_profit_crossed(bar) {
        Some((ExitReason::TakeProfit, pos.take_profit_price))
    } else {
        None
    }
}

fn is_opposite(held: Side, signal: Signal) -> bool {
    match signal {
        Signal::Exit => true,
        Signal::EnterLong => held == Side::Sell,
        Signal::EnterShort => held == Side::Buy,
        Signal::None => false,
    }
}

/// Portfolio statistics from the trade list and the mark-to-market curve
pub fn calculate_metrics(
    trades: &[Trade],
    equity_curve: &[(DateTime<Utc>, f64)],
    initial_capital: f64,
    periods_per_year: f64,
) -> PerformanceMetrics {
    let equity_final = equity_curve.last().map_or(initial_capital, |(_, e)| *e);
    let equity_peak = equity_curve
        .iter()
        .map(|(_, e)| *e)
        .fold(initial_capital, f64::max);
    let total_return = (equity_final - initial_capital) / initial_capital * 100.0;

    let total_commission: f64 = trades.iter().map(|t| t.commission).sum();

    let winning_trades = trades.iter().filter(|t| t.pnl > 0.0).count();
    let losing_trades = trades.len() - winning_trades;
    let win_rate = if trades.is_empty() {
        0.0
    } else {
        winning_trades as f64 / trades.len() as f64 * 100.0
    };

    let gross_profits: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
    let gross_losses: f64 = trades
        .iter()
        .filter(|t| t.pnl <= 0.0)
        .map(|t| t.pnl.abs())
        .sum();
    let profit_factor = if gross_losses > 0.0 {
        gross_profits / gross_losses
    } else if gross_profits > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let trade_returns: Vec<f64> = trades.iter().map(Trade::return_pct).collect();
    let (best_trade_pct, worst_trade_pct, avg_trade_pct) = if trade_returns.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        (
            trade_returns.iter().copied().fold(f64::MIN, f64::max),
            trade_returns.iter().copied().fold(f64::MAX, f64::min),
            trade_returns.iter().copied().mean(),
        )
    };

    // Max drawdown over the curve, starting from the initial capital
    let mut peak = initial_capital;
    let mut max_dd = 0.0;
    for (_, equity) in equity_curve {
        if *equity > peak {
            peak = *equity;
        }
        let dd = if peak > 0.0 { (peak - equity) / peak } else { 0.0 };
        if dd > max_dd {
            max_dd = dd;
        }
    }

    let mut previous = initial_capital;
    let returns: Vec<f64> = equity_curve
        .iter()
        .map(|(_, equity)| {
            let r = if previous > 0.0 {
                (equity - previous) / previous
            } else {
                0.0
            };
            previous = *equity;
            r
        })
        .collect();

    let sharpe_ratio = sharpe(&returns, periods_per_year);
    let sortino_ratio = sortino(&returns, periods_per_year);

    let calmar_ratio = if max_dd > 0.0 && !returns.is_empty() {
        let years = returns.len() as f64 / periods_per_year;
        let growth = equity_final / initial_capital;
        let annualized_return = if growth > 0.0 {
            growth.powf(1.0 / years) - 1.0
        } else {
            -1.0
        };
        annualized_return / max_dd
    } else {
        0.0
    };

    PerformanceMetrics {
        equity_final,
        equity_peak,
        total_return,
        sharpe_ratio,
        sortino_ratio,
        calmar_ratio,
        max_drawdown: max_dd * 100.0,
        win_rate,
        profit_factor,
        total_trades: trades.len(),
        winning_trades,
        losing_trades,
        best_trade_pct,
        worst_trade_pct,
        avg_trade_pct,
        total_commission,
        exposure: 0.0,
    }
}

/// Annualised mean over sample standard deviation; zero without dispersion
pub fn sharpe(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().copied().mean();
    let std_dev = returns.iter().copied().std_dev();
    if std_dev > 0.0 && std_dev.is_finite() {
        mean / std_dev * periods_per_year.sqrt()
    } else {
        0.0
    }
}

/// Annualised mean over downside deviation (RMS of negative returns over all
/// periods). Infinite when nothing went down and the mean is positive.
pub fn sortino(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().copied().mean();
    let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>()
        / returns.len() as f64)
        .sqrt();
    if downside > 0.0 {
        mean / downside * periods_per_year.sqrt()
    } else if mean > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}
