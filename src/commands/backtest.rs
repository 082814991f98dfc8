//! Backtest command implementation

use anyhow::{Context, Result};
use liquidation_backtester::data::{liquidation_stats, DatasetSource};
use liquidation_backtester::{simulate, MetricsReport};
use tracing::{debug, info};

use super::{csv_source, load_config, Overrides};

pub fn run(config_path: String, overrides: Overrides, show_trades: bool) -> Result<()> {
    info!("Starting backtest");

    let config = load_config(&config_path, overrides)?;
    config.validate().context("Invalid configuration")?;

    let symbol = config.symbol();
    let timeframe = config.timeframe()?;
    let (start, end) = config.date_range()?;

    info!("Loading data from: {}", config.data.data_dir);
    let dataset = csv_source(&config)
        .load(&symbol, &timeframe, start, end)
        .with_context(|| format!("Failed to load data for {} {}", symbol, timeframe))?;
    info!(
        "Loaded {} bars and {} liquidation events for {}",
        dataset.len(),
        dataset.liquidations().len(),
        symbol
    );

    let stats = liquidation_stats(
        dataset.liquidation_buckets(config.backtest.liquidation_aggregation_minutes),
    );
    info!(
        "Buy liquidations per {}m window: max ${:.0}, mean ${:.0}, median ${:.0} ({} windows)",
        config.backtest.liquidation_aggregation_minutes,
        stats.buy.max,
        stats.buy.mean,
        stats.buy.median,
        stats.buy.buckets
    );
    info!(
        "Sell liquidations per {}m window: max ${:.0}, mean ${:.0}, median ${:.0} ({} windows)",
        config.backtest.liquidation_aggregation_minutes,
        stats.sell.max,
        stats.sell.mean,
        stats.sell.median,
        stats.sell.buckets
    );

    info!(
        "Running {} on {} ({}, modus {})",
        config.strategy_name, symbol, timeframe, config.backtest.modus
    );
    let report = simulate(&config, &dataset)?;
    debug!("Equity curve has {} points", report.equity_curve.len());

    print_report(config.backtest.initial_cash, &report);
    if show_trades {
        print_trades(&report);
    }

    info!("Backtest completed successfully");

    Ok(())
}

fn print_report(initial_cash: f64, report: &MetricsReport) {
    let m = &report.metrics;
    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));
    println!("Initial Capital:    ${:.2}", initial_cash);
    println!("Final Equity:       ${:.2}", m.equity_final);
    println!("Peak Equity:        ${:.2}", m.equity_peak);
    println!("Total Return:       {:.2}%", m.total_return);
    println!("Sharpe Ratio:       {:.2}", m.sharpe_ratio);
    println!("Sortino Ratio:      {:.2}", m.sortino_ratio);
    println!("Calmar Ratio:       {:.2}", m.calmar_ratio);
    println!("Max Drawdown:       {:.2}%", m.max_drawdown);
    println!("Win Rate:           {:.2}%", m.win_rate);
    println!("Profit Factor:      {:.2}", m.profit_factor);
    println!("Total Trades:       {}", m.total_trades);
    println!("Winning Trades:     {}", m.winning_trades);
    println!("Losing Trades:      {}", m.losing_trades);
    println!("Best Trade:         {:.2}%", m.best_trade_pct);
    println!("Worst Trade:        {:.2}%", m.worst_trade_pct);
    println!("Average Trade:      {:.2}%", m.avg_trade_pct);
    println!("Total Commission:   ${:.2}", m.total_commission);
    println!("Exposure:           {:.2}%", m.exposure);
    if report.terminated_early {
        println!("Terminated early:   equity exhausted");
    }
    println!("{}", "=".repeat(60));
}

fn print_trades(report: &MetricsReport) {
    println!("\n{:<20} {:<5} {:>12} {:>12} {:>12} {:>8}  EXIT", "ENTRY", "SIDE", "ENTRY PX", "EXIT PX", "PNL", "RET%");
    println!("{}", "-".repeat(90));
    for trade in &report.trades {
        println!(
            "{:<20} {:<5} {:>12.4} {:>12.4} {:>12.2} {:>7.2}%  {}",
            trade.entry_time.format("%Y-%m-%d %H:%M"),
            trade.side.to_string(),
            trade.entry_price,
            trade.exit_price,
            trade.pnl,
            trade.return_pct(),
            trade.exit_reason
        );
    }
}
