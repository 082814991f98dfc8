//! Integration tests for the liquidation backtester
//!
//! These tests drive the public API end to end on synthetic data.

use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::str::FromStr;

use liquidation_backtester::config::OptimizationConfig;
use liquidation_backtester::data::{CsvDataSource, DatasetSource, InMemorySource, Timeframe};
use liquidation_backtester::optimizer::{ParameterSweep, SweepControl};
use liquidation_backtester::{
    optimize, simulate, BacktestError, Bar, Config, ExitReason, LiquidationEvent, MarketDataset,
    Modus, Optimizer, Side, Symbol, TargetMetric,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn bar_time(index: usize) -> DateTime<Utc> {
    start_time() + Duration::minutes(5 * index as i64)
}

/// Flat 5m bars with a 0.1% range around `price`
fn generate_flat_bars(count: usize, price: f64) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            Bar::new(
                bar_time(i),
                price,
                price * 1.001,
                price * 0.999,
                price,
                1_000.0,
            )
            .unwrap()
        })
        .collect()
}

/// Bars drifting up by `step` per bar
fn generate_trending_bars(count: usize, base_price: f64, step: f64) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            let open = base_price + i as f64 * step;
            let close = open + step;
            Bar::new(
                bar_time(i),
                open,
                close.max(open) * 1.0005,
                close.min(open) * 0.9995,
                close,
                1_000.0,
            )
            .unwrap()
        })
        .collect()
}

/// One liquidation print a minute into bar `index`
fn liquidation_at(index: usize, side: Side, notional_usd: f64) -> LiquidationEvent {
    LiquidationEvent {
        timestamp: bar_time(index) + Duration::minutes(1),
        side,
        notional_usd,
    }
}

fn dataset(symbol: &str, bars: Vec<Bar>, liquidations: Vec<LiquidationEvent>) -> MarketDataset {
    MarketDataset::from_parts(
        Symbol::new(symbol),
        Timeframe::from_str("5m").unwrap(),
        bars,
        liquidations,
        0,
    )
    .unwrap()
}

fn base_config(modus: Modus) -> Config {
    let mut config = Config::default();
    config.backtest.symbol = "ETHUSDT".to_string();
    config.backtest.timeframe = "5m".to_string();
    config.backtest.modus = modus;
    config.strategy_name = "counter-trade".to_string();
    config.strategy.buy_liquidation_threshold_usd = 100_000.0;
    config.strategy.sell_liquidation_threshold_usd = 100_000.0;
    config.strategy.stop_loss_percentage = 1.0;
    config.strategy.take_profit_percentage = 2.0;
    config
}

fn with_ranges(mut config: Config, ranges: Vec<(&str, ParameterSweep)>) -> Config {
    let ranges: BTreeMap<String, ParameterSweep> = ranges
        .into_iter()
        .map(|(name, sweep)| (name.to_string(), sweep))
        .collect();
    config.optimization = Some(OptimizationConfig {
        ranges,
        ..Default::default()
    });
    config
}

// =============================================================================
// Single run scenarios
// =============================================================================

#[test]
fn test_single_breach_holds_until_end_of_data() {
    let bars = generate_flat_bars(100, 100.0);
    let ds = dataset("ETHUSDT", bars, vec![liquidation_at(40, Side::Sell, 150_000.0)]);

    let report = simulate(&base_config(Modus::Buy), &ds).unwrap();

    assert_eq!(report.trades.len(), 1);
    let trade = &report.trades[0];
    assert_eq!(trade.side, Side::Buy);
    assert_eq!(trade.entry_time, bar_time(40));
    assert_eq!(trade.exit_time, bar_time(99));
    assert_eq!(trade.exit_reason, ExitReason::EndOfData);
    assert!(!report.terminated_early);
    assert_eq!(report.equity_curve.len(), 100);
}

#[test]
fn test_single_breach_exits_on_first_stop_crossing() {
    let mut bars = generate_flat_bars(100, 100.0);
    bars[60].low = 98.5;
    bars[75].low = 97.0;
    let ds = dataset("ETHUSDT", bars, vec![liquidation_at(40, Side::Sell, 150_000.0)]);

    let report = simulate(&base_config(Modus::Buy), &ds).unwrap();

    assert_eq!(report.trades.len(), 1);
    let trade = &report.trades[0];
    assert_eq!(trade.exit_reason, ExitReason::StopLoss);
    assert_eq!(trade.exit_time, bar_time(60));
    assert_relative_eq!(trade.exit_price, 99.0, max_relative = 1e-9);
    assert!(trade.pnl < 0.0);
}

#[test]
fn test_take_profit_on_trend() {
    let bars = generate_trending_bars(100, 100.0, 0.1);
    let ds = dataset("ETHUSDT", bars, vec![liquidation_at(10, Side::Sell, 150_000.0)]);

    let report = simulate(&base_config(Modus::Both), &ds).unwrap();

    assert_eq!(report.trades.len(), 1);
    let trade = &report.trades[0];
    assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
    assert_relative_eq!(trade.exit_price, trade.entry_price * 1.02, max_relative = 1e-9);
    assert!(trade.pnl > 0.0);
    assert!(report.metrics.total_return > 0.0);
}

#[test]
fn test_short_entry_stops_above() {
    let mut bars = generate_flat_bars(100, 100.0);
    bars[50].high = 101.5;
    let ds = dataset("ETHUSDT", bars, vec![liquidation_at(30, Side::Buy, 200_000.0)]);

    let report = simulate(&base_config(Modus::Sell), &ds).unwrap();

    assert_eq!(report.trades.len(), 1);
    let trade = &report.trades[0];
    assert_eq!(trade.side, Side::Sell);
    assert_eq!(trade.exit_reason, ExitReason::StopLoss);
    assert_relative_eq!(trade.exit_price, 101.0, max_relative = 1e-9);
}

#[test]
fn test_modus_filters_entries() {
    let bars = generate_flat_bars(100, 100.0);
    let ds = dataset("ETHUSDT", bars, vec![liquidation_at(30, Side::Buy, 200_000.0)]);

    // counter-trade wants to short buy liquidations
    let report = simulate(&base_config(Modus::Buy), &ds).unwrap();
    assert!(report.trades.is_empty());
    assert_eq!(report.metrics.total_trades, 0);
}

#[test]
fn test_follow_the_flow_trades_with_liquidations() {
    let bars = generate_flat_bars(100, 100.0);
    let ds = dataset("ETHUSDT", bars, vec![liquidation_at(30, Side::Sell, 200_000.0)]);

    let mut config = base_config(Modus::Both);
    config.strategy_name = "follow-the-flow".to_string();
    let report = simulate(&config, &ds).unwrap();

    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].side, Side::Sell);
}

#[test]
fn test_no_second_position_while_open() {
    let bars = generate_flat_bars(100, 100.0);
    let liqs = vec![
        liquidation_at(40, Side::Sell, 150_000.0),
        liquidation_at(45, Side::Sell, 150_000.0),
        liquidation_at(50, Side::Buy, 150_000.0),
    ];
    let ds = dataset("ETHUSDT", bars, liqs);

    let report = simulate(&base_config(Modus::Both), &ds).unwrap();

    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].entry_time, bar_time(40));
}

#[test]
fn test_slippage_applies_on_both_sides() {
    let bars = generate_flat_bars(100, 100.0);
    let ds = dataset("ETHUSDT", bars, vec![liquidation_at(40, Side::Sell, 150_000.0)]);

    let mut config = base_config(Modus::Buy);
    config.strategy.slippage_percentage_per_side = 0.1;
    config.backtest.commission_percentage = 0.0;
    let report = simulate(&config, &ds).unwrap();

    let trade = &report.trades[0];
    assert_relative_eq!(trade.entry_price, 100.1, max_relative = 1e-9);
    assert_relative_eq!(trade.exit_price, 99.9, max_relative = 1e-9);
    assert!(trade.pnl < 0.0);
    assert_eq!(trade.commission, 0.0);
}

#[test]
fn test_equity_depletion_terminates_run() {
    let bars = generate_flat_bars(100, 100.0);
    let ds = dataset("ETHUSDT", bars, vec![liquidation_at(40, Side::Sell, 150_000.0)]);

    // the whole account as margin leaves nothing for the entry commission
    let mut config = base_config(Modus::Buy);
    config.strategy.position_size_fraction = 1.0;
    config.backtest.commission_percentage = 0.1;
    let report = simulate(&config, &ds).unwrap();

    assert!(report.terminated_early);
    assert!(report.trades.is_empty());
    assert_eq!(report.equity_curve.len(), 100);
    assert!(report
        .equity_curve
        .iter()
        .all(|&(_, equity)| equity == config.backtest.initial_cash));
    assert_eq!(report.metrics.equity_final, config.backtest.initial_cash);
}

#[test]
fn test_gap_in_data_is_rejected() {
    let mut bars = generate_flat_bars(20, 100.0);
    bars.remove(10);
    let result = MarketDataset::from_parts(
        Symbol::new("ETHUSDT"),
        Timeframe::from_str("5m").unwrap(),
        bars,
        Vec::new(),
        0,
    );
    assert!(matches!(result, Err(BacktestError::DataGap { missing_bars: 1, .. })));
}

// =============================================================================
// Optimization
// =============================================================================

#[test]
fn test_one_point_grid_matches_simulate() {
    let mut bars = generate_trending_bars(100, 100.0, 0.05);
    bars[70].low = 90.0;
    let liqs = vec![
        liquidation_at(10, Side::Sell, 150_000.0),
        liquidation_at(60, Side::Sell, 150_000.0),
    ];
    let ds = dataset("ETHUSDT", bars, liqs);
    let config = with_ranges(
        base_config(Modus::Both),
        vec![("stop_loss_percentage", ParameterSweep::Values { values: vec![1.0] })],
    );

    let direct = simulate(&config, &ds).unwrap();
    let results = optimize(&config, &InMemorySource::new().with(ds)).unwrap();

    assert_eq!(results.total_points, 1);
    assert_eq!(results.evaluations.len(), 1);
    let report = &results.evaluations[0].report;
    assert_eq!(report.equity_curve.len(), 100);
    assert_eq!(report.trades.len(), 2);
    assert_eq!(report.trades[0].symbol.as_str(), "ETHUSDT");
    assert_eq!(report.trades[0].size, direct.trades[0].size);
    assert_eq!(report, &direct);
}

#[test]
fn test_simulate_ignores_sweep_section() {
    let ds = dataset("ETHUSDT", generate_flat_bars(50, 100.0), Vec::new());
    let config = with_ranges(
        base_config(Modus::Both),
        vec![(
            "stop_loss_percentage",
            ParameterSweep::Range {
                start: 1.0,
                end: 3.0,
                step: 0.0,
            },
        )],
    );

    assert!(simulate(&config, &ds).is_ok());
    assert!(config.validate().is_err());
}

#[test]
fn test_grid_size_is_product_of_dimensions() {
    let mut config = with_ranges(
        base_config(Modus::Both),
        vec![
            (
                "stop_loss_percentage",
                ParameterSweep::Range {
                    start: 1.0,
                    end: 3.0,
                    step: 1.0,
                },
            ),
            (
                "take_profit_percentage",
                ParameterSweep::Values {
                    values: vec![2.0, 4.0],
                },
            ),
        ],
    );
    if let Some(opt) = config.optimization.as_mut() {
        opt.symbols = vec!["ETHUSDT".to_string(), "BTCUSDT".to_string()];
    }

    let source = InMemorySource::new()
        .with(dataset("ETHUSDT", generate_flat_bars(50, 100.0), Vec::new()))
        .with(dataset("BTCUSDT", generate_flat_bars(50, 40_000.0), Vec::new()));
    let results = optimize(&config, &source).unwrap();

    assert_eq!(results.total_points, 12);
    assert_eq!(results.evaluations.len(), 12);
    assert!(results.failures.is_empty());
    assert!(!results.cancelled);

    let mut indices: Vec<usize> = results.evaluations.iter().map(|e| e.point.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..12).collect::<Vec<_>>());
}

#[test]
fn test_invalid_range_is_rejected_before_running() {
    let config = with_ranges(
        base_config(Modus::Both),
        vec![(
            "stop_loss_percentage",
            ParameterSweep::Range {
                start: 1.0,
                end: 3.0,
                step: 0.0,
            },
        )],
    );
    let source = InMemorySource::new().with(dataset("ETHUSDT", generate_flat_bars(50, 100.0), Vec::new()));

    let result = optimize(&config, &source);
    assert!(matches!(result, Err(BacktestError::InvalidRange { .. })));
}

#[test]
fn test_missing_symbol_fails_only_its_points() {
    let mut config = with_ranges(
        base_config(Modus::Both),
        vec![(
            "take_profit_percentage",
            ParameterSweep::Values {
                values: vec![1.0, 2.0],
            },
        )],
    );
    if let Some(opt) = config.optimization.as_mut() {
        opt.symbols = vec!["ETHUSDT".to_string(), "SOLUSDT".to_string()];
    }
    let source = InMemorySource::new().with(dataset("ETHUSDT", generate_flat_bars(50, 100.0), Vec::new()));

    let results = optimize(&config, &source).unwrap();
    assert_eq!(results.evaluations.len(), 2);
    assert_eq!(results.failures.len(), 2);
    assert!(results
        .failures
        .iter()
        .all(|f| f.point.symbol.as_str() == "SOLUSDT"));
}

#[test]
fn test_ranking_prefers_better_metric() {
    let mut bars = generate_trending_bars(100, 100.0, 0.1);
    bars[30].low = 99.0;
    let ds = dataset("ETHUSDT", bars, vec![liquidation_at(10, Side::Sell, 150_000.0)]);
    let mut config = with_ranges(
        base_config(Modus::Buy),
        vec![(
            "take_profit_percentage",
            ParameterSweep::Values {
                values: vec![0.5, 5.0],
            },
        )],
    );
    if let Some(opt) = config.optimization.as_mut() {
        opt.target_metrics = vec!["Equity Final [$]".to_string(), "max_drawdown".to_string()];
    }

    let results = optimize(&config, &InMemorySource::new().with(ds)).unwrap();
    assert_eq!(results.rankings.len(), 2);

    let best = results.best(TargetMetric::EquityFinal).unwrap();
    let ranked: Vec<f64> = results
        .ranked(TargetMetric::EquityFinal)
        .map(|e| e.report.metrics.equity_final)
        .collect();
    assert_eq!(ranked.len(), 2);
    assert!(ranked[0] >= ranked[1]);
    assert_eq!(best.report.metrics.equity_final, ranked[0]);

    let drawdowns: Vec<f64> = results
        .ranked(TargetMetric::MaxDrawdown)
        .map(|e| e.report.metrics.max_drawdown)
        .collect();
    assert!(drawdowns[0] <= drawdowns[1]);
}

#[test]
fn test_zero_budget_returns_partial_results() {
    let config = with_ranges(
        base_config(Modus::Both),
        vec![(
            "stop_loss_percentage",
            ParameterSweep::Values {
                values: vec![1.0, 2.0, 3.0],
            },
        )],
    );
    let source = InMemorySource::new().with(dataset("ETHUSDT", generate_flat_bars(50, 100.0), Vec::new()));

    let result = Optimizer::new(config)
        .with_control(SweepControl::new().with_budget(std::time::Duration::ZERO))
        .run(&source);

    match result {
        Err(BacktestError::SweepTimeout {
            completed,
            total,
            partial,
            ..
        }) => {
            assert_eq!(total, 3);
            assert!(completed < total);
            assert!(partial.cancelled);
            assert_eq!(partial.evaluations.len(), completed);
        }
        other => panic!("expected SweepTimeout, got {:?}", other.map(|r| r.total_points)),
    }
}

#[test]
fn test_budget_keeps_points_completed_before_timeout() {
    let liqs: Vec<LiquidationEvent> = (0..20_000)
        .step_by(500)
        .map(|i| liquidation_at(i, Side::Sell, 150_000.0))
        .collect();
    let ds = dataset("ETHUSDT", generate_flat_bars(20_000, 100.0), liqs);
    let mut config = with_ranges(
        base_config(Modus::Both),
        vec![(
            "take_profit_percentage",
            ParameterSweep::Range {
                start: 0.1,
                end: 100.0,
                step: 0.1,
            },
        )],
    );
    if let Some(opt) = config.optimization.as_mut() {
        opt.sequential = true;
    }

    let result = Optimizer::new(config)
        .with_control(SweepControl::new().with_budget(std::time::Duration::from_millis(20)))
        .run(&InMemorySource::new().with(ds));

    match result {
        Err(BacktestError::SweepTimeout {
            completed,
            total,
            partial,
            ..
        }) => {
            assert_eq!(total, 1000);
            assert!(completed > 0);
            assert!(completed < total);
            assert!(partial.cancelled);
            assert_eq!(partial.evaluations.len(), completed);

            // sequential runs finish a prefix of the grid
            let mut indices: Vec<usize> = partial.evaluations.iter().map(|e| e.point.index).collect();
            indices.sort_unstable();
            assert_eq!(indices, (0..completed).collect::<Vec<_>>());

            let mut order = partial.rankings[0].order.clone();
            order.sort_unstable();
            assert_eq!(order, (0..completed).collect::<Vec<_>>());
        }
        other => panic!("expected SweepTimeout, got {:?}", other.map(|r| r.total_points)),
    }
}

#[test]
fn test_cancelled_sweep_reports_cancellation() {
    let config = with_ranges(
        base_config(Modus::Both),
        vec![(
            "stop_loss_percentage",
            ParameterSweep::Values {
                values: vec![1.0, 2.0],
            },
        )],
    );
    let source = InMemorySource::new().with(dataset("ETHUSDT", generate_flat_bars(50, 100.0), Vec::new()));

    let control = SweepControl::new();
    control.cancel();
    let results = Optimizer::new(config).with_control(control).run(&source).unwrap();

    assert!(results.cancelled);
    assert!(results.evaluations.is_empty());
    assert_eq!(results.total_points, 2);
}

// =============================================================================
// CSV round trip
// =============================================================================

#[test]
fn test_optimize_from_csv_files() {
    let dir = std::env::temp_dir().join(format!("liqbt_it_{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();

    let mut prices = String::from("datetime,open,high,low,close,volume\n");
    for bar in generate_trending_bars(60, 100.0, 0.1) {
        prices.push_str(&format!(
            "{},{},{},{},{},{}\n",
            bar.timestamp.format("%Y-%m-%d %H:%M:%S"),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume
        ));
    }
    fs::write(dir.join("ETHUSDT_5m.csv"), prices).unwrap();

    let liq = liquidation_at(5, Side::Sell, 250_000.0);
    let liquidations = format!(
        "timestamp,side,cumulated_usd_size\n{},sell,{}\n",
        liq.timestamp.timestamp_millis(),
        liq.notional_usd
    );
    fs::write(dir.join("ETHUSDT_liquidations.csv"), liquidations).unwrap();

    let config = with_ranges(
        base_config(Modus::Both),
        vec![(
            "take_profit_percentage",
            ParameterSweep::Values {
                values: vec![1.0, 2.0],
            },
        )],
    );
    let source = CsvDataSource::new(&dir, 0);
    let (start, end) = config.date_range().unwrap();
    let ds = source.load(&config.symbol(), &config.timeframe().unwrap(), start, end).unwrap();
    assert_eq!(ds.len(), 60);
    assert_eq!(ds.liquidations().len(), 1);

    let results = optimize(&config, &source).unwrap();
    assert_eq!(results.evaluations.len(), 2);
    assert!(results
        .evaluations
        .iter()
        .all(|e| e.report.metrics.total_trades == 1));

    fs::remove_dir_all(&dir).ok();
}
