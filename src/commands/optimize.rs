//! Optimize command implementation with progress tracking and result persistence

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use liquidation_backtester::optimizer::{EvaluatedPoint, GridPoint, SweepParam};
use liquidation_backtester::{
    BacktestError, Config, Modus, Optimizer, PerformanceMetrics, RankedResults, TargetMetric, Trade,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use super::{csv_source, load_config, Overrides};

/// Command line arguments of `optimize`
pub struct OptimizeArgs {
    pub config_path: String,
    pub overrides: Overrides,
    pub symbols: Option<String>,
    pub strategies: Option<String>,
    pub modi: Option<String>,
    pub metrics: Option<String>,
    pub top: usize,
    pub sequential: bool,
    pub max_duration: Option<u64>,
    pub save: bool,
}

/// Parse comma-separated values, dropping blanks
fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .collect()
}

/// Best grid point of one (symbol, strategy, modus) group, as written to disk
#[derive(Serialize)]
struct SavedResult<'a> {
    target_metric: TargetMetric,
    metric_value: f64,
    generated_at: DateTime<Utc>,
    start_date: &'a str,
    end_date: &'a str,
    timeframe: &'a str,
    point: &'a GridPoint,
    metrics: &'a PerformanceMetrics,
    terminated_early: bool,
    trades: &'a [Trade],
}

pub fn run(args: OptimizeArgs) -> Result<()> {
    info!("Starting optimization");

    let mut config = load_config(&args.config_path, args.overrides)?;
    let opt = config.optimization.get_or_insert_with(Default::default);

    if let Some(symbols) = &args.symbols {
        opt.symbols = parse_list(symbols).into_iter().map(|s| s.to_uppercase()).collect();
    }
    if let Some(strategies) = &args.strategies {
        opt.strategies = parse_list(strategies);
    }
    if let Some(modi) = &args.modi {
        opt.modi = parse_list(modi)
            .iter()
            .map(|m| Modus::from_str(m).map_err(anyhow::Error::msg))
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(metrics) = &args.metrics {
        opt.target_metrics = parse_list(metrics);
    }
    if args.sequential {
        opt.sequential = true;
    }
    if let Some(secs) = args.max_duration {
        opt.max_duration_secs = Some(secs);
    }

    config.validate().context("Invalid configuration")?;

    let optimizer = Optimizer::new(config.clone());
    let grid = optimizer.grid()?;
    if grid.is_empty() {
        bail!("Optimization grid is empty");
    }

    let Some(opt) = config.optimization.as_ref() else {
        bail!("Missing optimization section");
    };
    let target_metrics = opt.parsed_target_metrics()?;
    let swept: Vec<SweepParam> = opt
        .ranges
        .keys()
        .filter_map(|k| SweepParam::from_str(k).ok())
        .collect();

    println!("\n{}", "=".repeat(70));
    println!("OPTIMIZATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!(
        "  Symbols:       {}",
        grid.symbols()
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Timeframe:     {}", config.backtest.timeframe);
    println!(
        "  Period:        {} .. {}",
        config.backtest.start_date_iso, config.backtest.end_date_iso
    );
    println!(
        "  Parameters:    {}",
        swept.iter().map(|p| p.key()).collect::<Vec<_>>().join(", ")
    );
    println!(
        "  Metrics:       {}",
        target_metrics
            .iter()
            .map(|m| m.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Total tests:   {}", grid.len());
    println!(
        "  Mode:          {}",
        if opt.sequential { "sequential" } else { "parallel" }
    );
    if let Some(secs) = opt.max_duration_secs {
        println!("  Time budget:   {}s", secs);
    }
    println!("{}\n", "=".repeat(70));

    let pb = ProgressBar::new(grid.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("⚡ {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}, {per_sec:.2}] ✓ {msg}")?
            .progress_chars("█░ "),
    );

    let source = csv_source(&config);
    let outcome = optimizer.with_progress(pb.clone()).run(&source);

    let results = match outcome {
        Ok(results) => results,
        Err(BacktestError::SweepTimeout {
            budget,
            completed,
            total,
            partial,
        }) => {
            warn!(
                "Time budget of {:?} exhausted after {}/{} grid points",
                budget, completed, total
            );
            println!(
                "\nTime budget exhausted: showing {} of {} grid points",
                completed, total
            );
            *partial
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e).context("Optimization failed");
        }
    };

    pb.finish_with_message(format!("{} evaluated", results.evaluations.len()));
    println!();

    for failed in &results.failures {
        warn!("Grid point {} failed: {}", failed.point.index, failed.error);
    }
    if !results.failures.is_empty() {
        println!("{} grid point(s) failed, see log for details", results.failures.len());
    }

    if results.evaluations.is_empty() {
        info!("No valid results found.");
        return Ok(());
    }

    for &metric in &target_metrics {
        print_top(&results, metric, args.top, &swept);
    }

    if args.save {
        let written = save_best(&config, &results, &target_metrics)?;
        println!("\nSaved {} best result file(s) to {}", written, config.data.results_dir);
    }

    info!("Optimization completed successfully");

    Ok(())
}

fn format_params(point: &GridPoint, swept: &[SweepParam]) -> String {
    let mut parts: Vec<String> = swept
        .iter()
        .map(|p| format!("{}:{}", short_name(*p), p.get(&point.params)))
        .collect();
    if point.params.exit_on_opposite_signal {
        parts.push("exit-opp".to_string());
    }
    parts.join(" ")
}

fn short_name(param: SweepParam) -> &'static str {
    match param {
        SweepParam::BuyThreshold => "BuyTh",
        SweepParam::SellThreshold => "SellTh",
        SweepParam::StopLoss => "SL",
        SweepParam::TakeProfit => "TP",
        SweepParam::Slippage => "Slip",
        SweepParam::PositionSizeFraction => "Frac",
        SweepParam::AverageMultiplier => "AvgX",
        SweepParam::CooldownCandles => "Cool",
    }
}

fn print_top(results: &RankedResults, metric: TargetMetric, top: usize, swept: &[SweepParam]) {
    let ranked: Vec<&EvaluatedPoint> = results.ranked(metric).take(top).collect();

    println!("\n{}", "=".repeat(120));
    println!("TOP {} OPTIMIZATION RESULTS (sorted by {})", ranked.len(), metric);
    println!("{}", "=".repeat(120));
    println!(
        "{:<4} {:>9} {:>9} {:>8} {:>8} {:>6} | {:<10} {:<15} {:<4} | Parameters",
        "Rank", "Value", "Return%", "MaxDD%", "WinR%", "Trades", "Symbol", "Strategy", "Mode"
    );
    println!("{}", "-".repeat(120));

    for (i, eval) in ranked.iter().enumerate() {
        let m = &eval.report.metrics;
        let p = &eval.point;
        println!(
            "{:<4} {:>9.2} {:>9.2} {:>8.2} {:>8.2} {:>6} | {:<10} {:<15} {:<4} | {}",
            i + 1,
            metric.value(m),
            m.total_return,
            m.max_drawdown,
            m.win_rate,
            m.total_trades,
            p.symbol.to_string(),
            p.strategy.to_string(),
            p.modus.to_string(),
            format_params(p, swept)
        );
    }
    println!("{}", "=".repeat(120));
}

fn result_path(results_dir: &Path, point: &GridPoint, metric: TargetMetric) -> PathBuf {
    results_dir
        .join(point.symbol.as_str())
        .join(point.strategy.id())
        .join(point.modus.to_string())
        .join(format!("best_{}.json", metric.slug()))
}

/// Write the best point of every (symbol, strategy, modus) group per metric
fn save_best(config: &Config, results: &RankedResults, metrics: &[TargetMetric]) -> Result<usize> {
    let results_dir = PathBuf::from(&config.data.results_dir);
    let generated_at = Utc::now();
    let mut written = 0;

    for &metric in metrics {
        for eval in results.best_per_group(metric) {
            let path = result_path(&results_dir, &eval.point, metric);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }

            let saved = SavedResult {
                target_metric: metric,
                metric_value: metric.value(&eval.report.metrics),
                generated_at,
                start_date: &config.backtest.start_date_iso,
                end_date: &config.backtest.end_date_iso,
                timeframe: &config.backtest.timeframe,
                point: &eval.point,
                metrics: &eval.report.metrics,
                terminated_early: eval.report.terminated_early,
                trades: &eval.report.trades,
            };
            let json = serde_json::to_string_pretty(&saved).context("Failed to serialize result")?;
            fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Saved best {} for {} to {}", metric, eval.point.symbol, path.display());
            written += 1;
        }
    }

    Ok(written)
}
