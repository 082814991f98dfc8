//! Liquidation backtester - main entry point
//!
//! This binary provides two subcommands:
//! - backtest: Run a single liquidation strategy backtest
//! - optimize: Grid-search strategy parameters

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::Overrides;

#[derive(Parser, Debug)]
#[command(name = "liquidation-backtester")]
#[command(about = "Backtest and optimize liquidation-driven crypto strategies", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single backtest
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/ethusdt_5m.json")]
        config: String,

        #[command(flatten)]
        overrides: Overrides,

        /// Print every closed trade
        #[arg(long)]
        trades: bool,
    },

    /// Grid-search strategy parameters from the config's optimization section
    Optimize {
        /// Path to configuration file with an optimization section
        #[arg(short, long, default_value = "configs/ethusdt_5m.json")]
        config: String,

        #[command(flatten)]
        overrides: Overrides,

        /// Symbols to sweep (comma-separated), replaces optimization.symbols
        #[arg(long)]
        symbols: Option<String>,

        /// Strategies to sweep (comma-separated), replaces optimization.strategies
        #[arg(long)]
        strategies: Option<String>,

        /// Modi to sweep (comma-separated buy,sell,both), replaces optimization.modi
        #[arg(long)]
        modi: Option<String>,

        /// Target metrics (comma-separated), e.g. "sharpe,Sortino Ratio"
        #[arg(long)]
        metrics: Option<String>,

        /// Number of top results to show per metric
        #[arg(short, long, default_value = "10")]
        top: usize,

        /// Run sequentially instead of parallel
        #[arg(long)]
        sequential: bool,

        /// Stop dispatching new grid points after this many seconds
        #[arg(long)]
        max_duration: Option<u64>,

        /// Do not write best results to the results directory
        #[arg(long)]
        no_save: bool,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if file_only {
        // Console stays clean for the progress bar
        let file_appender = tracing_appender::rolling::never("logs", &log_filename);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        let file_appender = tracing_appender::rolling::never("logs", &log_filename);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Backtest { .. } => ("backtest", false),
        Commands::Optimize { .. } => ("optimize", true),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Backtest {
            config,
            overrides,
            trades,
        } => commands::backtest::run(config, overrides, trades),

        Commands::Optimize {
            config,
            overrides,
            symbols,
            strategies,
            modi,
            metrics,
            top,
            sequential,
            max_duration,
            no_save,
        } => commands::optimize::run(commands::optimize::OptimizeArgs {
            config_path: config,
            overrides,
            symbols,
            strategies,
            modi,
            metrics,
            top,
            sequential,
            max_duration,
            save: !no_save,
        }),
    }
}
