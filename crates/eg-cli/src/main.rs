//! eg-cli
//!
//! Thin command surface over the earnings-gap crates: this is the only
//! place in the workspace that calls `std::process::exit` — every library
//! crate returns a typed `Result`/outcome enum and leaves exit-code mapping
//! to main.

mod adapters;
mod candidates;

use adapters::{AlpacaPositionSource, CsvPriceSource};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use eg_config::{LiveConfig, RunMode};
use eg_portfolio::{PortfolioConfig, PortfolioSimulator};
use eg_schemas::{EntryMode, Grade, StopMode, TrailingMode};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "eg")]
#[command(about = "Earnings-gap backtest and live paper-trading engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Kill switch commands
    KillSwitch {
        #[command(subcommand)]
        cmd: KillSwitchCmd,
    },

    /// Generate today's execution + shadow signal files (C6)
    SignalGen {
        /// CSV of ranked candidates for the trade date
        #[arg(long)]
        candidates: PathBuf,
        #[arg(long)]
        trade_date: NaiveDate,
        /// Layered config YAML paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
        /// Directory holding one `{ticker}.csv` price file per ticker
        #[arg(long)]
        price_data_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Drive the order executor against a signal file (C8)
    Execute {
        #[arg(long)]
        signals: PathBuf,
        #[arg(long)]
        trade_date: NaiveDate,
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
        #[arg(value_enum, long)]
        phase: ExecPhase,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        skip_time_check: bool,
    },

    /// Run the portfolio simulator end to end over a candidates file and a
    /// price-data directory (C5)
    Backtest {
        #[arg(long)]
        candidates: PathBuf,
        #[arg(long)]
        price_data_dir: PathBuf,
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
        #[arg(long)]
        exports_root: PathBuf,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ExecPhase {
    Place,
    Poll,
    All,
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum KillSwitchCmd {
    On,
    Off,
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(%err, "command failed");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = eg_store::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = eg_store::status(&pool).await?;
                    println!("db_ok={} has_positions_table={}", s.ok, s.has_positions_table);
                }
                DbCmd::Migrate => {
                    eg_store::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::KillSwitch { cmd } => {
            let pool = eg_store::connect_from_env().await?;
            match cmd {
                KillSwitchCmd::On => {
                    eg_store::set_kill_switch(&pool, true).await?;
                    println!("kill_switch=on");
                }
                KillSwitchCmd::Off => {
                    eg_store::set_kill_switch(&pool, false).await?;
                    println!("kill_switch=off");
                }
                KillSwitchCmd::Status => {
                    let engaged = eg_store::kill_switch_engaged(&pool).await?;
                    println!("kill_switch={}", if engaged { "on" } else { "off" });
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::SignalGen {
            candidates,
            trade_date,
            config_paths,
            price_data_dir,
            output_dir,
            force,
            dry_run,
        } => signal_gen(candidates, trade_date, config_paths, price_data_dir, output_dir, force, dry_run).await,

        Commands::Execute {
            signals,
            trade_date,
            config_paths,
            phase,
            dry_run,
            skip_time_check,
        } => execute(signals, trade_date, config_paths, phase, dry_run, skip_time_check).await,

        Commands::Backtest { candidates, price_data_dir, config_paths, exports_root } => {
            backtest(candidates, price_data_dir, config_paths, exports_root)
        }
    }
}

fn live_config_from_yaml(config_paths: &[String]) -> Result<(LiveConfig, serde_json::Value)> {
    let path_refs: Vec<&str> = config_paths.iter().map(String::as_str).collect();
    let loaded = eg_config::load_layered_yaml(&path_refs)?;
    let config: LiveConfig =
        serde_json::from_value(loaded.config_json.clone()).context("config yaml does not match LiveConfig shape")?;
    config.validate().map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    Ok((config, loaded.config_json))
}

async fn signal_gen(
    candidates_path: PathBuf,
    trade_date: NaiveDate,
    config_paths: Vec<String>,
    price_data_dir: PathBuf,
    output_dir: PathBuf,
    force: bool,
    dry_run: bool,
) -> Result<ExitCode> {
    let (config, config_json) = live_config_from_yaml(&config_paths)?;
    let secrets = eg_config::resolve_secrets_for_mode(&config_json, RunMode::Paper)?;

    let pool = eg_store::connect_from_env().await?;
    let candidates = candidates::load_candidates_csv(&candidates_path)?;
    let price_source = CsvPriceSource::new(price_data_dir);

    let broker = match (&secrets.broker_api_key, &secrets.broker_api_secret) {
        (Some(key), Some(secret)) => Some(eg_broker::AlpacaClient::new(key, secret, None, false)?),
        _ => None,
    };
    let position_source = broker.as_ref().map(AlpacaPositionSource::new);
    let position_source_ref: Option<&dyn eg_signals::PositionSource> =
        position_source.as_ref().map(|p| p as &dyn eg_signals::PositionSource);

    let run_id = eg_artifacts::deterministic_run_id("sig", trade_date, "signal-gen");
    let outcome = eg_signals::generate_signals(
        &pool,
        &config,
        &price_source,
        position_source_ref,
        &candidates,
        trade_date,
        &run_id,
        Utc::now(),
        force,
        dry_run,
    )
    .await?;

    match outcome {
        eg_signals::SignalOutcome::Generated(bundle) => {
            eg_signals::write_signal_file(&output_dir, trade_date, "ema_p10", &bundle.ema_p10)?;
            eg_signals::write_signal_file(&output_dir, trade_date, "nwl_p4", &bundle.nwl_p4)?;
            println!("run_id={run_id}");
            println!(
                "ema_p10: exits={} entries={} skipped={}",
                bundle.ema_p10.summary.total_exits,
                bundle.ema_p10.summary.total_entries,
                bundle.ema_p10.summary.total_skipped
            );
            println!(
                "nwl_p4: exits={} entries={} skipped={}",
                bundle.nwl_p4.summary.total_exits,
                bundle.nwl_p4.summary.total_entries,
                bundle.nwl_p4.summary.total_skipped
            );
            Ok(ExitCode::SUCCESS)
        }
        eg_signals::SignalOutcome::KillSwitchEngaged => {
            eprintln!("kill switch engaged; refusing to generate signals");
            Ok(ExitCode::from(3))
        }
        eg_signals::SignalOutcome::PositionMismatch(lines) => {
            eprintln!("position reconciliation mismatch:");
            for line in lines {
                eprintln!("  {line}");
            }
            Ok(ExitCode::from(4))
        }
    }
}

async fn execute(
    signals_path: PathBuf,
    trade_date: NaiveDate,
    config_paths: Vec<String>,
    phase: ExecPhase,
    dry_run: bool,
    skip_time_check: bool,
) -> Result<ExitCode> {
    let (config, config_json) = live_config_from_yaml(&config_paths)?;
    let secrets = eg_config::resolve_secrets_for_mode(&config_json, RunMode::Paper)?;

    let pool = eg_store::connect_from_env().await?;
    let broker = match (&secrets.broker_api_key, &secrets.broker_api_secret) {
        (Some(key), Some(secret)) => Some(eg_broker::AlpacaClient::new(key, secret, None, false)?),
        _ => None,
    };
    let run_id = eg_executor::generate_run_id(trade_date);

    let outcome = if matches!(phase, ExecPhase::Poll) {
        eg_executor::execute_poll_phase(&pool, broker.as_ref(), trade_date, &run_id, dry_run).await?
    } else {
        let raw = std::fs::read_to_string(&signals_path)
            .with_context(|| format!("read signal file: {}", signals_path.display()))?;
        let signals: eg_signals::SignalFile = serde_json::from_str(&raw).context("parse signal file")?;
        let skip_poll = matches!(phase, ExecPhase::Place);
        eg_executor::execute_signals(
            &pool,
            &config,
            broker.as_ref(),
            &signals,
            trade_date,
            &run_id,
            dry_run,
            skip_time_check,
            skip_poll,
        )
        .await?
    };

    match outcome {
        eg_executor::ExecutionOutcome::Completed(summary) => {
            println!("run_id={run_id}");
            println!(
                "exits_executed={} entries_executed={} skipped={}",
                summary.exits_executed, summary.entries_executed, summary.skipped
            );
            Ok(ExitCode::SUCCESS)
        }
        eg_executor::ExecutionOutcome::KillSwitchEngaged => {
            eprintln!("kill switch engaged; refusing to execute");
            Ok(ExitCode::from(3))
        }
        eg_executor::ExecutionOutcome::WrongStrategy(strategy) => {
            eprintln!("refusing to execute signal file with strategy '{strategy}' (expected ema_p10)");
            Ok(ExitCode::from(5))
        }
        eg_executor::ExecutionOutcome::OpgAllPhaseIncompatible => {
            eprintln!("--phase all is incompatible with entry_tif=opg; use --phase place then --phase poll");
            Ok(ExitCode::from(6))
        }
        eg_executor::ExecutionOutcome::KillSwitchTripped { reason, partial } => {
            eprintln!("kill switch engaged mid-run: {reason}");
            eprintln!(
                "partial: exits_executed={} entries_executed={} skipped={}",
                partial.exits_executed, partial.entries_executed, partial.skipped
            );
            Ok(ExitCode::from(3))
        }
    }
}

fn backtest(
    candidates_path: PathBuf,
    price_data_dir: PathBuf,
    config_paths: Vec<String>,
    exports_root: PathBuf,
) -> Result<ExitCode> {
    let (config, _) = live_config_from_yaml(&config_paths)?;

    let candidates = candidates::load_candidates_csv(&candidates_path)?;
    let index = candidates::load_price_index(&price_data_dir, &candidates)?;

    let portfolio_config = PortfolioConfig {
        max_positions: config.max_positions,
        daily_entry_limit: config.daily_entry_limit as usize,
        position_size: config.position_size,
        stop_loss_pct: config.stop_loss_pct,
        slippage_pct: config.slippage_pct,
        stop_mode: StopMode::parse(&config.stop_mode).context("invalid stop_mode")?,
        entry_mode: EntryMode::parse(&config.entry_mode).context("invalid entry_mode")?,
        max_holding_days: config.max_holding_days,
        rotation: config.rotation,
        min_grade: parse_grade(&config.min_grade),
        trailing_mode: config
            .trailing_stop
            .as_deref()
            .and_then(TrailingMode::parse)
            .unwrap_or(TrailingMode::WeeklyEma),
        trailing_period: config.primary_trailing_period,
        trailing_transition_weeks: config.trailing_transition_weeks,
    };

    let simulator = PortfolioSimulator::new(portfolio_config).map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    let report = simulator.run(&candidates, &index);

    let run_id = format!("bt-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
    let init = eg_artifacts::init_run_artifacts(eg_artifacts::InitRunArtifactsArgs {
        exports_root: &exports_root,
        schema_version: 1,
        run_id: &run_id,
        engine_id: "eg-backtest",
        mode: "BACKTEST",
        config_hash: "n/a",
        created_at_utc: Utc::now(),
    })?;
    eg_artifacts::write_backtest_report(&init.run_dir, &report)?;

    println!("run_id={run_id}");
    println!("trades={} skipped={}", report.trades.len(), report.skipped.len());
    println!("report_dir={}", init.run_dir.display());
    Ok(ExitCode::SUCCESS)
}

fn parse_grade(s: &str) -> Grade {
    match s.trim().to_ascii_uppercase().as_str() {
        "A" => Grade::A,
        "B" => Grade::B,
        "C" => Grade::C,
        _ => Grade::D,
    }
}
