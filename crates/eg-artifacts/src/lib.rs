//! Run-artifact writer: `exports/<run_id>/manifest.json` plus the CSV/JSON
//! report a backtest or live run leaves behind.
//!
//! Grounded on `mqk-artifacts::init_run_artifacts` /
//! `write_backtest_report`: same placeholder-then-overwrite discipline, same
//! manifest shape (schema version, run id, engine id, mode, hashes), adapted
//! to this crate's `PortfolioReport` instead of `mqk-backtest::BacktestReport`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use eg_portfolio::PortfolioReport;
use eg_schemas::ExitReason;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: i32,
    pub run_id: String,
    pub engine_id: String,
    pub mode: String,
    pub config_hash: String,
    pub created_at_utc: DateTime<Utc>,
    pub artifacts: ArtifactList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactList {
    pub manifest_json: String,
    pub trades_csv: String,
    pub skipped_csv: String,
    pub fills_csv: String,
    pub equity_curve_csv: String,
    pub metrics_json: String,
}

pub struct InitRunArtifactsArgs<'a> {
    pub exports_root: &'a Path,
    pub schema_version: i32,
    pub run_id: &'a str,
    pub engine_id: &'a str,
    pub mode: &'a str,
    pub config_hash: &'a str,
    pub created_at_utc: DateTime<Utc>,
}

pub struct InitRunArtifactsResult {
    pub run_dir: PathBuf,
    pub manifest_path: PathBuf,
}

/// Creates `exports/<run_id>/` with placeholder CSVs (if absent) and an
/// overwritten `manifest.json`. Called at the start of every run so a crash
/// mid-run still leaves a manifest behind for the CLI's `db status` to find.
pub fn init_run_artifacts(args: InitRunArtifactsArgs<'_>) -> Result<InitRunArtifactsResult> {
    let run_dir = args.exports_root.join(args.run_id);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("create exports dir failed: {}", run_dir.display()))?;

    ensure_file_exists_with(
        &run_dir.join("trades.csv"),
        "ticker,grade,grade_source,score,report_date,entry_date,entry_price,exit_date,exit_price,shares,invested,pnl,return_pct,holding_days,exit_reason\n",
    )?;
    ensure_file_exists_with(
        &run_dir.join("skipped.csv"),
        "ticker,report_date,grade,score,skip_reason\n",
    )?;
    ensure_file_exists_with(&run_dir.join("fills.csv"), "exit_date,ticker,side,qty,price\n")?;
    ensure_file_exists_with(&run_dir.join("equity_curve.csv"), "exit_date,realized_equity\n")?;
    ensure_file_exists_with(&run_dir.join("metrics.json"), "{}\n")?;

    let manifest = RunManifest {
        schema_version: args.schema_version,
        run_id: args.run_id.to_string(),
        engine_id: args.engine_id.to_string(),
        mode: args.mode.to_string(),
        config_hash: args.config_hash.to_string(),
        created_at_utc: args.created_at_utc,
        artifacts: ArtifactList {
            manifest_json: "manifest.json".to_string(),
            trades_csv: "trades.csv".to_string(),
            skipped_csv: "skipped.csv".to_string(),
            fills_csv: "fills.csv".to_string(),
            equity_curve_csv: "equity_curve.csv".to_string(),
            metrics_json: "metrics.json".to_string(),
        },
    };

    let manifest_path = run_dir.join("manifest.json");
    let json = serde_json::to_string_pretty(&manifest).context("serialize manifest failed")?;
    fs::write(&manifest_path, format!("{json}\n"))
        .with_context(|| format!("write manifest failed: {}", manifest_path.display()))?;

    Ok(InitRunArtifactsResult { run_dir, manifest_path })
}

fn ensure_file_exists_with(path: &Path, contents_if_create: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, contents_if_create)
        .with_context(|| format!("create placeholder failed: {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct BacktestMetrics<'a> {
    schema_version: i32,
    trades: usize,
    skipped: usize,
    wins: usize,
    losses: usize,
    total_pnl: f64,
    final_realized_equity: f64,
    win_rate_pct: f64,
    symbols: Vec<&'a str>,
}

/// Writes `trades.csv`, `skipped.csv`, `fills.csv`, `equity_curve.csv` and
/// `metrics.json` into `run_dir` (overwriting). The equity curve here is a
/// running sum of realized P&L ordered by exit date — this engine has no
/// mark-to-market pricing of still-open positions, unlike a tick-level
/// backtester, so "equity" means realized equity at each close, not NAV.
pub fn write_backtest_report(run_dir: &Path, report: &PortfolioReport) -> Result<()> {
    fs::create_dir_all(run_dir)
        .with_context(|| format!("create backtest artifacts dir failed: {}", run_dir.display()))?;

    let mut trades_csv = String::from(
        "ticker,grade,grade_source,score,report_date,entry_date,entry_price,exit_date,exit_price,shares,invested,pnl,return_pct,holding_days,exit_reason\n",
    );
    let mut sorted_trades = report.trades.clone();
    sorted_trades.sort_by(|a, b| a.exit_date.cmp(&b.exit_date).then(a.ticker.cmp(&b.ticker)));
    for t in &sorted_trades {
        trades_csv.push_str(&format!(
            "{},{:?},{:?},{},{},{},{},{},{},{},{},{},{},{},{}\n",
            t.ticker,
            t.grade,
            t.grade_source,
            t.score.map(|s| s.to_string()).unwrap_or_default(),
            t.report_date,
            t.entry_date,
            t.entry_price,
            t.exit_date,
            t.exit_price,
            t.shares,
            t.invested,
            t.pnl,
            t.return_pct,
            t.holding_days,
            exit_reason_str(t.exit_reason),
        ));
    }
    let trades_path = run_dir.join("trades.csv");
    fs::write(&trades_path, trades_csv)
        .with_context(|| format!("write trades.csv failed: {}", trades_path.display()))?;

    let mut skipped_csv = String::from("ticker,report_date,grade,score,skip_reason\n");
    let mut sorted_skipped = report.skipped.clone();
    sorted_skipped.sort_by(|a, b| a.report_date.cmp(&b.report_date).then(a.ticker.cmp(&b.ticker)));
    for s in &sorted_skipped {
        skipped_csv.push_str(&format!(
            "{},{},{:?},{},{:?}\n",
            s.ticker,
            s.report_date,
            s.grade,
            s.score.map(|v| v.to_string()).unwrap_or_default(),
            s.skip_reason,
        ));
    }
    let skipped_path = run_dir.join("skipped.csv");
    fs::write(&skipped_path, skipped_csv)
        .with_context(|| format!("write skipped.csv failed: {}", skipped_path.display()))?;

    let mut fills_csv = String::from("exit_date,ticker,side,qty,price\n");
    for t in &sorted_trades {
        fills_csv.push_str(&format!("{},{},SELL,{},{}\n", t.exit_date, t.ticker, t.shares, t.exit_price));
    }
    let fills_path = run_dir.join("fills.csv");
    fs::write(&fills_path, fills_csv)
        .with_context(|| format!("write fills.csv failed: {}", fills_path.display()))?;

    let mut eq_csv = String::from("exit_date,realized_equity\n");
    let mut running = 0.0;
    for t in &sorted_trades {
        running += t.pnl;
        eq_csv.push_str(&format!("{},{}\n", t.exit_date, round2(running)));
    }
    let eq_path = run_dir.join("equity_curve.csv");
    fs::write(&eq_path, eq_csv)
        .with_context(|| format!("write equity_curve.csv failed: {}", eq_path.display()))?;

    let wins = sorted_trades.iter().filter(|t| t.pnl > 0.0).count();
    let losses = sorted_trades.iter().filter(|t| t.pnl < 0.0).count();
    let total_pnl: f64 = sorted_trades.iter().map(|t| t.pnl).sum();
    let mut symbols: Vec<&str> = sorted_trades.iter().map(|t| t.ticker.as_str()).collect();
    symbols.sort();
    symbols.dedup();

    let metrics = BacktestMetrics {
        schema_version: 1,
        trades: sorted_trades.len(),
        skipped: report.skipped.len(),
        wins,
        losses,
        total_pnl: round2(total_pnl),
        final_realized_equity: round2(running),
        win_rate_pct: if sorted_trades.is_empty() {
            0.0
        } else {
            round2(wins as f64 / sorted_trades.len() as f64 * 100.0)
        },
        symbols,
    };

    let metrics_path = run_dir.join("metrics.json");
    let json = serde_json::to_string_pretty(&metrics).context("serialize metrics failed")?;
    fs::write(&metrics_path, format!("{json}\n"))
        .with_context(|| format!("write metrics.json failed: {}", metrics_path.display()))?;

    Ok(())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn exit_reason_str(r: ExitReason) -> &'static str {
    match r {
        ExitReason::StopLoss => "stop_loss",
        ExitReason::MaxHolding => "max_holding",
        ExitReason::EndOfData => "end_of_data",
        ExitReason::TrendBreak => "trend_break",
        ExitReason::RotatedOut => "rotated_out",
    }
}

/// Deterministic run-id: `sig_{trade_date}_{uuid5}` / `exec-{trade_date}-{uuid5}`,
/// namespaced over the run's own inputs instead of `uuid::new_v4`, so a
/// backtest replay with identical inputs reproduces the identical run id.
pub fn deterministic_run_id(prefix: &str, trade_date: chrono::NaiveDate, seed: &str) -> String {
    let namespace = Uuid::NAMESPACE_URL;
    let name = format!("{prefix}:{trade_date}:{seed}");
    let id = Uuid::new_v5(&namespace, name.as_bytes());
    match prefix {
        "sig" => format!("sig_{trade_date}_{id}"),
        "exec" => format!("exec-{trade_date}-{id}"),
        other => format!("{other}_{trade_date}_{id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use eg_schemas::{Grade, GradeSource, SkipReason, SkippedTrade, TradeResult};
    use tempfile::tempdir;

    fn trade(ticker: &str, exit_date: &str, pnl: f64) -> TradeResult {
        TradeResult {
            ticker: ticker.to_string(),
            grade: Grade::A,
            grade_source: GradeSource::Json,
            score: Some(1.0),
            report_date: "2026-01-01".parse().unwrap(),
            entry_date: "2026-01-02".parse().unwrap(),
            entry_price: 10.0,
            exit_date: exit_date.parse().unwrap(),
            exit_price: 10.0 + pnl / 100.0,
            shares: 100,
            invested: 1000.0,
            pnl,
            return_pct: pnl / 1000.0 * 100.0,
            holding_days: 3,
            exit_reason: ExitReason::StopLoss,
            gap_size: None,
            company_name: None,
        }
    }

    #[test]
    fn init_run_artifacts_creates_placeholders_and_manifest() {
        let dir = tempdir().unwrap();
        let result = init_run_artifacts(InitRunArtifactsArgs {
            exports_root: dir.path(),
            schema_version: 1,
            run_id: "exec-2026-01-05-test",
            engine_id: "eg-executor",
            mode: "backtest",
            config_hash: "deadbeef",
            created_at_utc: Utc::now(),
        })
        .unwrap();

        assert!(result.manifest_path.exists());
        assert!(result.run_dir.join("trades.csv").exists());
        assert!(result.run_dir.join("equity_curve.csv").exists());
    }

    #[test]
    fn write_backtest_report_sorts_by_exit_date_and_sums_equity() {
        let dir = tempdir().unwrap();
        let report = PortfolioReport {
            trades: vec![trade("WIDG", "2026-01-10", 50.0), trade("ACME", "2026-01-05", -20.0)],
            skipped: vec![SkippedTrade {
                ticker: "ZED".to_string(),
                report_date: "2026-01-01".parse::<NaiveDate>().unwrap(),
                grade: Grade::C,
                score: Some(0.1),
                skip_reason: SkipReason::CapacityFull,
            }],
        };
        write_backtest_report(dir.path(), &report).unwrap();

        let eq = fs::read_to_string(dir.path().join("equity_curve.csv")).unwrap();
        let lines: Vec<&str> = eq.lines().collect();
        assert_eq!(lines[1], "2026-01-05,-20");
        assert_eq!(lines[2], "2026-01-10,30");

        let metrics = fs::read_to_string(dir.path().join("metrics.json")).unwrap();
        assert!(metrics.contains("\"trades\": 2"));
        assert!(metrics.contains("\"skipped\": 1"));
    }

    #[test]
    fn deterministic_run_id_is_stable_across_calls() {
        let date: NaiveDate = "2026-01-05".parse().unwrap();
        let a = deterministic_run_id("sig", date, "ema_p10");
        let b = deterministic_run_id("sig", date, "ema_p10");
        assert_eq!(a, b);
        assert!(a.starts_with("sig_2026-01-05_"));
    }
}
