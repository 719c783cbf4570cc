//! eg-signals
//!
//! Turns a day's earnings-gap candidates plus the current open book into a
//! pair of signal files: the execution book (`ema_p10`) that the executor
//! actually trades, and a shadow book (`nwl_p4`) tracked purely for
//! comparison. Grounded on `signal_generator.py`'s `generate_signals` /
//! `_generate_ema_signals` / `_generate_shadow_signals` — kept as one
//! function per path since the two books share almost no state (they trail
//! different indicators) beyond the candidate list and slot math.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use eg_config::LiveConfig;
use eg_schemas::{
    Grade, PersistentPosition, ShadowPosition, TradeCandidate, TrailingMode,
};
use eg_trailstop::{PriceSource, TrailingStopChecker};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::path::Path;

/// A brokerage-reported open position, used only for reconciliation and for
/// picking the weakest holding during rotation. Kept as a narrow trait so
/// this crate never depends on `eg-broker`'s HTTP stack directly — a real
/// adapter wraps `eg_broker::AlpacaClient::get_positions`.
pub trait PositionSource {
    fn fetch_positions(&self) -> Result<Vec<BrokerPosition>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub ticker: String,
    pub qty: i64,
    pub unrealized_pl: f64,
}

#[derive(Debug)]
pub enum SignalOutcome {
    Generated(SignalBundle),
    KillSwitchEngaged,
    /// One line per mismatch (ticker-only / qty) found during reconciliation.
    PositionMismatch(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalBundle {
    pub ema_p10: SignalFile,
    pub nwl_p4: SignalFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalFile {
    pub trade_date: NaiveDate,
    pub strategy: String,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub exits: Vec<SignalExit>,
    pub entries: Vec<SignalEntry>,
    pub skipped: Vec<SignalSkip>,
    pub summary: SignalSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalExit {
    pub ticker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<i64>,
    pub reason: String,
    pub qty: u64,
    pub entry_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEntry {
    pub ticker: String,
    pub side: String,
    pub qty: u64,
    pub score: f64,
    pub grade: Grade,
    pub report_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    pub stop_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSkip {
    pub ticker: String,
    pub reason: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalSummary {
    pub total_exits: usize,
    pub total_entries: usize,
    pub total_skipped: usize,
    pub open_positions_before: usize,
    pub open_positions_after: usize,
}

fn parse_min_grade(s: &str) -> Grade {
    match s {
        "A" => Grade::A,
        "B" => Grade::B,
        "C" => Grade::C,
        _ => Grade::D,
    }
}

/// Filters by `min_grade` (inclusive) and sorts by score descending, ties
/// broken by ticker for determinism.
fn filter_candidates<'a>(candidates: &'a [TradeCandidate], min_grade: Grade) -> Vec<&'a TradeCandidate> {
    let mut filtered: Vec<&TradeCandidate> =
        candidates.iter().filter(|c| c.grade.rank() <= min_grade.rank()).collect();
    filtered.sort_by(|a, b| {
        b.score
            .unwrap_or(0.0)
            .partial_cmp(&a.score.unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.ticker.cmp(&b.ticker))
    });
    filtered
}

fn calculate_qty(price: f64, position_size: f64) -> u64 {
    if price <= 0.0 {
        return 0;
    }
    (position_size / price).floor() as u64
}

fn calculate_stop_price(price: f64, stop_loss_pct: f64) -> f64 {
    round2(price * (1.0 - stop_loss_pct / 100.0))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn reference_price(price_source: &dyn PriceSource, ticker: &str, trade_date: NaiveDate) -> Option<f64> {
    let start = trade_date - chrono::Duration::days(7);
    price_source
        .fetch_prices(ticker, start, trade_date)
        .ok()
        .and_then(|bars| bars.last().map(|b| b.open))
}

/// Finds the open position with the most negative unrealized P&L, as
/// reported by the brokerage. `None` if no DB position has a matching
/// brokerage position.
fn find_weakest_position<'a>(
    db_positions: &'a [PersistentPosition],
    broker_positions: &[BrokerPosition],
) -> Option<(&'a PersistentPosition, f64)> {
    db_positions
        .iter()
        .filter_map(|pos| {
            let broker = broker_positions.iter().find(|b| b.ticker == pos.ticker)?;
            Some((pos, broker.unrealized_pl))
        })
        .filter(|(_, pnl)| *pnl < 0.0)
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

/// Finds the shadow position with the worst score, used as the rotation
/// candidate — the shadow book has no brokerage P&L to draw on, so a lower
/// score stands in for weakness (grounded on `_find_weakest_shadow`'s
/// score-based heuristic).
fn find_weakest_shadow(shadow_positions: &[ShadowPosition]) -> Option<&ShadowPosition> {
    shadow_positions
        .iter()
        .min_by(|a, b| {
            a.score
                .unwrap_or(0.0)
                .partial_cmp(&b.score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

#[allow(clippy::too_many_arguments)]
pub async fn generate_signals(
    pool: &SqlitePool,
    config: &LiveConfig,
    price_source: &dyn PriceSource,
    position_source: Option<&dyn PositionSource>,
    candidates: &[TradeCandidate],
    trade_date: NaiveDate,
    run_id: &str,
    generated_at: DateTime<Utc>,
    force: bool,
    dry_run: bool,
) -> Result<SignalOutcome> {
    if eg_store::kill_switch_engaged(pool).await? {
        return Ok(SignalOutcome::KillSwitchEngaged);
    }

    let min_grade = parse_min_grade(&config.min_grade);
    let ranked = filter_candidates(candidates, min_grade);

    let db_positions = eg_store::get_open_positions(pool).await?;

    if let Some(source) = position_source {
        let broker_positions = source.fetch_positions()?;
        if let Some(mismatches) = reconcile_positions(&db_positions, &broker_positions) {
            if !force {
                return Ok(SignalOutcome::PositionMismatch(mismatches));
            }
            tracing::warn!(mismatches = ?mismatches, "continuing with --force despite position mismatch");
        }
        let ema = generate_ema_signals(
            config,
            price_source,
            Some(&broker_positions),
            &db_positions,
            &ranked,
            trade_date,
            run_id,
            generated_at,
        )?;
        let nwl =
            generate_shadow_signals(pool, config, price_source, &ranked, trade_date, run_id, generated_at, dry_run)
                .await?;
        return Ok(SignalOutcome::Generated(SignalBundle { ema_p10: ema, nwl_p4: nwl }));
    }

    let ema = generate_ema_signals(
        config,
        price_source,
        None,
        &db_positions,
        &ranked,
        trade_date,
        run_id,
        generated_at,
    )?;
    let nwl = generate_shadow_signals(pool, config, price_source, &ranked, trade_date, run_id, generated_at, dry_run)
        .await?;
    Ok(SignalOutcome::Generated(SignalBundle { ema_p10: ema, nwl_p4: nwl }))
}

/// Compares DB positions against brokerage positions by ticker set and
/// quantity. `None` if everything matches.
fn reconcile_positions(
    db_positions: &[PersistentPosition],
    broker_positions: &[BrokerPosition],
) -> Option<Vec<String>> {
    let db_tickers: BTreeSet<&str> = db_positions.iter().map(|p| p.ticker.as_str()).collect();
    let broker_tickers: BTreeSet<&str> = broker_positions.iter().map(|p| p.ticker.as_str()).collect();

    let mut mismatches = Vec::new();
    for ticker in db_tickers.difference(&broker_tickers) {
        mismatches.push(format!("in DB but not brokerage: {ticker}"));
    }
    for ticker in broker_tickers.difference(&db_tickers) {
        mismatches.push(format!("in brokerage but not DB: {ticker}"));
    }
    for ticker in db_tickers.intersection(&broker_tickers) {
        let db_pos = db_positions.iter().find(|p| p.ticker == *ticker).unwrap();
        let broker_pos = broker_positions.iter().find(|p| p.ticker == *ticker).unwrap();
        if db_pos.shares as i64 != broker_pos.qty {
            mismatches.push(format!("qty mismatch {ticker}: db={} brokerage={}", db_pos.shares, broker_pos.qty));
        }
    }

    if mismatches.is_empty() {
        None
    } else {
        Some(mismatches)
    }
}

#[allow(clippy::too_many_arguments)]
fn generate_ema_signals(
    config: &LiveConfig,
    price_source: &dyn PriceSource,
    broker_positions: Option<&[BrokerPosition]>,
    db_positions: &[PersistentPosition],
    ranked: &[&TradeCandidate],
    trade_date: NaiveDate,
    run_id: &str,
    generated_at: DateTime<Utc>,
) -> Result<SignalFile> {
    let checker = TrailingStopChecker {
        trailing_transition_weeks: config.trailing_transition_weeks,
        fmp_lookback_days: config.fmp_lookback_days,
    };
    let trailing_mode = match config.trailing_stop.as_deref() {
        Some("weekly_ema") => TrailingMode::WeeklyEma,
        Some("weekly_nweek_low") => TrailingMode::WeeklyNweekLow,
        _ => TrailingMode::WeeklyEma,
    };

    let mut exits: Vec<SignalExit> = Vec::new();
    for pos in db_positions {
        let result = checker.check_position(
            price_source,
            &pos.ticker,
            pos.entry_date,
            trailing_mode,
            config.primary_trailing_period,
            trade_date,
        )?;
        if result.should_exit {
            exits.push(SignalExit {
                ticker: pos.ticker.clone(),
                position_id: Some(pos.position_id),
                reason: "trend_break".to_string(),
                qty: pos.shares,
                entry_price: pos.entry_price,
                stop_order_id: pos.stop_order_id.clone(),
            });
            tracing::info!(ticker = %pos.ticker, "ema exit signal: trend_break");
        }
    }

    let mut exit_tickers: BTreeSet<String> = exits.iter().map(|e| e.ticker.clone()).collect();
    let held_tickers: BTreeSet<String> = db_positions.iter().map(|p| p.ticker.clone()).collect();
    let mut entries: Vec<SignalEntry> = Vec::new();
    let open_after_exits = db_positions.len() - exits.len();

    if config.rotation
        && !db_positions.is_empty()
        && open_after_exits == config.max_positions
        && !ranked.is_empty()
    {
        if let Some(broker_positions) = broker_positions {
            if let Some((weakest, weakest_pnl)) = find_weakest_position(db_positions, broker_positions) {
                if !exit_tickers.contains(&weakest.ticker) {
                    let best_candidate = ranked
                        .iter()
                        .find(|c| !held_tickers.contains(&c.ticker) && !exit_tickers.contains(&c.ticker));
                    if let Some(candidate) = best_candidate {
                        // Positions carry no score once opened, so the execution book's
                        // rotation gate is the brokerage P&L alone; the candidate just
                        // needs any positive score to be worth the swap.
                        let candidate_score = candidate.score.unwrap_or(0.0);
                        if weakest_pnl < 0.0 && candidate_score > 0.0 {
                            exits.push(SignalExit {
                                ticker: weakest.ticker.clone(),
                                position_id: Some(weakest.position_id),
                                reason: "rotated_out".to_string(),
                                qty: weakest.shares,
                                entry_price: weakest.entry_price,
                                stop_order_id: weakest.stop_order_id.clone(),
                            });
                            exit_tickers.insert(weakest.ticker.clone());
                            if let Some(price) = reference_price(price_source, &candidate.ticker, trade_date) {
                                let qty = calculate_qty(price, config.position_size);
                                let stop_price = calculate_stop_price(price, config.stop_loss_pct);
                                entries.push(SignalEntry {
                                    ticker: candidate.ticker.clone(),
                                    side: "buy".to_string(),
                                    qty,
                                    score: candidate_score,
                                    grade: candidate.grade,
                                    report_date: candidate.report_date,
                                    company_name: candidate.company_name.clone(),
                                    stop_price,
                                });
                                tracing::info!(
                                    out = %weakest.ticker, in_ = %candidate.ticker,
                                    "rotation: exit weakest in favor of stronger candidate"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    let open_count = db_positions.len();
    let exit_count = exits.len();
    let mut available_slots = config.max_positions as i64 - (open_count as i64 - exit_count as i64);
    let mut entry_tickers: BTreeSet<String> = entries.iter().map(|e| e.ticker.clone()).collect();
    let mut skipped: Vec<SignalSkip> = Vec::new();

    for candidate in ranked {
        if available_slots <= 0 {
            break;
        }
        if held_tickers.contains(&candidate.ticker) {
            skipped.push(SignalSkip {
                ticker: candidate.ticker.clone(),
                reason: "already_held".to_string(),
                score: candidate.score.unwrap_or(0.0),
            });
            continue;
        }
        if exit_tickers.contains(&candidate.ticker) || entry_tickers.contains(&candidate.ticker) {
            continue;
        }
        let Some(price) = reference_price(price_source, &candidate.ticker, trade_date) else {
            skipped.push(SignalSkip {
                ticker: candidate.ticker.clone(),
                reason: "no_price_data".to_string(),
                score: candidate.score.unwrap_or(0.0),
            });
            continue;
        };
        let qty = calculate_qty(price, config.position_size);
        let stop_price = calculate_stop_price(price, config.stop_loss_pct);
        entries.push(SignalEntry {
            ticker: candidate.ticker.clone(),
            side: "buy".to_string(),
            qty,
            score: candidate.score.unwrap_or(0.0),
            grade: candidate.grade,
            report_date: candidate.report_date,
            company_name: candidate.company_name.clone(),
            stop_price,
        });
        entry_tickers.insert(candidate.ticker.clone());
        available_slots -= 1;
    }

    let skipped_tickers: BTreeSet<String> = skipped.iter().map(|s| s.ticker.clone()).collect();
    for candidate in ranked {
        if !entry_tickers.contains(&candidate.ticker)
            && !held_tickers.contains(&candidate.ticker)
            && !exit_tickers.contains(&candidate.ticker)
            && !skipped_tickers.contains(&candidate.ticker)
        {
            skipped.push(SignalSkip {
                ticker: candidate.ticker.clone(),
                reason: "capacity_full".to_string(),
                score: candidate.score.unwrap_or(0.0),
            });
        }
    }

    let open_after = (open_count as i64 - exit_count as i64 + entries.len() as i64).max(0) as usize;

    Ok(SignalFile {
        trade_date,
        strategy: "ema_p10".to_string(),
        run_id: run_id.to_string(),
        generated_at,
        summary: SignalSummary {
            total_exits: exits.len(),
            total_entries: entries.len(),
            total_skipped: skipped.len(),
            open_positions_before: open_count,
            open_positions_after: open_after,
        },
        exits,
        entries,
        skipped,
    })
}

#[allow(clippy::too_many_arguments)]
async fn generate_shadow_signals(
    pool: &SqlitePool,
    config: &LiveConfig,
    price_source: &dyn PriceSource,
    ranked: &[&TradeCandidate],
    trade_date: NaiveDate,
    run_id: &str,
    generated_at: DateTime<Utc>,
    dry_run: bool,
) -> Result<SignalFile> {
    let shadow_positions = eg_store::list_open_shadow_positions(pool).await?;

    let checker = TrailingStopChecker {
        trailing_transition_weeks: config.trailing_transition_weeks,
        fmp_lookback_days: config.fmp_lookback_days,
    };
    let trailing_mode = match config.shadow_trailing_stop.as_deref() {
        Some("weekly_ema") => TrailingMode::WeeklyEma,
        Some("weekly_nweek_low") => TrailingMode::WeeklyNweekLow,
        _ => TrailingMode::WeeklyNweekLow,
    };

    struct ShadowExit {
        shadow_id: i64,
        ticker: String,
        reason: &'static str,
        qty: u64,
        entry_price: f64,
        last_close: Option<f64>,
    }

    let mut shadow_exits: Vec<ShadowExit> = Vec::new();
    for pos in &shadow_positions {
        let result = checker.check_position(
            price_source,
            &pos.ticker,
            pos.entry_date,
            trailing_mode,
            config.shadow_trailing_period,
            trade_date,
        )?;
        if result.should_exit {
            shadow_exits.push(ShadowExit {
                shadow_id: pos.shadow_id,
                ticker: pos.ticker.clone(),
                reason: "trend_break",
                qty: 1,
                entry_price: pos.entry_price,
                last_close: result.last_close,
            });
        }
    }

    let mut exit_tickers: BTreeSet<String> = shadow_exits.iter().map(|e| e.ticker.clone()).collect();
    let held_tickers: BTreeSet<String> = shadow_positions.iter().map(|p| p.ticker.clone()).collect();
    let mut shadow_entries: Vec<SignalEntry> = Vec::new();
    let open_after_exits = shadow_positions.len() - shadow_exits.len();

    if config.rotation && !shadow_positions.is_empty() && open_after_exits == config.max_positions && !ranked.is_empty()
    {
        let remaining: Vec<ShadowPosition> = shadow_positions
            .iter()
            .filter(|p| !exit_tickers.contains(&p.ticker))
            .cloned()
            .collect();
        if let Some(weakest) = find_weakest_shadow(&remaining) {
            let best_candidate = ranked
                .iter()
                .find(|c| !held_tickers.contains(&c.ticker) && !exit_tickers.contains(&c.ticker));
            if let Some(candidate) = best_candidate {
                let weakest_score = weakest.score.unwrap_or(0.0);
                let candidate_score = candidate.score.unwrap_or(0.0);
                if candidate_score > weakest_score {
                    shadow_exits.push(ShadowExit {
                        shadow_id: weakest.shadow_id,
                        ticker: weakest.ticker.clone(),
                        reason: "rotated_out",
                        qty: 1,
                        entry_price: weakest.entry_price,
                        last_close: None,
                    });
                    exit_tickers.insert(weakest.ticker.clone());
                    if let Some(price) = reference_price(price_source, &candidate.ticker, trade_date) {
                        let qty = calculate_qty(price, config.position_size);
                        let stop_price = calculate_stop_price(price, config.stop_loss_pct);
                        shadow_entries.push(SignalEntry {
                            ticker: candidate.ticker.clone(),
                            side: "buy".to_string(),
                            qty,
                            score: candidate_score,
                            grade: candidate.grade,
                            report_date: candidate.report_date,
                            company_name: candidate.company_name.clone(),
                            stop_price,
                        });
                    }
                }
            }
        }
    }

    let open_count = shadow_positions.len();
    let exit_count = shadow_exits.len();
    let mut available_slots = config.max_positions as i64 - (open_count as i64 - exit_count as i64);
    let mut entry_tickers: BTreeSet<String> = shadow_entries.iter().map(|e| e.ticker.clone()).collect();
    let mut skipped: Vec<SignalSkip> = Vec::new();

    for candidate in ranked {
        if available_slots <= 0 {
            break;
        }
        if held_tickers.contains(&candidate.ticker) {
            skipped.push(SignalSkip {
                ticker: candidate.ticker.clone(),
                reason: "already_held".to_string(),
                score: candidate.score.unwrap_or(0.0),
            });
            continue;
        }
        if exit_tickers.contains(&candidate.ticker) || entry_tickers.contains(&candidate.ticker) {
            continue;
        }
        let Some(price) = reference_price(price_source, &candidate.ticker, trade_date) else {
            skipped.push(SignalSkip {
                ticker: candidate.ticker.clone(),
                reason: "no_price_data".to_string(),
                score: candidate.score.unwrap_or(0.0),
            });
            continue;
        };
        let qty = calculate_qty(price, config.position_size);
        let stop_price = calculate_stop_price(price, config.stop_loss_pct);
        shadow_entries.push(SignalEntry {
            ticker: candidate.ticker.clone(),
            side: "buy".to_string(),
            qty,
            score: candidate.score.unwrap_or(0.0),
            grade: candidate.grade,
            report_date: candidate.report_date,
            company_name: candidate.company_name.clone(),
            stop_price,
        });
        entry_tickers.insert(candidate.ticker.clone());
        available_slots -= 1;
    }

    let skipped_tickers: BTreeSet<String> = skipped.iter().map(|s| s.ticker.clone()).collect();
    for candidate in ranked {
        if !entry_tickers.contains(&candidate.ticker)
            && !held_tickers.contains(&candidate.ticker)
            && !exit_tickers.contains(&candidate.ticker)
            && !skipped_tickers.contains(&candidate.ticker)
        {
            skipped.push(SignalSkip {
                ticker: candidate.ticker.clone(),
                reason: "capacity_full".to_string(),
                score: candidate.score.unwrap_or(0.0),
            });
        }
    }

    if !dry_run {
        for exit in &shadow_exits {
            let exit_price = exit.last_close.unwrap_or(exit.entry_price);
            eg_store::close_shadow_position(
                pool,
                exit.shadow_id,
                trade_date,
                exit_price,
                if exit.reason == "rotated_out" {
                    eg_schemas::ExitReason::RotatedOut
                } else {
                    eg_schemas::ExitReason::TrendBreak
                },
            )
            .await?;
        }
        for entry in &shadow_entries {
            eg_store::insert_shadow_position(
                pool,
                &eg_store::NewShadowPosition {
                    ticker: entry.ticker.clone(),
                    entry_date: trade_date,
                    entry_price: entry.stop_price / (1.0 - config.stop_loss_pct / 100.0),
                    score: Some(entry.score),
                },
            )
            .await?;
        }
        eg_store::insert_shadow_signal(
            pool,
            &eg_schemas::ShadowSignalRecord {
                ticker: "_summary_".to_string(),
                trade_date,
                score: None,
                action: format!(
                    "exits={} entries={} skipped={}",
                    shadow_exits.len(),
                    shadow_entries.len(),
                    skipped.len()
                ),
            },
        )
        .await?;
    }

    let open_after = (open_count as i64 - exit_count as i64 + shadow_entries.len() as i64).max(0) as usize;

    Ok(SignalFile {
        trade_date,
        strategy: "nwl_p4".to_string(),
        run_id: run_id.to_string(),
        generated_at,
        summary: SignalSummary {
            total_exits: shadow_exits.len(),
            total_entries: shadow_entries.len(),
            total_skipped: skipped.len(),
            open_positions_before: open_count,
            open_positions_after: open_after,
        },
        exits: shadow_exits
            .into_iter()
            .map(|e| SignalExit {
                ticker: e.ticker,
                position_id: Some(e.shadow_id),
                reason: e.reason.to_string(),
                qty: e.qty,
                entry_price: e.entry_price,
                stop_order_id: None,
            })
            .collect(),
        entries: shadow_entries,
        skipped,
    })
}

pub fn write_signal_file(output_dir: &Path, trade_date: NaiveDate, strategy: &str, signal: &SignalFile) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("create signal output dir failed: {}", output_dir.display()))?;
    let path = output_dir.join(format!("trade_signals_{trade_date}_{strategy}.json"));
    let json = serde_json::to_string_pretty(signal).context("serialize signal file failed")?;
    std::fs::write(&path, format!("{json}\n")).with_context(|| format!("write signal file failed: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eg_schemas::{GradeSource, PriceBar};
    use std::collections::HashMap;

    struct FakeSource {
        bars: HashMap<String, Vec<PriceBar>>,
    }

    impl PriceSource for FakeSource {
        fn fetch_prices(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
            Ok(self
                .bars
                .get(ticker)
                .map(|bars| bars.iter().copied().filter(|b| b.date >= start && b.date <= end).collect())
                .unwrap_or_default())
        }
    }

    fn bar(date: &str, price: f64) -> PriceBar {
        PriceBar {
            date: date.parse().unwrap(),
            open: price,
            high: price,
            low: price,
            close: price,
            adj_close: price,
            volume: 100,
        }
    }

    fn candidate(ticker: &str, score: f64, grade: Grade) -> TradeCandidate {
        TradeCandidate {
            ticker: ticker.to_string(),
            company_name: None,
            report_date: "2026-01-05".parse().unwrap(),
            grade,
            grade_source: GradeSource::Json,
            score: Some(score),
            gap_size: None,
        }
    }

    #[test]
    fn filter_candidates_drops_low_grade_and_sorts_by_score() {
        let candidates = vec![
            candidate("LOW", 90.0, Grade::D),
            candidate("B", 50.0, Grade::B),
            candidate("A", 80.0, Grade::A),
        ];
        let ranked = filter_candidates(&candidates, Grade::B);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].ticker, "A");
        assert_eq!(ranked[1].ticker, "B");
    }

    #[test]
    fn qty_and_stop_price_match_original_rounding() {
        assert_eq!(calculate_qty(33.33, 10_000.0), 300);
        assert_eq!(calculate_stop_price(100.0, 10.0), 90.0);
        assert_eq!(calculate_qty(0.0, 10_000.0), 0);
    }

    #[test]
    fn reference_price_uses_most_recent_bar_open() {
        let mut bars = HashMap::new();
        bars.insert("ACME".to_string(), vec![bar("2026-01-03", 10.0), bar("2026-01-04", 11.0)]);
        let source = FakeSource { bars };
        let price = reference_price(&source, "ACME", "2026-01-05".parse().unwrap());
        assert_eq!(price, Some(11.0));
    }

    #[test]
    fn reconcile_positions_flags_qty_mismatch() {
        let db = vec![PersistentPosition {
            position_id: 1,
            ticker: "ACME".to_string(),
            entry_date: "2026-01-01".parse().unwrap(),
            entry_price: 10.0,
            shares: 100,
            stop_price: Some(9.0),
            stop_order_id: None,
            exit_date: None,
            exit_price: None,
            exit_reason: None,
        }];
        let broker = vec![BrokerPosition { ticker: "ACME".to_string(), qty: 50, unrealized_pl: 5.0 }];
        let mismatches = reconcile_positions(&db, &broker).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].contains("qty mismatch"));
    }

    #[test]
    fn reconcile_positions_matches_when_equal() {
        let db = vec![PersistentPosition {
            position_id: 1,
            ticker: "ACME".to_string(),
            entry_date: "2026-01-01".parse().unwrap(),
            entry_price: 10.0,
            shares: 100,
            stop_price: Some(9.0),
            stop_order_id: None,
            exit_date: None,
            exit_price: None,
            exit_reason: None,
        }];
        let broker = vec![BrokerPosition { ticker: "ACME".to_string(), qty: 100, unrealized_pl: 5.0 }];
        assert!(reconcile_positions(&db, &broker).is_none());
    }
}
