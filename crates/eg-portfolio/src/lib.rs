//! eg-portfolio
//!
//! The day-by-day portfolio scheduler: entries compete for a fixed number of
//! slots, exits run through a five-phase pipeline each trading day so that
//! pending exits, new entries, intraday stops, week-end trailing stops and
//! max-holding exits all see a consistent, ordered view of the book. This is
//! the shared rule kernel the live executor must reach bit-identical exit
//! decisions against (see `eg-trailstop` for the live-side twin of phase 4).
//!
//! Grounded on the original `backtest/portfolio_simulator.py`'s
//! `PortfolioSimulator.simulate_portfolio()`, generalized in the manner of
//! `mqk-backtest::engine::BacktestEngine::run()`: a validated config+state
//! struct, a typed constructor, a per-day phase pipeline, and a final
//! report. `BTreeMap<String, _>` keeps the open book in ticker order so a
//! run produces the same trade sequence on every replay.

use chrono::NaiveDate;
use eg_prices::{
    aggregate_daily_to_weekly, compute_weekly_ema, compute_weekly_nweek_low, count_completed_weeks,
    is_trend_broken, is_week_end_by_date, PriceDateIndex,
};
use eg_schemas::{
    EntryMode, ExitReason, Grade, GradeSource, OpenPosition, PendingExit, PriceBar, SkipReason,
    SkippedTrade, StopMode, TradeCandidate, TradeResult, TrailingMode,
};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioConfig {
    pub max_positions: usize,
    pub daily_entry_limit: usize,
    pub position_size: f64,
    pub stop_loss_pct: f64,
    pub slippage_pct: f64,
    pub stop_mode: StopMode,
    pub entry_mode: EntryMode,
    /// Disabled when `None`, matching the original's `max_holding_days=None`.
    pub max_holding_days: Option<i64>,
    /// When capacity is full, rotate out the weakest held position in favor
    /// of a strictly stronger candidate instead of skipping it.
    pub rotation: bool,
    /// Candidates graded worse than this (higher `Grade::rank()`) never enter.
    pub min_grade: Grade,
    pub trailing_mode: TrailingMode,
    pub trailing_period: usize,
    pub trailing_transition_weeks: u32,
}

/// Constructor validation errors, matching `PortfolioSimulator.__init__`'s
/// `ValueError`s in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortfolioError {
    InvalidMaxPositions,
    InvalidDailyEntryLimit,
    InvalidPositionSize,
    InvalidStopLossPct,
    InvalidSlippagePct,
    InvalidTrailingPeriod,
}

impl std::fmt::Display for PortfolioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            PortfolioError::InvalidMaxPositions => "max_positions must be >= 1",
            PortfolioError::InvalidDailyEntryLimit => "daily_entry_limit must be >= 1",
            PortfolioError::InvalidPositionSize => "position_size must be > 0",
            PortfolioError::InvalidStopLossPct => "stop_loss_pct must be > 0",
            PortfolioError::InvalidSlippagePct => "slippage_pct must be >= 0",
            PortfolioError::InvalidTrailingPeriod => "trailing_period must be >= 1",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for PortfolioError {}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioReport {
    pub trades: Vec<TradeResult>,
    pub skipped: Vec<SkippedTrade>,
}

/// An open position plus the entry-time grade/score needed to rank it during
/// rotation; `eg_schemas::OpenPosition` itself carries neither.
#[derive(Debug, Clone, PartialEq)]
struct ManagedPosition {
    position: OpenPosition,
    report_date: NaiveDate,
    grade: Grade,
    grade_source: GradeSource,
    score: Option<f64>,
    gap_size: Option<f64>,
    company_name: Option<String>,
}

pub struct PortfolioSimulator {
    config: PortfolioConfig,
}

impl PortfolioSimulator {
    pub fn new(config: PortfolioConfig) -> Result<Self, PortfolioError> {
        if config.max_positions == 0 {
            return Err(PortfolioError::InvalidMaxPositions);
        }
        if config.daily_entry_limit == 0 {
            return Err(PortfolioError::InvalidDailyEntryLimit);
        }
        if config.position_size <= 0.0 {
            return Err(PortfolioError::InvalidPositionSize);
        }
        if config.stop_loss_pct <= 0.0 {
            return Err(PortfolioError::InvalidStopLossPct);
        }
        if config.slippage_pct < 0.0 {
            return Err(PortfolioError::InvalidSlippagePct);
        }
        if config.trailing_period == 0 {
            return Err(PortfolioError::InvalidTrailingPeriod);
        }
        Ok(PortfolioSimulator { config })
    }

    /// Runs every candidate against `index`'s full trading calendar.
    ///
    /// Per trading day: (1) execute positions tagged `pending_exit` at the
    /// day's open, (2) admit new entries scheduled for today up to capacity
    /// (rotating out the weakest holding when `rotation` is enabled), (3)
    /// check the configured stop mode, (4) at week-end, check the trailing
    /// trend indicator and tag a break for next-open execution, (5) force
    /// exits past `max_holding_days`. Anything still open when the data runs
    /// out closes at the last known price as `end_of_data`.
    pub fn run(&self, candidates: &[TradeCandidate], index: &PriceDateIndex) -> PortfolioReport {
        let mut skipped = Vec::new();
        let mut schedule: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
        let mut candidate_bars: Vec<Option<Vec<PriceBar>>> = Vec::with_capacity(candidates.len());

        for (i, candidate) in candidates.iter().enumerate() {
            let bars = index.get_bars_up_to(&candidate.ticker, far_future());
            if bars.is_empty() {
                skipped.push(skip(candidate, SkipReason::NoPriceData));
                candidate_bars.push(None);
                continue;
            }
            match find_entry_bar(&bars, candidate.report_date, self.config.entry_mode) {
                Some(entry_bar) => {
                    schedule.entry(entry_bar.date).or_default().push(i);
                    candidate_bars.push(Some(bars));
                }
                None => {
                    skipped.push(skip(candidate, SkipReason::NoPriceData));
                    candidate_bars.push(None);
                }
            }
        }

        let mut open: BTreeMap<String, ManagedPosition> = BTreeMap::new();
        let mut trades: Vec<TradeResult> = Vec::new();

        for today in index.all_trading_dates() {
            self.phase1_pending_exits(today, index, &mut open, &mut trades);
            self.phase2_new_entries(
                today,
                index,
                &schedule,
                candidates,
                &candidate_bars,
                &mut open,
                &mut trades,
                &mut skipped,
            );
            self.phase3_stop_check(today, index, &mut open, &mut trades);
            self.phase4_trailing_stop(today, index, &mut open);
            self.phase5_max_holding(today, index, &mut open, &mut trades);
        }

        self.close_remaining_end_of_data(index, &mut open, &mut trades);

        tracing::info!(
            trades = trades.len(),
            skipped = skipped.len(),
            "portfolio simulation complete"
        );

        PortfolioReport { trades, skipped }
    }

    fn phase1_pending_exits(
        &self,
        today: NaiveDate,
        index: &PriceDateIndex,
        open: &mut BTreeMap<String, ManagedPosition>,
        trades: &mut Vec<TradeResult>,
    ) {
        let mut to_close = Vec::new();
        for (ticker, pos) in open.iter() {
            let Some(reason) = pos.position.pending_exit else { continue };
            let Some(bar) = index.get_bar(ticker, today) else { continue };
            let exit_price = bar.adjusted_open() * (1.0 - self.config.slippage_pct / 100.0);
            let exit_reason = match reason {
                PendingExit::StopLoss => ExitReason::StopLoss,
                PendingExit::TrendBreak => ExitReason::TrendBreak,
            };
            to_close.push((ticker.clone(), today, exit_price, exit_reason));
        }
        self.apply_closes(to_close, open, trades);
    }

    #[allow(clippy::too_many_arguments)]
    fn phase2_new_entries(
        &self,
        today: NaiveDate,
        index: &PriceDateIndex,
        schedule: &BTreeMap<NaiveDate, Vec<usize>>,
        candidates: &[TradeCandidate],
        candidate_bars: &[Option<Vec<PriceBar>>],
        open: &mut BTreeMap<String, ManagedPosition>,
        trades: &mut Vec<TradeResult>,
        skipped: &mut Vec<SkippedTrade>,
    ) {
        let Some(indices) = schedule.get(&today) else { return };

        let mut ranked: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| candidates[i].grade.rank() <= self.config.min_grade.rank())
            .collect();
        ranked.sort_by(|&a, &b| {
            candidates[a].grade.rank().cmp(&candidates[b].grade.rank()).then_with(|| {
                candidates[b]
                    .score
                    .unwrap_or(f64::MIN)
                    .partial_cmp(&candidates[a].score.unwrap_or(f64::MIN))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });

        let mut scheduled_today: HashSet<String> = HashSet::new();
        let mut rotated_today = false;

        for (rank_pos, idx) in ranked.into_iter().enumerate() {
            let candidate = &candidates[idx];

            if rank_pos >= self.config.daily_entry_limit {
                skipped.push(skip(candidate, SkipReason::DailyLimit));
                continue;
            }
            if !scheduled_today.insert(candidate.ticker.clone()) {
                skipped.push(skip(candidate, SkipReason::DuplicateTicker));
                continue;
            }
            if open.contains_key(&candidate.ticker) {
                skipped.push(skip(candidate, SkipReason::AlreadyHeld));
                continue;
            }

            let bars = candidate_bars[idx].as_ref().expect("scheduled candidates carry bars");
            let Some(entry_bar) = find_entry_bar(bars, candidate.report_date, self.config.entry_mode) else {
                skipped.push(skip(candidate, SkipReason::NoPriceData));
                continue;
            };

            if entry_bar.open <= 0.0 {
                skipped.push(skip(candidate, SkipReason::MissingOhlc));
                continue;
            }
            let entry_price = entry_bar.adjusted_open();
            let shares = (self.config.position_size / entry_price) as u64;
            if shares == 0 {
                skipped.push(skip(candidate, SkipReason::ZeroShares));
                continue;
            }

            if open.len() >= self.config.max_positions {
                if !self.config.rotation || rotated_today {
                    skipped.push(skip(candidate, SkipReason::CapacityFull));
                    continue;
                }
                match weakest_position(open, index, today) {
                    Some((weakest_ticker, unrealized))
                        if unrealized < 0.0
                            && candidate.score.unwrap_or(f64::MIN)
                                > open[&weakest_ticker].score.unwrap_or(f64::MIN) =>
                    {
                        let Some(weak_bar) = index.get_bar(&weakest_ticker, today) else {
                            skipped.push(skip(candidate, SkipReason::CapacityFull));
                            continue;
                        };
                        let exit_price = weak_bar.adjusted_open() * (1.0 - self.config.slippage_pct / 100.0);
                        if let Some(weak) = open.remove(&weakest_ticker) {
                            trades.push(close_trade(weak, today, exit_price, ExitReason::RotatedOut));
                        }
                        rotated_today = true;
                    }
                    _ => {
                        skipped.push(skip(candidate, SkipReason::CapacityFull));
                        continue;
                    }
                }
            }

            let invested = shares as f64 * entry_price;
            let stop_price = entry_price * (1.0 - self.config.stop_loss_pct / 100.0);
            open.insert(
                candidate.ticker.clone(),
                ManagedPosition {
                    position: OpenPosition {
                        ticker: candidate.ticker.clone(),
                        entry_date: entry_bar.date,
                        entry_price: round4(entry_price),
                        shares,
                        invested: round2(invested),
                        stop_price,
                        pending_exit: None,
                    },
                    report_date: candidate.report_date,
                    grade: candidate.grade,
                    grade_source: candidate.grade_source,
                    score: candidate.score,
                    gap_size: candidate.gap_size,
                    company_name: candidate.company_name.clone(),
                },
            );
        }
    }

    fn phase3_stop_check(
        &self,
        today: NaiveDate,
        index: &PriceDateIndex,
        open: &mut BTreeMap<String, ManagedPosition>,
        trades: &mut Vec<TradeResult>,
    ) {
        let mut to_close = Vec::new();
        for (ticker, pos) in open.iter_mut() {
            if pos.position.pending_exit.is_some() {
                continue;
            }
            let Some(bar) = index.get_bar(ticker, today) else { continue };
            let days_held = (today - pos.position.entry_date).num_days();

            let triggered = match self.config.stop_mode {
                StopMode::Intraday => bar.low > 0.0 && bar.adjusted_low() <= pos.position.stop_price,
                StopMode::SkipEntryDay => {
                    days_held > 0 && bar.low > 0.0 && bar.adjusted_low() <= pos.position.stop_price
                }
                StopMode::Close | StopMode::CloseNextOpen => {
                    let c = end_of_data_price(bar);
                    c > 0.0 && c <= pos.position.stop_price
                }
            };
            if !triggered {
                continue;
            }

            if self.config.stop_mode == StopMode::CloseNextOpen {
                pos.position.pending_exit = Some(PendingExit::StopLoss);
                continue;
            }

            let exit_price = match self.config.stop_mode {
                StopMode::Close => end_of_data_price(bar) * (1.0 - self.config.slippage_pct / 100.0),
                _ => pos.position.stop_price * (1.0 - self.config.slippage_pct / 100.0),
            };
            to_close.push((ticker.clone(), today, exit_price, ExitReason::StopLoss));
        }
        self.apply_closes(to_close, open, trades);
    }

    /// At the last trading day of each ISO week, checks whether the
    /// configured trailing indicator broke and — if so — tags the position
    /// for execution at tomorrow's open, mirroring `close_next_open` timing
    /// regardless of the run's `stop_mode`.
    fn phase4_trailing_stop(&self, today: NaiveDate, index: &PriceDateIndex, open: &mut BTreeMap<String, ManagedPosition>) {
        for (ticker, pos) in open.iter_mut() {
            if pos.position.pending_exit.is_some() {
                continue;
            }
            let bars = index.get_bars_up_to(ticker, today);
            if bars.is_empty() || !is_week_end_by_date(&bars, today) {
                continue;
            }

            let weekly = aggregate_daily_to_weekly(&bars);
            let completed = count_completed_weeks(&weekly, pos.position.entry_date, today);
            if (completed as u32) < self.config.trailing_transition_weeks {
                continue;
            }

            let indicators = match self.config.trailing_mode {
                TrailingMode::WeeklyEma => compute_weekly_ema(&weekly, self.config.trailing_period),
                TrailingMode::WeeklyNweekLow => compute_weekly_nweek_low(&weekly, self.config.trailing_period),
            };
            if is_trend_broken(&weekly, &indicators, today) {
                pos.position.pending_exit = Some(PendingExit::TrendBreak);
            }
        }
    }

    fn phase5_max_holding(
        &self,
        today: NaiveDate,
        index: &PriceDateIndex,
        open: &mut BTreeMap<String, ManagedPosition>,
        trades: &mut Vec<TradeResult>,
    ) {
        let Some(max_days) = self.config.max_holding_days else { return };
        let mut to_close = Vec::new();
        for (ticker, pos) in open.iter() {
            if pos.position.pending_exit.is_some() {
                continue;
            }
            let days_held = (today - pos.position.entry_date).num_days();
            if days_held < max_days {
                continue;
            }
            let Some(bar) = index.get_bar(ticker, today) else { continue };
            let price = end_of_data_price(bar);
            if price <= 0.0 {
                continue;
            }
            to_close.push((ticker.clone(), today, price, ExitReason::MaxHolding));
        }
        self.apply_closes(to_close, open, trades);
    }

    fn close_remaining_end_of_data(
        &self,
        index: &PriceDateIndex,
        open: &mut BTreeMap<String, ManagedPosition>,
        trades: &mut Vec<TradeResult>,
    ) {
        let tickers: Vec<String> = open.keys().cloned().collect();
        for ticker in tickers {
            let bars = index.get_bars_up_to(&ticker, far_future());
            let Some(last) = bars.last() else { continue };
            let price = end_of_data_price(last);
            if let Some(pos) = open.remove(&ticker) {
                trades.push(close_trade(pos, last.date, price, ExitReason::EndOfData));
            }
        }
    }

    fn apply_closes(
        &self,
        to_close: Vec<(String, NaiveDate, f64, ExitReason)>,
        open: &mut BTreeMap<String, ManagedPosition>,
        trades: &mut Vec<TradeResult>,
    ) {
        for (ticker, date, price, reason) in to_close {
            if let Some(pos) = open.remove(&ticker) {
                trades.push(close_trade(pos, date, price, reason));
            }
        }
    }
}

fn skip(candidate: &TradeCandidate, reason: SkipReason) -> SkippedTrade {
    SkippedTrade {
        ticker: candidate.ticker.clone(),
        report_date: candidate.report_date,
        grade: candidate.grade,
        score: candidate.score,
        skip_reason: reason,
    }
}

fn close_trade(pos: ManagedPosition, exit_date: NaiveDate, exit_price: f64, exit_reason: ExitReason) -> TradeResult {
    let entry_price = pos.position.entry_price;
    let shares = pos.position.shares;
    let pnl = (exit_price - entry_price) * shares as f64;
    let return_pct = ((exit_price / entry_price) - 1.0) * 100.0;
    let holding_days = (exit_date - pos.position.entry_date).num_days();

    TradeResult {
        ticker: pos.position.ticker,
        grade: pos.grade,
        grade_source: pos.grade_source,
        score: pos.score,
        report_date: pos.report_date,
        entry_date: pos.position.entry_date,
        entry_price,
        exit_date,
        exit_price: round4(exit_price),
        shares,
        invested: pos.position.invested,
        pnl: round2(pnl),
        return_pct: round2(return_pct),
        holding_days,
        exit_reason,
        gap_size: pos.gap_size,
        company_name: pos.company_name,
    }
}

/// Finds the open position with the most negative unrealized P&L —
/// `(previous_close - entry_price) * shares` — as the rotation candidate.
/// A ticker with no previous close (never traded before today) is ineligible,
/// preserving the original's treatment of "no bar" as disqualifying rather
/// than trivially weakest.
fn weakest_position(
    open: &BTreeMap<String, ManagedPosition>,
    index: &PriceDateIndex,
    today: NaiveDate,
) -> Option<(String, f64)> {
    open.iter()
        .filter_map(|(ticker, pos)| {
            let prev_close = index.get_previous_close(ticker, today)?;
            let unrealized = (prev_close - pos.position.entry_price) * pos.position.shares as f64;
            Some((ticker.clone(), unrealized))
        })
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

fn end_of_data_price(bar: &PriceBar) -> f64 {
    if bar.adj_close > 0.0 {
        bar.adj_close
    } else {
        bar.close
    }
}

fn find_entry_bar(bars: &[PriceBar], report_date: NaiveDate, entry_mode: EntryMode) -> Option<&PriceBar> {
    match entry_mode {
        EntryMode::ReportOpen => bars.iter().find(|b| b.date >= report_date),
        EntryMode::NextDayOpen => bars.iter().find(|b| b.date > report_date),
    }
}

fn far_future() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).expect("valid constant date")
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(date: &str, open: f64, high: f64, low: f64, close: f64) -> PriceBar {
        PriceBar {
            date: date.parse().unwrap(),
            open,
            high,
            low,
            close,
            adj_close: close,
            volume: 1000,
        }
    }

    fn candidate(ticker: &str, report_date: &str, grade: Grade, score: Option<f64>) -> TradeCandidate {
        TradeCandidate {
            ticker: ticker.to_string(),
            company_name: None,
            report_date: report_date.parse().unwrap(),
            grade,
            grade_source: GradeSource::Html,
            score,
            gap_size: Some(5.0),
        }
    }

    fn default_config() -> PortfolioConfig {
        PortfolioConfig {
            max_positions: 2,
            daily_entry_limit: 10,
            position_size: 1000.0,
            stop_loss_pct: 10.0,
            slippage_pct: 0.5,
            stop_mode: StopMode::Intraday,
            entry_mode: EntryMode::NextDayOpen,
            max_holding_days: Some(90),
            rotation: true,
            min_grade: Grade::D,
            trailing_mode: TrailingMode::WeeklyEma,
            trailing_period: 10,
            trailing_transition_weeks: 2,
        }
    }

    #[test]
    fn rejects_zero_max_positions() {
        let mut config = default_config();
        config.max_positions = 0;
        assert_eq!(PortfolioSimulator::new(config).unwrap_err(), PortfolioError::InvalidMaxPositions);
    }

    #[test]
    fn single_candidate_closes_at_end_of_data() {
        let sim = PortfolioSimulator::new(default_config()).unwrap();
        let mut index = PriceDateIndex::new();
        for (d, o, h, l, c) in [
            ("2025-01-02", 10.0, 10.5, 9.5, 10.0),
            ("2025-01-03", 10.0, 11.0, 9.8, 10.5),
            ("2025-01-06", 10.5, 11.0, 10.0, 10.8),
        ] {
            index.insert("AAA".to_string(), bar(d, o, h, l, c));
        }
        let candidates = vec![candidate("AAA", "2025-01-02", Grade::A, Some(90.0))];
        let report = sim.run(&candidates, &index);
        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].exit_reason, ExitReason::EndOfData);
        assert_eq!(report.trades[0].exit_date, "2025-01-06".parse::<NaiveDate>().unwrap());
    }

    #[test]
    fn capacity_full_without_rotation_skips_overflow() {
        let mut config = default_config();
        config.max_positions = 1;
        config.rotation = false;
        let sim = PortfolioSimulator::new(config).unwrap();

        let mut index = PriceDateIndex::new();
        for ticker in ["AAA", "BBB"] {
            index.insert(ticker.to_string(), bar("2025-01-02", 10.0, 10.5, 9.5, 10.0));
            index.insert(ticker.to_string(), bar("2025-01-03", 10.0, 10.5, 9.8, 10.2));
        }
        let candidates = vec![
            candidate("AAA", "2025-01-01", Grade::A, Some(90.0)),
            candidate("BBB", "2025-01-01", Grade::A, Some(80.0)),
        ];
        let report = sim.run(&candidates, &index);
        assert_eq!(report.trades.iter().filter(|t| t.exit_reason != ExitReason::EndOfData).count(), 0);
        let skipped_capacity = report.skipped.iter().find(|s| s.skip_reason == SkipReason::CapacityFull);
        assert!(skipped_capacity.is_some());
        assert_eq!(skipped_capacity.unwrap().ticker, "BBB");
    }

    #[test]
    fn rotation_swaps_in_a_stronger_candidate() {
        // WEAK enters first and drifts into a small unrealized loss (but not
        // enough to trip its own stop); STRONG arrives later with a higher
        // score while WEAK still holds the only slot.
        let mut config = default_config();
        config.max_positions = 1;
        config.rotation = true;
        let sim = PortfolioSimulator::new(config).unwrap();

        let mut index = PriceDateIndex::new();
        for (d, o, h, l, c) in [
            ("2025-01-02", 10.0, 10.5, 9.5, 10.0),
            ("2025-01-03", 9.8, 10.0, 9.3, 9.5),
            ("2025-01-06", 9.2, 9.4, 9.0, 9.3),
        ] {
            index.insert("WEAK".to_string(), bar(d, o, h, l, c));
        }
        for (d, o, h, l, c) in [("2025-01-03", 20.0, 20.5, 19.5, 20.0), ("2025-01-06", 20.5, 21.0, 20.0, 20.8)] {
            index.insert("STRONG".to_string(), bar(d, o, h, l, c));
        }

        let candidates = vec![
            candidate("WEAK", "2025-01-01", Grade::A, Some(60.0)),
            candidate("STRONG", "2025-01-03", Grade::A, Some(95.0)),
        ];
        let report = sim.run(&candidates, &index);

        let rotated = report.trades.iter().find(|t| t.exit_reason == ExitReason::RotatedOut);
        assert!(rotated.is_some());
        assert_eq!(rotated.unwrap().ticker, "WEAK");
        // Closed at WEAK's own 2025-01-06 adjusted open (9.2) x 0.995, not STRONG's.
        assert_eq!(rotated.unwrap().exit_price, 9.154);

        let strong_entry = report
            .trades
            .iter()
            .chain(std::iter::empty())
            .find(|t| t.ticker == "STRONG");
        assert!(strong_entry.is_some());
    }

    #[test]
    fn rotation_declines_when_incoming_score_does_not_beat_weakest() {
        let mut config = default_config();
        config.max_positions = 1;
        config.rotation = true;
        let sim = PortfolioSimulator::new(config).unwrap();

        let mut index = PriceDateIndex::new();
        for (d, o, h, l, c) in [
            ("2025-01-02", 10.0, 10.5, 9.5, 10.0),
            ("2025-01-03", 9.8, 10.0, 9.3, 9.5),
            ("2025-01-06", 9.2, 9.4, 9.0, 9.3),
        ] {
            index.insert("WEAK".to_string(), bar(d, o, h, l, c));
        }
        for (d, o, h, l, c) in [("2025-01-03", 20.0, 20.5, 19.5, 20.0), ("2025-01-06", 20.5, 21.0, 20.0, 20.8)] {
            index.insert("MEDIOCRE".to_string(), bar(d, o, h, l, c));
        }

        let candidates = vec![
            candidate("WEAK", "2025-01-01", Grade::A, Some(60.0)),
            candidate("MEDIOCRE", "2025-01-03", Grade::A, Some(50.0)),
        ];
        let report = sim.run(&candidates, &index);

        assert!(!report.trades.iter().any(|t| t.exit_reason == ExitReason::RotatedOut));
        assert!(report.skipped.iter().any(|s| s.ticker == "MEDIOCRE" && s.skip_reason == SkipReason::CapacityFull));
    }

    #[test]
    fn at_most_one_rotation_per_day() {
        // Two held positions are both underwater when two higher-scoring
        // candidates are scheduled to enter on the same day. Only the
        // better-ranked candidate should rotate in; the second must be
        // capacity-skipped even though it would also beat the (new) weakest
        // holding in isolation.
        let mut config = default_config();
        config.max_positions = 2;
        config.rotation = true;
        let sim = PortfolioSimulator::new(config).unwrap();

        let mut index = PriceDateIndex::new();
        for ticker in ["WEAK1", "WEAK2"] {
            for (d, o, h, l, c) in [
                ("2025-01-02", 10.0, 10.5, 9.5, 10.0),
                ("2025-01-03", 9.8, 10.0, 9.3, 9.5),
                ("2025-01-06", 9.2, 9.4, 9.0, 9.3),
            ] {
                index.insert(ticker.to_string(), bar(d, o, h, l, c));
            }
        }
        for (d, o, h, l, c) in [("2025-01-05", 20.0, 20.5, 19.5, 20.0), ("2025-01-06", 20.5, 21.0, 20.0, 20.8)] {
            index.insert("STRONG1".to_string(), bar(d, o, h, l, c));
        }
        for (d, o, h, l, c) in [("2025-01-05", 30.0, 30.5, 29.5, 30.0), ("2025-01-06", 30.5, 31.0, 30.0, 30.8)] {
            index.insert("STRONG2".to_string(), bar(d, o, h, l, c));
        }

        let candidates = vec![
            candidate("WEAK1", "2025-01-01", Grade::A, Some(60.0)),
            candidate("WEAK2", "2025-01-01", Grade::A, Some(55.0)),
            candidate("STRONG1", "2025-01-05", Grade::A, Some(95.0)),
            candidate("STRONG2", "2025-01-05", Grade::A, Some(90.0)),
        ];
        let report = sim.run(&candidates, &index);

        assert_eq!(report.trades.iter().filter(|t| t.exit_reason == ExitReason::RotatedOut).count(), 1);
        assert!(report.skipped.iter().any(|s| s.ticker == "STRONG2" && s.skip_reason == SkipReason::CapacityFull));
    }

    #[test]
    fn trailing_trend_break_tags_pending_exit_for_next_open() {
        let mut config = default_config();
        config.trailing_period = 1;
        config.trailing_transition_weeks = 1;
        config.max_holding_days = None;
        config.stop_loss_pct = 90.0; // keep the intraday stop from firing first
        let sim = PortfolioSimulator::new(config).unwrap();

        let mut index = PriceDateIndex::new();
        // Week 1 (entry week): rising closes.
        for (d, c) in [("2025-01-06", 10.0), ("2025-01-07", 11.0), ("2025-01-08", 12.0), ("2025-01-09", 13.0), ("2025-01-10", 14.0)] {
            index.insert("AAA".to_string(), bar(d, c, c + 0.5, c - 0.5, c));
        }
        // Week 2: closes fall below week 1's EMA by week end, then a next-open exit bar.
        for (d, c) in [("2025-01-13", 9.0), ("2025-01-14", 8.0), ("2025-01-15", 7.0), ("2025-01-16", 6.0), ("2025-01-17", 5.0)] {
            index.insert("AAA".to_string(), bar(d, c, c + 0.5, c - 0.5, c));
        }
        index.insert("AAA".to_string(), bar("2025-01-21", 4.5, 4.8, 4.3, 4.5));

        let candidates = vec![candidate("AAA", "2025-01-05", Grade::A, Some(90.0))];
        let report = sim.run(&candidates, &index);
        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].exit_reason, ExitReason::TrendBreak);
        assert_eq!(report.trades[0].exit_date, "2025-01-21".parse::<NaiveDate>().unwrap());
    }
}
