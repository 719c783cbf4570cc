//! eg-tradesim
//!
//! Per-candidate trade simulation: independent trade replay with a single
//! stop loss (four modes), a max holding period, fixed position sizing, and
//! an optional daily entry cap across candidates sharing an entry date. No
//! portfolio capacity or rotation — each candidate is simulated against the
//! schedule other candidates produce only through `daily_entry_limit`, which
//! is what makes this the cheap first pass before the full portfolio
//! scheduler (`eg-portfolio`).
//!
//! Grounded on the original `backtest/trade_simulator.py` (entry scan, stop
//! trigger, max-holding/end-of-data exits), generalized to the full four-mode
//! stop-mode and entry-mode table that `portfolio_simulator.py` implements
//! per day — the per-candidate Python simulator only ever runs
//! `intraday`/`next_day_open`; the other three modes are recovered here from
//! `PortfolioSimulator::_check_stop_loss` and applied per-candidate instead
//! of per-day.

use chrono::NaiveDate;
use eg_schemas::{EntryMode, ExitReason, Grade, GradeSource, SkipReason, SkippedTrade, StopMode, TradeResult};
use std::collections::HashMap;

/// One earnings-gap candidate as seen by the trade simulator. A trimmed view
/// of `eg_schemas::TradeCandidate` that doesn't require a `PriceBar` universe
/// to construct.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub ticker: String,
    pub report_date: NaiveDate,
    pub grade: Grade,
    pub grade_source: GradeSource,
    pub score: Option<f64>,
    pub gap_size: Option<f64>,
    pub company_name: Option<String>,
}

pub struct TradeSimulator {
    pub position_size: f64,
    pub stop_loss_pct: f64,
    pub slippage_pct: f64,
    pub max_holding_days: i64,
    pub stop_mode: StopMode,
    pub entry_mode: EntryMode,
    /// When set, caps the number of entries scheduled on any single entry
    /// date; scored candidates rank above unscored ones, overflow is
    /// reported as `daily_limit`. `None` disables the cap.
    pub daily_entry_limit: Option<usize>,
}

impl Default for TradeSimulator {
    fn default() -> Self {
        TradeSimulator {
            position_size: 10_000.0,
            stop_loss_pct: 10.0,
            slippage_pct: 0.5,
            max_holding_days: 90,
            stop_mode: StopMode::Intraday,
            entry_mode: EntryMode::NextDayOpen,
            daily_entry_limit: None,
        }
    }
}

impl TradeSimulator {
    /// Simulates every candidate against its ticker's bar series (sorted by
    /// date). Candidates with no bars in `price_data` are skipped as
    /// `no_price_data` up front. When `daily_entry_limit` is set, candidates
    /// are grouped by resolved entry date, ranked score-descending (unscored
    /// last), and overflow beyond the cap is skipped as `daily_limit`.
    pub fn simulate_all(
        &self,
        candidates: &[Candidate],
        price_data: &HashMap<String, Vec<eg_schemas::PriceBar>>,
    ) -> (Vec<TradeResult>, Vec<SkippedTrade>) {
        let mut trades = Vec::new();
        let mut skipped = Vec::new();

        let mut entry_scheduled: HashMap<NaiveDate, Vec<&Candidate>> = HashMap::new();

        for candidate in candidates {
            match price_data.get(&candidate.ticker) {
                None => {
                    skipped.push(skip(candidate, SkipReason::NoPriceData));
                    continue;
                }
                Some(bars) if bars.is_empty() => {
                    skipped.push(skip(candidate, SkipReason::NoPriceData));
                    continue;
                }
                Some(bars) => match find_entry_index(bars, candidate.report_date, self.entry_mode) {
                    Some(idx) => entry_scheduled.entry(bars[idx].date).or_default().push(candidate),
                    None => skipped.push(skip(candidate, SkipReason::NoPriceData)),
                },
            }
        }

        let mut dates: Vec<NaiveDate> = entry_scheduled.keys().copied().collect();
        dates.sort();

        for date in dates {
            let mut day_candidates = entry_scheduled.remove(&date).unwrap_or_default();
            day_candidates.sort_by(|a, b| {
                b.score
                    .unwrap_or(f64::MIN)
                    .partial_cmp(&a.score.unwrap_or(f64::MIN))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            for (i, candidate) in day_candidates.into_iter().enumerate() {
                if let Some(limit) = self.daily_entry_limit {
                    if i >= limit {
                        skipped.push(skip(candidate, SkipReason::DailyLimit));
                        continue;
                    }
                }
                let bars = price_data.get(&candidate.ticker).expect("scheduled from price_data");
                match self.simulate_single(candidate, bars) {
                    Ok(trade) => trades.push(trade),
                    Err(s) => skipped.push(s),
                }
            }
        }

        tracing::info!(
            trades = trades.len(),
            skipped = skipped.len(),
            "trade simulation complete"
        );
        (trades, skipped)
    }

    fn simulate_single(
        &self,
        candidate: &Candidate,
        bars: &[eg_schemas::PriceBar],
    ) -> Result<TradeResult, SkippedTrade> {
        let entry_idx = find_entry_index(bars, candidate.report_date, self.entry_mode)
            .ok_or_else(|| skip(candidate, SkipReason::NoPriceData))?;
        let entry_bar = &bars[entry_idx];

        if entry_bar.open <= 0.0 || entry_bar.low <= 0.0 || entry_bar.high <= 0.0 || entry_bar.close <= 0.0 {
            return Err(skip(candidate, SkipReason::MissingOhlc));
        }

        let entry_price = entry_bar.adjusted_open();
        if entry_price <= 0.0 {
            return Err(skip(candidate, SkipReason::MissingOhlc));
        }

        let shares = (self.position_size / entry_price) as u64;
        if shares == 0 {
            return Err(skip(candidate, SkipReason::ZeroShares));
        }

        let invested = shares as f64 * entry_price;
        let stop_price = entry_price * (1.0 - self.stop_loss_pct / 100.0);
        let entry_date = entry_bar.date;

        let mut exit_price = None;
        let mut exit_date = None;
        let mut exit_reason = None;

        let remaining = &bars[entry_idx..];
        for (i, bar) in remaining.iter().enumerate() {
            let days_held = (bar.date - entry_date).num_days();

            if stop_hit(self.stop_mode, bar, stop_price, days_held) {
                match self.stop_mode {
                    StopMode::CloseNextOpen => {
                        let (price, date) = match remaining.get(i + 1) {
                            Some(nb) => (nb.adjusted_open(), nb.date),
                            None => (end_of_data_price(bar), bar.date),
                        };
                        exit_price = Some(price * (1.0 - self.slippage_pct / 100.0));
                        exit_date = Some(date);
                    }
                    StopMode::Close => {
                        exit_price = Some(end_of_data_price(bar) * (1.0 - self.slippage_pct / 100.0));
                        exit_date = Some(bar.date);
                    }
                    StopMode::Intraday | StopMode::SkipEntryDay => {
                        exit_price = Some(stop_price * (1.0 - self.slippage_pct / 100.0));
                        exit_date = Some(bar.date);
                    }
                }
                exit_reason = Some(ExitReason::StopLoss);
                break;
            }

            if days_held >= self.max_holding_days && bar.close > 0.0 {
                exit_price = Some(end_of_data_price(bar));
                exit_date = Some(bar.date);
                exit_reason = Some(ExitReason::MaxHolding);
                break;
            }
        }

        let (exit_price, exit_date, exit_reason) = match (exit_price, exit_date, exit_reason) {
            (Some(p), Some(d), Some(r)) => (p, d, r),
            _ => {
                let last_bar = bars.last().expect("non-empty bar series");
                (end_of_data_price(last_bar), last_bar.date, ExitReason::EndOfData)
            }
        };

        let pnl = (exit_price - entry_price) * shares as f64;
        let return_pct = ((exit_price / entry_price) - 1.0) * 100.0;
        let holding_days = (exit_date - entry_date).num_days();

        Ok(TradeResult {
            ticker: candidate.ticker.clone(),
            grade: candidate.grade,
            grade_source: candidate.grade_source,
            score: candidate.score,
            report_date: candidate.report_date,
            entry_date,
            entry_price: round4(entry_price),
            exit_date,
            exit_price: round4(exit_price),
            shares,
            invested: round2(invested),
            pnl: round2(pnl),
            return_pct: round2(return_pct),
            holding_days,
            exit_reason,
            gap_size: candidate.gap_size,
            company_name: candidate.company_name.clone(),
        })
    }
}

fn skip(candidate: &Candidate, reason: SkipReason) -> SkippedTrade {
    SkippedTrade {
        ticker: candidate.ticker.clone(),
        report_date: candidate.report_date,
        grade: candidate.grade,
        score: candidate.score,
        skip_reason: reason,
    }
}

/// Whether `bar`'s stop condition is met for the configured `stop_mode`.
/// `skip_entry_day` shares the intraday trigger but ignores the entry day
/// itself; `close_next_open` shares the close-based trigger and only differs
/// in execution price/date, handled by the caller.
fn stop_hit(stop_mode: StopMode, bar: &eg_schemas::PriceBar, stop_price: f64, days_held: i64) -> bool {
    match stop_mode {
        StopMode::Intraday => bar.low > 0.0 && bar.adjusted_low() <= stop_price,
        StopMode::SkipEntryDay => days_held > 0 && bar.low > 0.0 && bar.adjusted_low() <= stop_price,
        StopMode::Close | StopMode::CloseNextOpen => {
            let adj_c = end_of_data_price(bar);
            adj_c > 0.0 && adj_c <= stop_price
        }
    }
}

fn end_of_data_price(bar: &eg_schemas::PriceBar) -> f64 {
    if bar.adj_close > 0.0 {
        bar.adj_close
    } else {
        bar.close
    }
}

/// First bar matching `entry_mode`: `ReportOpen` accepts the report date
/// itself; `NextDayOpen` requires a date strictly after it.
fn find_entry_index(bars: &[eg_schemas::PriceBar], report_date: NaiveDate, entry_mode: EntryMode) -> Option<usize> {
    match entry_mode {
        EntryMode::ReportOpen => bars.iter().position(|b| b.date >= report_date),
        EntryMode::NextDayOpen => bars.iter().position(|b| b.date > report_date),
    }
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
    use eg_schemas::PriceBar;

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

    fn candidate(ticker: &str, report_date: &str, score: Option<f64>) -> Candidate {
        Candidate {
            ticker: ticker.to_string(),
            report_date: report_date.parse().unwrap(),
            grade: Grade::A,
            grade_source: GradeSource::Html,
            score,
            gap_size: Some(5.0),
            company_name: None,
        }
    }

    #[test]
    fn intraday_stop_loss_applies_slippage() {
        let sim = TradeSimulator::default();
        let bars = vec![
            bar("2025-10-02", 100.0, 101.0, 99.0, 100.0),
            bar("2025-10-03", 95.0, 96.0, 91.0, 93.0),
            bar("2025-10-04", 90.0, 91.0, 85.0, 86.0),
        ];
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), bars);

        let (trades, skipped) = sim.simulate_all(&[candidate("AAPL", "2025-10-01", Some(90.0))], &data);
        assert!(skipped.is_empty());
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.entry_date, "2025-10-02".parse::<NaiveDate>().unwrap());
        assert_eq!(t.exit_date, "2025-10-04".parse::<NaiveDate>().unwrap());
        assert_eq!(t.exit_reason, ExitReason::StopLoss);
        assert_eq!(t.exit_price, 89.55);
    }

    #[test]
    fn close_next_open_falls_back_to_close_when_no_next_bar() {
        let sim = TradeSimulator {
            stop_mode: StopMode::CloseNextOpen,
            ..TradeSimulator::default()
        };
        let bars = vec![
            bar("2025-10-02", 100.0, 101.0, 99.0, 100.0),
            bar("2025-10-03", 95.0, 96.0, 91.0, 88.0),
        ];
        let mut data = HashMap::new();
        data.insert("AAPL".to_string(), bars);

        let (trades, _) = sim.simulate_all(&[candidate("AAPL", "2025-10-01", None)], &data);
        let t = &trades[0];
        assert_eq!(t.exit_date, "2025-10-03".parse::<NaiveDate>().unwrap());
        assert_eq!(t.exit_price, 87.56);
    }

    #[test]
    fn zero_shares_is_skipped() {
        let sim = TradeSimulator {
            position_size: 10.0,
            ..TradeSimulator::default()
        };
        let bars = vec![bar("2025-10-02", 500.0, 505.0, 495.0, 500.0)];
        let mut data = HashMap::new();
        data.insert("BRK".to_string(), bars);

        let (trades, skipped) = sim.simulate_all(&[candidate("BRK", "2025-10-01", None)], &data);
        assert!(trades.is_empty());
        assert_eq!(skipped[0].skip_reason, SkipReason::ZeroShares);
    }

    #[test]
    fn daily_entry_limit_ranks_scored_above_unscored_and_skips_overflow() {
        let sim = TradeSimulator {
            daily_entry_limit: Some(1),
            ..TradeSimulator::default()
        };
        let bars_a = vec![bar("2025-10-02", 10.0, 11.0, 9.0, 10.0), bar("2025-10-03", 10.0, 11.0, 9.0, 10.0)];
        let bars_b = bars_a.clone();
        let mut data = HashMap::new();
        data.insert("AAA".to_string(), bars_a);
        data.insert("BBB".to_string(), bars_b);

        let candidates = vec![
            candidate("AAA", "2025-10-01", None),
            candidate("BBB", "2025-10-01", Some(80.0)),
        ];
        let (trades, skipped) = sim.simulate_all(&candidates, &data);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].ticker, "BBB");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].ticker, "AAA");
        assert_eq!(skipped[0].skip_reason, SkipReason::DailyLimit);
    }
}
