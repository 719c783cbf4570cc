//! eg-trailstop
//!
//! Live trailing-stop evaluation for a single open position: fetches the
//! trailing window of bars, aggregates to weekly, computes the configured
//! trend indicator and decides whether this week's close broke it.
//!
//! Grounded on the original `live/trailing_stop_checker.py`. Unlike the
//! portfolio simulator (which already holds every bar it will ever need),
//! the live checker pulls its own window through a [`PriceSource`] so it can
//! run standalone against a real brokerage/price-data feed each trading day.

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use eg_prices::{
    aggregate_daily_to_weekly, compute_weekly_ema, compute_weekly_nweek_low, count_completed_weeks,
    is_trend_broken, is_week_end_by_date,
};
use eg_schemas::{PriceBar, TrailingMode};

/// Fetches a ticker's daily bars for `[start, end]`. Implemented by the
/// brokerage/price-data client; kept as a trait here so this crate never
/// depends on an HTTP stack.
pub trait PriceSource {
    fn fetch_prices(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrailingStopResult {
    pub ticker: String,
    pub is_week_end: bool,
    pub completed_weeks: usize,
    pub transition_met: bool,
    pub trend_broken: bool,
    pub should_exit: bool,
    pub indicator_value: Option<f64>,
    pub last_close: Option<f64>,
}

pub struct TrailingStopChecker {
    pub trailing_transition_weeks: u32,
    pub fmp_lookback_days: i64,
}

impl Default for TrailingStopChecker {
    fn default() -> Self {
        TrailingStopChecker {
            trailing_transition_weeks: 2,
            fmp_lookback_days: 400,
        }
    }
}

impl TrailingStopChecker {
    /// Evaluates whether `ticker`, held since `entry_date`, should exit as of
    /// `as_of_date` under the given trailing mode and indicator period.
    ///
    /// Fails soft (an all-`false`/`None` result) when the price source
    /// returns no data, and short-circuits with `is_week_end: false` when
    /// `as_of_date` is not the last trading day of its ISO week — the
    /// trailing stop only ever fires at week boundaries.
    pub fn check_position(
        &self,
        source: &dyn PriceSource,
        ticker: &str,
        entry_date: NaiveDate,
        trailing_mode: TrailingMode,
        period: usize,
        as_of_date: NaiveDate,
    ) -> Result<TrailingStopResult> {
        let start = as_of_date - Duration::days(self.fmp_lookback_days);
        let bars = source.fetch_prices(ticker, start, as_of_date)?;

        if bars.is_empty() {
            return Ok(TrailingStopResult {
                ticker: ticker.to_string(),
                is_week_end: false,
                completed_weeks: 0,
                transition_met: false,
                trend_broken: false,
                should_exit: false,
                indicator_value: None,
                last_close: None,
            });
        }

        let week_end = is_week_end_by_date(&bars, as_of_date);
        if !week_end {
            return Ok(TrailingStopResult {
                ticker: ticker.to_string(),
                is_week_end: false,
                completed_weeks: 0,
                transition_met: false,
                trend_broken: false,
                should_exit: false,
                indicator_value: None,
                last_close: None,
            });
        }

        let weekly = aggregate_daily_to_weekly(&bars);
        let indicators = match trailing_mode {
            TrailingMode::WeeklyEma => compute_weekly_ema(&weekly, period),
            TrailingMode::WeeklyNweekLow => compute_weekly_nweek_low(&weekly, period),
        };

        let completed = count_completed_weeks(&weekly, entry_date, as_of_date);
        let transition_met = completed as u32 >= self.trailing_transition_weeks;
        let broken = transition_met && is_trend_broken(&weekly, &indicators, as_of_date);

        let last_idx = weekly
            .iter()
            .enumerate()
            .filter(|(_, wb)| wb.week_ending <= as_of_date)
            .map(|(i, _)| i)
            .next_back();

        let (last_close, indicator_value) = match last_idx {
            Some(i) => (Some(weekly[i].close), indicators.get(i).copied().flatten()),
            None => (None, None),
        };

        Ok(TrailingStopResult {
            ticker: ticker.to_string(),
            is_week_end: true,
            completed_weeks: completed,
            transition_met,
            trend_broken: broken,
            should_exit: week_end && transition_met && broken,
            indicator_value,
            last_close,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeSource {
        bars: HashMap<String, Vec<PriceBar>>,
    }

    impl PriceSource for FakeSource {
        fn fetch_prices(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
            Ok(self
                .bars
                .get(ticker)
                .map(|bars| {
                    bars.iter()
                        .copied()
                        .filter(|b| b.date >= start && b.date <= end)
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn bar(date: &str, close: f64) -> PriceBar {
        PriceBar {
            date: date.parse().unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            adj_close: close,
            volume: 100,
        }
    }

    #[test]
    fn empty_data_fails_soft() {
        let source = FakeSource { bars: HashMap::new() };
        let checker = TrailingStopChecker::default();
        let result = checker
            .check_position(
                &source,
                "AAPL",
                "2025-01-01".parse().unwrap(),
                TrailingMode::WeeklyEma,
                10,
                "2025-03-01".parse().unwrap(),
            )
            .unwrap();
        assert!(!result.should_exit);
        assert!(!result.is_week_end);
    }

    #[test]
    fn non_week_end_short_circuits() {
        let mut bars = HashMap::new();
        bars.insert(
            "AAPL".to_string(),
            vec![bar("2025-01-06", 10.0), bar("2025-01-07", 10.0)],
        );
        let source = FakeSource { bars };
        let checker = TrailingStopChecker::default();
        let result = checker
            .check_position(
                &source,
                "AAPL",
                "2025-01-01".parse().unwrap(),
                TrailingMode::WeeklyEma,
                2,
                "2025-01-06".parse().unwrap(),
            )
            .unwrap();
        assert!(!result.is_week_end);
        assert!(!result.should_exit);
    }
}
