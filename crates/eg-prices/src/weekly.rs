//! Weekly bar aggregation and trend indicators for the trailing stop.

use chrono::{Datelike, NaiveDate};
use eg_schemas::{PriceBar, WeeklyBar};
use std::collections::HashMap;

/// Aggregate daily bars into weekly bars using ISO week numbers.
///
/// Partial weeks (holidays, short weeks) are valid bars. Uses adjusted
/// prices: `open` = first bar's adjusted open, `high`/`low` = max/min of
/// adjusted high/low across the week, `close` = last bar's adjusted close
/// (falling back to raw close when the adjusted close is non-positive).
pub fn aggregate_daily_to_weekly(bars: &[PriceBar]) -> Vec<WeeklyBar> {
    if bars.is_empty() {
        return Vec::new();
    }

    let mut order: Vec<(i32, u32)> = Vec::new();
    let mut groups: HashMap<(i32, u32), Vec<PriceBar>> = HashMap::new();

    for bar in bars {
        let iso = bar.date.iso_week();
        let key = (iso.year(), iso.week());
        if !groups.contains_key(&key) {
            order.push(key);
        }
        groups.entry(key).or_default().push(*bar);
    }

    order
        .into_iter()
        .map(|key| {
            let week_bars = &groups[&key];
            let first = week_bars.first().expect("group is never empty");
            let last = week_bars.last().expect("group is never empty");

            WeeklyBar {
                iso_year: key.0,
                iso_week: key.1,
                week_start: first.date,
                week_ending: last.date,
                open: first.adjusted_open(),
                high: week_bars
                    .iter()
                    .map(PriceBar::adjusted_high)
                    .fold(f64::MIN, f64::max),
                low: week_bars
                    .iter()
                    .map(PriceBar::adjusted_low)
                    .fold(f64::MAX, f64::min),
                close: if last.adj_close > 0.0 {
                    last.adj_close
                } else {
                    last.close
                },
                volume: week_bars.iter().map(|b| b.volume).sum(),
            }
        })
        .collect()
}

/// EMA of weekly close prices. The first `period` bars use an SMA seed, then
/// the standard EMA recurrence. Indices before the seed are `None`, and a
/// `None` predecessor propagates forward (missing data never heals itself).
pub fn compute_weekly_ema(weekly_bars: &[WeeklyBar], period: usize) -> Vec<Option<f64>> {
    if weekly_bars.is_empty() || period < 1 {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut result: Vec<Option<f64>> = Vec::with_capacity(weekly_bars.len());

    for (i, wb) in weekly_bars.iter().enumerate() {
        if i < period - 1 {
            result.push(None);
        } else if i == period - 1 {
            let sma: f64 = weekly_bars[..period].iter().map(|b| b.close).sum::<f64>() / period as f64;
            result.push(Some(round6(sma)));
        } else {
            match result[i - 1] {
                None => result.push(None),
                Some(prev) => {
                    let ema = wb.close * k + prev * (1.0 - k);
                    result.push(Some(round6(ema)));
                }
            }
        }
    }

    result
}

/// N-week low excluding the current week: for index `i`, the min low over
/// `weekly_bars[i-period..i]`. `None` until a full window of `period` prior
/// weeks exists.
pub fn compute_weekly_nweek_low(weekly_bars: &[WeeklyBar], period: usize) -> Vec<Option<f64>> {
    if weekly_bars.is_empty() || period < 1 {
        return Vec::new();
    }

    (0..weekly_bars.len())
        .map(|i| {
            if i < period {
                None
            } else {
                let start = i.saturating_sub(period);
                weekly_bars[start..i]
                    .iter()
                    .map(|b| b.low)
                    .fold(None, |acc: Option<f64>, low| {
                        Some(acc.map_or(low, |a| a.min(low)))
                    })
            }
        })
        .collect()
}

/// Whether `current_date` is the last trading day of its ISO week, found by
/// scanning `bars` for that date and checking the next bar's ISO week.
pub fn is_week_end_by_date(bars: &[PriceBar], current_date: NaiveDate) -> bool {
    let Some(idx) = bars.iter().position(|b| b.date == current_date) else {
        return false;
    };
    is_week_end_by_index(bars, idx)
}

/// Whether `bars[idx]` is the last trading day of its ISO week.
pub fn is_week_end_by_index(bars: &[PriceBar], idx: usize) -> bool {
    let cur = bars[idx].date.iso_week();
    if idx + 1 >= bars.len() {
        return true;
    }
    let next = bars[idx + 1].date.iso_week();
    (cur.year(), cur.week()) != (next.year(), next.week())
}

/// Count weekly bars that started strictly after `entry_date` and completed
/// by `current_date`. The entry week is always excluded, even when entry
/// falls on the week's first trading day.
pub fn count_completed_weeks(
    weekly_bars: &[WeeklyBar],
    entry_date: NaiveDate,
    current_date: NaiveDate,
) -> usize {
    weekly_bars
        .iter()
        .filter(|wb| wb.week_start > entry_date && wb.week_ending <= current_date)
        .count()
}

/// Whether the most recent weekly bar completed by `current_date` broke the
/// given indicator (weekly close below the indicator value).
pub fn is_trend_broken(
    weekly_bars: &[WeeklyBar],
    indicators: &[Option<f64>],
    current_date: NaiveDate,
) -> bool {
    let wb_idx = weekly_bars
        .iter()
        .enumerate()
        .filter(|(_, wb)| wb.week_ending <= current_date)
        .map(|(i, _)| i)
        .next_back();

    let Some(idx) = wb_idx else {
        return false;
    };
    let Some(Some(indicator)) = indicators.get(idx) else {
        return false;
    };
    weekly_bars[idx].close < *indicator
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn aggregates_single_week() {
        let bars = vec![bar("2025-01-06", 10.0), bar("2025-01-07", 12.0), bar("2025-01-08", 9.0)];
        let weekly = aggregate_daily_to_weekly(&bars);
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].open, 10.0);
        assert_eq!(weekly[0].high, 12.0);
        assert_eq!(weekly[0].low, 9.0);
        assert_eq!(weekly[0].close, 9.0);
        assert_eq!(weekly[0].volume, 300);
    }

    #[test]
    fn ema_seeds_with_sma_then_recurs() {
        let bars: Vec<PriceBar> = (1..=5)
            .map(|w| bar(&format!("2025-01-{:02}", w * 7), 10.0 * w as f64))
            .collect();
        let weekly = aggregate_daily_to_weekly(&bars);
        let ema = compute_weekly_ema(&weekly, 3);
        assert_eq!(ema[0], None);
        assert_eq!(ema[1], None);
        assert!(ema[2].is_some());
        assert!(ema[3].is_some());
    }

    #[test]
    fn nweek_low_excludes_current_week() {
        let closes = [10.0, 5.0, 20.0, 1.0];
        let weekly: Vec<WeeklyBar> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| WeeklyBar {
                iso_year: 2025,
                iso_week: i as u32 + 1,
                week_start: "2025-01-06".parse().unwrap(),
                week_ending: "2025-01-10".parse().unwrap(),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 0,
            })
            .collect();
        let low = compute_weekly_nweek_low(&weekly, 2);
        assert_eq!(low, vec![None, None, Some(5.0), Some(5.0)]);
    }

    #[test]
    fn count_completed_weeks_excludes_entry_week() {
        let weekly = vec![
            WeeklyBar {
                iso_year: 2025,
                iso_week: 1,
                week_start: "2025-01-06".parse().unwrap(),
                week_ending: "2025-01-10".parse().unwrap(),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0,
            },
            WeeklyBar {
                iso_year: 2025,
                iso_week: 2,
                week_start: "2025-01-13".parse().unwrap(),
                week_ending: "2025-01-17".parse().unwrap(),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0,
            },
        ];
        let entry = "2025-01-06".parse().unwrap();
        assert_eq!(
            count_completed_weeks(&weekly, entry, "2025-01-10".parse().unwrap()),
            0
        );
        assert_eq!(
            count_completed_weeks(&weekly, entry, "2025-01-17".parse().unwrap()),
            1
        );
    }
}
