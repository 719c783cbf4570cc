//! eg-prices
//!
//! - Ticker/date indexed price bar lookup (`PriceDateIndex`)
//! - Daily-to-weekly bar aggregation (ISO week grouping)
//! - Weekly EMA and N-week-low trend indicators
//!
//! Pure deterministic logic over already-fetched bars: no IO, no network, no
//! wall-clock time.

mod index;
pub mod weekly;

pub use index::PriceDateIndex;
pub use weekly::{
    aggregate_daily_to_weekly, compute_weekly_ema, compute_weekly_nweek_low,
    count_completed_weeks, is_trend_broken, is_week_end_by_date, is_week_end_by_index,
};
