//! Shared wire and domain types for the earnings-gap backtest and live pipeline.
//!
//! These mirror the data model used across the price store, simulators, signal
//! generator, state store and executor so that every crate agrees on the same
//! shapes without depending on each other's internals.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single daily OHLC bar, already split/dividend adjusted by the adj_factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: u64,
}

impl PriceBar {
    /// Ratio of adjusted close to raw close; falls back to 1.0 when close is zero
    /// so downstream math never divides by it.
    pub fn adj_factor(&self) -> f64 {
        if self.close == 0.0 {
            1.0
        } else {
            self.adj_close / self.close
        }
    }

    pub fn adjusted_open(&self) -> f64 {
        self.open * self.adj_factor()
    }

    pub fn adjusted_high(&self) -> f64 {
        self.high * self.adj_factor()
    }

    pub fn adjusted_low(&self) -> f64 {
        self.low * self.adj_factor()
    }
}

/// A calendar week of aggregated daily bars, keyed by ISO (year, week).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeeklyBar {
    pub iso_year: i32,
    pub iso_week: u32,
    /// First trading day of the week.
    pub week_start: NaiveDate,
    /// Last trading day of the week.
    pub week_ending: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    A,
    B,
    C,
    D,
}

impl Grade {
    /// Lower rank sorts first; mirrors the original's `GRADE_ORDER` mapping.
    pub fn rank(self) -> u8 {
        match self {
            Grade::A => 0,
            Grade::B => 1,
            Grade::C => 2,
            Grade::D => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeSource {
    Html,
    Inferred,
    Json,
}

/// A single earnings-gap candidate surfaced for a report date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeCandidate {
    pub ticker: String,
    pub company_name: Option<String>,
    pub report_date: NaiveDate,
    pub grade: Grade,
    pub grade_source: GradeSource,
    pub score: Option<f64>,
    pub gap_size: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    MaxHolding,
    EndOfData,
    TrendBreak,
    RotatedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub ticker: String,
    pub grade: Grade,
    pub grade_source: GradeSource,
    pub score: Option<f64>,
    pub report_date: NaiveDate,
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub exit_date: NaiveDate,
    pub exit_price: f64,
    pub shares: u64,
    pub invested: f64,
    pub pnl: f64,
    pub return_pct: f64,
    pub holding_days: i64,
    pub exit_reason: ExitReason,
    pub gap_size: Option<f64>,
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoPriceData,
    ZeroShares,
    MissingOhlc,
    DuplicateTicker,
    CapacityFull,
    DailyLimit,
    AlreadyHeld,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTrade {
    pub ticker: String,
    pub report_date: NaiveDate,
    pub grade: Grade,
    pub score: Option<f64>,
    pub skip_reason: SkipReason,
}

/// A pending exit tag carried on an open position while it waits for the next
/// bar to actually execute (`close_next_open` stop mode, trend break).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingExit {
    StopLoss,
    TrendBreak,
}

/// An in-flight position held by the portfolio simulator for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub ticker: String,
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub shares: u64,
    pub invested: f64,
    pub stop_price: f64,
    pub pending_exit: Option<PendingExit>,
}

/// A position as persisted across process restarts by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentPosition {
    pub position_id: i64,
    pub ticker: String,
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub shares: u64,
    pub stop_price: Option<f64>,
    pub stop_order_id: Option<String>,
    pub exit_date: Option<NaiveDate>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

/// What an order is for, independent of its buy/sell side: an entry buy, an
/// exit sell, or a protective stop. Not named explicitly in the external spec,
/// resolved from the original state store's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderIntent {
    Entry,
    Exit,
    Stop,
}

/// Brokerage order lifecycle. `Filled` and the five variants after it are
/// terminal; nothing transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    DoneForDay,
    Suspended,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
                | OrderStatus::DoneForDay
                | OrderStatus::Suspended
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub client_order_id: String,
    pub ticker: String,
    pub side: Side,
    pub intent: OrderIntent,
    pub trade_date: NaiveDate,
    pub qty: u64,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    pub filled_qty: u64,
    pub filled_avg_price: Option<f64>,
    pub reject_reason: Option<String>,
    pub planned_stop_price: Option<f64>,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Place,
    Poll,
    Execute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub phase: RunPhase,
    pub trade_date: NaiveDate,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub summary: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowPosition {
    pub shadow_id: i64,
    pub ticker: String,
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub score: Option<f64>,
    pub exit_date: Option<NaiveDate>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowSignalRecord {
    pub ticker: String,
    pub trade_date: NaiveDate,
    pub score: Option<f64>,
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub kill_switch: bool,
}

/// Trend indicator used by the trailing stop, matching
/// `PortfolioSimulator::VALID_TRAILING_MODES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingMode {
    WeeklyEma,
    WeeklyNweekLow,
}

impl TrailingMode {
    pub fn parse(s: &str) -> Option<TrailingMode> {
        match s {
            "weekly_ema" => Some(TrailingMode::WeeklyEma),
            "weekly_nweek_low" => Some(TrailingMode::WeeklyNweekLow),
            _ => None,
        }
    }
}

/// Stop-loss execution mode, matching `PortfolioSimulator::VALID_STOP_MODES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    Intraday,
    Close,
    SkipEntryDay,
    CloseNextOpen,
}

impl StopMode {
    pub fn parse(s: &str) -> Option<StopMode> {
        match s {
            "intraday" => Some(StopMode::Intraday),
            "close" => Some(StopMode::Close),
            "skip_entry_day" => Some(StopMode::SkipEntryDay),
            "close_next_open" => Some(StopMode::CloseNextOpen),
            _ => None,
        }
    }
}

/// Entry timing mode, matching `PortfolioSimulator`'s `entry_mode` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    /// First bar on or after the report date.
    ReportOpen,
    /// First bar strictly after the report date.
    NextDayOpen,
}

impl EntryMode {
    pub fn parse(s: &str) -> Option<EntryMode> {
        match s {
            "report_open" => Some(EntryMode::ReportOpen),
            "next_day_open" => Some(EntryMode::NextDayOpen),
            _ => None,
        }
    }
}
