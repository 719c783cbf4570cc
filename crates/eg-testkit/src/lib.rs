//! Shared test fixtures for the earnings-gap crates: bar/candidate builders
//! and fake `PriceSource`/`PositionSource` implementations, so integration
//! tests in `eg-signals`, `eg-executor` and `eg-cli` don't each hand-roll
//! their own. Grounded on `mqk-testkit`'s `FakeBroker` (a `HashMap`-backed
//! stand-in enforcing the same idempotency contract as the real thing) and
//! `load_bars_csv`'s builder style, scaled down to this workspace's narrower
//! capability traits.

use chrono::NaiveDate;
use eg_schemas::{Grade, GradeSource, PriceBar, TradeCandidate};
use eg_signals::{BrokerPosition, PositionSource};
use eg_trailstop::PriceSource;
use std::collections::HashMap;
use std::sync::Mutex;

/// Builds a daily bar with `adj_close` defaulted to `close`.
pub fn bar(date: &str, open: f64, high: f64, low: f64, close: f64) -> PriceBar {
    PriceBar {
        date: date.parse().expect("valid date"),
        open,
        high,
        low,
        close,
        adj_close: close,
        volume: 1_000,
    }
}

/// Builds a graded candidate with every optional field left unset, suitable
/// as a default a test then overrides fields on.
pub fn candidate(ticker: &str, report_date: &str, grade: Grade, score: Option<f64>) -> TradeCandidate {
    TradeCandidate {
        ticker: ticker.to_string(),
        company_name: None,
        report_date: report_date.parse().expect("valid date"),
        grade,
        grade_source: GradeSource::Html,
        score,
        gap_size: None,
    }
}

/// An in-memory `PriceSource` over per-ticker bar vectors, filtered to the
/// requested `[start, end]` window the way a real feed would.
#[derive(Debug, Clone, Default)]
pub struct FakePriceSource {
    bars: HashMap<String, Vec<PriceBar>>,
}

impl FakePriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bars(mut self, ticker: &str, bars: Vec<PriceBar>) -> Self {
        self.bars.insert(ticker.to_string(), bars);
        self
    }
}

impl PriceSource for FakePriceSource {
    fn fetch_prices(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> anyhow::Result<Vec<PriceBar>> {
        Ok(self
            .bars
            .get(ticker)
            .map(|bars| bars.iter().copied().filter(|b| b.date >= start && b.date <= end).collect())
            .unwrap_or_default())
    }
}

/// A fixed set of brokerage positions, standing in for a real
/// `AlpacaPositionSource` in signal-generation tests. `set_positions` lets a
/// test mutate the book mid-run (e.g. simulating a fill landing between two
/// reconciliation checks).
#[derive(Debug, Default)]
pub struct FakePositionSource {
    positions: Mutex<Vec<BrokerPosition>>,
}

impl FakePositionSource {
    pub fn new(positions: Vec<BrokerPosition>) -> Self {
        Self { positions: Mutex::new(positions) }
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        *self.positions.lock().expect("fake position source mutex poisoned") = positions;
    }
}

impl PositionSource for FakePositionSource {
    fn fetch_positions(&self) -> anyhow::Result<Vec<BrokerPosition>> {
        Ok(self.positions.lock().expect("fake position source mutex poisoned").clone())
    }
}

/// An in-memory sqlite pool with the full schema applied, for tests that need
/// a real `eg_store` round trip without a file on disk.
pub async fn memory_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.expect("open in-memory sqlite");
    eg_store::migrate(&pool).await.expect("run migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_price_source_filters_to_window() {
        let source = FakePriceSource::new().with_bars(
            "ACME",
            vec![
                bar("2026-01-02", 10.0, 10.5, 9.5, 10.0),
                bar("2026-01-05", 10.2, 10.6, 9.9, 10.3),
                bar("2026-01-06", 10.4, 10.8, 10.0, 10.6),
            ],
        );
        let bars = source
            .fetch_prices("ACME", "2026-01-05".parse().unwrap(), "2026-01-06".parse().unwrap())
            .unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, "2026-01-05".parse::<NaiveDate>().unwrap());
    }

    #[test]
    fn fake_price_source_unknown_ticker_is_empty() {
        let source = FakePriceSource::new();
        let bars = source
            .fetch_prices("NOPE", "2026-01-01".parse().unwrap(), "2026-01-31".parse().unwrap())
            .unwrap();
        assert!(bars.is_empty());
    }

    #[test]
    fn fake_position_source_round_trips_updates() {
        let source = FakePositionSource::new(vec![BrokerPosition {
            ticker: "ACME".to_string(),
            qty: 10,
            unrealized_pl: 5.0,
        }]);
        assert_eq!(source.fetch_positions().unwrap().len(), 1);
        source.set_positions(vec![]);
        assert!(source.fetch_positions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_pool_has_migrated_schema() {
        let pool = memory_pool().await;
        let status = eg_store::status(&pool).await.unwrap();
        assert!(status.ok);
        assert!(status.has_positions_table);
    }
}
