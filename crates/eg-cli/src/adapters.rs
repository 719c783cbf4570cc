//! Boundary adapters wiring `eg-broker`'s HTTP client and a local CSV price
//! cache into the narrow capability traits `eg-signals`/`eg-trailstop`
//! depend on. No market-data HTTP client lives in this workspace, so a local
//! CSV cache stands in as the `PriceSource` for both live and backtest use;
//! see DESIGN.md.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use eg_broker::AlpacaClient;
use eg_schemas::PriceBar;
use eg_signals::{BrokerPosition, PositionSource};
use eg_trailstop::PriceSource;
use std::collections::HashMap;
use std::path::PathBuf;

pub struct AlpacaPositionSource<'a> {
    client: &'a AlpacaClient,
}

impl<'a> AlpacaPositionSource<'a> {
    pub fn new(client: &'a AlpacaClient) -> Self {
        Self { client }
    }
}

impl PositionSource for AlpacaPositionSource<'_> {
    fn fetch_positions(&self) -> Result<Vec<BrokerPosition>> {
        let positions = self.client.get_positions()?;
        Ok(positions
            .into_iter()
            .map(|p| BrokerPosition {
                ticker: p.symbol,
                qty: p.qty as i64,
                unrealized_pl: p.unrealized_pl,
            })
            .collect())
    }
}

/// Reads `{ticker}.csv` files from a directory, one row per trading day:
/// `date,open,high,low,close,adj_close,volume`. Grounded on
/// `mqk-testkit::load_bars_csv`'s positional-column parsing style.
pub struct CsvPriceSource {
    dir: PathBuf,
}

impl CsvPriceSource {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn load(&self, ticker: &str) -> Result<Vec<PriceBar>> {
        let path = self.dir.join(format!("{ticker}.csv"));
        let mut rdr = csv::Reader::from_path(&path)
            .with_context(|| format!("open price csv for {ticker}: {}", path.display()))?;
        let mut bars = Vec::new();
        for rec in rdr.records() {
            let rec = rec.with_context(|| format!("read price csv row for {ticker}"))?;
            let date: NaiveDate = rec[0].parse().with_context(|| format!("parse date for {ticker}"))?;
            let open: f64 = rec[1].parse().with_context(|| format!("parse open for {ticker}"))?;
            let high: f64 = rec[2].parse().with_context(|| format!("parse high for {ticker}"))?;
            let low: f64 = rec[3].parse().with_context(|| format!("parse low for {ticker}"))?;
            let close: f64 = rec[4].parse().with_context(|| format!("parse close for {ticker}"))?;
            let adj_close: f64 = rec
                .get(5)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse())
                .transpose()
                .with_context(|| format!("parse adj_close for {ticker}"))?
                .unwrap_or(close);
            let volume: u64 = rec
                .get(6)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse())
                .transpose()
                .with_context(|| format!("parse volume for {ticker}"))?
                .unwrap_or(0);
            if high < low {
                tracing::debug!(ticker, %date, "dropping bar with high < low");
                continue;
            }
            bars.push(PriceBar { date, open, high, low, close, adj_close, volume });
        }
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }
}

impl PriceSource for CsvPriceSource {
    fn fetch_prices(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
        let bars = self.load(ticker)?;
        Ok(bars.into_iter().filter(|b| b.date >= start && b.date <= end).collect())
    }
}

/// In-memory cache over `CsvPriceSource`, used by the backtest subcommand to
/// avoid re-reading a ticker's CSV once per candidate.
pub struct CachedPriceLoader {
    source: CsvPriceSource,
    cache: HashMap<String, Vec<PriceBar>>,
}

impl CachedPriceLoader {
    pub fn new(dir: PathBuf) -> Self {
        Self { source: CsvPriceSource::new(dir), cache: HashMap::new() }
    }

    pub fn bars(&mut self, ticker: &str) -> Result<&[PriceBar]> {
        if !self.cache.contains_key(ticker) {
            let bars = self.source.load(ticker)?;
            self.cache.insert(ticker.to_string(), bars);
        }
        Ok(self.cache.get(ticker).expect("just inserted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &std::path::Path, ticker: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(format!("{ticker}.csv"))).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn csv_price_source_filters_by_date_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "ACME",
            "date,open,high,low,close,adj_close,volume\n\
             2026-01-06,10.2,10.6,10.0,10.5,10.5,900\n\
             2026-01-05,10.0,10.5,9.5,10.2,10.2,1000\n",
        );
        let source = CsvPriceSource::new(dir.path().to_path_buf());
        let bars = source
            .fetch_prices("ACME", "2026-01-05".parse().unwrap(), "2026-01-05".parse().unwrap())
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].date, "2026-01-05".parse::<NaiveDate>().unwrap());

        let all = source
            .fetch_prices("ACME", "2026-01-01".parse().unwrap(), "2026-01-31".parse().unwrap())
            .unwrap();
        assert_eq!(all[0].date, "2026-01-05".parse::<NaiveDate>().unwrap());
        assert_eq!(all[1].date, "2026-01-06".parse::<NaiveDate>().unwrap());
    }

    #[test]
    fn csv_price_source_drops_bars_with_high_below_low() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "BAD",
            "date,open,high,low,close,adj_close,volume\n2026-01-05,10.0,9.0,9.5,9.8,9.8,500\n",
        );
        let source = CsvPriceSource::new(dir.path().to_path_buf());
        let bars = source
            .fetch_prices("BAD", "2026-01-01".parse().unwrap(), "2026-01-31".parse().unwrap())
            .unwrap();
        assert!(bars.is_empty());
    }

    #[test]
    fn csv_price_source_defaults_missing_adj_close_and_volume() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "NOADJ", "date,open,high,low,close\n2026-01-05,10.0,10.5,9.5,10.2\n");
        let source = CsvPriceSource::new(dir.path().to_path_buf());
        let bars = source
            .fetch_prices("NOADJ", "2026-01-01".parse().unwrap(), "2026-01-31".parse().unwrap())
            .unwrap();
        assert_eq!(bars[0].adj_close, 10.2);
        assert_eq!(bars[0].volume, 0);
    }

    #[test]
    fn cached_price_loader_reuses_loaded_bars() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "ACME",
            "date,open,high,low,close,adj_close,volume\n2026-01-05,10.0,10.5,9.5,10.2,10.2,1000\n",
        );
        let mut loader = CachedPriceLoader::new(dir.path().to_path_buf());
        assert_eq!(loader.bars("ACME").unwrap().len(), 1);
        assert_eq!(loader.bars("ACME").unwrap().len(), 1);
    }
}
