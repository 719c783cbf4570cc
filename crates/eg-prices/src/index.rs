use chrono::NaiveDate;
use eg_schemas::PriceBar;
use std::collections::{BTreeMap, BTreeSet};

/// O(1) ticker+date bar lookup, previous-close lookup and trading-date
/// enumeration over a fixed universe of price bars.
///
/// Grounded on the original backtest's `PriceDateIndex`: built once per run
/// from a flat set of fetched bars, then queried repeatedly by the
/// simulators without re-touching the price fetcher.
#[derive(Debug, Clone, Default)]
pub struct PriceDateIndex {
    by_ticker: BTreeMap<String, BTreeMap<NaiveDate, PriceBar>>,
    all_dates: BTreeSet<NaiveDate>,
}

impl PriceDateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bars<I>(bars: I) -> Self
    where
        I: IntoIterator<Item = (String, PriceBar)>,
    {
        let mut idx = Self::new();
        for (ticker, bar) in bars {
            idx.insert(ticker, bar);
        }
        idx
    }

    pub fn insert(&mut self, ticker: String, bar: PriceBar) {
        self.all_dates.insert(bar.date);
        self.by_ticker.entry(ticker).or_default().insert(bar.date, bar);
    }

    pub fn get_bar(&self, ticker: &str, date: NaiveDate) -> Option<&PriceBar> {
        self.by_ticker.get(ticker)?.get(&date)
    }

    /// Nearest strictly-prior date with data for `ticker`, returned as an
    /// adjusted close (falls back to raw close when adj_close is non-positive).
    pub fn get_previous_close(&self, ticker: &str, date: NaiveDate) -> Option<f64> {
        let dates = self.by_ticker.get(ticker)?;
        let (_, bar) = dates.range(..date).next_back()?;
        Some(adjusted_close(bar))
    }

    /// All bars for `ticker` with `date <= as_of`, in ascending date order.
    pub fn get_bars_up_to(&self, ticker: &str, as_of: NaiveDate) -> Vec<PriceBar> {
        match self.by_ticker.get(ticker) {
            Some(dates) => dates.range(..=as_of).map(|(_, bar)| *bar).collect(),
            None => Vec::new(),
        }
    }

    /// Union of every trading date seen across all tickers, ascending.
    pub fn all_trading_dates(&self) -> Vec<NaiveDate> {
        self.all_dates.iter().copied().collect()
    }
}

fn adjusted_close(bar: &PriceBar) -> f64 {
    if bar.adj_close > 0.0 {
        bar.adj_close
    } else {
        bar.close
    }
}
