//! CSV loaders for the backtest and live signal-gen commands. Candidate
//! ranking and price history both arrive as external files rather than over
//! an in-process API, so this is a thin, positional-column reader grounded
//! on `mqk-testkit::load_bars_csv`'s style.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use eg_prices::PriceDateIndex;
use eg_schemas::{Grade, GradeSource, TradeCandidate};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::adapters::CachedPriceLoader;

pub fn load_candidates_csv(path: &Path) -> Result<Vec<TradeCandidate>> {
    let mut rdr =
        csv::Reader::from_path(path).with_context(|| format!("open candidates csv: {}", path.display()))?;
    let mut out = Vec::new();
    for rec in rdr.records() {
        let rec = rec.context("read candidates csv row")?;
        let ticker = rec[0].to_string();
        let company_name = rec.get(1).filter(|s| !s.is_empty()).map(str::to_string);
        let report_date: NaiveDate = rec[2].parse().with_context(|| format!("parse report_date for {ticker}"))?;
        let grade = parse_grade(&rec[3]).with_context(|| format!("parse grade for {ticker}"))?;
        let grade_source = parse_grade_source(&rec[4]).with_context(|| format!("parse grade_source for {ticker}"))?;
        let score: Option<f64> =
            rec.get(5).filter(|s| !s.is_empty()).map(|s| s.parse()).transpose().context("parse score")?;
        let gap_size: Option<f64> =
            rec.get(6).filter(|s| !s.is_empty()).map(|s| s.parse()).transpose().context("parse gap_size")?;
        out.push(TradeCandidate { ticker, company_name, report_date, grade, grade_source, score, gap_size });
    }
    Ok(out)
}

fn parse_grade(s: &str) -> Result<Grade> {
    match s.trim().to_ascii_uppercase().as_str() {
        "A" => Ok(Grade::A),
        "B" => Ok(Grade::B),
        "C" => Ok(Grade::C),
        "D" => Ok(Grade::D),
        other => anyhow::bail!("unknown grade '{other}'"),
    }
}

fn parse_grade_source(s: &str) -> Result<GradeSource> {
    match s.trim().to_ascii_lowercase().as_str() {
        "html" => Ok(GradeSource::Html),
        "inferred" => Ok(GradeSource::Inferred),
        "json" => Ok(GradeSource::Json),
        other => anyhow::bail!("unknown grade_source '{other}'"),
    }
}

/// Loads every ticker referenced by `candidates` from `price_data_dir`
/// (`{ticker}.csv` per ticker) into a date index for the portfolio simulator.
pub fn load_price_index(price_data_dir: &Path, candidates: &[TradeCandidate]) -> Result<PriceDateIndex> {
    let mut loader = CachedPriceLoader::new(PathBuf::from(price_data_dir));
    let tickers: BTreeSet<&str> = candidates.iter().map(|c| c.ticker.as_str()).collect();
    let mut all_bars = Vec::new();
    for ticker in tickers {
        let bars = loader.bars(ticker)?;
        all_bars.extend(bars.iter().cloned().map(|bar| (ticker.to_string(), bar)));
    }
    Ok(PriceDateIndex::from_bars(all_bars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &std::path::Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_candidates_with_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "candidates.csv",
            "ticker,company_name,report_date,grade,grade_source,score,gap_size\n\
             ACME,Acme Corp,2026-01-05,A,html,91.5,6.2\n\
             WIDG,,2026-01-05,c,inferred,,\n",
        );

        let candidates = load_candidates_csv(&path).unwrap();
        assert_eq!(candidates.len(), 2);

        assert_eq!(candidates[0].ticker, "ACME");
        assert_eq!(candidates[0].company_name.as_deref(), Some("Acme Corp"));
        assert_eq!(candidates[0].grade, Grade::A);
        assert_eq!(candidates[0].grade_source, GradeSource::Html);
        assert_eq!(candidates[0].score, Some(91.5));
        assert_eq!(candidates[0].gap_size, Some(6.2));

        assert_eq!(candidates[1].ticker, "WIDG");
        assert!(candidates[1].company_name.is_none());
        assert_eq!(candidates[1].grade, Grade::C);
        assert_eq!(candidates[1].grade_source, GradeSource::Inferred);
        assert!(candidates[1].score.is_none());
    }

    #[test]
    fn rejects_unknown_grade() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "candidates.csv",
            "ticker,company_name,report_date,grade,grade_source,score,gap_size\nACME,,2026-01-05,Z,html,,\n",
        );
        assert!(load_candidates_csv(&path).is_err());
    }

    #[test]
    fn load_price_index_merges_every_referenced_ticker() {
        let candidates_dir = tempfile::tempdir().unwrap();
        write_csv(
            candidates_dir.path(),
            "ACME.csv",
            "date,open,high,low,close,adj_close,volume\n2026-01-05,10.0,10.5,9.5,10.2,10.2,1000\n",
        );
        write_csv(
            candidates_dir.path(),
            "WIDG.csv",
            "date,open,high,low,close,adj_close,volume\n2026-01-05,5.0,5.2,4.8,5.1,5.1,500\n",
        );

        let candidates = vec![
            candidate_for_test("ACME"),
            candidate_for_test("WIDG"),
        ];
        let index = load_price_index(candidates_dir.path(), &candidates).unwrap();
        assert!(index.get_bar("ACME", "2026-01-05".parse().unwrap()).is_some());
        assert!(index.get_bar("WIDG", "2026-01-05".parse().unwrap()).is_some());
    }

    fn candidate_for_test(ticker: &str) -> TradeCandidate {
        TradeCandidate {
            ticker: ticker.to_string(),
            company_name: None,
            report_date: "2026-01-05".parse().unwrap(),
            grade: Grade::A,
            grade_source: GradeSource::Html,
            score: Some(50.0),
            gap_size: None,
        }
    }
}
