//! Frozen run parameters shared by the live signal generator and executor.
//!
//! Grounded on the original `live/config.py`'s `LiveConfig` dataclass: every
//! field here is read once at process start and never mutated, so a run's
//! behavior is fully determined by the values captured in its manifest.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Stop-loss execution mode, matching `PortfolioSimulator::VALID_STOP_MODES`.
pub const VALID_STOP_MODES: &[&str] = &["intraday", "close", "skip_entry_day", "close_next_open"];

/// Trailing-stop indicator, matching `PortfolioSimulator::VALID_TRAILING_MODES`.
pub const VALID_TRAILING_MODES: &[&str] = &["weekly_ema", "weekly_nweek_low"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    pub position_size: f64,
    pub stop_loss_pct: f64,
    pub slippage_pct: f64,
    pub max_holding_days: Option<i64>,
    pub stop_mode: String,
    pub entry_mode: String,
    pub max_positions: usize,
    pub trailing_stop: Option<String>,
    pub trailing_transition_weeks: u32,
    pub rotation: bool,
    pub daily_entry_limit: u32,
    pub entry_tif: String,
    pub entry_cutoff_minutes: i64,
    pub min_buying_power: f64,
    pub max_daily_trade_orders: u32,
    pub max_daily_stop_orders: u32,
    /// Candidates below this grade never enter (`"A"`..`"D"`).
    pub min_grade: String,
    /// Indicator period for `trailing_stop` on the execution (`ema_p10`) book.
    pub primary_trailing_period: usize,
    /// Trailing indicator tracked on the shadow (`nwl_p4`) book; independent
    /// of `trailing_stop` so the two books can diverge for comparison.
    pub shadow_trailing_stop: Option<String>,
    pub shadow_trailing_period: usize,
    /// Lookback window the price fetcher pulls for trailing-stop evaluation.
    pub fmp_lookback_days: i64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            position_size: 10_000.0,
            stop_loss_pct: 10.0,
            slippage_pct: 0.5,
            max_holding_days: Some(90),
            stop_mode: "intraday".to_string(),
            entry_mode: "report_open".to_string(),
            max_positions: 10,
            trailing_stop: Some("weekly_ema".to_string()),
            trailing_transition_weeks: 2,
            rotation: true,
            daily_entry_limit: 3,
            entry_tif: "opg".to_string(),
            entry_cutoff_minutes: 30,
            min_buying_power: 5_000.0,
            max_daily_trade_orders: 20,
            max_daily_stop_orders: 20,
            min_grade: "B".to_string(),
            primary_trailing_period: 10,
            shadow_trailing_stop: Some("weekly_nweek_low".to_string()),
            shadow_trailing_period: 4,
            fmp_lookback_days: 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveConfigError {
    InvalidStopMode(String),
    InvalidTrailingStop(String),
    NoExitStrategy,
}

impl std::fmt::Display for LiveConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveConfigError::InvalidStopMode(mode) => {
                write!(f, "invalid stop_mode '{mode}'; expected one of {VALID_STOP_MODES:?}")
            }
            LiveConfigError::InvalidTrailingStop(mode) => write!(
                f,
                "invalid trailing_stop '{mode}'; expected one of {VALID_TRAILING_MODES:?} or none"
            ),
            LiveConfigError::NoExitStrategy => {
                write!(f, "trailing_stop and max_holding_days cannot both be unset")
            }
        }
    }
}

impl std::error::Error for LiveConfigError {}

impl LiveConfig {
    /// Mirrors `LiveConfig.__post_init__`'s validation.
    pub fn validate(&self) -> Result<(), LiveConfigError> {
        if !VALID_STOP_MODES.contains(&self.stop_mode.as_str()) {
            return Err(LiveConfigError::InvalidStopMode(self.stop_mode.clone()));
        }
        if let Some(mode) = &self.trailing_stop {
            if !VALID_TRAILING_MODES.contains(&mode.as_str()) {
                return Err(LiveConfigError::InvalidTrailingStop(mode.clone()));
            }
        }
        if self.trailing_stop.is_none() && self.max_holding_days.is_none() {
            return Err(LiveConfigError::NoExitStrategy);
        }
        Ok(())
    }

    /// Maps manifest JSON keys to `LiveConfig` field names, mirroring the
    /// original's `MANIFEST_FIELD_MAP`.
    fn manifest_field_map() -> BTreeMap<&'static str, &'static str> {
        BTreeMap::from([
            ("position_size", "position_size"),
            ("stop_loss", "stop_loss_pct"),
            ("slippage", "slippage_pct"),
            ("max_holding", "max_holding_days"),
            ("stop_mode", "stop_mode"),
            ("entry_mode", "entry_mode"),
            ("max_positions", "max_positions"),
            ("trailing_transition_weeks", "trailing_transition_weeks"),
        ])
    }

    fn field_value(&self, field: &str) -> Value {
        match field {
            "position_size" => Value::from(self.position_size),
            "stop_loss_pct" => Value::from(self.stop_loss_pct),
            "slippage_pct" => Value::from(self.slippage_pct),
            "max_holding_days" => match self.max_holding_days {
                Some(d) => Value::from(d),
                None => Value::Null,
            },
            "stop_mode" => Value::from(self.stop_mode.clone()),
            "entry_mode" => Value::from(self.entry_mode.clone()),
            "max_positions" => Value::from(self.max_positions as u64),
            "trailing_transition_weeks" => Value::from(self.trailing_transition_weeks),
            _ => Value::Null,
        }
    }

    /// Compares this config against a run manifest's recognized fields, mirroring
    /// `verify_against_manifest`. Treats `null == null` as a match. Returns every
    /// mismatch rather than stopping at the first.
    pub fn verify_against_manifest(&self, manifest: &Value) -> Result<(), Vec<ManifestMismatch>> {
        let mut mismatches = Vec::new();
        for (manifest_key, field) in Self::manifest_field_map() {
            let Some(manifest_value) = manifest.get(manifest_key) else {
                continue;
            };
            let expected = self.field_value(field);
            if !values_match(&expected, manifest_value) {
                mismatches.push(ManifestMismatch {
                    field: field.to_string(),
                    expected,
                    found: manifest_value.clone(),
                });
            }
        }
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(mismatches)
        }
    }
}

fn values_match(a: &Value, b: &Value) -> bool {
    if a.is_null() && b.is_null() {
        return true;
    }
    a == b
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestMismatch {
    pub field: String,
    pub expected: Value,
    pub found: Value,
}

impl std::fmt::Display for ManifestMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: expected {}, manifest has {}",
            self.field, self.expected, self.found
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        LiveConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unset_trailing_stop_and_max_holding() {
        let mut cfg = LiveConfig::default();
        cfg.max_holding_days = None;
        cfg.trailing_stop = None;
        assert!(matches!(
            cfg.validate(),
            Err(LiveConfigError::NoExitStrategy)
        ));
    }

    #[test]
    fn manifest_mismatch_on_stop_loss() {
        let cfg = LiveConfig::default();
        let manifest = serde_json::json!({"stop_loss": 8.0});
        let err = cfg.verify_against_manifest(&manifest).unwrap_err();
        assert_eq!(err.len(), 1);
        assert_eq!(err[0].field, "stop_loss_pct");
    }

    #[test]
    fn manifest_match_ignores_unrecognized_keys() {
        let cfg = LiveConfig::default();
        let manifest = serde_json::json!({
            "position_size": 10000.0,
            "stop_loss": 10.0,
            "unrelated_key": "whatever",
        });
        cfg.verify_against_manifest(&manifest).unwrap();
    }
}
