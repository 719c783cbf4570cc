//! Mode-aware secret resolution.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES**, never values.
//! - Callers invoke [`resolve_secrets_for_mode`] once at startup and pass the
//!   result into constructors; never scatter `std::env::var` calls elsewhere.
//! - `Debug` impls redact every secret value.
//! - Error messages reference the env var NAME, never the value.
//!
//! # Mode-aware enforcement
//! - `Backtest`: no keys required; the price fetcher's API key still falls
//!   back to a local `.mcp.json` if the env var is unset, matching the
//!   original price fetcher's key resolution.
//! - `Paper`: broker api_key + api_secret required.
//! - `Live`: broker api_key + api_secret required; refuses construction
//!   entirely elsewhere (see `eg-broker`'s paper-URL guard) unless the
//!   caller has explicitly opted into live trading.

use anyhow::{bail, Result};
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Backtest,
    Paper,
    Live,
}

impl RunMode {
    pub fn parse(s: &str) -> Result<RunMode> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BACKTEST" => Ok(RunMode::Backtest),
            "PAPER" => Ok(RunMode::Paper),
            "LIVE" => Ok(RunMode::Live),
            other => bail!(
                "SECRETS_UNKNOWN_MODE: unrecognised mode '{other}'; expected one of: LIVE | PAPER | BACKTEST"
            ),
        }
    }
}

/// All runtime-resolved secrets for one process instantiation.
///
/// Built once via [`resolve_secrets_for_mode`]. **Values are redacted in
/// `Debug` output.**
#[derive(Clone)]
pub struct ResolvedSecrets {
    pub broker_api_key: Option<String>,
    pub broker_api_secret: Option<String>,
    pub price_data_api_key: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field(
                "broker_api_key",
                &self.broker_api_key.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "broker_api_secret",
                &self.broker_api_secret.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "price_data_api_key",
                &self.price_data_api_key.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

struct SecretEnvNames {
    broker_api_key_var: String,
    broker_api_secret_var: String,
    price_data_api_key_var: String,
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Reads `mcpServers.<name>.env.<env_var>` from a `.mcp.json` next to the
/// working directory, matching the original's fallback for a missing env var.
fn resolve_from_mcp_json(env_var: &str) -> Option<String> {
    let path = Path::new(".mcp.json");
    let contents = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&contents).ok()?;
    let servers = parsed.get("mcpServers")?.as_object()?;
    for server in servers.values() {
        if let Some(val) = server.pointer(&format!("/env/{env_var}")).and_then(Value::as_str) {
            let trimmed = val.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Resolves one env var, falling back to `.mcp.json` when unset, mirroring
/// `config.py::resolve_api_key`.
fn resolve_with_mcp_fallback(var_name: &str) -> Option<String> {
    resolve_env(var_name).or_else(|| resolve_from_mcp_json(var_name))
}

fn parse_env_names(config_json: &Value) -> SecretEnvNames {
    SecretEnvNames {
        broker_api_key_var: read_str_at(config_json, "/broker/keys_env/api_key")
            .unwrap_or_else(|| "ALPACA_API_KEY".to_string()),
        broker_api_secret_var: read_str_at(config_json, "/broker/keys_env/api_secret")
            .unwrap_or_else(|| "ALPACA_API_SECRET".to_string()),
        price_data_api_key_var: read_str_at(config_json, "/data/provider/api_key_env")
            .unwrap_or_else(|| "FMP_API_KEY".to_string()),
    }
}

/// Resolve all secrets from the environment for the given run mode.
///
/// # Errors
/// Returns `Err` naming the env var NAME of the first missing required
/// secret. The value is never mentioned.
pub fn resolve_secrets_for_mode(config_json: &Value, mode: RunMode) -> Result<ResolvedSecrets> {
    let names = parse_env_names(config_json);

    let broker_api_key = resolve_env(&names.broker_api_key_var);
    let broker_api_secret = resolve_env(&names.broker_api_secret_var);
    let price_data_api_key = resolve_with_mcp_fallback(&names.price_data_api_key_var);

    match mode {
        RunMode::Live | RunMode::Paper => {
            if broker_api_key.is_none() {
                bail!(
                    "SECRETS_MISSING mode={mode:?}: required env var '{}' (broker api_key) is not set or empty",
                    names.broker_api_key_var,
                );
            }
            if broker_api_secret.is_none() {
                bail!(
                    "SECRETS_MISSING mode={mode:?}: required env var '{}' (broker api_secret) is not set or empty",
                    names.broker_api_secret_var,
                );
            }
        }
        RunMode::Backtest => {}
    }

    Ok(ResolvedSecrets {
        broker_api_key,
        broker_api_secret,
        price_data_api_key,
    })
}
