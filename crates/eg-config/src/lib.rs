//! Layered YAML configuration with canonical-JSON hashing for reproducibility,
//! plus the frozen run parameters (`LiveConfig`) and mode-aware secret
//! resolution built on top of it.

mod live;
mod secrets;

pub use live::{LiveConfig, ManifestMismatch};
pub use secrets::{resolve_secrets_for_mode, ResolvedSecrets, RunMode};

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_sorts_keys_and_is_stable() {
        let v = serde_json::json!({"b": 1, "a": {"z": 1, "y": 2}});
        let c1 = canonicalize_json(&v);
        let c2 = canonicalize_json(&v);
        assert_eq!(c1, c2);
        assert_eq!(c1, r#"{"a":{"y":2,"z":1},"b":1}"#);
    }

    #[test]
    fn deep_merge_overrides_scalars_and_merges_objects() {
        let mut dst = serde_json::json!({"stop_loss_pct": 10.0, "nested": {"a": 1}});
        let src = serde_json::json!({"stop_loss_pct": 8.0, "nested": {"b": 2}});
        deep_merge(&mut dst, src);
        assert_eq!(dst["stop_loss_pct"], 8.0);
        assert_eq!(dst["nested"]["a"], 1);
        assert_eq!(dst["nested"]["b"], 2);
    }
}
