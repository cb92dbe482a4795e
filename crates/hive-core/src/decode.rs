//! Decode-with-default for free-form JSON columns.
//!
//! Context, loop configuration and acceptance criteria are written by agents
//! and other tools, so malformed bytes are expected. Every read site goes
//! through [`decode_or`] instead of surfacing a parse error.

use crate::types::LoopConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

/// Run context: flat string map with lower-cased keys.
pub type Context = BTreeMap<String, String>;

/// Decode `raw` as JSON, returning `default` when it is absent or malformed.
pub fn decode_or<T: DeserializeOwned>(raw: Option<&str>, default: T) -> T {
    match raw {
        Some(raw) => serde_json::from_str(raw).unwrap_or(default),
        None => default,
    }
}

/// Decode a run context.
///
/// Only a JSON object is accepted. Keys are lower-cased; scalar values are
/// stringified and nested values are re-encoded as JSON text.
pub fn context(raw: Option<&str>) -> Context {
    let map: serde_json::Map<String, Value> = decode_or(raw, serde_json::Map::new());
    map.into_iter()
        .map(|(key, value)| (key.to_lowercase(), stringify(value)))
        .collect()
}

/// Decode a loop configuration. `None` means absent or malformed.
pub fn loop_config(raw: Option<&str>) -> Option<LoopConfig> {
    decode_or(raw, None)
}

/// Decode acceptance criteria, defaulting to an empty list.
pub fn acceptance_criteria(raw: Option<&str>) -> Vec<String> {
    decode_or(raw, Vec::new())
}

/// Encode a context for storage.
pub fn encode_context(context: &Context) -> String {
    // A string map always serializes.
    serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string())
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_or_returns_default_on_garbage() {
        let value: Vec<String> = decode_or(Some("{not json"), vec!["fallback".to_string()]);
        assert_eq!(value, vec!["fallback".to_string()]);
    }

    #[test]
    fn decode_or_returns_default_when_absent() {
        let value: i64 = decode_or(None, 7);
        assert_eq!(value, 7);
    }

    #[test]
    fn context_normalizes_keys_and_scalars() {
        let ctx = context(Some(r#"{"Repo":"/tmp/x","attempts":3,"ok":true,"none":null}"#));
        assert_eq!(ctx.get("repo").map(String::as_str), Some("/tmp/x"));
        assert_eq!(ctx.get("attempts").map(String::as_str), Some("3"));
        assert_eq!(ctx.get("ok").map(String::as_str), Some("true"));
        assert_eq!(ctx.get("none").map(String::as_str), Some(""));
    }

    #[test]
    fn context_rejects_non_objects() {
        assert!(context(Some("[1,2]")).is_empty());
        assert!(context(Some("{{bad")).is_empty());
        assert!(context(None).is_empty());
    }

    #[test]
    fn loop_config_malformed_is_none() {
        assert!(loop_config(Some("{bad")).is_none());
        assert!(loop_config(Some(r#"{"completion":"all_done"}"#)).is_none());
        assert!(loop_config(Some(r#"{"over":"stories"}"#)).is_some());
    }

    #[test]
    fn acceptance_criteria_defaults_to_empty() {
        assert!(acceptance_criteria(Some("not json")).is_empty());
        assert_eq!(
            acceptance_criteria(Some(r#"["builds","tests pass"]"#)),
            vec!["builds".to_string(), "tests pass".to_string()]
        );
    }

    #[test]
    fn encode_round_trips_context() {
        let mut ctx = Context::new();
        ctx.insert("task".to_string(), "ship it".to_string());
        assert_eq!(context(Some(&encode_context(&ctx))), ctx);
    }
}
