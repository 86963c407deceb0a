/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/values.rs
*
* The values tree handed to renderers. A single canonical representation is
* kept (a JSON object map); YAML or JSON text is produced on demand.
*
* Nulls are pruned recursively whenever a tree is deserialized or merged: the
* rendering backends cannot tell an explicit null from an absent key. A map
* that only becomes empty because its nulls were removed is dropped as well,
* while a map authored empty is kept.
*
* Scalar map keys that are not strings (`1: x`, `true: y`) are stringified
* the way helm does; only sequence or map keys are rejected.
*
* SPDX-License-Identifier: Apache-2.0 */

pub mod strvals;

use schemars::{json_schema, JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Values(Map<String, Value>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(mut map: Map<String, Value>) -> Self {
        prune_nulls(&mut map);
        Values(map)
    }

    /// Parses a YAML (or JSON) document. An empty document yields empty values.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        serde_yaml::from_str(text)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Deep merges `other` on top of `self`. Maps merge key by key, any other
    /// value (including an empty string) replaces what was there.
    pub fn merge(&mut self, other: &Values) {
        merge_maps(&mut self.0, &other.0);
        prune_nulls(&mut self.0);
    }

    /// Applies `--set` style assignments (`a.b=c,d={x,y}`).
    pub fn set_str(&mut self, assignments: &str) -> Result<(), strvals::ParseError> {
        strvals::parse_into(assignments, &mut self.0)?;
        prune_nulls(&mut self.0);
        Ok(())
    }

    /// Applies a single `key=value` pair without list or comma handling.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<(), strvals::ParseError> {
        strvals::set_value(&mut self.0, key, raw)?;
        prune_nulls(&mut self.0);
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.0)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    /// Top-level scalar entries rendered as strings, used to stamp annotations
    /// onto manifests that take no parameters.
    pub fn scalar_entries(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some((k.clone(), s))
            })
            .collect()
    }
}

impl From<Map<String, Value>> for Values {
    fn from(map: Map<String, Value>) -> Self {
        Values::from_map(map)
    }
}

impl<'de> Deserialize<'de> for Values {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tree = serde_yaml::Value::deserialize(deserializer)?;
        match from_yaml_value(tree).map_err(serde::de::Error::custom)? {
            Value::Null => Ok(Values::new()),
            Value::Object(map) => Ok(Values::from_map(map)),
            other => Err(serde::de::Error::custom(format!(
                "values must be a map, got {}",
                other
            ))),
        }
    }
}

fn scalar_key(key: serde_yaml::Value) -> Result<String, String> {
    match key {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok("null".to_string()),
        serde_yaml::Value::Tagged(tagged) => scalar_key(tagged.value),
        other => Err(format!("unsupported map key {:?}", other)),
    }
}

/// Converts a YAML tree to JSON, stringifying scalar map keys.
fn from_yaml_value(value: serde_yaml::Value) -> Result<Value, String> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                let f = n.as_f64().unwrap_or_default();
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(n.to_string()))
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => Value::Array(
            items
                .into_iter()
                .map(from_yaml_value)
                .collect::<Result<_, _>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::new();
            for (k, v) in mapping {
                map.insert(scalar_key(k)?, from_yaml_value(v)?);
            }
            Value::Object(map)
        }
        serde_yaml::Value::Tagged(tagged) => from_yaml_value(tagged.value)?,
    })
}

impl JsonSchema for Values {
    fn schema_name() -> Cow<'static, str> {
        "Values".into()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        })
    }
}

/// Recursively merges `src` into `dst`.
pub fn merge_maps(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, value) in src {
        match (dst.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge_maps(existing, incoming),
            _ => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Removes nulls in place. Returns true if anything was removed.
pub fn prune_nulls(map: &mut Map<String, Value>) -> bool {
    let mut removed = false;
    map.retain(|_, value| match value {
        Value::Null => {
            removed = true;
            false
        }
        Value::Object(child) => {
            if prune_nulls(child) && child.is_empty() {
                removed = true;
                return false;
            }
            true
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                if let Value::Object(child) = item {
                    prune_nulls(child);
                }
            }
            true
        }
        _ => true,
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(v: Value) -> Values {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn scalar_keys_are_stringified() {
        let v = Values::from_yaml("ports:\n  1: http\n  2.5: half\nflags:\n  true: on\n").unwrap();
        assert_eq!(v.get("ports"), Some(&json!({"1": "http", "2.5": "half"})));
        assert_eq!(v.get("flags"), Some(&json!({"true": "on"})));
        assert!(Values::from_yaml("? [a, b]\n: x\n").is_err());
    }

    #[test]
    fn null_only_child_collapses_parent() {
        assert!(values(json!({"a": {"b": null}})).is_empty());
    }

    #[test]
    fn null_sibling_is_removed() {
        assert_eq!(
            values(json!({"a": {"b": null, "c": 1}})),
            values(json!({"a": {"c": 1}}))
        );
    }

    #[test]
    fn authored_empty_map_is_kept() {
        let v = values(json!({"resources": {}}));
        assert_eq!(v.get("resources"), Some(&json!({})));
    }

    #[test]
    fn deeply_nested_nulls_collapse_all_the_way_up() {
        assert!(values(json!({"a": {"b": {"c": null}}})).is_empty());
    }

    #[test]
    fn merge_is_deep() {
        let mut base = values(json!({"x": {"y": 1}}));
        base.merge(&values(json!({"x": {"z": 2}})));
        assert_eq!(base, values(json!({"x": {"y": 1, "z": 2}})));
    }

    #[test]
    fn merge_scalar_overrides_map_and_empty_string_wins() {
        let mut base = values(json!({"x": {"y": 1}, "s": "old"}));
        base.merge(&Values::from_map(
            json!({"x": "flat", "s": ""}).as_object().cloned().unwrap(),
        ));
        assert_eq!(base, values(json!({"x": "flat", "s": ""})));
    }

    #[test]
    fn merging_a_null_deletes_the_key() {
        let mut base = values(json!({"x": {"y": 1, "z": 2}}));
        let mut patch = Map::new();
        patch.insert("x".into(), json!({"y": null}));
        merge_maps(&mut base.0, &patch);
        prune_nulls(&mut base.0);
        assert_eq!(base, values(json!({"x": {"z": 2}})));
    }

    #[test]
    fn yaml_round_trip_and_non_map_rejected() {
        let v = Values::from_yaml("image:\n  tag: v1\n").unwrap();
        assert_eq!(v, values(json!({"image": {"tag": "v1"}})));
        assert!(Values::from_yaml("").unwrap().is_empty());
        assert!(Values::from_yaml("- a\n- b\n").is_err());
        assert_eq!(Values::from_yaml(&v.to_yaml().unwrap()).unwrap(), v);
    }

    #[test]
    fn scalar_entries_skip_nested_values() {
        let v = values(json!({"foo": "bar", "replicas": 2, "image": {"tag": "v1"}}));
        let entries: Vec<_> = v.scalar_entries().into_iter().collect();
        assert_eq!(
            entries,
            vec![("foo".to_string(), "bar".to_string()), ("replicas".to_string(), "2".to_string())]
        );
    }
}
