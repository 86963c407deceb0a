/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/render/manifest.rs
*
* Conversion between multi-document YAML streams and `DynamicObject`s.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::error::{Error, Result};
use kube::api::DynamicObject;
use serde::Deserialize;
use serde_json::Value;

fn into_objects(doc: Value, out: &mut Vec<DynamicObject>) -> Result<()> {
    let Value::Object(map) = &doc else {
        return Err(Error::render("manifest", format!("document is not an object: {}", doc)));
    };
    let kind = map.get("kind").and_then(Value::as_str).unwrap_or_default();
    if kind.ends_with("List") {
        if let Some(Value::Array(items)) = map.get("items") {
            for item in items.clone() {
                into_objects(item, out)?;
            }
            return Ok(());
        }
    }
    let obj: DynamicObject = serde_json::from_value(doc)?;
    let identified = obj.types.as_ref().is_some_and(|t| !t.kind.is_empty() && !t.api_version.is_empty())
        && obj.metadata.name.as_deref().is_some_and(|n| !n.is_empty());
    if !identified {
        return Err(Error::render(
            "manifest",
            "object without apiVersion, kind or metadata.name",
        ));
    }
    out.push(obj);
    Ok(())
}

/// Parses a rendered stream. Empty documents are skipped and `*List` kinds
/// are flattened into their items.
pub fn split_manifests(text: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let doc = Value::deserialize(document)?;
        if doc.is_null() {
            continue;
        }
        into_objects(doc, &mut objects)?;
    }
    Ok(objects)
}

/// Serializes objects back into a stream, each document preceded by `---`.
pub fn join_manifests(objects: &[DynamicObject]) -> Result<String> {
    let mut out = String::new();
    for obj in objects {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(obj)?);
    }
    Ok(out)
}
