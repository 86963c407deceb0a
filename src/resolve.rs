/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/resolve.rs
*
* The values resolver. A plugin's final values are built from its
* `valuesFrom` references, in declared order, with its inline values merged
* on top:
*
* - ConfigMap `binaryData` entries are YAML documents deep-merged into the
*   accumulator ("file" values);
* - ConfigMap `data` and Secret `data` entries are `prefix+key=value`
*   assignments with dotted-path semantics ("set" values).
*
* A reference that does not exist is skipped when optional and an error
* otherwise.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::cluster::Cluster;
use crate::crds::{Plugin, ValuesFrom, ValuesFromKind};
use crate::error::{Error, Result};
use crate::values::Values;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::debug;

fn set_entries<'a>(
    values: &mut Values,
    prefix: &str,
    entries: impl Iterator<Item = (&'a String, String)>,
) -> Result<()> {
    for (key, value) in entries {
        values.set_value(&format!("{}{}", prefix, key), &value)?;
    }
    Ok(())
}

fn missing(reference: &ValuesFrom, namespace: &str) -> Result<()> {
    if reference.optional {
        debug!(kind = %reference.kind, namespace, name = %reference.name, "optional values reference missing");
        return Ok(());
    }
    Err(Error::ValuesReference(format!(
        "{} {}/{} not found",
        reference.kind, namespace, reference.name
    )))
}

async fn apply_reference(
    cluster: &dyn Cluster,
    reference: &ValuesFrom,
    namespace: &str,
    values: &mut Values,
) -> Result<()> {
    let prefix = reference.prefix.as_deref().unwrap_or_default();
    match reference.kind {
        ValuesFromKind::ConfigMap => {
            let Some(cm) = cluster.get_config_map(namespace, &reference.name).await? else {
                return missing(reference, namespace);
            };
            for (key, bytes) in cm.binary_data.iter().flatten() {
                let text = String::from_utf8_lossy(&bytes.0);
                let file = Values::from_yaml(&text).map_err(|e| {
                    Error::ValuesReference(format!(
                        "ConfigMap {}/{} key {}: {}",
                        namespace, reference.name, key, e
                    ))
                })?;
                values.merge(&file);
            }
            let empty = BTreeMap::new();
            let data = cm.data.as_ref().unwrap_or(&empty);
            set_entries(values, prefix, data.iter().map(|(k, v)| (k, v.clone())))?;
        }
        ValuesFromKind::Secret => {
            let Some(secret) = cluster.get_secret(namespace, &reference.name).await? else {
                return missing(reference, namespace);
            };
            let empty = BTreeMap::new();
            let data = secret.data.as_ref().unwrap_or(&empty);
            set_entries(
                values,
                prefix,
                data.iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned())),
            )?;
        }
    }
    Ok(())
}

/// Resolves the values a plugin is rendered with.
pub async fn resolve_values(cluster: &dyn Cluster, plugin: &Plugin) -> Result<Values> {
    let own_namespace = plugin.namespace().unwrap_or_else(|| "default".to_string());
    let mut values = Values::new();
    for reference in &plugin.spec.values_from {
        let namespace = reference
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&own_namespace);
        apply_reference(cluster, reference, namespace, &mut values).await?;
    }
    values.merge(&plugin.spec.values);
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use k8s_openapi::ByteString;
    use serde_json::json;

    fn plugin(spec: serde_json::Value) -> Plugin {
        serde_json::from_value(json!({
            "apiVersion": "plugins.kubegems.io/v1beta1",
            "kind": "Plugin",
            "metadata": {"name": "app", "namespace": "kubegems"},
            "spec": spec,
        }))
        .unwrap()
    }

    fn config_map(name: &str, data: &[(&str, &str)], binary: &[(&str, &str)]) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.into());
        cm.metadata.namespace = Some("kubegems".into());
        if !data.is_empty() {
            cm.data = Some(data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        }
        if !binary.is_empty() {
            cm.binary_data = Some(
                binary
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            );
        }
        cm
    }

    #[tokio::test]
    async fn file_values_deep_merge_under_inline_values() {
        let cluster = MemoryCluster::new();
        cluster.insert_config_map(config_map("files", &[], &[("values.yaml", "x:\n  y: 1\n")]));
        let p = plugin(json!({
            "kind": "helm",
            "values": {"x": {"z": 2}},
            "valuesFrom": [{"kind": "ConfigMap", "name": "files"}]
        }));
        let values = resolve_values(&cluster, &p).await.unwrap();
        assert_eq!(serde_json::to_value(&values).unwrap(), json!({"x": {"y": 1, "z": 2}}));
    }

    #[tokio::test]
    async fn inline_values_win_over_set_values() {
        let cluster = MemoryCluster::new();
        cluster.insert_config_map(config_map("sets", &[("x.y", "")], &[]));
        let p = plugin(json!({
            "kind": "helm",
            "values": {"x": {"y": "v"}},
            "valuesFrom": [{"kind": "ConfigMap", "name": "sets"}]
        }));
        let values = resolve_values(&cluster, &p).await.unwrap();
        assert_eq!(values.get("x"), Some(&json!({"y": "v"})));
    }

    #[tokio::test]
    async fn later_references_override_earlier_ones() {
        let cluster = MemoryCluster::new();
        cluster.insert_config_map(config_map("first", &[("replicas", "1")], &[]));
        cluster.insert_config_map(config_map("second", &[("replicas", "3")], &[]));
        let p = plugin(json!({
            "kind": "helm",
            "valuesFrom": [
                {"kind": "ConfigMap", "name": "first"},
                {"kind": "ConfigMap", "name": "second"}
            ]
        }));
        let values = resolve_values(&cluster, &p).await.unwrap();
        assert_eq!(values.get("replicas"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn secret_entries_use_the_prefix() {
        let cluster = MemoryCluster::new();
        let mut secret = Secret::default();
        secret.metadata.name = Some("creds".into());
        secret.metadata.namespace = Some("vault".into());
        secret.data = Some(
            [("password".to_string(), ByteString(b"s3cr,et".to_vec()))]
                .into_iter()
                .collect(),
        );
        cluster.insert_secret(secret);
        let p = plugin(json!({
            "kind": "helm",
            "valuesFrom": [{"kind": "Secret", "name": "creds", "namespace": "vault", "prefix": "db."}]
        }));
        let values = resolve_values(&cluster, &p).await.unwrap();
        assert_eq!(values.get("db"), Some(&json!({"password": "s3cr,et"})));
    }

    #[tokio::test]
    async fn optional_references_may_be_missing() {
        let cluster = MemoryCluster::new();
        let optional = plugin(json!({
            "kind": "helm",
            "values": {"a": 1},
            "valuesFrom": [{"kind": "Secret", "name": "ghost", "optional": true}]
        }));
        let values = resolve_values(&cluster, &optional).await.unwrap();
        assert_eq!(values.get("a"), Some(&json!(1)));

        let required = plugin(json!({
            "kind": "helm",
            "valuesFrom": [{"kind": "ConfigMap", "name": "ghost"}]
        }));
        let err = resolve_values(&cluster, &required).await.unwrap_err();
        assert!(matches!(err, Error::ValuesReference(_)));
        assert!(err.to_string().contains("ConfigMap kubegems/ghost"));
    }
}
