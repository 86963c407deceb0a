/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds.rs
*
* This file defines the Rust data structures for the `Plugin` Custom Resource
* (`plugins.kubegems.io/v1beta1`). The `kube::CustomResource` derive produces
* the strongly-typed `Plugin` object and its CRD manifest; `schemars`
* generates the embedded OpenAPI v3 schema.
*
* Architecture:
* - `PluginSpec` is the user's desired state: which bundle to install, from
*   where, with which values, and which other Plugins must be installed first.
* - `PluginStatus` is owned by the controller. `resources` is the managed set:
*   plain `{apiVersion, kind, namespace, name}` references, never full objects,
*   so status stays small.
* - `serde` attributes map idiomatic Rust `snake_case` to Kubernetes
*   `camelCase`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::values::Values;
use kube::api::DynamicObject;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GROUP: &str = "plugins.kubegems.io";
pub const PLUGIN_FINALIZER: &str = "plugins.kubegems.io/finalizer";
/// Stamped on every rendered object; value is the owning plugin's name.
pub const PLUGIN_NAME_ANNOTATION: &str = "plugins.kubegems.io/plugin-name";
/// Comma separated list of `OnUpdate` / `OnDelete`.
pub const IGNORE_OPTIONS_ANNOTATION: &str = "plugins.kubegems.io/ignore-options";
/// SHA-256 of the configuration last applied to an object.
pub const APPLIED_DIGEST_ANNOTATION: &str = "plugins.kubegems.io/applied-digest";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "plugins.kubegems.io",
    version = "v1beta1",
    kind = "Plugin",
    namespaced,
    status = "PluginStatus",
    printcolumn = r#"{"name":"Kind", "type":"string", "jsonPath":".spec.kind"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Namespace", "type":"string", "jsonPath":".status.namespace"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "plg"
)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    pub kind: BundleKind,

    /// `false` removes everything the plugin installed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Source locator: local path, `file://`, `.git`, `.zip`, `.tar.gz`/`.tgz`
    /// or a chart repository URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Chart name inside a chart repository. Defaults to the plugin name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,

    /// Sub-path inside the fetched source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Values::is_empty")]
    pub values: Values,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_from: Vec<ValuesFrom>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PluginReference>,

    /// Files written over the fetched source before rendering.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_overrides: Vec<FileOverride>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    Helm,
    Kustomize,
    Template,
    #[serde(alias = "inline")]
    Native,
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleKind::Helm => "helm",
            BundleKind::Kustomize => "kustomize",
            BundleKind::Template => "template",
            BundleKind::Native => "native",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ValuesFromKind {
    ConfigMap,
    Secret,
}

impl fmt::Display for ValuesFromKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValuesFromKind::ConfigMap => f.write_str("ConfigMap"),
            ValuesFromKind::Secret => f.write_str("Secret"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFrom {
    pub kind: ValuesFromKind,
    pub name: String,
    /// Defaults to the plugin's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Prepended to every key of the referenced object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Semver requirement on the installed version, e.g. `>=1.2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileOverride {
    pub name: String,
    pub content: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum PluginPhase {
    Installed,
    Failed,
    Disabled,
}

impl fmt::Display for PluginPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginPhase::Installed => "Installed",
            PluginPhase::Failed => "Failed",
            PluginPhase::Disabled => "Disabled",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PluginPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Values actually applied, nulls pruned.
    #[serde(default, skip_serializing_if = "Values::is_empty")]
    pub values: Values,
    #[serde(default)]
    pub resources: Vec<ManagedResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_timestamp: Option<String>,
}

/// A reference to one live object a plugin is responsible for.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ManagedResource {
    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        Some(ManagedResource {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone()?,
        })
    }

    /// Splits `apiVersion` into `(group, version)`; the core group is "".
    pub fn group_version(&self) -> (&str, &str) {
        split_api_version(&self.api_version)
    }

    pub fn is_crd(&self) -> bool {
        self.kind == "CustomResourceDefinition"
    }
}

impl fmt::Display for ManagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

impl Plugin {
    /// Namespace the rendered resources are installed into.
    pub fn install_namespace(&self) -> String {
        self.spec
            .install_namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| self.namespace())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn phase(&self) -> Option<PluginPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Whether a `valuesFrom` entry points at the given object.
    pub fn references(&self, kind: ValuesFromKind, namespace: &str, name: &str) -> bool {
        let own = self.namespace().unwrap_or_default();
        self.spec.values_from.iter().any(|r| {
            r.kind == kind && r.name == name && r.namespace.as_deref().unwrap_or(&own) == namespace
        })
    }
}
