/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/repository.rs
*
* The repository index cache: a periodically refreshed catalogue of the
* plugins published in one or more chart repositories. It is built once at
* start-up and shared by reference; nothing on the reconcile path reads it.
*
* A chart version is a plugin when its `plugins.kubegems.io/is-plugin`
* annotation is true. The remaining annotations describe how to install it:
*
*   plugins.kubegems.io/render-by          bundle kind, default `template`
*   plugins.kubegems.io/install-namespace  target namespace
*   plugins.kubegems.io/required           installed by default
*   plugins.kubegems.io/requirements       `name [constraint],...`
*   plugins.kubegems.io/category           `main/sub` or `sub`
*   plugins.kubegems.io/main-category      main category for a bare `sub`
*   plugins.kubegems.io/values-from        `[namespace/]name,...`
*   plugins.kubegems.io/health-check       free form, shown as-is
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::config::RepositorySource;
use crate::crds::{BundleKind, Plugin, PluginReference, PluginSpec, ValuesFrom, ValuesFromKind};
use crate::error::{Error, Result};
use crate::fetch::chart_repo::{download_index, ChartIndex, ChartVersion};
use crate::values::Values;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

const ANNOTATION_PREFIX: &str = "plugins.kubegems.io/";
/// Chart holding values shared by every other plugin.
pub const GLOBAL_CHART: &str = "global";
pub const GLOBAL_VALUES_CONFIG_MAP: &str = "kubegems-global-values";

fn annotation<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    annotations
        .get(&format!("{}{}", ANNOTATION_PREFIX, key))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn flag(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    annotation(annotations, key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

pub fn is_plugin_chart(chart: &ChartVersion) -> bool {
    flag(&chart.annotations, "is-plugin")
}

/// Parses `name [constraint],...` into dependency references.
pub fn parse_requirements(text: &str) -> Vec<PluginReference> {
    text.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(|r| {
            let (name, constraint) = match r.split_once(' ') {
                Some((name, c)) => (name, Some(c.trim().to_string()).filter(|c| !c.is_empty())),
                None => (r, None),
            };
            PluginReference {
                name: name.to_string(),
                namespace: None,
                version: constraint,
            }
        })
        .collect()
}

fn categories(annotations: &BTreeMap<String, String>) -> (Option<String>, Option<String>) {
    let Some(full) = annotation(annotations, "category") else {
        return (None, None);
    };
    match full.split_once('/') {
        Some((main, sub)) => (Some(main.to_string()), Some(sub.to_string())),
        None => {
            let main = annotation(annotations, "main-category").unwrap_or("other");
            (Some(main.to_string()), Some(full.to_string()))
        }
    }
}

fn values_from(chart: &str, annotations: &BTreeMap<String, String>) -> Vec<ValuesFrom> {
    let mut refs = Vec::new();
    if chart != GLOBAL_CHART {
        refs.push(ValuesFrom {
            kind: ValuesFromKind::ConfigMap,
            name: GLOBAL_VALUES_CONFIG_MAP.to_string(),
            namespace: None,
            prefix: Some(format!("{}.", GLOBAL_CHART)),
            optional: true,
        });
    }
    for entry in annotation(annotations, "values-from").unwrap_or_default().split(',') {
        let entry = entry.trim();
        if entry.is_empty() || entry == GLOBAL_CHART {
            continue;
        }
        let (namespace, name) = match entry.split_once('/') {
            Some((ns, name)) => (Some(ns.to_string()), name),
            None => (None, entry),
        };
        refs.push(ValuesFrom {
            kind: ValuesFromKind::ConfigMap,
            name: format!("kubegems-{}-values", name),
            namespace,
            prefix: Some(format!("{}.", name)),
            optional: true,
        });
    }
    refs
}

/// One installable version of a catalogued plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginVersion {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub repository: String,
    pub priority: i32,
    pub kind: BundleKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_namespace: Option<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<PluginReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,
    pub values_from: Vec<ValuesFrom>,
}

impl PluginVersion {
    pub fn from_chart(source: &RepositorySource, chart: &ChartVersion) -> Self {
        let a = &chart.annotations;
        let kind = annotation(a, "render-by")
            .and_then(|k| serde_json::from_value(serde_json::Value::String(k.to_lowercase())).ok())
            .unwrap_or(BundleKind::Template);
        let (main_category, category) = categories(a);
        PluginVersion {
            name: chart.name.clone(),
            version: chart.version.clone(),
            app_version: chart.app_version.clone(),
            description: chart.description.clone(),
            repository: source.address.clone(),
            priority: source.priority,
            kind,
            install_namespace: annotation(a, "install-namespace").map(str::to_string),
            required: flag(a, "required"),
            requirements: annotation(a, "requirements").map(parse_requirements).unwrap_or_default(),
            main_category,
            category,
            health_check: annotation(a, "health-check").map(str::to_string),
            values_from: values_from(&chart.name, a),
        }
    }

    /// A `Plugin` installing this version, created in `namespace`.
    pub fn to_plugin(&self, namespace: &str) -> Plugin {
        let mut plugin = Plugin::new(
            &self.name,
            PluginSpec {
                kind: self.kind,
                enabled: true,
                url: Some(self.repository.clone()),
                chart: Some(self.name.clone()),
                path: None,
                version: Some(self.version.clone()),
                install_namespace: self.install_namespace.clone(),
                values: Values::new(),
                values_from: self.values_from.clone(),
                dependencies: self.requirements.clone(),
                file_overrides: Vec::new(),
            },
        );
        plugin.metadata.namespace = Some(namespace.to_string());
        plugin
    }
}

/// A snapshot of one chart repository.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub name: String,
    pub address: String,
    pub priority: i32,
    /// Chart name to its plugin versions, highest first.
    pub plugins: BTreeMap<String, Vec<PluginVersion>>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Repository {
    pub fn from_index(source: &RepositorySource, index: &ChartIndex) -> Self {
        let mut plugins = BTreeMap::new();
        for chart in index.entries.keys() {
            let versions: Vec<PluginVersion> = index
                .versions(chart)
                .into_iter()
                .filter(|v| is_plugin_chart(v))
                .map(|v| PluginVersion::from_chart(source, v))
                .collect();
            if !versions.is_empty() {
                plugins.insert(chart.clone(), versions);
            }
        }
        Repository {
            name: source.name.clone(),
            address: source.address.clone(),
            priority: source.priority,
            plugins,
            last_sync: Some(Utc::now()),
        }
    }
}

pub struct RepositoryCache {
    http: reqwest::Client,
    sources: Vec<RepositorySource>,
    snapshot: RwLock<BTreeMap<String, Repository>>,
}

impl RepositoryCache {
    pub fn new(sources: Vec<RepositorySource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            sources,
            snapshot: RwLock::new(BTreeMap::new()),
        }
    }

    /// Replaces one repository's snapshot.
    pub async fn update(&self, source: &RepositorySource, index: &ChartIndex) {
        let repository = Repository::from_index(source, index);
        info!(repository = %source.name, plugins = repository.plugins.len(), "repository indexed");
        self.snapshot.write().await.insert(source.name.clone(), repository);
    }

    /// Downloads every repository index concurrently. A repository that
    /// fails keeps its previous snapshot.
    pub async fn refresh(&self) -> Result<()> {
        let downloads = self
            .sources
            .iter()
            .map(|source| async move { (source, download_index(&self.http, &source.address).await) });
        let mut errors = Vec::new();
        for (source, result) in join_all(downloads).await {
            match result {
                Ok(index) => self.update(source, &index).await,
                Err(e) => {
                    warn!(repository = %source.name, error = %e, "repository refresh failed");
                    errors.push(format!("{}: {}", source.name, e));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::fetch("repositories", errors.join("; ")))
        }
    }

    /// Every repository, highest priority first.
    pub async fn list(&self) -> Vec<Repository> {
        let mut repositories: Vec<Repository> = self.snapshot.read().await.values().cloned().collect();
        repositories.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        repositories
    }

    /// Versions of plugin `name` across repositories, highest priority
    /// repository first, versions highest first within a repository.
    pub async fn versions(&self, name: &str) -> Vec<PluginVersion> {
        self.list()
            .await
            .into_iter()
            .flat_map(|r| r.plugins.get(name).cloned().unwrap_or_default())
            .collect()
    }

    /// Refreshes every `interval` until the task is dropped.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "repository cache refresh incomplete");
            }
        }
    }
}
