/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/fetch/chart_repo.rs
*
* Chart repository support: the `index.yaml` document served by every chart
* repository, version selection within it, and the `Chart.yaml` metadata of
* an unpacked chart.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::Path;

// Index files in the wild carry unquoted versions (`version: 1.0`) and
// annotations (`is-plugin: true`); scalars are read back as strings.
fn scalar(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<serde_yaml::Value>::deserialize(d)?
        .and_then(scalar)
        .unwrap_or_default())
}

fn opt_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<serde_yaml::Value>::deserialize(d)?.and_then(scalar))
}

fn string_map<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<BTreeMap<String, String>, D::Error> {
    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(d)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| scalar(v).map(|v| (k, v)))
        .collect())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartIndex {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ChartVersion>>,
    #[serde(default)]
    pub generated: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "string")]
    pub version: String,
    #[serde(default, deserialize_with = "opt_string")]
    pub app_version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub deprecated: bool,
}

impl ChartVersion {
    pub fn semver(&self) -> Option<semver::Version> {
        parse_version(&self.version)
    }
}

/// Parses a chart version, tolerating a leading `v`.
pub fn parse_version(version: &str) -> Option<semver::Version> {
    semver::Version::parse(version.trim_start_matches('v')).ok()
}

impl ChartIndex {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Valid versions of `chart`, highest first. Entries without a name or
    /// with a version that is not semver are dropped.
    pub fn versions(&self, chart: &str) -> Vec<&ChartVersion> {
        let mut valid: Vec<(semver::Version, &ChartVersion)> = self
            .entries
            .get(chart)
            .into_iter()
            .flatten()
            .filter(|v| !v.name.is_empty())
            .filter_map(|v| v.semver().map(|s| (s, v)))
            .collect();
        valid.sort_by(|a, b| b.0.cmp(&a.0));
        valid.into_iter().map(|(_, v)| v).collect()
    }

    /// The requested version of `chart`, or its highest one when `version` is
    /// not given.
    pub fn find(&self, chart: &str, version: Option<&str>) -> Option<&ChartVersion> {
        let versions = self.versions(chart);
        match version.filter(|v| !v.is_empty()) {
            None => versions.into_iter().next(),
            Some(wanted) => {
                let wanted_semver = parse_version(wanted);
                versions.into_iter().find(|v| {
                    v.version == wanted || (wanted_semver.is_some() && v.semver() == wanted_semver)
                })
            }
        }
    }
}

/// Resolves a chart download URL against the repository address.
pub fn resolve_url(repository: &str, chart_url: &str) -> String {
    if chart_url.contains("://") {
        chart_url.to_string()
    } else {
        format!(
            "{}/{}",
            repository.trim_end_matches('/'),
            chart_url.trim_start_matches('/')
        )
    }
}

pub fn index_url(repository: &str) -> String {
    format!("{}/index.yaml", repository.trim_end_matches('/'))
}

pub async fn download_index(http: &reqwest::Client, repository: &str) -> Result<ChartIndex> {
    let url = index_url(repository);
    let body = http.get(&url).send().await?.error_for_status()?.text().await?;
    ChartIndex::parse(&body).map_err(|e| Error::fetch(url, e))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChartDependency {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
}

/// The subset of `Chart.yaml` the installer reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "opt_string")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "opt_string")]
    pub app_version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<ChartDependency>,
}

impl ChartMetadata {
    pub const FILE: &'static str = "Chart.yaml";

    /// Reads `Chart.yaml` from `dir`; `None` when the file does not exist.
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(dir.join(Self::FILE)).await {
            Ok(text) => Ok(Some(serde_yaml::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
apiVersion: v1
entries:
  nginx:
    - name: nginx
      version: 1.2.0
      appVersion: "1.25"
      urls: [charts/nginx-1.2.0.tgz]
    - name: nginx
      version: not-a-version
      urls: [charts/nginx-bad.tgz]
    - name: nginx
      version: v1.10.0
      urls: [https://mirror.example.com/nginx-1.10.0.tgz]
    - name: ""
      version: 9.9.9
    - name: nginx
      version: 1.9.0
      appVersion: 1.25
      annotations:
        plugins.kubegems.io/is-plugin: true
      urls: [charts/nginx-1.9.0.tgz]
generated: "2024-01-01T00:00:00Z"
"#;

    #[test]
    fn versions_are_filtered_and_sorted_descending() {
        let index = ChartIndex::parse(INDEX).unwrap();
        let versions: Vec<_> = index.versions("nginx").iter().map(|v| v.version.as_str()).collect();
        assert_eq!(versions, vec!["v1.10.0", "1.9.0", "1.2.0"]);
        assert!(index.versions("missing").is_empty());
        let unquoted = index.find("nginx", Some("1.9.0")).unwrap();
        assert_eq!(unquoted.app_version.as_deref(), Some("1.25"));
        assert_eq!(unquoted.annotations["plugins.kubegems.io/is-plugin"], "true");
    }

    #[test]
    fn find_picks_latest_or_exact() {
        let index = ChartIndex::parse(INDEX).unwrap();
        assert_eq!(index.find("nginx", None).unwrap().version, "v1.10.0");
        assert_eq!(index.find("nginx", Some("1.2.0")).unwrap().app_version.as_deref(), Some("1.25"));
        assert_eq!(index.find("nginx", Some("1.10.0")).unwrap().version, "v1.10.0");
        assert!(index.find("nginx", Some("2.0.0")).is_none());
    }

    #[test]
    fn relative_urls_resolve_against_repository() {
        assert_eq!(
            resolve_url("https://charts.kubegems.io/kubegems/", "charts/nginx-1.2.0.tgz"),
            "https://charts.kubegems.io/kubegems/charts/nginx-1.2.0.tgz"
        );
        assert_eq!(
            resolve_url("https://charts.kubegems.io", "https://mirror.example.com/a.tgz"),
            "https://mirror.example.com/a.tgz"
        );
        assert_eq!(index_url("http://repo/"), "http://repo/index.yaml");
    }

    #[tokio::test]
    async fn chart_metadata_loading() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ChartMetadata::load(dir.path()).await.unwrap().is_none());
        std::fs::write(
            dir.path().join("Chart.yaml"),
            "apiVersion: v2\nname: demo\nversion: 0.1.0\nappVersion: \"2.0\"\ndependencies:\n  - name: redis\n    repository: https://charts.example.com\n",
        )
        .unwrap();
        let meta = ChartMetadata::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.app_version.as_deref(), Some("2.0"));
        assert_eq!(meta.dependencies.len(), 1);
    }
}
