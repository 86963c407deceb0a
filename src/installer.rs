/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/installer.rs
*
* The plugin pipeline for one `Plugin`: resolve values, fetch the bundle,
* render it and sync the result into the cluster, then record the outcome in
* the status. `Bundler` is the cluster-free half (fetch + render) and is
* shared with the CLI; `Installer` adds values resolution and syncing.
*
* The status passed in is updated in place. The caller decides whether it
* is written back.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::cluster::Cluster;
use crate::crds::{BundleKind, Plugin, PluginPhase, PluginStatus, PLUGIN_NAME_ANNOTATION};
use crate::error::{Error, Result};
use crate::fetch::archive::copy_dir;
use crate::fetch::{FetchRequest, Fetcher};
use crate::render::manifest::split_manifests;
use crate::render::{Release, Rendered, RendererRegistry};
use crate::resolve::resolve_values;
use crate::sync::{SyncEngine, SyncOptions};
use crate::values::Values;
use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A fetched source, possibly a staged copy carrying file overrides. The
/// staging directory lives as long as this value.
pub struct Source {
    pub path: PathBuf,
    _staging: Option<TempDir>,
}

fn override_path(root: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    let plain = rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain || name.is_empty() {
        return Err(Error::fetch(name, "file override must be a relative path inside the bundle"));
    }
    Ok(root.join(rel))
}

pub struct Bundler {
    fetcher: Fetcher,
    renderers: RendererRegistry,
}

impl Bundler {
    pub fn new(fetcher: Fetcher, renderers: RendererRegistry) -> Self {
        Self { fetcher, renderers }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Downloads the plugin's source into the cache.
    pub async fn download(&self, plugin: &Plugin) -> Result<PathBuf> {
        self.fetcher.fetch(&FetchRequest::for_plugin(plugin)).await
    }

    /// Fetches the source and applies the plugin's file overrides on a staged
    /// copy, leaving the cache untouched.
    pub async fn source(&self, plugin: &Plugin) -> Result<Source> {
        let path = self.download(plugin).await?;
        if plugin.spec.file_overrides.is_empty() {
            return Ok(Source { path, _staging: None });
        }
        let staging = tempfile::Builder::new().prefix("bundle-").tempdir()?;
        let (src, dest) = (path.clone(), staging.path().to_path_buf());
        tokio::task::spawn_blocking(move || copy_dir(&src, &dest))
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("staging {}: {}", path.display(), e)))??;
        for file in &plugin.spec.file_overrides {
            let target = override_path(staging.path(), &file.name)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.content).await?;
            debug!(plugin = %plugin.name_any(), file = %file.name, "file override written");
        }
        Ok(Source {
            path: staging.path().to_path_buf(),
            _staging: Some(staging),
        })
    }

    /// Renders the plugin with `values`.
    pub async fn template(&self, plugin: &Plugin, values: &Values) -> Result<Rendered> {
        let source = self.source(plugin).await?;
        let release = Release::new(plugin.name_any(), plugin.install_namespace());
        let renderer = self.renderers.get(plugin.spec.kind)?;
        let mut rendered = renderer.render(&release, &source.path, values).await?;
        if rendered.version.is_none() {
            rendered.version = plugin.spec.version.clone();
        }
        Ok(rendered)
    }
}

pub struct Installer {
    bundler: Arc<Bundler>,
    cluster: Arc<dyn Cluster>,
    engine: SyncEngine,
    options: SyncOptions,
}

impl Installer {
    pub fn new(bundler: Arc<Bundler>, cluster: Arc<dyn Cluster>, options: SyncOptions) -> Self {
        Self {
            engine: SyncEngine::new(cluster.clone()),
            bundler,
            cluster,
            options,
        }
    }

    fn sync_options(&self, plugin: &Plugin, values: &Values) -> SyncOptions {
        let mut options = self.options.clone();
        if plugin.spec.kind == BundleKind::Native {
            options.annotations.extend(values.scalar_entries());
        }
        options
            .annotations
            .insert(PLUGIN_NAME_ANNOTATION.to_string(), plugin.name_any());
        options
    }

    /// Installs or upgrades the plugin. Errors before the sync leave
    /// `status.resources` untouched; sync errors still record what is live.
    pub async fn apply(&self, plugin: &Plugin, status: &mut PluginStatus) -> Result<()> {
        let namespace = plugin.install_namespace();
        let values = resolve_values(self.cluster.as_ref(), plugin).await?;
        let rendered = self.bundler.template(plugin, &values).await?;
        let desired = split_manifests(&rendered.manifests)?;
        info!(plugin = %plugin.name_any(), namespace = %namespace, objects = desired.len(), "rendered");

        let options = self.sync_options(plugin, &values);
        let outcome = self
            .engine
            .sync(&namespace, desired, &status.resources, &options)
            .await;
        let previous = status.clone();
        status.resources = outcome.managed.clone();
        outcome.into_result()?;

        status.phase = Some(PluginPhase::Installed);
        status.message = None;
        status.version = rendered.version;
        status.app_version = rendered.app_version;
        status.namespace = Some(namespace);
        status.values = values;
        status.observed_generation = plugin.metadata.generation;

        let changed = previous.phase != status.phase
            || previous.version != status.version
            || previous.app_version != status.app_version
            || previous.namespace != status.namespace
            || previous.values != status.values
            || previous.resources != status.resources;
        let ts = now();
        if status.creation_timestamp.is_none() {
            status.creation_timestamp = Some(ts.clone());
        }
        if changed || status.upgrade_timestamp.is_none() {
            status.upgrade_timestamp = Some(ts);
        }
        Ok(())
    }

    /// Removes everything the plugin installed.
    pub async fn remove(&self, plugin: &Plugin, status: &mut PluginStatus) -> Result<()> {
        let namespace = plugin.install_namespace();
        let outcome = self
            .engine
            .sync(&namespace, Vec::new(), &status.resources, &self.options)
            .await;
        status.resources = outcome.managed.clone();
        outcome.into_result()?;
        status.phase = Some(PluginPhase::Disabled);
        status.message = None;
        status.observed_generation = plugin.metadata.generation;
        info!(plugin = %plugin.name_any(), "removed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use crate::crds::ManagedResource;
    use crate::render::NativeRenderer;
    use serde_json::json;

    pub(crate) fn native_bundler(search: &Path, cache: &Path) -> Arc<Bundler> {
        let mut renderers = RendererRegistry::new();
        renderers.register(BundleKind::Native, Arc::new(NativeRenderer));
        Arc::new(Bundler::new(
            Fetcher::new(vec![search.to_path_buf()], cache.to_path_buf(), "helm"),
            renderers,
        ))
    }

    pub(crate) fn write_bundle(search: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = search.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (file, content) in files {
            std::fs::write(dir.join(file), content).unwrap();
        }
    }

    pub(crate) const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 1\n";

    pub(crate) fn plugin(spec: serde_json::Value) -> Plugin {
        serde_json::from_value(json!({
            "apiVersion": "plugins.kubegems.io/v1beta1",
            "kind": "Plugin",
            "metadata": {"name": "web", "namespace": "kubegems", "generation": 1},
            "spec": spec,
        }))
        .unwrap()
    }

    fn deployment_ref() -> ManagedResource {
        ManagedResource {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: Some("apps".into()),
            name: "web".into(),
        }
    }

    #[tokio::test]
    async fn fresh_native_install_stamps_values_as_annotations() {
        let (search, cache) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        write_bundle(search.path(), "web", &[("deploy.yaml", DEPLOYMENT)]);
        let cluster = Arc::new(MemoryCluster::new());
        let installer = Installer::new(
            native_bundler(search.path(), cache.path()),
            cluster.clone(),
            SyncOptions::default(),
        );

        let p = plugin(json!({"kind": "native", "installNamespace": "apps", "values": {"foo": "bar"}}));
        let mut status = PluginStatus::default();
        installer.apply(&p, &mut status).await.unwrap();

        assert_eq!(status.phase, Some(PluginPhase::Installed));
        assert_eq!(status.resources, vec![deployment_ref()]);
        assert_eq!(status.namespace.as_deref(), Some("apps"));
        assert_eq!(status.values.get("foo"), Some(&json!("bar")));
        assert!(status.creation_timestamp.is_some());

        let live = cluster.object(&deployment_ref()).unwrap();
        let annotations = live.metadata.annotations.unwrap();
        assert_eq!(annotations["foo"], "bar");
        assert_eq!(annotations[PLUGIN_NAME_ANNOTATION], "web");
    }

    #[tokio::test]
    async fn reapplying_keeps_the_upgrade_timestamp() {
        let (search, cache) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        write_bundle(search.path(), "web", &[("deploy.yaml", DEPLOYMENT)]);
        let cluster = Arc::new(MemoryCluster::new());
        let installer = Installer::new(
            native_bundler(search.path(), cache.path()),
            cluster.clone(),
            SyncOptions::default(),
        );
        let p = plugin(json!({"kind": "native"}));
        let mut status = PluginStatus::default();
        installer.apply(&p, &mut status).await.unwrap();

        let first = status.clone();
        status.upgrade_timestamp = Some("2020-01-01T00:00:00Z".into());
        cluster.clear_writes();
        installer.apply(&p, &mut status).await.unwrap();
        assert!(cluster.writes().is_empty());
        assert_eq!(status.upgrade_timestamp.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(status.resources, first.resources);
    }

    #[tokio::test]
    async fn file_overrides_apply_to_a_staged_copy() {
        let (search, cache) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        write_bundle(search.path(), "web", &[("deploy.yaml", DEPLOYMENT)]);
        let cluster = Arc::new(MemoryCluster::new());
        let installer = Installer::new(
            native_bundler(search.path(), cache.path()),
            cluster.clone(),
            SyncOptions::default(),
        );
        let p = plugin(json!({
            "kind": "native",
            "fileOverrides": [{"name": "extra/cm.yaml", "content": "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: extra\n"}]
        }));
        let mut status = PluginStatus::default();
        installer.apply(&p, &mut status).await.unwrap();
        assert_eq!(status.resources.len(), 2);
        assert!(!search.path().join("web/extra").exists());
    }

    #[tokio::test]
    async fn escaping_file_overrides_are_rejected() {
        assert!(override_path(Path::new("/tmp/x"), "../etc/passwd").is_err());
        assert!(override_path(Path::new("/tmp/x"), "/etc/passwd").is_err());
        assert_eq!(
            override_path(Path::new("/tmp/x"), "values.yaml").unwrap(),
            PathBuf::from("/tmp/x/values.yaml")
        );
    }

    #[tokio::test]
    async fn render_failure_leaves_resources_untouched() {
        let (search, cache) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        let installer = Installer::new(
            native_bundler(search.path(), cache.path()),
            cluster,
            SyncOptions::default(),
        );
        let p = plugin(json!({"kind": "native"}));
        let mut status = PluginStatus {
            resources: vec![deployment_ref()],
            ..Default::default()
        };
        assert!(installer.apply(&p, &mut status).await.unwrap_err().is_not_found());
        assert_eq!(status.resources, vec![deployment_ref()]);
    }

    #[tokio::test]
    async fn removal_deletes_every_managed_resource() {
        let (search, cache) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        write_bundle(
            search.path(),
            "web",
            &[
                ("a.yaml", DEPLOYMENT),
                ("b.yaml", "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n"),
                ("c.yaml", "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: web\n"),
            ],
        );
        let cluster = Arc::new(MemoryCluster::new());
        let installer = Installer::new(
            native_bundler(search.path(), cache.path()),
            cluster.clone(),
            SyncOptions::default(),
        );
        let p = plugin(json!({"kind": "native", "installNamespace": "apps"}));
        let mut status = PluginStatus::default();
        installer.apply(&p, &mut status).await.unwrap();
        assert_eq!(status.resources.len(), 3);
        assert_eq!(cluster.objects().len(), 3);

        cluster.clear_writes();
        installer.remove(&p, &mut status).await.unwrap();
        assert_eq!(status.phase, Some(PluginPhase::Disabled));
        assert!(status.resources.is_empty());
        assert!(cluster.objects().is_empty());
        let deletes = cluster.writes().iter().filter(|w| w.starts_with("delete")).count();
        assert_eq!(deletes, 3);
    }
}
