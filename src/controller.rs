/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/controller.rs
*
* The `Plugin` controller. It runs the kube-rs `Controller` loop, keeps the
* finalizer on every Plugin through `kube::runtime::finalizer`, and drives
* each Plugin through a small state machine:
*
*   Apply, enabled     -> dependency gate -> install     -> Installed | Failed
*   Apply, disabled    -> prune everything               -> Disabled  | Failed
*   Cleanup (deleting) -> prune everything               -> Disabled, finalizer removed
*                                                           Failed, finalizer kept, retried
*
* An unsatisfied dependency is not a failure: the status is left alone and
* the Plugin is looked at again after `dependency_requeue`.
*
* ConfigMaps and Secrets are watched as well. A change to one of them is
* mapped back to the Plugins whose `valuesFrom` names it with a linear scan
* of the controller's own reflector store.
*
* The status is written only when it differs from what is stored, so a
* converged Plugin causes no API writes at all. Live Plugins are reconciled
* again every `resync_interval` so objects edited or deleted out of band are
* put back.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::cluster::Cluster;
use crate::config::ControllerConfig;
use crate::crds::{Plugin, PluginPhase, PluginStatus, ValuesFromKind, PLUGIN_FINALIZER};
use crate::error::{Error, Result};
use crate::fetch::chart_repo::parse_version;
use crate::installer::Installer;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::Api,
    runtime::finalizer::{finalizer, Event as FinalizerEvent},
    Client, ResourceExt,
};
use kube_runtime::{
    controller::{self, Action},
    reflector::ObjectRef,
    watcher, Controller,
};
use std::sync::Arc;
use tracing::{error, field, info, instrument, warn, Span};

/// What a reconcile does with a Plugin, decided from its spec and metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Install,
    Remove,
}

pub struct Reconciler {
    cluster: Arc<dyn Cluster>,
    installer: Installer,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn Cluster>, installer: Installer, config: ControllerConfig) -> Self {
        Self {
            cluster,
            installer,
            config,
        }
    }

    pub fn decide(plugin: &Plugin) -> Step {
        if plugin.is_deleting() || !plugin.spec.enabled {
            Step::Remove
        } else {
            Step::Install
        }
    }

    /// Fails with `Error::Dependency` unless every dependency is installed at
    /// an acceptable version.
    pub async fn check_dependencies(&self, plugin: &Plugin) -> Result<()> {
        let own = plugin.namespace().unwrap_or_default();
        for dep in plugin.spec.dependencies.iter().filter(|d| !d.name.is_empty()) {
            let namespace = dep.namespace.clone().filter(|ns| !ns.is_empty()).unwrap_or_else(|| own.clone());
            let unsatisfied = |reason: String| Error::Dependency {
                namespace: namespace.clone(),
                name: dep.name.clone(),
                reason,
            };
            let Some(found) = self.cluster.get_plugin(&namespace, &dep.name).await? else {
                return Err(unsatisfied("not found".into()));
            };
            if found.phase() != Some(PluginPhase::Installed) {
                return Err(unsatisfied("not installed".into()));
            }
            if let Some(wanted) = dep.version.as_deref().filter(|v| !v.is_empty()) {
                let installed = found.status.as_ref().and_then(|s| s.version.clone()).unwrap_or_default();
                if !version_satisfies(&installed, wanted) {
                    return Err(unsatisfied(format!("version {} does not satisfy {}", installed, wanted)));
                }
            }
        }
        Ok(())
    }

    async fn write_status(&self, plugin: &Plugin, status: &PluginStatus) -> Result<()> {
        if plugin.status.as_ref() == Some(status) {
            return Ok(());
        }
        self.cluster.update_plugin_status(plugin, status).await
    }

    async fn fail(&self, plugin: &Plugin, mut status: PluginStatus, err: Error) -> Result<Action> {
        warn!(plugin = %plugin.name_any(), error = %err, "reconcile failed");
        status.phase = Some(PluginPhase::Failed);
        status.message = Some(err.to_string());
        status.observed_generation = plugin.metadata.generation;
        if let Err(write_err) = self.write_status(plugin, &status).await {
            error!(plugin = %plugin.name_any(), error = %write_err, "writing failed status");
        }
        Err(err)
    }

    /// Handles a live Plugin.
    pub async fn apply(&self, plugin: &Plugin) -> Result<Action> {
        let mut status = plugin.status.clone().unwrap_or_default();
        let result = match Self::decide(plugin) {
            Step::Remove => self.installer.remove(plugin, &mut status).await,
            Step::Install => {
                match self.check_dependencies(plugin).await {
                    Err(e) if e.is_dependency() => {
                        info!(plugin = %plugin.name_any(), reason = %e, "waiting for dependency");
                        return Ok(Action::requeue(self.config.dependency_requeue));
                    }
                    Err(e) => return Err(e),
                    Ok(()) => {}
                }
                self.installer.apply(plugin, &mut status).await
            }
        };
        match result {
            Ok(()) => {
                self.write_status(plugin, &status).await?;
                Ok(Action::requeue(self.config.resync_interval))
            }
            Err(e) => self.fail(plugin, status, e).await,
        }
    }

    /// Handles a Plugin being deleted. Success lets the finalizer go; an error
    /// keeps it so the cleanup is retried.
    pub async fn cleanup(&self, plugin: &Plugin) -> Result<Action> {
        let mut status = plugin.status.clone().unwrap_or_default();
        match self.installer.remove(plugin, &mut status).await {
            Ok(()) => {
                self.write_status(plugin, &status).await?;
                Ok(Action::await_change())
            }
            Err(e) => self.fail(plugin, status, e).await,
        }
    }
}

fn version_satisfies(installed: &str, wanted: &str) -> bool {
    match (semver::VersionReq::parse(wanted), parse_version(installed)) {
        (Ok(req), Some(version)) => req.matches(&version),
        _ => installed.trim_start_matches('v') == wanted.trim_start_matches('v'),
    }
}

pub struct Context {
    pub client: Client,
    pub reconciler: Reconciler,
}

#[instrument(skip(plugin, ctx), fields(plugin = %plugin.name_any(), namespace = field::Empty))]
pub async fn reconcile(plugin: Arc<Plugin>, ctx: Arc<Context>) -> Result<Action> {
    let ns = plugin.namespace().ok_or(Error::MissingField("metadata.namespace"))?;
    Span::current().record("namespace", ns.as_str());
    let api: Api<Plugin> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, PLUGIN_FINALIZER, plugin, |event| async {
        match event {
            FinalizerEvent::Apply(plugin) => ctx.reconciler.apply(&plugin).await,
            FinalizerEvent::Cleanup(plugin) => ctx.reconciler.cleanup(&plugin).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

pub fn on_error(plugin: Arc<Plugin>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(plugin = %plugin.name_any(), error = %error, "requeueing after error");
    Action::requeue(ctx.reconciler.config.error_requeue)
}

/// Plugins whose `valuesFrom` points at `{kind} {namespace}/{name}`.
pub fn referencing<I>(plugins: I, kind: ValuesFromKind, namespace: &str, name: &str) -> Vec<ObjectRef<Plugin>>
where
    I: IntoIterator<Item = Arc<Plugin>>,
{
    plugins
        .into_iter()
        .filter(|p| p.references(kind, namespace, name))
        .map(|p| ObjectRef::from_obj(p.as_ref()))
        .collect()
}

/// Runs the controller until a shutdown signal arrives.
pub async fn run(ctx: Arc<Context>, concurrency: u16) {
    let client = ctx.client.clone();
    let plugins: Api<Plugin> = Api::all(client.clone());
    let controller = Controller::new(plugins, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency));

    let store = controller.store();
    let secret_store = store.clone();
    let controller = controller
        .watches(
            Api::<ConfigMap>::all(client.clone()),
            watcher::Config::default(),
            move |cm: ConfigMap| {
                let (ns, name) = (cm.namespace().unwrap_or_default(), cm.name_any());
                referencing(store.state(), ValuesFromKind::ConfigMap, &ns, &name)
            },
        )
        .watches(
            Api::<Secret>::all(client),
            watcher::Config::default(),
            move |secret: Secret| {
                let (ns, name) = (secret.namespace().unwrap_or_default(), secret.name_any());
                referencing(secret_store.state(), ValuesFromKind::Secret, &ns, &name)
            },
        );

    info!(concurrency, "plugin controller starting");
    controller
        .shutdown_on_signal()
        .run(reconcile, on_error, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => info!(plugin = %obj.name, namespace = ?obj.namespace, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile error"),
            }
        })
        .await;
    info!("plugin controller stopped");
}
