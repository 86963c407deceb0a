/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/cluster.rs
*
* The object-store interface the pipeline consumes. Everything above this
* layer (values resolution, the sync engine, the reconciler) talks to the
* cluster only through `Cluster`, so the whole pipeline can run against the
* in-memory implementation in tests.
*
* SPDX-License-Identifier: Apache-2.0 */

mod kube_cluster;
#[cfg(test)]
pub mod memory;

pub use kube_cluster::KubeCluster;

use crate::crds::{ManagedResource, Plugin, PluginStatus};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;

#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn get_plugin(&self, namespace: &str, name: &str) -> Result<Option<Plugin>>;

    /// Writes the whole status of `plugin`. The write is conditional on the
    /// plugin's resourceVersion; a concurrent change surfaces as a conflict.
    async fn update_plugin_status(&self, plugin: &Plugin, status: &PluginStatus) -> Result<()>;

    /// `Some(true)` for namespaced kinds, `Some(false)` for cluster scoped
    /// ones, `None` when the kind is not served by the cluster.
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<Option<bool>>;

    async fn get(&self, resource: &ManagedResource) -> Result<Option<DynamicObject>>;

    /// Creates `obj` through server-side apply, so `field_manager` owns every
    /// field from the first write on.
    async fn create(&self, obj: &DynamicObject, field_manager: &str) -> Result<()>;

    /// Server-side apply with forced ownership. Fields this manager applied
    /// before and `obj` no longer carries are removed from the live object.
    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<()>;

    /// Deletes by reference. A missing object counts as deleted.
    async fn delete(&self, resource: &ManagedResource) -> Result<()>;

    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// The API server's git version, e.g. `v1.28.3`.
    async fn server_version(&self) -> Result<Option<String>>;

    /// Every served `group/version` and `group/version/Kind`, sorted.
    async fn api_versions(&self) -> Result<Vec<String>>;
}
