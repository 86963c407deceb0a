/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/cluster/kube_cluster.rs
*
* `Cluster` backed by a live API server through kube-rs. Arbitrary kinds are
* handled as `DynamicObject`s; their API resources are discovered with
* `discovery::pinned_kind` and memoized, misses excepted, so a CRD installed
* by one render is picked up by the next.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::Cluster;
use crate::crds::{split_api_version, ManagedResource, Plugin, PluginStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::{
    api::{Api, DeleteParams, DynamicObject, ObjectMeta, Patch, PatchParams, PostParams},
    core::GroupVersionKind,
    discovery::{self, ApiCapabilities, ApiResource, Discovery, Scope},
    Client, Resource, ResourceExt,
};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

type Discovered = (ApiResource, ApiCapabilities);

pub struct KubeCluster {
    client: Client,
    field_manager: String,
    resources: RwLock<HashMap<String, Discovered>>,
}

impl KubeCluster {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            resources: RwLock::new(HashMap::new()),
        }
    }

    async fn discover(&self, api_version: &str, kind: &str) -> Result<Option<Discovered>> {
        let key = format!("{}/{}", api_version, kind);
        if let Some(found) = self.resources.read().await.get(&key) {
            return Ok(Some(found.clone()));
        }

        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let found = match discovery::pinned_kind(&self.client, &gvk).await {
            Ok(found) => found,
            Err(kube::Error::Discovery(e)) => {
                debug!(api_version, kind, error = %e, "kind is not served");
                return Ok(None);
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.resources.write().await.insert(key, found.clone());
        Ok(Some(found))
    }

    /// A namespaced kind without a namespace is an error, never the client's
    /// default namespace.
    fn api_for(&self, (ar, caps): &Discovered, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        match (&caps.scope, namespace.filter(|ns| !ns.is_empty())) {
            (Scope::Namespaced, Some(ns)) => Ok(Api::namespaced_with(self.client.clone(), ns, ar)),
            (Scope::Namespaced, None) => Err(Error::MissingField("metadata.namespace")),
            (Scope::Cluster, _) => Ok(Api::all_with(self.client.clone(), ar)),
        }
    }

    async fn api_for_object(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String)> {
        let types = obj.types.as_ref().ok_or(Error::MissingField("apiVersion/kind"))?;
        let name = obj.metadata.name.clone().ok_or(Error::MissingField("metadata.name"))?;
        let discovered = self
            .discover(&types.api_version, &types.kind)
            .await?
            .ok_or_else(|| Error::Sync(format!("{}/{} is not served by the cluster", types.api_version, types.kind)))?;
        Ok((self.api_for(&discovered, obj.metadata.namespace.as_deref())?, name))
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_plugin(&self, namespace: &str, name: &str) -> Result<Option<Plugin>> {
        let api: Api<Plugin> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_plugin_status(&self, plugin: &Plugin, status: &PluginStatus) -> Result<()> {
        let namespace = plugin.namespace().ok_or(Error::MissingField("metadata.namespace"))?;
        let name = plugin.name_any();
        let api: Api<Plugin> = Api::namespaced(self.client.clone(), &namespace);
        // Applying the complete status drops every field this manager set
        // before and omits now; resourceVersion makes the write conditional.
        let patch = json!({
            "apiVersion": Plugin::api_version(&()),
            "kind": Plugin::kind(&()),
            "metadata": {
                "name": name,
                "resourceVersion": plugin.resource_version(),
            },
            "status": status,
        });
        let params = PatchParams::apply(&self.field_manager).force();
        api.patch_status(&name, &params, &Patch::Apply(&patch)).await?;
        Ok(())
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<Option<bool>> {
        Ok(self
            .discover(api_version, kind)
            .await?
            .map(|(_, caps)| matches!(caps.scope, Scope::Namespaced)))
    }

    async fn get(&self, resource: &ManagedResource) -> Result<Option<DynamicObject>> {
        let Some(discovered) = self.discover(&resource.api_version, &resource.kind).await? else {
            return Ok(None);
        };
        let api = self.api_for(&discovered, resource.namespace.as_deref())?;
        Ok(api.get_opt(&resource.name).await?)
    }

    async fn create(&self, obj: &DynamicObject, field_manager: &str) -> Result<()> {
        let (api, name) = self.api_for_object(obj).await?;
        let params = PatchParams::apply(field_manager).force();
        api.patch(&name, &params, &Patch::Apply(obj)).await?;
        Ok(())
    }

    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<()> {
        let (api, name) = self.api_for_object(obj).await?;
        let params = PatchParams::apply(field_manager).force();
        api.patch(&name, &params, &Patch::Apply(obj)).await?;
        Ok(())
    }

    async fn delete(&self, resource: &ManagedResource) -> Result<()> {
        let Some(discovered) = self.discover(&resource.api_version, &resource.kind).await? else {
            return Ok(());
        };
        let api = self.api_for(&discovered, resource.namespace.as_deref())?;
        match api.delete(&resource.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await?.is_some() {
            return Ok(());
        }
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn server_version(&self) -> Result<Option<String>> {
        let info = self.client.apiserver_version().await?;
        Ok(Some(info.git_version))
    }

    async fn api_versions(&self) -> Result<Vec<String>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut served = BTreeSet::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, _) in group.versioned_resources(version) {
                    served.insert(format!("{}/{}", ar.api_version, ar.kind));
                    served.insert(ar.api_version);
                }
            }
        }
        Ok(served.into_iter().collect())
    }
}
