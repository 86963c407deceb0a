/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/cluster/memory.rs
*
* In-memory `Cluster` used by the unit tests. Every object write is recorded
* so tests can assert on exactly which API calls a sync performed.
*
* Server-side apply is modelled for a single field manager: the last applied
* configuration of each object is kept, and fields it carried that the next
* apply omits are dropped from the live object. Creating a CRD makes its kind
* served, the way the API server does.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::Cluster;
use crate::crds::{ManagedResource, Plugin, PluginStatus};
use crate::error::{Error, Result};
use crate::values::merge_maps;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    objects: BTreeMap<ManagedResource, DynamicObject>,
    applied: BTreeMap<ManagedResource, Value>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    secrets: BTreeMap<(String, String), Secret>,
    plugins: BTreeMap<(String, String), Plugin>,
    kinds: HashMap<String, bool>,
    namespaces: BTreeSet<String>,
    failing: HashSet<String>,
    writes: Vec<String>,
    status_updates: usize,
}

pub struct MemoryCluster {
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let cluster = MemoryCluster {
            state: Mutex::new(State::default()),
        };
        for (api_version, kind, namespaced) in [
            ("v1", "ConfigMap", true),
            ("v1", "Secret", true),
            ("v1", "Service", true),
            ("v1", "ServiceAccount", true),
            ("v1", "Namespace", false),
            ("apps/v1", "Deployment", true),
            ("rbac.authorization.k8s.io/v1", "ClusterRole", false),
            ("apiextensions.k8s.io/v1", "CustomResourceDefinition", false),
        ] {
            cluster.register_kind(api_version, kind, namespaced);
        }
        cluster
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn register_kind(&self, api_version: &str, kind: &str, namespaced: bool) {
        self.lock().kinds.insert(format!("{}/{}", api_version, kind), namespaced);
    }

    pub fn insert_object(&self, obj: DynamicObject) {
        let key = ManagedResource::from_object(&obj).unwrap();
        self.lock().objects.insert(key, obj);
    }

    pub fn insert_config_map(&self, cm: ConfigMap) {
        let key = (cm.namespace().unwrap(), cm.name_any());
        self.lock().config_maps.insert(key, cm);
    }

    pub fn insert_secret(&self, secret: Secret) {
        let key = (secret.namespace().unwrap(), secret.name_any());
        self.lock().secrets.insert(key, secret);
    }

    pub fn insert_plugin(&self, plugin: Plugin) {
        let key = (plugin.namespace().unwrap(), plugin.name_any());
        self.lock().plugins.insert(key, plugin);
    }

    /// Makes every write or delete of an object with this name fail.
    pub fn fail_on(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    pub fn object(&self, resource: &ManagedResource) -> Option<DynamicObject> {
        self.lock().objects.get(resource).cloned()
    }

    pub fn objects(&self) -> Vec<ManagedResource> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn status_updates(&self) -> usize {
        self.lock().status_updates
    }

    pub fn plugin(&self, namespace: &str, name: &str) -> Option<Plugin> {
        self.lock()
            .plugins
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Serves the kinds a `CustomResourceDefinition` declares.
    fn register_crd(state: &mut State, crd: &Value) {
        let spec = &crd["spec"];
        let (Some(group), Some(kind)) = (spec["group"].as_str(), spec["names"]["kind"].as_str()) else {
            return;
        };
        let namespaced = spec["scope"].as_str() != Some("Cluster");
        for version in spec["versions"].as_array().into_iter().flatten() {
            if let Some(version) = version["name"].as_str() {
                state
                    .kinds
                    .insert(format!("{}/{}/{}", group, version, kind), namespaced);
            }
        }
    }

    fn check_failing(state: &State, name: &str) -> Result<()> {
        if state.failing.contains(name) {
            return Err(Error::Sync(format!("injected failure for {}", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self
            .lock()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_plugin(&self, namespace: &str, name: &str) -> Result<Option<Plugin>> {
        Ok(self.plugin(namespace, name))
    }

    async fn update_plugin_status(&self, plugin: &Plugin, status: &PluginStatus) -> Result<()> {
        let mut state = self.lock();
        state.status_updates += 1;
        let key = (plugin.namespace().unwrap_or_default(), plugin.name_any());
        let stored = state.plugins.entry(key).or_insert_with(|| plugin.clone());
        stored.status = Some(status.clone());
        Ok(())
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<Option<bool>> {
        Ok(self.lock().kinds.get(&format!("{}/{}", api_version, kind)).copied())
    }

    async fn get(&self, resource: &ManagedResource) -> Result<Option<DynamicObject>> {
        Ok(self.object(resource))
    }

    async fn create(&self, obj: &DynamicObject, _field_manager: &str) -> Result<()> {
        let key = ManagedResource::from_object(obj).ok_or(Error::MissingField("metadata.name"))?;
        let mut state = self.lock();
        Self::check_failing(&state, &key.name)?;
        if state.objects.contains_key(&key) {
            return Err(Error::Sync(format!("{} already exists", key)));
        }
        let applied = serde_json::to_value(obj)?;
        if key.is_crd() {
            Self::register_crd(&mut state, &applied);
        }
        state.writes.push(format!("create {}", key));
        state.objects.insert(key.clone(), obj.clone());
        state.applied.insert(key, applied);
        Ok(())
    }

    async fn apply(&self, obj: &DynamicObject, _field_manager: &str) -> Result<()> {
        let key = ManagedResource::from_object(obj).ok_or(Error::MissingField("metadata.name"))?;
        let mut state = self.lock();
        Self::check_failing(&state, &key.name)?;
        state.writes.push(format!("apply {}", key));
        let desired = serde_json::to_value(obj)?;
        let merged = match state.objects.get(&key) {
            Some(live) => {
                let mut live = serde_json::to_value(live)?;
                if let (Some(live), Some(desired)) = (live.as_object_mut(), desired.as_object()) {
                    if let Some(previous) = state.applied.get(&key).and_then(Value::as_object) {
                        release_fields(live, previous, desired);
                    }
                    merge_maps(live, desired);
                }
                serde_json::from_value(live)?
            }
            None => obj.clone(),
        };
        if key.is_crd() {
            Self::register_crd(&mut state, &desired);
        }
        state.objects.insert(key.clone(), merged);
        state.applied.insert(key, desired);
        Ok(())
    }

    async fn delete(&self, resource: &ManagedResource) -> Result<()> {
        let mut state = self.lock();
        Self::check_failing(&state, &resource.name)?;
        if state.objects.remove(resource).is_some() {
            state.writes.push(format!("delete {}", resource));
        }
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.namespaces.insert(name.to_string()) {
            state.writes.push(format!("create namespace {}", name));
        }
        Ok(())
    }

    async fn server_version(&self) -> Result<Option<String>> {
        Ok(Some("v1.28.0".to_string()))
    }

    async fn api_versions(&self) -> Result<Vec<String>> {
        let state = self.lock();
        let mut served = BTreeSet::new();
        for gvk in state.kinds.keys() {
            if let Some((api_version, _)) = gvk.rsplit_once('/') {
                served.insert(api_version.to_string());
            }
            served.insert(gvk.clone());
        }
        Ok(served.into_iter().collect())
    }
}

/// Drops from `live` the fields `previous` applied and `next` no longer does.
fn release_fields(live: &mut Map<String, Value>, previous: &Map<String, Value>, next: &Map<String, Value>) {
    for (key, before) in previous {
        match (next.get(key), before) {
            (None, _) => {
                live.remove(key);
            }
            (Some(Value::Object(after)), Value::Object(before)) => {
                if let Some(Value::Object(live)) = live.get_mut(key) {
                    release_fields(live, before, after);
                }
            }
            _ => {}
        }
    }
}
