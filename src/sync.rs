/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/sync.rs
*
* The diff/sync engine. Given the freshly rendered objects and the managed
* set recorded by the previous reconciliation, it converges the cluster and
* returns the new managed set.
*
* The algorithm:
* 1. CustomResourceDefinitions are applied first, so custom resources
*    rendered next to them are served by the time they are looked at.
* 2. Normalize namespaces (namespaced kinds default to the install
*    namespace, cluster-scoped kinds lose theirs). An object whose kind is
*    still not served fails; it is never created in some default namespace.
* 3. Diff by `{apiVersion, kind, namespace, name}` into creates, applies and
*    removes.
* 4. Ensure target namespaces exist, then server-side apply every desired
*    object with forced ownership. Each object carries the digest of its
*    applied configuration; the write is skipped only when the live object
*    carries the same digest and every desired field, so a field dropped
*    from the render is still released by the next apply.
* 5. Delete everything in the remove set. A missing object counts as deleted;
*    a failed delete stays managed so it is retried.
* 6. Per-resource errors never short-circuit. They are collected and returned
*    alongside the managed set, which is sorted by apiVersion.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::cluster::Cluster;
use crate::crds::{ManagedResource, APPLIED_DIGEST_ANNOTATION, IGNORE_OPTIONS_ANNOTATION};
use crate::error::{Error, Result};
use kube::api::DynamicObject;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub field_manager: String,
    pub create_namespace: bool,
    /// Delete CRDs that dropped out of the render. Off by default: deleting a
    /// CRD deletes every custom resource of that kind.
    pub clean_crd: bool,
    /// Annotations stamped onto every desired object before it is applied.
    pub annotations: BTreeMap<String, String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            field_manager: crate::config::DEFAULT_FIELD_MANAGER.to_string(),
            create_namespace: true,
            clean_crd: false,
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Diff {
    pub creates: Vec<DynamicObject>,
    pub applies: Vec<DynamicObject>,
    pub removes: Vec<ManagedResource>,
}

/// Splits `desired` against the previously managed set. Objects without an
/// identity must have been filtered out by the caller.
pub fn diff(desired: Vec<DynamicObject>, managed: &[ManagedResource]) -> Diff {
    let managed_keys: HashSet<&ManagedResource> = managed.iter().collect();
    let mut desired_keys = HashSet::new();
    let mut result = Diff::default();

    for obj in desired {
        let Some(key) = ManagedResource::from_object(&obj) else {
            continue;
        };
        if managed_keys.contains(&key) {
            result.applies.push(obj);
        } else {
            result.creates.push(obj);
        }
        desired_keys.insert(key);
    }
    result.removes = managed
        .iter()
        .filter(|m| !desired_keys.contains(*m))
        .cloned()
        .collect();
    result
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub managed: Vec<ManagedResource>,
    pub errors: Vec<String>,
}

impl SyncOutcome {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<Vec<ManagedResource>> {
        if self.errors.is_empty() {
            Ok(self.managed)
        } else {
            Err(Error::Sync(self.errors.join("\n")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ignore {
    OnUpdate,
    OnDelete,
}

fn ignored(obj: &DynamicObject, option: Ignore) -> bool {
    let Some(value) = obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(IGNORE_OPTIONS_ANNOTATION))
    else {
        return false;
    };
    value.split(',').map(str::trim).any(|o| match option {
        Ignore::OnUpdate => o == "OnUpdate",
        Ignore::OnDelete => o == "OnDelete",
    })
}

/// True when every field of `desired` is present with the same value in
/// `live`. Lists must match element by element.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d
            .iter()
            .all(|(k, v)| l.get(k).map_or(false, |lv| is_subset(v, lv))),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| is_subset(dv, lv))
        }
        _ => desired == live,
    }
}

fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.annotations.as_ref()?.get(key).map(String::as_str)
}

/// Stamps the SHA-256 of the object's configuration, computed without the
/// digest annotation itself.
pub fn stamp_digest(obj: &mut DynamicObject) -> Result<()> {
    if let Some(annotations) = obj.metadata.annotations.as_mut() {
        annotations.remove(APPLIED_DIGEST_ANNOTATION);
        if annotations.is_empty() {
            obj.metadata.annotations = None;
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&*obj)?);
    let digest = format!("{:x}", hasher.finalize());
    obj.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(APPLIED_DIGEST_ANNOTATION.to_string(), digest);
    Ok(())
}

fn is_crd_object(obj: &DynamicObject) -> bool {
    ManagedResource::from_object(obj).is_some_and(|key| key.is_crd())
}

/// Same kind and name, whatever the namespace.
fn same_object(a: &ManagedResource, b: &ManagedResource) -> bool {
    a.api_version == b.api_version && a.kind == b.kind && a.name == b.name
}

enum Upsert {
    Created,
    Applied,
    Unchanged,
    Skipped,
}

pub struct SyncEngine {
    cluster: Arc<dyn Cluster>,
}

impl SyncEngine {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    /// Converges the cluster to `desired` and returns the new managed set with
    /// every per-resource error that occurred on the way.
    pub async fn sync(
        &self,
        namespace: &str,
        desired: Vec<DynamicObject>,
        managed: &[ManagedResource],
        options: &SyncOptions,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        let mut unresolved = Vec::new();
        let mut new_managed = Vec::new();

        let (crds, others): (Vec<_>, Vec<_>) = desired.into_iter().partition(is_crd_object);
        let crds = self
            .prepare(crds, namespace, options, &mut outcome.errors, &mut unresolved)
            .await;
        for crd in &crds {
            let was_managed = ManagedResource::from_object(crd).is_some_and(|key| managed.contains(&key));
            self.upsert_tracked(crd, was_managed, options, &mut outcome, &mut new_managed)
                .await;
        }

        let others = self
            .prepare(others, namespace, options, &mut outcome.errors, &mut unresolved)
            .await;

        let mut normalized_managed = Vec::with_capacity(managed.len());
        for resource in managed {
            normalized_managed.push(self.normalize_ref(resource, namespace).await);
        }

        let crd_count = crds.len();
        let mut prepared = crds;
        prepared.extend(others);
        let diff = diff(prepared, &normalized_managed);
        debug!(
            creates = diff.creates.len(),
            applies = diff.applies.len(),
            removes = diff.removes.len(),
            crds = crd_count,
            "computed diff"
        );

        if options.create_namespace {
            let namespaces: BTreeSet<String> = diff
                .creates
                .iter()
                .chain(diff.applies.iter())
                .filter_map(|o| o.metadata.namespace.clone())
                .collect();
            for ns in namespaces {
                if let Err(e) = self.cluster.ensure_namespace(&ns).await {
                    outcome.errors.push(format!("namespace {}: {}", ns, e));
                }
            }
        }

        for (obj, was_managed) in diff
            .creates
            .iter()
            .map(|o| (o, false))
            .chain(diff.applies.iter().map(|o| (o, true)))
        {
            if is_crd_object(obj) {
                continue;
            }
            self.upsert_tracked(obj, was_managed, options, &mut outcome, &mut new_managed)
                .await;
        }

        for resource in diff.removes {
            // Rendered but not resolvable this time; keep it until it is.
            if unresolved.iter().any(|u| same_object(u, &resource)) {
                new_managed.push(resource);
                continue;
            }
            match self.remove(&resource, options).await {
                Ok(true) => {}
                Ok(false) => new_managed.push(resource),
                Err(e) => {
                    warn!(resource = %resource, error = %e, "delete failed");
                    outcome.errors.push(format!("{}: {}", resource, e));
                    new_managed.push(resource);
                }
            }
        }

        let mut dedup = HashSet::new();
        new_managed.retain(|r| dedup.insert(r.clone()));
        new_managed.sort_by(|a, b| a.api_version.cmp(&b.api_version));
        outcome.managed = new_managed;
        outcome
    }

    /// Normalizes, annotates and de-duplicates `objects`. Objects that cannot
    /// be resolved are reported in `errors` and their identity is recorded
    /// in `unresolved`.
    async fn prepare(
        &self,
        objects: Vec<DynamicObject>,
        namespace: &str,
        options: &SyncOptions,
        errors: &mut Vec<String>,
        unresolved: &mut Vec<ManagedResource>,
    ) -> Vec<DynamicObject> {
        let mut prepared: Vec<DynamicObject> = Vec::with_capacity(objects.len());
        let mut seen = HashSet::new();
        for mut obj in objects {
            let Some(raw) = ManagedResource::from_object(&obj) else {
                errors.push("rendered object without apiVersion, kind or name".into());
                continue;
            };
            match self.normalize_object(&mut obj, namespace).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(resource = %raw, "kind is not served by the cluster");
                    errors.push(format!("{}: {}/{} is not served by the cluster", raw, raw.api_version, raw.kind));
                    unresolved.push(raw);
                    continue;
                }
                Err(e) => {
                    errors.push(format!("{}: {}", raw, e));
                    unresolved.push(raw);
                    continue;
                }
            }
            stamp_annotations(&mut obj, &options.annotations);
            if let Err(e) = stamp_digest(&mut obj) {
                errors.push(format!("{}: {}", raw, e));
                continue;
            }
            let Some(key) = ManagedResource::from_object(&obj) else {
                continue;
            };
            // Later documents win over earlier ones with the same identity.
            if !seen.insert(key.clone()) {
                prepared.retain(|o| ManagedResource::from_object(o).as_ref() != Some(&key));
            }
            prepared.push(obj);
        }
        prepared
    }

    async fn upsert_tracked(
        &self,
        obj: &DynamicObject,
        was_managed: bool,
        options: &SyncOptions,
        outcome: &mut SyncOutcome,
        managed: &mut Vec<ManagedResource>,
    ) {
        let Some(key) = ManagedResource::from_object(obj) else {
            return;
        };
        match self.upsert(obj, &key, &options.field_manager).await {
            Ok(result) => {
                match result {
                    Upsert::Created => info!(resource = %key, "created"),
                    Upsert::Applied => info!(resource = %key, "applied"),
                    Upsert::Skipped => info!(resource = %key, "ignored on update"),
                    Upsert::Unchanged => debug!(resource = %key, "up to date"),
                }
                managed.push(key);
            }
            Err(e) => {
                warn!(resource = %key, error = %e, "apply failed");
                outcome.errors.push(format!("{}: {}", key, e));
                // Still live from an earlier pass, so still ours.
                if was_managed {
                    managed.push(key);
                }
            }
        }
    }

    async fn upsert(&self, obj: &DynamicObject, key: &ManagedResource, field_manager: &str) -> Result<Upsert> {
        let Some(live) = self.cluster.get(key).await? else {
            self.cluster.create(obj, field_manager).await?;
            return Ok(Upsert::Created);
        };
        if ignored(obj, Ignore::OnUpdate) || ignored(&live, Ignore::OnUpdate) {
            return Ok(Upsert::Skipped);
        }
        let same_config = annotation(obj, APPLIED_DIGEST_ANNOTATION).is_some()
            && annotation(obj, APPLIED_DIGEST_ANNOTATION) == annotation(&live, APPLIED_DIGEST_ANNOTATION);
        if same_config && is_subset(&serde_json::to_value(obj)?, &serde_json::to_value(&live)?) {
            return Ok(Upsert::Unchanged);
        }
        self.cluster.apply(obj, field_manager).await?;
        Ok(Upsert::Applied)
    }

    /// Returns whether the resource left the managed set.
    async fn remove(&self, resource: &ManagedResource, options: &SyncOptions) -> Result<bool> {
        if resource.is_crd() && !options.clean_crd {
            info!(resource = %resource, "releasing CRD without deleting it");
            return Ok(true);
        }
        let Some(live) = self.cluster.get(resource).await? else {
            return Ok(true);
        };
        if ignored(&live, Ignore::OnDelete) {
            info!(resource = %resource, "ignored on delete");
            return Ok(false);
        }
        self.cluster.delete(resource).await?;
        info!(resource = %resource, "deleted");
        Ok(true)
    }

    /// Returns false when the object's kind is not served.
    async fn normalize_object(&self, obj: &mut DynamicObject, namespace: &str) -> Result<bool> {
        let types = obj.types.as_ref().ok_or(Error::MissingField("apiVersion/kind"))?;
        match self.cluster.is_namespaced(&types.api_version, &types.kind).await? {
            Some(true) => {
                if obj.metadata.namespace.as_deref().map_or(true, str::is_empty) {
                    obj.metadata.namespace = Some(namespace.to_string());
                }
            }
            Some(false) => obj.metadata.namespace = None,
            None => return Ok(false),
        }
        Ok(true)
    }

    async fn normalize_ref(&self, resource: &ManagedResource, namespace: &str) -> ManagedResource {
        let mut resource = resource.clone();
        match self.cluster.is_namespaced(&resource.api_version, &resource.kind).await {
            Ok(Some(true)) if resource.namespace.as_deref().map_or(true, str::is_empty) => {
                resource.namespace = Some(namespace.to_string());
            }
            Ok(Some(false)) => resource.namespace = None,
            _ => {}
        }
        resource
    }
}

fn stamp_annotations(obj: &mut DynamicObject, annotations: &BTreeMap<String, String>) {
    if annotations.is_empty() {
        return;
    }
    let target = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in annotations {
        target.entry(k.clone()).or_insert_with(|| v.clone());
    }
}
