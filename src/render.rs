/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/render.rs
*
* Rendering turns a fetched bundle plus its values into a multi-document
* manifest stream. There is one `Renderer` per `BundleKind`, registered once
* in a `RendererRegistry` at start-up and looked up by kind for every
* reconcile. Rendering never mutates cluster state.
*
* SPDX-License-Identifier: Apache-2.0 */

pub mod helm;
pub mod kustomize;
pub mod manifest;
pub mod native;
pub mod template;

use crate::config::SourceArgs;
use crate::crds::BundleKind;
use crate::error::{Error, Result};
use crate::values::Values;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub use helm::HelmRenderer;
pub use kustomize::KustomizeRenderer;
pub use native::NativeRenderer;
pub use template::TemplateRenderer;

/// Identity of one installation of a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
}

impl Release {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rendered {
    /// YAML documents separated by `---`.
    pub manifests: String,
    pub version: Option<String>,
    pub app_version: Option<String>,
}

/// What the target cluster serves. Helm based renderers pass it on so charts
/// see the same `.Capabilities` they would see installed in-cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub kube_version: Option<String>,
    /// `group/version` and `group/version/Kind` entries, sorted.
    pub api_versions: Vec<String>,
}

impl Capabilities {
    /// True when the values come from a reachable cluster.
    pub fn is_live(&self) -> bool {
        self.kube_version.is_some()
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, release: &Release, dir: &Path, values: &Values) -> Result<Rendered>;
}

/// Guesses the bundle kind of an unpacked source.
pub fn detect_kind(dir: &Path) -> BundleKind {
    if dir.join("Chart.yaml").is_file() {
        BundleKind::Helm
    } else if dir.join("kustomization.yaml").is_file() {
        BundleKind::Kustomize
    } else {
        BundleKind::Template
    }
}

#[derive(Clone, Default)]
pub struct RendererRegistry {
    renderers: HashMap<BundleKind, Arc<dyn Renderer>>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in renderer. `capabilities` describe the live cluster, or
    /// are empty when rendering offline.
    pub fn builtin(args: &SourceArgs, capabilities: Capabilities) -> Self {
        let mut registry = Self::new();
        registry.register(
            BundleKind::Helm,
            Arc::new(HelmRenderer::new(args.helm_bin.clone(), capabilities.clone())),
        );
        registry.register(
            BundleKind::Template,
            Arc::new(TemplateRenderer::new(args.helm_bin.clone(), capabilities)),
        );
        registry.register(
            BundleKind::Kustomize,
            Arc::new(KustomizeRenderer::new(args.kustomize_bin.clone())),
        );
        registry.register(BundleKind::Native, Arc::new(NativeRenderer));
        registry
    }

    pub fn register(&mut self, kind: BundleKind, renderer: Arc<dyn Renderer>) {
        self.renderers.insert(kind, renderer);
    }

    pub fn get(&self, kind: BundleKind) -> Result<Arc<dyn Renderer>> {
        self.renderers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::render(kind, "no renderer registered"))
    }
}
