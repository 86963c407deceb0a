/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/render/kustomize.rs
*
* Kustomize overlays are built with the `kustomize` binary against the
* source directory. Values do not apply to overlays.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::{Release, Rendered, Renderer};
use crate::crds::BundleKind;
use crate::error::{Error, Result};
use crate::process::execute_command;
use crate::values::Values;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

pub struct KustomizeRenderer {
    kustomize_bin: String,
}

impl KustomizeRenderer {
    pub fn new(kustomize_bin: impl Into<String>) -> Self {
        Self {
            kustomize_bin: kustomize_bin.into(),
        }
    }
}

#[async_trait]
impl Renderer for KustomizeRenderer {
    async fn render(&self, release: &Release, dir: &Path, _values: &Values) -> Result<Rendered> {
        debug!(release = %release.name, dir = %dir.display(), "rendering with kustomize");
        let mut cmd = Command::new(&self.kustomize_bin);
        cmd.arg("build").arg(dir);
        let manifests = execute_command(&mut cmd)
            .await
            .map_err(|e| Error::render(BundleKind::Kustomize, format!("{:#}", e)))?;
        Ok(Rendered {
            manifests,
            ..Default::default()
        })
    }
}
