/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/render/native.rs
*
* Native bundles are plain manifests: every `*.yaml` under the source, in
* lexical path order, each preceded by a document separator. No parameter
* substitution happens here.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::{Release, Rendered, Renderer};
use crate::crds::BundleKind;
use crate::error::{Error, Result};
use crate::values::Values;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct NativeRenderer;

/// Concatenates the YAML files below `dir`.
pub fn concat_yaml(dir: &Path) -> Result<String> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| Error::render(BundleKind::Native, e))?;
        let is_yaml = entry.path().extension().is_some_and(|ext| ext == "yaml");
        if entry.file_type().is_file() && is_yaml {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut out = String::new();
    for file in files {
        out.push_str("---\n");
        let content = std::fs::read_to_string(&file)?;
        out.push_str(&content);
        if !content.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out)
}

#[async_trait]
impl Renderer for NativeRenderer {
    async fn render(&self, _release: &Release, dir: &Path, _values: &Values) -> Result<Rendered> {
        let dir = dir.to_path_buf();
        let manifests = tokio::task::spawn_blocking(move || concat_yaml(&dir))
            .await
            .map_err(|e| Error::render(BundleKind::Native, e))??;
        Ok(Rendered {
            manifests,
            ..Default::default()
        })
    }
}
