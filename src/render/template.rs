/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/render/template.rs
*
* Template bundles are helm-shaped directories (a `templates/` folder and
* maybe a `values.yaml`) without a real chart identity. The source is staged
* into a scratch directory, given a synthetic `Chart.yaml` when it has none,
* and rendered by helm. With a live cluster the render runs with
* `--dry-run=server` so `lookup` sees real objects.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::helm::helm_template;
use super::{Capabilities, Release, Rendered, Renderer};
use crate::crds::BundleKind;
use crate::error::{Error, Result};
use crate::fetch::archive::copy_dir;
use crate::fetch::chart_repo::ChartMetadata;
use crate::values::Values;
use async_trait::async_trait;
use std::path::Path;

pub struct TemplateRenderer {
    helm_bin: String,
    capabilities: Capabilities,
}

impl TemplateRenderer {
    pub fn new(helm_bin: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            helm_bin: helm_bin.into(),
            capabilities,
        }
    }
}

pub(crate) fn synthetic_chart(name: &str, version: Option<&str>) -> String {
    format!(
        "apiVersion: v2\nname: {}\nversion: {}\n",
        name,
        version.unwrap_or("0.0.0")
    )
}

#[async_trait]
impl Renderer for TemplateRenderer {
    async fn render(&self, release: &Release, dir: &Path, values: &Values) -> Result<Rendered> {
        let staging = tempfile::Builder::new().prefix("template-").tempdir()?;
        let (src, dest) = (dir.to_path_buf(), staging.path().to_path_buf());
        tokio::task::spawn_blocking(move || copy_dir(&src, &dest))
            .await
            .map_err(|e| Error::render(BundleKind::Template, e))??;

        let meta = match ChartMetadata::load(staging.path()).await? {
            Some(meta) => meta,
            None => {
                tokio::fs::write(
                    staging.path().join(ChartMetadata::FILE),
                    synthetic_chart(&release.name, None),
                )
                .await?;
                ChartMetadata::default()
            }
        };

        let extra: &[&str] = if self.capabilities.is_live() {
            &["--dry-run=server"]
        } else {
            &[]
        };
        let manifests = helm_template(
            &self.helm_bin,
            BundleKind::Template,
            release,
            staging.path(),
            values,
            &self.capabilities,
            extra,
        )
        .await?;
        Ok(Rendered {
            manifests,
            version: meta.version,
            app_version: meta.app_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_chart_defaults_version() {
        assert_eq!(synthetic_chart("demo", None), "apiVersion: v2\nname: demo\nversion: 0.0.0\n");
        assert!(synthetic_chart("demo", Some("1.0.0")).contains("version: 1.0.0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chart_is_synthesized_in_a_staged_copy() {
        use std::os::unix::fs::PermissionsExt;

        let bin = tempfile::tempdir().unwrap();
        let helm = bin.path().join("helm");
        // Prints the Chart.yaml it was handed, which only exists in staging.
        std::fs::write(&helm, "#!/bin/sh\ncat \"$3/Chart.yaml\"\n").unwrap();
        std::fs::set_permissions(&helm, std::fs::Permissions::from_mode(0o755)).unwrap();

        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("templates")).unwrap();
        std::fs::write(source.path().join("templates/cm.yaml"), "kind: ConfigMap").unwrap();

        let renderer = TemplateRenderer::new(helm.display().to_string(), Capabilities::default());
        let rendered = renderer
            .render(&Release::new("demo", "web"), source.path(), &Values::new())
            .await
            .unwrap();
        assert!(rendered.manifests.contains("name: demo"));
        assert!(rendered.version.is_none());
        assert!(!source.path().join("Chart.yaml").exists());
    }
}
