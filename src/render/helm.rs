/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/render/helm.rs
*
* Helm charts are rendered client-side with `helm template`. Values are
* handed over through a temporary values file; CRDs are included so they are
* applied ahead of the resources that use them. The cluster's version and
* served API versions are passed as `--kube-version` and `--api-versions`.
*
* SPDX-License-Identifier: Apache-2.0 */

use super::{Capabilities, Release, Rendered, Renderer};
use crate::crds::BundleKind;
use crate::error::{Error, Result};
use crate::fetch::chart_repo::ChartMetadata;
use crate::process::execute_command;
use crate::values::Values;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

pub struct HelmRenderer {
    helm_bin: String,
    capabilities: Capabilities,
}

impl HelmRenderer {
    pub fn new(helm_bin: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            helm_bin: helm_bin.into(),
            capabilities,
        }
    }
}

/// Runs `helm template` for `dir` and returns the manifest stream.
pub(crate) async fn helm_template(
    helm_bin: &str,
    kind: BundleKind,
    release: &Release,
    dir: &Path,
    values: &Values,
    capabilities: &Capabilities,
    extra_args: &[&str],
) -> Result<String> {
    let mut values_file = tempfile::Builder::new()
        .prefix("values-")
        .suffix(".yaml")
        .tempfile()?;
    values_file.write_all(values.to_yaml()?.as_bytes())?;
    values_file.flush()?;

    let mut cmd = Command::new(helm_bin);
    cmd.arg("template")
        .arg(&release.name)
        .arg(dir)
        .arg("--namespace")
        .arg(&release.namespace)
        .arg("--values")
        .arg(values_file.path())
        .arg("--include-crds");
    if let Some(version) = &capabilities.kube_version {
        cmd.arg("--kube-version").arg(version);
    }
    for api_version in &capabilities.api_versions {
        cmd.arg("--api-versions").arg(api_version);
    }
    cmd.args(extra_args);

    debug!(release = %release.name, dir = %dir.display(), "rendering with helm");
    execute_command(&mut cmd)
        .await
        .map_err(|e| Error::render(kind, format!("{:#}", e)))
}

#[async_trait]
impl Renderer for HelmRenderer {
    async fn render(&self, release: &Release, dir: &Path, values: &Values) -> Result<Rendered> {
        let meta = ChartMetadata::load(dir)
            .await?
            .ok_or_else(|| Error::render(BundleKind::Helm, format!("no Chart.yaml in {}", dir.display())))?;
        let manifests = helm_template(
            &self.helm_bin,
            BundleKind::Helm,
            release,
            dir,
            values,
            &self.capabilities,
            &[],
        )
        .await?;
        Ok(Rendered {
            manifests,
            version: meta.version,
            app_version: meta.app_version,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in `helm` that echoes its arguments as a ConfigMap.
    fn fake_helm(dir: &Path) -> String {
        let path = dir.join("helm");
        std::fs::write(
            &path,
            "#!/bin/sh\nprintf 'apiVersion: v1\\nkind: ConfigMap\\nmetadata:\\n  name: %s\\ndata:\\n  args: \"%s\"\\n' \"$2\" \"$*\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn renders_with_chart_metadata() {
        let bin = tempfile::tempdir().unwrap();
        let chart = tempfile::tempdir().unwrap();
        std::fs::write(
            chart.path().join("Chart.yaml"),
            "apiVersion: v2\nname: demo\nversion: 1.2.3\nappVersion: \"4.5\"\n",
        )
        .unwrap();

        let capabilities = Capabilities {
            kube_version: Some("v1.28.0".into()),
            ..Default::default()
        };
        let renderer = HelmRenderer::new(fake_helm(bin.path()), capabilities);
        let rendered = renderer
            .render(&Release::new("demo", "web"), chart.path(), &Values::new())
            .await
            .unwrap();
        assert_eq!(rendered.version.as_deref(), Some("1.2.3"));
        assert_eq!(rendered.app_version.as_deref(), Some("4.5"));
        assert!(rendered.manifests.contains("name: demo"));
        assert!(rendered.manifests.contains("--namespace web"));
        assert!(rendered.manifests.contains("--include-crds"));
        assert!(rendered.manifests.contains("--kube-version v1.28.0"));
    }

    #[tokio::test]
    async fn served_api_versions_are_passed_to_helm() {
        let bin = tempfile::tempdir().unwrap();
        let chart = tempfile::tempdir().unwrap();
        std::fs::write(chart.path().join("Chart.yaml"), "apiVersion: v2\nname: demo\nversion: 0.1.0\n").unwrap();

        let capabilities = Capabilities {
            kube_version: Some("v1.28.0".into()),
            api_versions: vec!["monitoring.coreos.com/v1".into(), "monitoring.coreos.com/v1/ServiceMonitor".into()],
        };
        let renderer = HelmRenderer::new(fake_helm(bin.path()), capabilities);
        let rendered = renderer
            .render(&Release::new("demo", "web"), chart.path(), &Values::new())
            .await
            .unwrap();
        assert!(rendered
            .manifests
            .contains("--api-versions monitoring.coreos.com/v1 --api-versions monitoring.coreos.com/v1/ServiceMonitor"));
    }

    #[tokio::test]
    async fn offline_render_passes_no_capabilities() {
        let bin = tempfile::tempdir().unwrap();
        let chart = tempfile::tempdir().unwrap();
        std::fs::write(chart.path().join("Chart.yaml"), "apiVersion: v2\nname: demo\nversion: 0.1.0\n").unwrap();

        let renderer = HelmRenderer::new(fake_helm(bin.path()), Capabilities::default());
        let rendered = renderer
            .render(&Release::new("demo", "web"), chart.path(), &Values::new())
            .await
            .unwrap();
        assert!(!rendered.manifests.contains("--kube-version"));
        assert!(!rendered.manifests.contains("--api-versions"));
    }

    #[tokio::test]
    async fn missing_chart_yaml_is_a_render_error() {
        let chart = tempfile::tempdir().unwrap();
        let renderer = HelmRenderer::new("helm", Capabilities::default());
        let err = renderer
            .render(&Release::new("demo", "web"), chart.path(), &Values::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Render { .. }));
    }
}
