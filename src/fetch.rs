/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/fetch.rs
*
* The source fetcher: resolves a plugin's `{name, version, path, url}` to a
* local directory holding its bundle.
*
* Resolution order:
* 1. every search directory, then the cache directory: a non-empty
*    `{name}-{version}` or `{name}` directory, or a `.tgz`/`.tar.gz` of the
*    same name which is unpacked into the cache;
* 2. the per-repository cache `{cache}/{host}/{name}-{version}`;
* 3. the URL itself, dispatched on its shape: `.git` (checkout, shallow over
*    the network), local path or `file://` (used in place), `.zip`,
*    `.tar.gz`/`.tgz` (downloaded and unpacked), anything else over HTTP is
*    a chart repository;
* 4. otherwise the source is not found.
*
* Downloads and packed sources are unpacked into a staging directory next
* to their final location and renamed into place, so neither a concurrent
* reader nor a later lookup ever sees a half written cache entry. Errors are returned as-is; retrying is the
* reconciler's business.
*
* SPDX-License-Identifier: Apache-2.0 */

pub mod archive;
pub mod chart_repo;
pub mod git;

use crate::config::SourceArgs;
use crate::crds::Plugin;
use crate::error::{Error, Result};
use crate::process::execute_command;
use chart_repo::ChartMetadata;
use kube::ResourceExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub name: String,
    pub version: Option<String>,
    pub path: Option<String>,
    pub url: Option<String>,
}

impl FetchRequest {
    pub fn for_plugin(plugin: &Plugin) -> Self {
        let spec = &plugin.spec;
        FetchRequest {
            name: spec
                .chart
                .clone()
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| plugin.name_any()),
            version: spec.version.clone().filter(|v| !v.is_empty()),
            path: spec.path.clone().filter(|p| !p.is_empty()),
            url: spec.url.clone().filter(|u| !u.is_empty()),
        }
    }

    /// `{name}-{version}`, or `{name}` when unversioned.
    pub fn dir_name(&self) -> String {
        match &self.version {
            Some(version) => format!("{}-{}", self.name, version),
            None => self.name.clone(),
        }
    }

    fn candidates(&self) -> Vec<String> {
        let mut names = vec![self.dir_name()];
        if self.version.is_some() {
            names.push(self.name.clone());
        }
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Local,
    Git,
    Zip,
    TarGz,
    ChartRepository,
}

fn classify(url: &str) -> Result<SourceKind> {
    let lower = url.to_ascii_lowercase();
    let path_part = lower.split(['?', '#']).next().unwrap_or_default();
    if path_part.ends_with(".git") {
        return Ok(SourceKind::Git);
    }
    if git::is_local(&lower) {
        return Ok(SourceKind::Local);
    }
    if path_part.ends_with(".zip") {
        return Ok(SourceKind::Zip);
    }
    if path_part.ends_with(".tar.gz") || path_part.ends_with(".tgz") {
        return Ok(SourceKind::TarGz);
    }
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(SourceKind::ChartRepository);
    }
    Err(Error::UnsupportedSource(url.to_string()))
}

/// Cache sub-directory for a remote: its host, or the last path segment of a
/// `file://` URL.
pub fn repository_cache_name(url: &str) -> String {
    if let Some(path) = url.strip_prefix("file://") {
        return Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string());
    }
    if let Some(rest) = url.strip_prefix("git@") {
        return rest.split(':').next().unwrap_or("git").to_string();
    }
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| {
            url.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
                .collect()
        })
}

async fn is_populated(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

/// Renames a filled staging directory to `target`. Losing the race against a
/// concurrent fetch of the same source is not an error.
async fn promote(staging: &Path, target: &Path, source: &str, name: &str) -> Result<()> {
    if !is_populated(staging).await {
        return Err(Error::fetch(source, format!("nothing found for {}", name)));
    }
    if let Err(e) = tokio::fs::rename(staging, target).await {
        if !is_populated(target).await {
            return Err(e.into());
        }
    }
    Ok(())
}

/// A staging directory next to `target`, removed on drop.
async fn staging_for(target: &Path) -> Result<tempfile::TempDir> {
    let parent = target.parent().ok_or(Error::MissingField("cache directory"))?;
    tokio::fs::create_dir_all(parent).await?;
    Ok(tempfile::Builder::new().prefix(".fetch-").tempdir_in(parent)?)
}

/// Runs a blocking closure on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("blocking task failed: {}", e)))?
}

pub struct Fetcher {
    search_dirs: Vec<PathBuf>,
    cache_dir: PathBuf,
    helm_bin: String,
    http: reqwest::Client,
}

impl Fetcher {
    pub fn new(search_dirs: Vec<PathBuf>, cache_dir: PathBuf, helm_bin: impl Into<String>) -> Self {
        Self {
            search_dirs,
            cache_dir,
            helm_bin: helm_bin.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_args(args: &SourceArgs) -> Self {
        Self::new(args.search_dirs.clone(), args.cache_dir(), args.helm_bin.clone())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub async fn fetch(&self, req: &FetchRequest) -> Result<PathBuf> {
        let mut searched = Vec::new();
        for dir in self.search_dirs.iter().chain(std::iter::once(&self.cache_dir)) {
            searched.push(dir.display().to_string());
            if let Some(found) = self.lookup(dir, req).await? {
                debug!(plugin = %req.name, path = %found.display(), "found locally");
                return Ok(found);
            }
        }

        let Some(url) = req.url.as_deref() else {
            return Err(Error::NotFound {
                name: req.name.clone(),
                searched,
            });
        };

        let kind = classify(url)?;
        if kind == SourceKind::Local {
            return self.local(url, req).await;
        }

        let target = self
            .cache_dir
            .join(repository_cache_name(url))
            .join(req.dir_name());
        if is_populated(&target).await {
            debug!(plugin = %req.name, path = %target.display(), "cache hit");
            return Ok(target);
        }

        info!(plugin = %req.name, url, version = ?req.version, "downloading");
        let staging = staging_for(&target).await?;

        match kind {
            SourceKind::Git => self.git(url, req, staging.path()).await?,
            SourceKind::Zip => {
                let bytes = self.download(url).await?;
                let dest = staging.path().to_path_buf();
                let sub = req.path.clone();
                blocking(move || archive::extract_zip(&bytes, &dest, sub.as_deref())).await?;
            }
            SourceKind::TarGz => {
                let bytes = self.download(url).await?;
                let dest = staging.path().to_path_buf();
                let sub = req.path.clone();
                blocking(move || archive::extract_tar_gz(&bytes, &dest, sub.as_deref())).await?;
            }
            SourceKind::ChartRepository => self.chart(url, req, staging.path()).await?,
            SourceKind::Local => return self.local(url, req).await,
        }

        promote(staging.path(), &target, url, &req.dir_name()).await?;
        Ok(target)
    }

    async fn lookup(&self, dir: &Path, req: &FetchRequest) -> Result<Option<PathBuf>> {
        for name in req.candidates() {
            let candidate = dir.join(&name);
            if is_populated(&candidate).await {
                return Ok(Some(candidate));
            }
            for ext in ["tgz", "tar.gz"] {
                let packed = dir.join(format!("{}.{}", name, ext));
                if tokio::fs::metadata(&packed).await.map(|m| m.is_file()).unwrap_or(false) {
                    let target = self.cache_dir.join(&name);
                    if !is_populated(&target).await {
                        let bytes = tokio::fs::read(&packed).await?;
                        let staging = staging_for(&target).await?;
                        let dest = staging.path().to_path_buf();
                        blocking(move || archive::extract_tar_gz(&bytes, &dest, None)).await?;
                        promote(staging.path(), &target, &packed.display().to_string(), &name).await?;
                    }
                    return Ok(Some(target));
                }
            }
        }
        Ok(None)
    }

    async fn local(&self, url: &str, req: &FetchRequest) -> Result<PathBuf> {
        let base = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        let dir = match &req.path {
            Some(sub) => base.join(sub.trim_start_matches('/')),
            None => base,
        };
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            _ => Err(Error::fetch(url, format!("{} is not a directory", dir.display()))),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn git(&self, url: &str, req: &FetchRequest, dest: &Path) -> Result<()> {
        let checkout = tempfile::tempdir()?;
        let work = checkout.path().to_path_buf();
        let url_owned = url.to_string();
        let revision = req.version.clone();
        blocking(move || git::checkout(&url_owned, revision.as_deref(), &work)).await?;

        let src = match &req.path {
            Some(sub) => checkout.path().join(sub.trim_start_matches('/')),
            None => checkout.path().to_path_buf(),
        };
        if !src.is_dir() {
            return Err(Error::fetch(url, format!("path {:?} not found in repository", req.path)));
        }
        let dest = dest.to_path_buf();
        blocking(move || archive::copy_dir(&src, &dest)).await?;
        Ok(())
    }

    async fn chart(&self, repository: &str, req: &FetchRequest, dest: &Path) -> Result<()> {
        let index = chart_repo::download_index(&self.http, repository).await?;
        let chart = index
            .find(&req.name, req.version.as_deref())
            .ok_or_else(|| {
                Error::fetch(
                    repository,
                    format!("chart {} version {:?} not in index", req.name, req.version),
                )
            })?;
        let chart_url = chart
            .urls
            .first()
            .ok_or_else(|| Error::fetch(repository, format!("chart {} has no download url", req.name)))?;
        let bytes = self.download(&chart_repo::resolve_url(repository, chart_url)).await?;
        let target = dest.to_path_buf();
        blocking(move || archive::extract_tar_gz(&bytes, &target, None)).await?;
        self.build_dependencies(dest).await
    }

    /// Downloads dependency charts declared in `Chart.yaml` but not vendored
    /// under `charts/`.
    async fn build_dependencies(&self, dir: &Path) -> Result<()> {
        let Some(meta) = ChartMetadata::load(dir).await? else {
            return Ok(());
        };
        if meta.dependencies.is_empty() || is_populated(&dir.join("charts")).await {
            return Ok(());
        }
        let mut cmd = Command::new(&self.helm_bin);
        cmd.arg("dependency").arg("build").arg(dir);
        execute_command(&mut cmd)
            .await
            .map_err(|e| Error::fetch(meta.name, e))?;
        Ok(())
    }
}
