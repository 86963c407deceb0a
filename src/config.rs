/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/config.rs
*
* Configuration for the operator and the CLI. Both binaries are configured
* from flags with environment variable fallbacks, parsed by `clap`. The
* pieces shared by both (where sources are cached, where the helm and
* kustomize binaries live) are grouped in `SourceArgs`.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::error::{Error, Result};
use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_FIELD_MANAGER: &str = "kubegems-installer";

/// Where plugin sources come from and which external renderers are used.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Directory downloaded plugin sources are cached in.
    #[arg(short = 'c', long, env = "KUBEGEMS_PLUGINS_CACHE")]
    pub cache_dir: Option<PathBuf>,

    /// Directories searched for pre-populated plugin sources, in order.
    #[arg(short = 's', long = "search-dir", env = "KUBEGEMS_PLUGINS_DIR", value_delimiter = ',')]
    pub search_dirs: Vec<PathBuf>,

    /// The helm binary used by the helm and template renderers.
    #[arg(long, env = "HELM_BIN", default_value = "helm")]
    pub helm_bin: String,

    /// The kustomize binary used by the kustomize renderer.
    #[arg(long, env = "KUSTOMIZE_BIN", default_value = "kustomize")]
    pub kustomize_bin: String,
}

impl SourceArgs {
    /// The configured cache directory, or `~/.cache/kubegems/plugins`.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("kubegems")
                .join("plugins")
        })
    }
}

/// A chart repository catalogued by the repository cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySource {
    pub name: String,
    pub address: String,
    pub priority: i32,
}

impl std::str::FromStr for RepositorySource {
    type Err = Error;

    /// Parses `name=url` or `name=url@priority`.
    fn from_str(s: &str) -> Result<Self> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| Error::Other(anyhow::anyhow!("repository {:?} must be name=url[@priority]", s)))?;
        let (address, priority) = match rest.rsplit_once('@') {
            Some((address, p)) if !p.contains('/') => {
                let priority = p
                    .parse()
                    .map_err(|_| Error::Other(anyhow::anyhow!("invalid priority in repository {:?}", s)))?;
                (address, priority)
            }
            _ => (rest, 0),
        };
        if name.is_empty() || address.is_empty() {
            return Err(Error::Other(anyhow::anyhow!("repository {:?} must be name=url[@priority]", s)));
        }
        Ok(RepositorySource {
            name: name.to_string(),
            address: address.trim_end_matches('/').to_string(),
            priority,
        })
    }
}

/// The plugin operator: reconciles `Plugin` resources into the cluster.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct OperatorArgs {
    #[command(flatten)]
    pub sources: SourceArgs,

    /// Maximum number of plugins reconciled concurrently.
    #[arg(long, env = "KUBEGEMS_CONCURRENCY", default_value_t = 5)]
    pub concurrency: u16,

    /// Field manager used for server-side apply.
    #[arg(long, default_value = DEFAULT_FIELD_MANAGER)]
    pub field_manager: String,

    /// Delete CRDs that disappear from a plugin's render.
    #[arg(long, default_value_t = false)]
    pub clean_crd: bool,

    /// Seconds before re-checking a plugin whose dependencies are not installed.
    #[arg(long, default_value_t = 30)]
    pub dependency_requeue: u64,

    /// Seconds before retrying a failed reconcile.
    #[arg(long, default_value_t = 15)]
    pub error_requeue: u64,

    /// Seconds between two reconciles of an installed plugin, which repair
    /// live objects edited or deleted out of band.
    #[arg(long, default_value_t = 600)]
    pub resync_interval: u64,

    /// Chart repositories to catalogue, as `name=url[@priority]`.
    #[arg(long = "repository", env = "KUBEGEMS_REPOSITORIES", value_delimiter = ',')]
    pub repositories: Vec<RepositorySource>,

    /// Seconds between two catalogue refreshes.
    #[arg(long, default_value_t = 600)]
    pub repository_sync_interval: u64,

    /// Print the Plugin CRD as YAML and exit.
    #[arg(long, default_value_t = false)]
    pub print_crd: bool,
}

/// Settings of the reconciler, decoupled from the flag parser.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub concurrency: u16,
    pub dependency_requeue: Duration,
    pub error_requeue: Duration,
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            dependency_requeue: Duration::from_secs(30),
            error_requeue: Duration::from_secs(15),
            resync_interval: Duration::from_secs(600),
        }
    }
}

impl From<&OperatorArgs> for ControllerConfig {
    fn from(args: &OperatorArgs) -> Self {
        Self {
            concurrency: args.concurrency,
            dependency_requeue: Duration::from_secs(args.dependency_requeue),
            error_requeue: Duration::from_secs(args.error_requeue),
            resync_interval: Duration::from_secs(args.resync_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_source_parsing() {
        let plain: RepositorySource = "kubegems=https://charts.kubegems.io/kubegems/".parse().unwrap();
        assert_eq!(plain.address, "https://charts.kubegems.io/kubegems");
        assert_eq!(plain.priority, 0);

        let prioritized: RepositorySource = "local=http://127.0.0.1:8080@10".parse().unwrap();
        assert_eq!(prioritized.address, "http://127.0.0.1:8080");
        assert_eq!(prioritized.priority, 10);

        assert!("no-address".parse::<RepositorySource>().is_err());
        assert!("x=http://a@high".parse::<RepositorySource>().is_err());
    }

    #[test]
    fn operator_defaults() {
        let args = OperatorArgs::parse_from(["kubegems-installer", "-s", "/plugins,/extra"]);
        assert_eq!(args.concurrency, 5);
        assert_eq!(args.field_manager, DEFAULT_FIELD_MANAGER);
        assert_eq!(args.sources.search_dirs, vec![PathBuf::from("/plugins"), PathBuf::from("/extra")]);
        let config = ControllerConfig::from(&args);
        assert_eq!(config.dependency_requeue, Duration::from_secs(30));
    }

    #[test]
    fn explicit_cache_dir_wins() {
        let args = OperatorArgs::parse_from(["kubegems-installer", "-c", "/var/cache/plugins"]);
        assert_eq!(args.sources.cache_dir(), PathBuf::from("/var/cache/plugins"));
    }
}
