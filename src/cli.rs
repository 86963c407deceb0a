/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/cli.rs
*
* The `kubegems-plugins` command line: render plugins to stdout, pre-fetch
* their sources into the cache, and browse chart repository catalogues.
* Nothing here talks to a cluster.
*
* Inputs are paths or `-` for stdin. A directory is a plugin on its own,
* named after the directory with its kind detected from its content; a file
* (or stdin) holds one or more `Plugin` manifests.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::config::{RepositorySource, SourceArgs};
use crate::crds::Plugin;
use crate::fetch::Fetcher;
use crate::installer::Bundler;
use crate::render::manifest::{join_manifests, split_manifests};
use crate::render::{detect_kind, Capabilities, RendererRegistry};
use crate::repository::RepositoryCache;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use kube::ResourceExt;
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "kubegems-plugins", author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub sources: SourceArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render plugins to stdout as YAML documents.
    Template {
        /// Plugin directories, manifest files, or `-` for stdin.
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Extra values, `a.b=c` (repeatable).
        #[arg(long = "set")]
        set: Vec<String>,
        /// Namespace for plugins that do not name one.
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
    },
    /// Fetch plugin sources into the cache directory.
    Download {
        #[arg(required = true)]
        inputs: Vec<String>,
    },
    /// Browse chart repository catalogues.
    Repo {
        /// Repositories as `name=url[@priority]`.
        #[arg(long = "repository", env = "KUBEGEMS_REPOSITORIES", value_delimiter = ',', required = true)]
        repositories: Vec<RepositorySource>,
        #[command(subcommand)]
        command: RepoCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// List every catalogued plugin version.
    List,
    /// Print a Plugin manifest installing a catalogued plugin.
    Show {
        name: String,
        #[arg(long)]
        version: Option<String>,
        #[arg(short = 'n', long, default_value = "kubegems-installer")]
        namespace: String,
    },
}

fn plugin_from_dir(dir: &Path, namespace: &str) -> Result<Plugin> {
    let abs = std::fs::canonicalize(dir).with_context(|| format!("resolving {}", dir.display()))?;
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no directory name", abs.display()))?;
    let mut plugin: Plugin = serde_json::from_value(serde_json::json!({
        "apiVersion": "plugins.kubegems.io/v1beta1",
        "kind": "Plugin",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {"kind": detect_kind(&abs), "url": format!("file://{}", abs.display())},
    }))?;
    if plugin.spec.install_namespace.is_none() {
        plugin.spec.install_namespace = Some(namespace.to_string());
    }
    Ok(plugin)
}

fn plugins_from_yaml(text: &str, namespace: &str) -> Result<Vec<Plugin>> {
    let mut plugins = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_json::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let mut plugin: Plugin = serde_json::from_value(value)?;
        if plugin.namespace().is_none() {
            plugin.metadata.namespace = Some(namespace.to_string());
        }
        plugins.push(plugin);
    }
    Ok(plugins)
}

/// Turns CLI inputs into plugins.
pub fn load_plugins(inputs: &[String], namespace: &str, stdin: &mut dyn Read) -> Result<Vec<Plugin>> {
    let mut plugins = Vec::new();
    for input in inputs {
        if input == "-" {
            let mut text = String::new();
            stdin.read_to_string(&mut text)?;
            plugins.extend(plugins_from_yaml(&text, namespace)?);
            continue;
        }
        let path = PathBuf::from(input);
        if path.is_dir() {
            plugins.push(plugin_from_dir(&path, namespace)?);
        } else {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", input))?;
            plugins.extend(plugins_from_yaml(&text, namespace)?);
        }
    }
    Ok(plugins)
}

fn bundler(sources: &SourceArgs) -> Bundler {
    Bundler::new(Fetcher::from_args(sources), RendererRegistry::builtin(sources, Capabilities::default()))
}

pub async fn run(cli: Cli, out: &mut dyn Write) -> Result<()> {
    match cli.command {
        Command::Template { inputs, set, namespace } => {
            let plugins = load_plugins(&inputs, &namespace, &mut std::io::stdin())?;
            let bundler = bundler(&cli.sources);
            for plugin in plugins {
                let mut values = plugin.spec.values.clone();
                for assignment in &set {
                    values.set_str(assignment)?;
                }
                let rendered = bundler
                    .template(&plugin, &values)
                    .await
                    .with_context(|| format!("rendering {}", plugin.name_any()))?;
                let objects = split_manifests(&rendered.manifests)?;
                out.write_all(join_manifests(&objects)?.as_bytes())?;
            }
        }
        Command::Download { inputs } => {
            let plugins = load_plugins(&inputs, "default", &mut std::io::stdin())?;
            let bundler = bundler(&cli.sources);
            for plugin in plugins {
                let path = bundler
                    .download(&plugin)
                    .await
                    .with_context(|| format!("downloading {}", plugin.name_any()))?;
                writeln!(out, "{}\t{}", plugin.name_any(), path.display())?;
            }
        }
        Command::Repo { repositories, command } => {
            let cache = RepositoryCache::new(repositories);
            cache.refresh().await?;
            match command {
                RepoCommand::List => {
                    for repository in cache.list().await {
                        for (name, versions) in &repository.plugins {
                            for v in versions {
                                writeln!(
                                    out,
                                    "{}\t{}\t{}\t{}",
                                    repository.name,
                                    name,
                                    v.version,
                                    v.category.as_deref().unwrap_or("-")
                                )?;
                            }
                        }
                    }
                }
                RepoCommand::Show { name, version, namespace } => {
                    let versions = cache.versions(&name).await;
                    let found = match &version {
                        Some(wanted) => versions.iter().find(|v| &v.version == wanted),
                        None => versions.first(),
                    }
                    .ok_or_else(|| anyhow!("plugin {} {} not found", name, version.as_deref().unwrap_or("")))?;
                    out.write_all(serde_yaml::to_string(&found.to_plugin(&namespace))?.as_bytes())?;
                }
            }
        }
    }
    Ok(())
}
