/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/main.rs
*
* Entry point of the plugin operator.
*
* Start-up order:
* 1. Parse flags and install the JSON `tracing` subscriber.
* 2. Connect to the cluster and read its version and served API versions,
*    which the helm based renderers pass on as `--kube-version` and
*    `--api-versions`.
* 3. Build the pipeline once (fetcher, renderer registry, sync options,
*    installer, reconciler) and share it through the controller context.
* 4. Start the repository index cache in the background when repositories
*    are configured.
* 5. Run the controller until SIGINT/SIGTERM.
*
* SPDX-License-Identifier: Apache-2.0 */

use clap::Parser;
use kube::{Client, CustomResourceExt};
use kubegems_installer::cluster::{Cluster, KubeCluster};
use kubegems_installer::config::{ControllerConfig, OperatorArgs};
use kubegems_installer::controller::{self, Context, Reconciler};
use kubegems_installer::crds::Plugin;
use kubegems_installer::fetch::Fetcher;
use kubegems_installer::installer::{Bundler, Installer};
use kubegems_installer::render::{Capabilities, RendererRegistry};
use kubegems_installer::repository::RepositoryCache;
use kubegems_installer::sync::SyncOptions;
use kubegems_installer::telemetry::{self, LogFormat};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = OperatorArgs::parse();
    if args.print_crd {
        print!("{}", serde_yaml::to_string(&Plugin::crd())?);
        return Ok(());
    }
    telemetry::init(LogFormat::Json)?;

    let client = Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(client.clone(), args.field_manager.clone()));
    let capabilities = match (cluster.server_version().await, cluster.api_versions().await) {
        (Ok(kube_version), Ok(api_versions)) => Capabilities {
            kube_version,
            api_versions,
        },
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "cluster capabilities unknown, rendering with helm defaults");
            Capabilities::default()
        }
    };
    info!(
        kube_version = ?capabilities.kube_version,
        api_versions = capabilities.api_versions.len(),
        cache = %args.sources.cache_dir().display(),
        "starting plugin operator"
    );

    let bundler = Arc::new(Bundler::new(
        Fetcher::from_args(&args.sources),
        RendererRegistry::builtin(&args.sources, capabilities),
    ));
    let options = SyncOptions {
        field_manager: args.field_manager.clone(),
        clean_crd: args.clean_crd,
        ..Default::default()
    };
    let installer = Installer::new(bundler, cluster.clone(), options);
    let config = ControllerConfig::from(&args);
    let concurrency = config.concurrency;
    let ctx = Arc::new(Context {
        client,
        reconciler: Reconciler::new(cluster, installer, config),
    });

    let repositories = (!args.repositories.is_empty()).then(|| {
        let cache = Arc::new(RepositoryCache::new(args.repositories.clone()));
        tokio::spawn(cache.run(Duration::from_secs(args.repository_sync_interval)))
    });

    controller::run(ctx, concurrency).await;

    if let Some(task) = repositories {
        task.abort();
    }
    info!("plugin operator stopped");
    Ok(())
}
