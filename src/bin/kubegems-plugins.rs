/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/bin/kubegems-plugins.rs
*
* Entry point of the `kubegems-plugins` CLI. Rendered manifests go to stdout,
* logs to stderr.
*
* SPDX-License-Identifier: Apache-2.0 */

use clap::Parser;
use kubegems_installer::cli::{self, Cli};
use kubegems_installer::telemetry::{self, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(LogFormat::Text)?;
    let args = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    cli::run(args, &mut stdout).await
}
