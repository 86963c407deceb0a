/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/telemetry.rs
*
* Installs the global `tracing` subscriber. The level comes from RUST_LOG
* (default `info`). The operator logs JSON lines, the CLI human readable text
* on stderr so rendered manifests on stdout stay clean.
*
* SPDX-License-Identifier: Apache-2.0 */

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init()?,
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}
