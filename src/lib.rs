/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/lib.rs
*
* The plugin installer library. A `Plugin` flows through the pipeline
* fetch -> resolve -> render -> sync, driven by the controller:
*
* - `fetch`: materializes a plugin's source into a local directory.
* - `resolve`: builds the final values from inline values and references.
* - `render`: one renderer per bundle kind (helm, kustomize, template, native).
* - `sync`: converges the cluster to the rendered objects and tracks the
*   managed set.
* - `installer`: the pipeline for one plugin; `controller`: the reconcile loop.
* - `repository`: the catalogue of plugins published in chart repositories.
*
* SPDX-License-Identifier: Apache-2.0 */

pub mod cli;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crds;
pub mod error;
pub mod fetch;
pub mod installer;
pub mod process;
pub mod render;
pub mod repository;
pub mod resolve;
pub mod sync;
pub mod telemetry;
pub mod values;

pub use error::{Error, Result};
