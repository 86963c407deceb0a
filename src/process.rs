/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/process.rs
*
* Runs external tools (helm, kustomize) and captures their output. Children
* are killed when the reconcile future is dropped, so a shutdown does not
* leave renders running.
*
* SPDX-License-Identifier: Apache-2.0 */

use anyhow::{anyhow, Context, Result};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Executes `command` and returns its stdout. A non-zero exit becomes an error
/// carrying the tool's stderr.
pub async fn execute_command(command: &mut Command) -> Result<String> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let args: Vec<String> = command
        .as_std()
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    debug!(program = %program, args = ?args, "running command");

    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to start '{}'", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "'{}' exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        ));
    }
    String::from_utf8(output.stdout).with_context(|| format!("'{}' produced non UTF-8 output", program))
}
