/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/fetch/git.rs
*
* Shallow git checkouts with `git2`. Only the requested revision is fetched
* (depth 1); a revision is tried as a tag, then as a branch, then as a raw
* refspec or commit id. Blocking: run on the blocking pool.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::error::{Error, Result};
use git2::{build::CheckoutBuilder, FetchOptions, Repository};
use std::path::Path;
use tracing::debug;

fn refspecs(revision: Option<&str>) -> Vec<String> {
    match revision.filter(|r| !r.is_empty()) {
        None => vec!["HEAD".to_string()],
        Some(rev) => vec![
            format!("+refs/tags/{0}:refs/tags/{0}", rev),
            format!("+refs/heads/{0}:refs/remotes/origin/{0}", rev),
            rev.to_string(),
        ],
    }
}

/// True for `file://` URLs and plain paths, which git reaches without a
/// network transport.
pub fn is_local(url: &str) -> bool {
    url.starts_with("file://") || !(url.contains("://") || url.starts_with("git@"))
}

/// Checks `revision` (default branch when `None`) of `url` out into `dest`,
/// which must be an empty directory.
pub fn checkout(url: &str, revision: Option<&str>, dest: &Path) -> Result<()> {
    let repo = Repository::init(dest)?;
    let mut remote = repo.remote_anonymous(url)?;

    let mut last_error: Option<git2::Error> = None;
    for refspec in refspecs(revision) {
        let mut options = FetchOptions::new();
        // The local transport cannot serve shallow fetches.
        if !is_local(url) {
            options.depth(1);
        }
        if let Err(e) = remote.fetch(&[refspec.as_str()], Some(&mut options), None) {
            debug!(url, refspec = %refspec, error = %e, "fetch attempt failed");
            last_error = Some(e);
            continue;
        }
        let commit = match repo
            .find_reference("FETCH_HEAD")
            .and_then(|r| r.peel_to_commit())
        {
            Ok(commit) => commit,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
        repo.set_head_detached(commit.id())?;
        debug!(url, commit = %commit.id(), "checked out");
        return Ok(());
    }

    Err(match last_error {
        Some(e) => Error::fetch(url, e),
        None => Error::fetch(url, "revision not found"),
    })
}
