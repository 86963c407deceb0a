/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/fetch/archive.rs
*
* Archive extraction and directory copies used to materialize sources into
* the cache. All functions here are blocking; callers run them on the
* blocking pool.
*
* When every entry of an archive sits under one top-level directory (the
* usual layout of chart packages and forge snapshots) that directory is
* stripped. A sub-path then selects the part of the archive to keep.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Keeps only plain path components; anything absolute or climbing out of the
/// destination is rejected.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// The shared top-level directory of `paths`, if there is exactly one and at
/// least one entry lives below it.
fn common_root(paths: &[PathBuf]) -> Option<OsString> {
    let roots: HashSet<&std::ffi::OsStr> = paths
        .iter()
        .filter_map(|p| p.components().next())
        .map(|c| c.as_os_str())
        .collect();
    let nested = paths.iter().any(|p| p.components().count() > 1);
    if roots.len() == 1 && nested {
        roots.into_iter().next().map(OsString::from)
    } else {
        None
    }
}

/// Maps an archive path to its destination-relative path.
fn relocate(path: &Path, root: Option<&OsString>, sub_path: Option<&Path>) -> Option<PathBuf> {
    let mut rel = path;
    if let Some(root) = root {
        rel = rel.strip_prefix(root).ok()?;
    }
    if let Some(sub) = sub_path {
        rel = rel.strip_prefix(sub).ok()?;
    }
    if rel.as_os_str().is_empty() {
        None
    } else {
        Some(rel.to_path_buf())
    }
}

fn clean_sub_path(sub_path: Option<&str>) -> Option<PathBuf> {
    sub_path
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .and_then(|s| sanitize(Path::new(s)))
}

/// Extracts a gzip compressed tarball held in memory into `dest`.
pub fn extract_tar_gz(bytes: &[u8], dest: &Path, sub_path: Option<&str>) -> Result<usize> {
    let mut paths = Vec::new();
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
    for entry in archive.entries()? {
        let entry = entry?;
        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            continue;
        }
        if let Some(path) = sanitize(&entry.path()?) {
            paths.push(path);
        }
    }
    let root = common_root(&paths);
    let sub = clean_sub_path(sub_path);

    let mut written = 0;
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        let Some(path) = sanitize(&entry.path()?) else {
            continue;
        };
        let Some(rel) = relocate(&path, root.as_ref(), sub.as_deref()) else {
            continue;
        };
        let target = dest.join(rel);
        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else if kind.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
            written += 1;
        }
    }
    Ok(written)
}

/// Extracts a zip archive held in memory into `dest`.
pub fn extract_zip(bytes: &[u8], dest: &Path, sub_path: Option<&str>) -> Result<usize> {
    let zip_err = |e: zip::result::ZipError| Error::fetch("zip", e);
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(zip_err)?;

    let mut paths = Vec::new();
    for i in 0..archive.len() {
        let file = archive.by_index(i).map_err(zip_err)?;
        if let Some(path) = file.enclosed_name() {
            paths.push(path);
        }
    }
    let root = common_root(&paths);
    let sub = clean_sub_path(sub_path);

    let mut written = 0;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(zip_err)?;
        let Some(path) = file.enclosed_name() else {
            continue;
        };
        let Some(rel) = relocate(&path, root.as_ref(), sub.as_deref()) else {
            continue;
        };
        let target = dest.join(rel);
        if file.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        io::copy(&mut file, &mut out)?;
        written += 1;
    }
    Ok(written)
}

/// Recursively copies `src` into `dest`, skipping VCS metadata.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    let walker = WalkDir::new(src)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| Error::IoError(io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::IoError(io::Error::other(e)))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (path, content) in files {
            writer
                .start_file(*path, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn chart_package_root_is_stripped() {
        let bytes = tar_gz(&[
            ("nginx/Chart.yaml", "name: nginx\nversion: 1.0.0\n"),
            ("nginx/templates/deploy.yaml", "kind: Deployment\n"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(extract_tar_gz(&bytes, dir.path(), None).unwrap(), 2);
        assert!(dir.path().join("Chart.yaml").is_file());
        assert!(dir.path().join("templates/deploy.yaml").is_file());
    }

    #[test]
    fn sub_path_selects_part_of_the_archive() {
        let bytes = tar_gz(&[
            ("repo-main/README.md", "docs"),
            ("repo-main/deploy/plugins/nginx/a.yaml", "kind: Service\n"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        extract_tar_gz(&bytes, dir.path(), Some("deploy/plugins/nginx/")).unwrap();
        assert!(dir.path().join("a.yaml").is_file());
        assert!(!dir.path().join("README.md").exists());
    }

    #[test]
    fn flat_archives_are_kept_as_is() {
        let bytes = zip_bytes(&[("a.yaml", "a"), ("b/c.yaml", "c")]);
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(extract_zip(&bytes, dir.path(), None).unwrap(), 2);
        assert!(dir.path().join("a.yaml").is_file());
        assert!(dir.path().join("b/c.yaml").is_file());
    }

    #[test]
    fn zip_root_is_stripped() {
        let bytes = zip_bytes(&[("bundle/kustomization.yaml", "resources: []\n")]);
        let dir = tempfile::tempdir().unwrap();
        extract_zip(&bytes, dir.path(), None).unwrap();
        assert!(dir.path().join("kustomization.yaml").is_file());
    }

    #[test]
    fn traversal_is_rejected() {
        assert_eq!(sanitize(Path::new("../etc/passwd")), None);
        assert_eq!(sanitize(Path::new("/etc/passwd")), None);
        assert_eq!(sanitize(Path::new("./a/b")), Some(PathBuf::from("a/b")));
    }

    #[test]
    fn copy_dir_skips_git_metadata() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join(".git")).unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(src.path().join("templates")).unwrap();
        fs::write(src.path().join("templates/a.yaml"), "a").unwrap();
        let dest = tempfile::tempdir().unwrap();
        assert_eq!(copy_dir(src.path(), dest.path()).unwrap(), 1);
        assert!(dest.path().join("templates/a.yaml").is_file());
        assert!(!dest.path().join(".git").exists());
    }
}
