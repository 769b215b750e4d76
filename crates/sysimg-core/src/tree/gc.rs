//! Mark-and-sweep over the publish root.
//!
//! The live set is every path reachable from `channels.json`: the manifests
//! and their signatures, device keyrings, each image's files and
//! signatures, and the `.json` metadata sidecar of each file. Anything else
//! on disk (outside `gpg/`) is an orphan.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use sysimg_schema::DeviceIndex;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{GPG_DIR, Tree, TreeError, manifest, normalize};
use crate::keys::signature_path;

/// What a cleanup sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Pool and device files nothing references.
    pub removed_files: Vec<PathBuf>,
    /// Emptied directories.
    pub removed_dirs: Vec<PathBuf>,
}

/// `<stem>.json` metadata sidecar of an artifact.
///
/// `pool/ubuntu-1.tar.xz` → `pool/ubuntu-1.json`; `boot.img` → `boot.json`.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match name.rfind(".tar") {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name.rsplit_once('.').map_or(name.as_str(), |(stem, _)| stem),
    };
    path.with_file_name(format!("{stem}.json"))
}

impl Tree {
    /// Every path the current manifests keep alive.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Malformed`] if any manifest cannot be parsed;
    /// collecting garbage against a partial live set would delete live files.
    pub fn live_paths(&self) -> Result<BTreeSet<PathBuf>, TreeError> {
        let mut live = BTreeSet::new();
        let channels_path = normalize(&self.channels_path());
        live.insert(signature_path(&channels_path));
        live.insert(channels_path);

        let channels = self.list_channels()?;
        for url in channels.referenced_paths() {
            let path = normalize(&self.abs_path(url));
            if path.extension().is_some_and(|ext| ext == "json") {
                live.insert(signature_path(&path));
                let index: DeviceIndex = manifest::load(&path)?;
                for img in &index.images {
                    for file_url in img.referenced_paths() {
                        let file = normalize(&self.abs_path(file_url));
                        let sidecar = sidecar_path(&file);
                        live.insert(signature_path(&sidecar));
                        live.insert(sidecar);
                        live.insert(file);
                    }
                }
            }
            live.insert(path);
        }
        Ok(live)
    }

    /// Files on disk that no manifest references.
    ///
    /// # Errors
    ///
    /// See [`Tree::live_paths`].
    pub fn list_orphaned_files(&self) -> Result<Vec<PathBuf>, TreeError> {
        let live = self.live_paths()?;
        let gpg = self.root.join(GPG_DIR);
        let orphans = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.path() != gpg)
            .filter_map(Result::ok)
            .filter(|e| !e.file_type().is_dir())
            .map(|e| normalize(e.path()))
            .filter(|p| !live.contains(p))
            .collect();
        Ok(orphans)
    }

    /// Referenced files that are not on disk.
    ///
    /// # Errors
    ///
    /// See [`Tree::live_paths`].
    pub fn list_missing_files(&self) -> Result<Vec<PathBuf>, TreeError> {
        Ok(self
            .live_paths()?
            .into_iter()
            .filter(|p| !p.exists() && !is_optional(p))
            .collect())
    }

    /// Delete orphaned files, then directories left empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the live set cannot be computed or a deletion
    /// fails.
    pub fn cleanup_tree(&self) -> Result<CleanupReport, TreeError> {
        let mut report = CleanupReport::default();
        for path in self.list_orphaned_files()? {
            debug!("removing orphan {}", path.display());
            std::fs::remove_file(&path)?;
            report.removed_files.push(path);
        }

        let gpg = self.root.join(GPG_DIR);
        let dirs: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_entry(|e| e.path() != gpg)
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.path().to_path_buf())
            .collect();
        for dir in dirs {
            let empty = std::fs::read_dir(&dir)?.next().is_none();
            if empty {
                std::fs::remove_dir(&dir)?;
                report.removed_dirs.push(dir);
            }
        }

        if !report.removed_files.is_empty() {
            info!(
                "cleanup removed {} files and {} directories",
                report.removed_files.len(),
                report.removed_dirs.len()
            );
        }
        Ok(report)
    }
}

/// Metadata sidecars are kept when present but not required.
fn is_optional(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let manifest = name.starts_with("index.json") || name.starts_with("channels.json");
    !manifest && (name.ends_with(".json") || name.ends_with(".json.asc"))
}
