//! Metadata sidecars and artifact families.
//!
//! Every artifact a generator drops into the pool gets a `<stem>.json`
//! sidecar recording who made it and which logical artifact ("family") it
//! is a version of. Delta generation pairs base and new files by family.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{GeneratorContext, GeneratorError};
use crate::keys::signature_path;
use crate::tree::sidecar_path;

/// Families that are never diffed: the new file itself goes into deltas.
const UNDIFFED_FAMILIES: [&str; 3] = ["version", "keyring", "boot"];

/// Sidecar describing how an artifact was produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Generator that produced the artifact.
    pub generator: String,
    /// File family, used to match delta bases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    /// Upstream version the artifact was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Base file of a delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Target file of a delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ArtifactMetadata {
    /// Metadata for an artifact of `generator`.
    pub fn new(generator: &str) -> Self {
        Self {
            generator: generator.to_string(),
            ..Self::default()
        }
    }

    /// Set the family.
    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    /// Set the upstream version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Read the sidecar of `artifact`, if it has a parsable one.
    pub fn load(artifact: &Path) -> Option<Self> {
        let bytes = std::fs::read(sidecar_path(artifact)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Write and sign the sidecar of `artifact` unless one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the sidecar cannot be written or signed.
    pub fn write_for(
        &self,
        ctx: &GeneratorContext,
        device: &str,
        artifact: &Path,
    ) -> Result<PathBuf, GeneratorError> {
        let path = sidecar_path(artifact);
        if !path.exists() {
            std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        }
        ensure_signed(ctx, device, &path)?;
        Ok(path)
    }
}

/// Sign `path` unless a signature already sits next to it.
///
/// # Errors
///
/// Returns the signing error.
pub fn ensure_signed(
    ctx: &GeneratorContext,
    device: &str,
    path: &Path,
) -> Result<PathBuf, GeneratorError> {
    let sig = signature_path(path);
    if !sig.exists() {
        ctx.tree.keys().sign_file(Some(device), path)?;
    }
    Ok(sig)
}

/// `ubuntu-20240101.tar.xz` → `ubuntu`; names without a `-` are their own prefix.
pub fn filename_prefix(name: &str) -> &str {
    name.rsplit_once('-').map_or(name, |(prefix, _)| prefix)
}

/// Family of an artifact: the sidecar's `family` if recorded, otherwise the
/// filename prefix.
pub fn family_of(path: &Path) -> String {
    if let Some(family) = ArtifactMetadata::load(path).and_then(|m| m.family) {
        return family;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    filename_prefix(&name).to_string()
}

/// Whether `base` and `new` are versions of the same artifact.
///
/// When both carry a recorded family those are compared; if either lacks
/// one the filename prefixes decide.
pub fn same_family(base: &Path, new: &Path) -> bool {
    let recorded = |p: &Path| ArtifactMetadata::load(p).and_then(|m| m.family);
    match (recorded(base), recorded(new)) {
        (Some(a), Some(b)) => a == b,
        _ => {
            let name = |p: &Path| {
                p.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            };
            filename_prefix(&name(base)) == filename_prefix(&name(new))
        }
    }
}

/// Version, keyring and boot artifacts are shipped whole in deltas.
pub fn is_undiffed(path: &Path) -> bool {
    let family = family_of(path);
    UNDIFFED_FAMILIES.contains(&family.as_str())
}
