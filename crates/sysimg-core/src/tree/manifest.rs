//! Signed JSON manifests.
//!
//! A commit writes `<file>.new`, signs it, then renames the signature and
//! the file into place. Readers see either the old or the new manifest,
//! never a half-written one.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::TreeError;
use crate::io::remove_if_exists;
use crate::keys::{KeyHierarchy, signature_path};

/// Load `path`, or `T::default()` if it does not exist yet.
pub(crate) fn load<T: DeserializeOwned + Default>(path: &Path) -> Result<T, TreeError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| TreeError::Malformed {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

/// Atomically replace `path` with `value`, signed for `device`.
pub(crate) fn commit<T: Serialize>(
    path: &Path,
    value: &T,
    keys: &KeyHierarchy,
    device: Option<&str>,
) -> Result<(), TreeError> {
    let tmp = staging_path(path);
    let tmp_sig = signature_path(&tmp);
    remove_if_exists(&tmp)?;
    remove_if_exists(&tmp_sig)?;

    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    std::fs::write(&tmp, &json)?;

    if let Err(err) = keys.sign_file_to(device, &tmp, &tmp_sig) {
        remove_if_exists(&tmp)?;
        return Err(err.into());
    }
    std::fs::rename(&tmp_sig, signature_path(path))?;
    std::fs::rename(&tmp, path)?;
    debug!("committed {}", path.display());
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".new");
    PathBuf::from(os)
}
