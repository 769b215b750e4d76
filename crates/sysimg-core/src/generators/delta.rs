//! Default delta counterpart: zstd "patch-from" compression.
//!
//! The base file is the dictionary for compressing the new file, so the
//! output only carries what changed. Deltas land in the pool as
//! `<new>.delta-<base>.zst` and are reused when already present. A delta is
//! only published after it has been decoded against its base and found to
//! reproduce the new file byte for byte.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zstd::dict::{DecoderDictionary, EncoderDictionary};

use super::artifact::{ArtifactMetadata, ensure_signed, is_undiffed};
use super::{GeneratorContext, GeneratorError};

const DELTA_LEVEL: i32 = 19;

/// Compress `target` with `base` as the dictionary.
fn encode_patch(base: &[u8], target: &[u8]) -> io::Result<Vec<u8>> {
    let dict = EncoderDictionary::copy(base, DELTA_LEVEL);
    let mut encoder = zstd::stream::Encoder::with_prepared_dictionary(Vec::new(), &dict)?;
    encoder.write_all(target)?;
    encoder.finish()
}

/// Rebuild the target of `patch` from `base`.
fn decode_patch(base: &[u8], patch: &[u8]) -> io::Result<Vec<u8>> {
    let dict = DecoderDictionary::copy(base);
    let mut decoder = zstd::stream::Decoder::with_prepared_dictionary(patch, &dict)?;
    let mut target = Vec::new();
    io::copy(&mut decoder, &mut target)?;
    Ok(target)
}

/// Whether `patch` turns `base` into exactly `target`.
fn reproduces(base: &[u8], patch: &[u8], target: &[u8]) -> bool {
    decode_patch(base, patch).is_ok_and(|rebuilt| rebuilt == target)
}

/// What [`build_delta`] did on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Built {
    Identical,
    Reused,
    Written,
}

/// Make sure `out` holds a verified delta from `base` to `new`.
fn build_delta(base: &Path, new: &Path, out: &Path) -> io::Result<Built> {
    let base_data = std::fs::read(base)?;
    let new_data = std::fs::read(new)?;
    if base_data == new_data {
        return Ok(Built::Identical);
    }

    if out.exists() {
        if reproduces(&base_data, &std::fs::read(out)?, &new_data) {
            return Ok(Built::Reused);
        }
        warn!("{} does not rebuild its target, regenerating", out.display());
    }

    let patch = encode_patch(&base_data, &new_data)?;
    if !reproduces(&base_data, &patch, &new_data) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("delta {} does not rebuild {}", out.display(), new.display()),
        ));
    }
    let dir = out.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&patch)?;
    tmp.persist(out).map_err(|err| err.error)?;
    Ok(Built::Written)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Delta of `new` against `base` for `device`.
///
/// Returns `new` itself for artifacts that are never diffed, and `None`
/// when both files have identical content.
///
/// # Errors
///
/// Returns an error if either file cannot be read, the delta does not
/// rebuild `new`, or it cannot be written or signed.
pub async fn zstd_delta(
    ctx: &GeneratorContext,
    base: &Path,
    new: &Path,
    device: &str,
) -> Result<Option<PathBuf>, GeneratorError> {
    if is_undiffed(new) {
        return Ok(Some(new.to_path_buf()));
    }
    let (base_name, new_name) = (file_name(base), file_name(new));
    let out = ctx
        .tree
        .pool_dir()
        .join(format!("{new_name}.delta-{base_name}.zst"));

    let (base_path, new_path, out_path) = (base.to_path_buf(), new.to_path_buf(), out.clone());
    let built = tokio::task::spawn_blocking(move || build_delta(&base_path, &new_path, &out_path))
        .await
        .map_err(|err| GeneratorError::Failed(format!("delta task failed: {err}")))??;

    match built {
        Built::Identical => {
            debug!("{new_name} is identical to {base_name}, no delta needed");
            return Ok(None);
        }
        // The old signature covered other bytes.
        Built::Written => crate::io::remove_if_exists(&crate::keys::signature_path(&out))?,
        Built::Reused => {}
    }

    ensure_signed(ctx, device, &out)?;
    let mut meta = ArtifactMetadata::new("delta");
    meta.source = Some(base_name);
    meta.target = Some(new_name);
    meta.write_for(ctx, device, &out)?;
    Ok(Some(out))
}
