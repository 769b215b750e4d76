//! Public keyrings published next to the images.
//!
//! Role keyrings go to `gpg/<role>.tar.zst`, signed by the parent role (the
//! archive master vouches for itself). A device keyring lives in its device
//! directory as `device.tar.zst`, signed by image-signing, and is attached
//! to the device entry of `channels.json`.

use std::path::{Path, PathBuf};

use sysimg_schema::Sha256Digest;
use tracing::{debug, info};

use super::{GPG_DIR, Tree, TreeError};
use crate::io::remove_if_exists;
use crate::keys::{KeyError, KeyRole, KeyringMeta, signature_path};
use crate::tarball::write_keyring_tarball;

/// File name of a published device keyring.
pub const DEVICE_KEYRING: &str = "device.tar.zst";

impl Tree {
    /// Publish the public keyring of `role` under `gpg/`.
    ///
    /// # Errors
    ///
    /// Returns an error if `role` (or its signer) has no valid key or the
    /// archive cannot be written.
    pub fn publish_keyring(&self, role: KeyRole) -> Result<PathBuf, TreeError> {
        let key = self
            .keys
            .key(role)
            .ok_or_else(|| KeyError::MissingKey(role.to_string()))?;
        let dest = self.root.join(GPG_DIR).join(format!("{role}.tar.zst"));
        self.write_keyring(&key.meta, role.parent().unwrap_or(role), &dest)?;
        info!("published {role} keyring");
        Ok(dest)
    }

    /// Publish the device-signing keyring of `channel/device` and attach it
    /// to the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device or its key is missing, or the archive
    /// cannot be written and signed.
    pub fn publish_device_keyring(&self, channel: &str, device: &str) -> Result<PathBuf, TreeError> {
        let handle = self.get_device(channel, device)?;
        let key = self.keys.device_key(device).ok_or_else(|| {
            KeyError::MissingKey(format!("{} ({device})", KeyRole::DeviceSigning))
        })?;
        let dest = handle.dir().join(DEVICE_KEYRING);
        self.write_keyring(&key.meta, KeyRole::ImageSigning, &dest)?;
        self.set_device_keyring(channel, device, &dest)?;
        info!("published device keyring of {channel}/{device}");
        Ok(dest)
    }

    /// Write `meta` to `dest` and sign it with `signer`, unless an identical
    /// signed archive is already there.
    fn write_keyring(&self, meta: &KeyringMeta, signer: KeyRole, dest: &Path) -> Result<(), TreeError> {
        let dir = dest.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".keyring-")
            .tempfile_in(dir)?;
        write_keyring_tarball(meta, staging.path())?;

        let sig = signature_path(dest);
        if dest.exists()
            && sig.exists()
            && Sha256Digest::of_file(dest)? == Sha256Digest::of_file(staging.path())?
        {
            debug!("{} is up to date", dest.display());
            return Ok(());
        }
        staging.persist(dest).map_err(|err| err.error)?;
        remove_if_exists(&sig)?;
        self.keys.sign_file_as(signer, dest)?;
        Ok(())
    }
}
