//! The published tree.
//!
//! ```text
//! <publish>/
//!   channels.json(.asc)
//!   <channel>/<device>/index.json(.asc)
//!   <channel>/<device>/version-<N>.tar.zst(.asc)
//!   pool/<artifact>(.asc) + pool/<stem>.json(.asc)
//!   gpg/                       public keyrings, never garbage collected
//! ```
//!
//! All manifest writes go through [`manifest::commit`]; all reads go through
//! [`Tree::list_channels`] and [`Device::index`].

mod alias;
mod device;
mod gc;
mod keyring;
pub(crate) mod manifest;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sysimg_schema::{
    CHANNELS_FILE, ChannelEntry, ChannelsFile, DeviceEntry, ImageEntry, ImageKey, KeyringRef,
    TagError,
};
use thiserror::Error;
use tracing::{info, warn};

pub use device::{Device, NewImage};
pub use gc::{CleanupReport, sidecar_path};
pub use keyring::DEVICE_KEYRING;

use crate::keys::{KeyError, KeyHierarchy, signature_path};
use crate::tarball::ServiceEndpoint;

/// Directory under the publish root that is never garbage collected.
pub const GPG_DIR: &str = "gpg";

/// Shared artifact directory.
pub const POOL_DIR: &str = "pool";

/// Publish tree failures.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A document did not serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A manifest could not be parsed.
    #[error("malformed manifest {path}: {source}")]
    Malformed {
        /// Manifest path.
        path: PathBuf,
        /// Parser error.
        source: serde_json::Error,
    },

    /// Signing or verification failed.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The channel already exists.
    #[error("channel '{0}' already exists")]
    ChannelExists(String),

    /// The channel does not exist.
    #[error("no channel '{0}'")]
    MissingChannel(String),

    /// The device already exists.
    #[error("device '{device}' already exists in channel '{channel}'")]
    DeviceExists {
        /// Channel name.
        channel: String,
        /// Device name.
        device: String,
    },

    /// The device does not exist.
    #[error("no device '{device}' in channel '{channel}'")]
    MissingDevice {
        /// Channel name.
        channel: String,
        /// Device name.
        device: String,
    },

    /// The channel is not an alias.
    #[error("channel '{0}' is not an alias")]
    NotAnAlias(String),

    /// A file to publish does not exist.
    #[error("missing file {0}")]
    MissingFile(PathBuf),

    /// A path lies outside the publish root.
    #[error("{0} is outside the publish root")]
    OutsideRoot(PathBuf),

    /// No image matches.
    #[error("no image {0}")]
    MissingImage(String),

    /// The image is already published.
    #[error("image {0} already exists")]
    DuplicateImage(String),

    /// A delta names a base with no full image.
    #[error("delta base {base} is not a full image on this device")]
    MissingBase {
        /// Version the delta starts from.
        base: u64,
    },

    /// A new image is not newer than the latest one.
    #[error("version {version} is not newer than latest full image {latest}")]
    VersionNotIncreasing {
        /// Version being published.
        version: u64,
        /// Latest version already in the index.
        latest: u64,
    },

    /// The image is malformed.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Phasing percentages range from 0 to 100.
    #[error("invalid phased percentage {0}")]
    InvalidPercentage(u8),

    /// Only the latest image can be changed this way.
    #[error("version {0} is not the latest image")]
    NotLatest(u64),

    /// The tag cannot be stored.
    #[error(transparent)]
    InvalidTag(#[from] TagError),

    /// A rename target already exists on disk.
    #[error("{0} already exists")]
    PathExists(PathBuf),
}

/// What [`Tree::expire_images`] dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpireReport {
    /// Images dropped from the index.
    pub removed: Vec<ImageKey>,
    /// Files deleted with them.
    pub deleted_files: Vec<PathBuf>,
}

/// The authoritative channel → device → image repository.
#[derive(Debug, Clone)]
pub struct Tree {
    root: PathBuf,
    keys: Arc<KeyHierarchy>,
    endpoint: ServiceEndpoint,
}

impl Tree {
    /// Open (and if needed initialize) the tree at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or the initial
    /// `channels.json` cannot be signed.
    pub fn open(
        root: &Path,
        keys: Arc<KeyHierarchy>,
        endpoint: ServiceEndpoint,
    ) -> Result<Self, TreeError> {
        std::fs::create_dir_all(root)?;
        let tree = Self {
            root: root.to_path_buf(),
            keys,
            endpoint,
        };
        if !tree.channels_path().exists() {
            manifest::commit(&tree.channels_path(), &ChannelsFile::new(), &tree.keys, None)?;
        }
        Ok(tree)
    }

    /// Publish root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys signing every manifest.
    pub fn keys(&self) -> &Arc<KeyHierarchy> {
        &self.keys
    }

    /// Public endpoint baked into version tarballs.
    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// Path of `channels.json`.
    pub fn channels_path(&self) -> PathBuf {
        self.root.join(CHANNELS_FILE)
    }

    /// Shared file pool.
    pub fn pool_dir(&self) -> PathBuf {
        self.root.join(POOL_DIR)
    }

    /// Absolute path of a `/`-rooted URL path.
    pub fn abs_path(&self, url: &str) -> PathBuf {
        self.root.join(url.trim_start_matches('/'))
    }

    /// `/`-rooted URL path of a file under the root.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::OutsideRoot`] for paths outside the tree.
    pub fn url_path(&self, path: &Path) -> Result<String, TreeError> {
        url_path(&self.root, path)
    }

    /// Current channel/device topology.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Malformed`] if `channels.json` is not valid.
    pub fn list_channels(&self) -> Result<ChannelsFile, TreeError> {
        manifest::load(&self.channels_path())
    }

    /// Device handle, following redirects to the device owning the index.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::MissingChannel`] / [`TreeError::MissingDevice`].
    pub fn get_device(&self, channel: &str, device: &str) -> Result<Device, TreeError> {
        let channels = self.list_channels()?;
        if !channels.contains(channel) {
            return Err(TreeError::MissingChannel(channel.to_string()));
        }
        let resolved = channels
            .resolve(channel, device)
            .ok_or_else(|| TreeError::MissingDevice {
                channel: channel.to_string(),
                device: device.to_string(),
            })?;
        Ok(self.device_handle(&resolved.channel, &resolved.device))
    }

    fn device_handle(&self, channel: &str, device: &str) -> Device {
        Device {
            root: self.root.clone(),
            channel: channel.to_string(),
            name: device.to_string(),
            keys: Arc::clone(&self.keys),
        }
    }

    /// # Errors
    ///
    /// Returns [`TreeError::ChannelExists`] if the name is taken.
    pub fn create_channel(&self, name: &str) -> Result<(), TreeError> {
        self.update_channels(|channels| {
            if channels.contains(name) {
                return Err(TreeError::ChannelExists(name.to_string()));
            }
            channels.insert(name, ChannelEntry::default());
            Ok(())
        })?;
        info!("created channel {name}");
        Ok(())
    }

    /// Delete a channel entry and its directory. Pool files are left to
    /// [`Tree::cleanup_tree`].
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::MissingChannel`] if there is no such channel.
    pub fn remove_channel(&self, name: &str) -> Result<(), TreeError> {
        self.update_channels(|channels| {
            channels
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| TreeError::MissingChannel(name.to_string()))
        })?;
        let dir = self.root.join(name);
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
        }
        info!("removed channel {name}");
        Ok(())
    }

    /// Rename a channel, moving its directory and rewriting the paths in its
    /// device indexes. Redirects and aliases pointing at it follow along.
    ///
    /// # Errors
    ///
    /// Returns an error if `old` is missing, or `new` already exists as a
    /// channel or a directory.
    pub fn rename_channel(&self, old: &str, new: &str) -> Result<(), TreeError> {
        self.update_channels(|channels| {
            let mut entry = channels
                .remove(old)
                .ok_or_else(|| TreeError::MissingChannel(old.to_string()))?;
            if channels.contains(new) {
                return Err(TreeError::ChannelExists(new.to_string()));
            }

            if entry.redirect.is_none() {
                let (old_dir, new_dir) = (self.root.join(old), self.root.join(new));
                if new_dir.exists() {
                    return Err(TreeError::PathExists(new_dir));
                }
                if old_dir.is_dir() {
                    std::fs::rename(&old_dir, &new_dir)?;
                }
                let (old_prefix, new_prefix) = (format!("/{old}/"), format!("/{new}/"));
                let rebase = |url: &mut String| {
                    if let Some(rest) = url.strip_prefix(&old_prefix) {
                        *url = format!("{new_prefix}{rest}");
                    }
                };
                for (name, dev) in &mut entry.devices {
                    if dev.is_redirect() {
                        continue;
                    }
                    let handle = self.device_handle(new, name);
                    dev.index = Some(self.url_path(&handle.index_path())?);
                    if let Some(keyring) = &mut dev.keyring {
                        rebase(&mut keyring.path);
                        rebase(&mut keyring.signature);
                    }
                    handle.update_index(|index| {
                        for file in index.images.iter_mut().flat_map(|img| img.files.iter_mut()) {
                            rebase(&mut file.path);
                            rebase(&mut file.signature);
                        }
                        Ok(())
                    })?;
                }
            }

            for (_, other) in channels.iter_mut() {
                if other.alias.as_deref() == Some(old) {
                    other.alias = Some(new.to_string());
                }
                if other.redirect.as_deref() == Some(old) {
                    other.redirect = Some(new.to_string());
                    other.devices = entry.devices.clone();
                    continue;
                }
                for (dev_name, dev) in &mut other.devices {
                    if dev.redirect.as_deref() == Some(old) {
                        let target = dev.device.clone().unwrap_or_else(|| dev_name.clone());
                        dev.redirect = Some(new.to_string());
                        dev.index = entry.devices.get(&target).and_then(|t| t.index.clone());
                    }
                }
            }
            channels.insert(new, entry);
            Ok(())
        })?;
        info!("renamed channel {old} to {new}");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`TreeError::MissingChannel`] if there is no such channel.
    pub fn hide_channel(&self, name: &str) -> Result<(), TreeError> {
        self.set_hidden(name, true)
    }

    /// # Errors
    ///
    /// Returns [`TreeError::MissingChannel`] if there is no such channel.
    pub fn show_channel(&self, name: &str) -> Result<(), TreeError> {
        self.set_hidden(name, false)
    }

    fn set_hidden(&self, name: &str, hidden: bool) -> Result<(), TreeError> {
        self.update_channels(|channels| {
            let entry = channels
                .get_mut(name)
                .ok_or_else(|| TreeError::MissingChannel(name.to_string()))?;
            entry.hidden = hidden;
            Ok(())
        })
    }

    /// Create a device with an empty signed index.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is missing, the device exists, or the
    /// keyring (when given) or its signature is missing.
    pub fn create_device(
        &self,
        channel: &str,
        device: &str,
        keyring: Option<&Path>,
    ) -> Result<Device, TreeError> {
        let keyring = keyring.map(|p| self.keyring_ref(p)).transpose()?;
        let handle = self.device_handle(channel, device);
        let index_url = self.url_path(&handle.index_path())?;
        self.update_channels(|channels| {
            let entry = channels
                .get_mut(channel)
                .ok_or_else(|| TreeError::MissingChannel(channel.to_string()))?;
            if entry.devices.contains_key(device) {
                return Err(TreeError::DeviceExists {
                    channel: channel.to_string(),
                    device: device.to_string(),
                });
            }
            let mut dev = DeviceEntry::with_index(index_url);
            dev.keyring = keyring;
            entry.devices.insert(device.to_string(), dev);
            Ok(())
        })?;
        // Force the empty index into existence.
        handle.update_index(|_| Ok(()))?;
        info!("created device {channel}/{device}");
        Ok(handle)
    }

    /// # Errors
    ///
    /// Returns [`TreeError::MissingDevice`] if there is no such device.
    pub fn remove_device(&self, channel: &str, device: &str) -> Result<(), TreeError> {
        let removed = self.update_channels(|channels| {
            let entry = channels
                .get_mut(channel)
                .ok_or_else(|| TreeError::MissingChannel(channel.to_string()))?;
            entry
                .devices
                .remove(device)
                .ok_or_else(|| TreeError::MissingDevice {
                    channel: channel.to_string(),
                    device: device.to_string(),
                })
        })?;
        if !removed.is_redirect() {
            let dir = self.root.join(channel).join(device);
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        info!("removed device {channel}/{device}");
        Ok(())
    }

    /// Attach (or replace) a device keyring. The file and its signature
    /// must already be in the tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the device or keyring files are missing.
    pub fn set_device_keyring(
        &self,
        channel: &str,
        device: &str,
        keyring: &Path,
    ) -> Result<(), TreeError> {
        let keyring = self.keyring_ref(keyring)?;
        self.update_channels(|channels| {
            let dev = channels
                .get_mut(channel)
                .and_then(|c| c.devices.get_mut(device))
                .ok_or_else(|| TreeError::MissingDevice {
                    channel: channel.to_string(),
                    device: device.to_string(),
                })?;
            dev.keyring = Some(keyring);
            Ok(())
        })
    }

    fn keyring_ref(&self, path: &Path) -> Result<KeyringRef, TreeError> {
        let sig = signature_path(path);
        for p in [path, sig.as_path()] {
            if !p.is_file() {
                return Err(TreeError::MissingFile(p.to_path_buf()));
            }
        }
        Ok(KeyringRef {
            path: self.url_path(path)?,
            signature: self.url_path(&sig)?,
        })
    }

    /// Expire old images of one device and delete files nothing else in
    /// the tree still references.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is missing or a manifest is malformed.
    pub fn expire_images(
        &self,
        channel: &str,
        device: &str,
        fullcount: usize,
    ) -> Result<ExpireReport, TreeError> {
        let handle = self.get_device(channel, device)?;
        let removed: Vec<ImageEntry> = handle.expire_images(fullcount)?;
        if removed.is_empty() {
            return Ok(ExpireReport::default());
        }

        let live = self.live_paths()?;
        let mut deleted_files = Vec::new();
        for url in removed.iter().flat_map(ImageEntry::referenced_paths) {
            let path = normalize(&self.abs_path(url));
            if live.contains(&path) || deleted_files.contains(&path) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => deleted_files.push(path),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("failed to delete {}: {err}", path.display()),
            }
        }
        let removed: Vec<ImageKey> = removed.iter().map(ImageEntry::key).collect();
        info!(
            "expired {} images on {channel}/{device}, deleted {} files",
            removed.len(),
            deleted_files.len()
        );
        Ok(ExpireReport {
            removed,
            deleted_files,
        })
    }

    /// Load `channels.json`, mutate, commit if changed.
    pub(crate) fn update_channels<T>(
        &self,
        f: impl FnOnce(&mut ChannelsFile) -> Result<T, TreeError>,
    ) -> Result<T, TreeError> {
        let path = self.channels_path();
        let before = self.list_channels()?;
        let mut channels = before.clone();
        let out = f(&mut channels)?;
        if channels != before || !path.exists() {
            manifest::commit(&path, &channels, &self.keys, None)?;
        }
        Ok(out)
    }
}

/// `/`-rooted URL path of `path` relative to `root`.
pub(crate) fn url_path(root: &Path, path: &Path) -> Result<String, TreeError> {
    let rel = normalize(path)
        .strip_prefix(normalize(root))
        .map_err(|_| TreeError::OutsideRoot(path.to_path_buf()))?
        .to_path_buf();
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(format!("/{}", parts.join("/")))
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests;
