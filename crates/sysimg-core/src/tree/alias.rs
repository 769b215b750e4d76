//! Channel aliases and redirects.
//!
//! An alias channel republishes its target's images under its own name,
//! with version tarballs regenerated to carry `channel_target`. A redirect
//! (whole channel or single device) only forwards clients to the target's
//! index.

use sysimg_schema::{ChannelEntry, DeviceEntry, ImageEntry, Sha256Digest};
use tracing::{info, warn};

use super::{Tree, TreeError};
use crate::io::remove_if_exists;
use crate::keys::signature_path;
use crate::tarball::{VersionTarball, is_version_tarball};

impl Tree {
    /// Create `name` as an alias of `target` and populate it.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` exists or `target` does not.
    pub fn create_channel_alias(&self, name: &str, target: &str) -> Result<(), TreeError> {
        self.update_channels(|channels| {
            if channels.contains(name) {
                return Err(TreeError::ChannelExists(name.to_string()));
            }
            if !channels.contains(target) {
                return Err(TreeError::MissingChannel(target.to_string()));
            }
            channels.insert(
                name,
                ChannelEntry {
                    alias: Some(target.to_string()),
                    ..ChannelEntry::default()
                },
            );
            Ok(())
        })?;
        info!("created alias {name} -> {target}");
        self.sync_alias(name)
    }

    /// Point alias channel `name` at `target` and repopulate it from
    /// scratch.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::NotAnAlias`] if `name` is not an alias, and
    /// [`TreeError::MissingChannel`] if either channel is missing.
    pub fn change_channel_alias(&self, name: &str, target: &str) -> Result<(), TreeError> {
        let channels = self.list_channels()?;
        let entry = channels
            .get(name)
            .ok_or_else(|| TreeError::MissingChannel(name.to_string()))?;
        if entry.redirect.is_some() || entry.alias.as_deref().is_none_or(|alias| alias == name) {
            return Err(TreeError::NotAnAlias(name.to_string()));
        }
        if !channels.contains(target) {
            return Err(TreeError::MissingChannel(target.to_string()));
        }
        self.remove_channel(name)?;
        self.create_channel_alias(name, target)
    }

    /// Create `name` forwarding every device to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` exists or `target` does not.
    pub fn create_channel_redirect(&self, name: &str, target: &str) -> Result<(), TreeError> {
        self.update_channels(|channels| {
            if channels.contains(name) {
                return Err(TreeError::ChannelExists(name.to_string()));
            }
            let devices = channels
                .get(target)
                .ok_or_else(|| TreeError::MissingChannel(target.to_string()))?
                .devices
                .clone();
            channels.insert(
                name,
                ChannelEntry {
                    devices,
                    redirect: Some(target.to_string()),
                    ..ChannelEntry::default()
                },
            );
            Ok(())
        })?;
        info!("created redirect {name} -> {target}");
        Ok(())
    }

    /// Make `channel/device` forward to `target_channel/device`.
    ///
    /// # Errors
    ///
    /// Returns an error if `channel` is missing, already has `device`, or the
    /// target device does not exist.
    pub fn create_per_device_redirect(
        &self,
        device: &str,
        channel: &str,
        target_channel: &str,
    ) -> Result<(), TreeError> {
        self.update_channels(|channels| {
            let resolved = channels
                .resolve(target_channel, device)
                .ok_or_else(|| TreeError::MissingDevice {
                    channel: target_channel.to_string(),
                    device: device.to_string(),
                })?;
            let entry = channels
                .get_mut(channel)
                .ok_or_else(|| TreeError::MissingChannel(channel.to_string()))?;
            if entry.devices.contains_key(device) {
                return Err(TreeError::DeviceExists {
                    channel: channel.to_string(),
                    device: device.to_string(),
                });
            }
            entry.devices.insert(
                device.to_string(),
                DeviceEntry {
                    index: resolved.index,
                    redirect: Some(target_channel.to_string()),
                    device: Some(device.to_string()),
                    keyring: None,
                },
            );
            Ok(())
        })?;
        info!("redirected {channel}/{device} -> {target_channel}/{device}");
        Ok(())
    }

    /// Bring alias channels of `channel` up to date and re-point every
    /// redirect that targets it.
    ///
    /// # Errors
    ///
    /// Returns the first alias or redirect failure.
    pub fn sync_aliases(&self, channel: &str) -> Result<(), TreeError> {
        let channels = self.list_channels()?;
        let aliases: Vec<String> = channels
            .iter()
            .filter(|(_, entry)| entry.alias.as_deref() == Some(channel))
            .map(|(name, _)| name.to_string())
            .collect();
        for alias in &aliases {
            self.sync_alias(alias)?;
        }
        self.sync_redirects(channel)?;
        for alias in &aliases {
            self.sync_redirects(alias)?;
        }
        Ok(())
    }

    /// Make alias channel `name` mirror its target's devices and images.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::NotAnAlias`] if `name` has no alias target.
    pub fn sync_alias(&self, name: &str) -> Result<(), TreeError> {
        let channels = self.list_channels()?;
        let entry = channels
            .get(name)
            .ok_or_else(|| TreeError::MissingChannel(name.to_string()))?;
        let target = entry
            .alias
            .clone()
            .ok_or_else(|| TreeError::NotAnAlias(name.to_string()))?;
        if !channels.contains(&target) {
            return Err(TreeError::MissingChannel(target));
        }
        let wanted: Vec<String> = channels
            .generation_targets(&target)
            .into_iter()
            .map(ToString::to_string)
            .collect();

        let stale: Vec<String> = entry
            .devices
            .keys()
            .filter(|d| !wanted.contains(d))
            .cloned()
            .collect();
        for device in stale {
            self.remove_device(name, &device)?;
        }

        for device in &wanted {
            let dst = if entry.devices.contains_key(device) {
                self.device_handle(name, device)
            } else {
                self.create_device(name, device, None)?
            };
            let src_index = self.device_handle(&target, device).index()?;
            dst.update_index(|index| {
                let mut images = Vec::with_capacity(src_index.images.len());
                for img in &src_index.images {
                    let mut copied = match index.get(&img.key()) {
                        Some(existing) => existing.clone(),
                        None => self.alias_image(name, &target, device, img)?,
                    };
                    copied.phased_percentage = img.phased_percentage;
                    images.push(copied);
                }
                index.images = images;
                Ok(())
            })?;
        }
        info!("synced alias {name} with {target}");
        Ok(())
    }

    /// Re-point redirects to `target` at its current indexes; drop those
    /// whose target device is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if `channels.json` cannot be read or committed.
    pub fn sync_redirects(&self, target: &str) -> Result<(), TreeError> {
        self.update_channels(|channels| {
            let snapshot = channels.clone();
            for (name, entry) in channels.iter_mut() {
                if entry.redirect.as_deref() == Some(target) {
                    match snapshot.get(target) {
                        Some(t) => entry.devices = t.devices.clone(),
                        None => warn!("channel {name} redirects to missing channel {target}"),
                    }
                    continue;
                }

                let mut dangling = Vec::new();
                for (dev_name, dev) in &mut entry.devices {
                    if dev.redirect.as_deref() != Some(target) {
                        continue;
                    }
                    let target_device = dev.device.clone().unwrap_or_else(|| dev_name.clone());
                    match snapshot.resolve(target, &target_device) {
                        Some(resolved) => dev.index = resolved.index,
                        None => dangling.push(dev_name.clone()),
                    }
                }
                for dev_name in dangling {
                    warn!("removing dangling redirect {name}/{dev_name} -> {target}");
                    entry.devices.remove(&dev_name);
                }
            }
            Ok(())
        })
    }

    /// Copy of `img` for an alias channel, with its version tarball rebuilt.
    fn alias_image(
        &self,
        alias: &str,
        target: &str,
        device: &str,
        img: &ImageEntry,
    ) -> Result<ImageEntry, TreeError> {
        let mut img = img.clone();
        let dir = self.root.join(alias).join(device);
        std::fs::create_dir_all(&dir)?;
        for file in &mut img.files {
            if !is_version_tarball(&file.path) {
                continue;
            }
            let name = file.path.rsplit('/').next().unwrap_or_default().to_string();
            let dest = dir.join(&name);
            let sig = signature_path(&dest);
            if !dest.exists() {
                remove_if_exists(&sig)?;
                VersionTarball {
                    channel: alias,
                    device,
                    version: img.version,
                    channel_target: Some(target),
                    version_detail: Some(&img.version_detail),
                }
                .write(&self.endpoint, &dest)?;
            }
            if !sig.exists() {
                self.keys.sign_file(Some(device), &dest)?;
            }
            file.path = self.url_path(&dest)?;
            file.signature = self.url_path(&sig)?;
            file.checksum = Sha256Digest::of_file(&dest)?;
            file.size = std::fs::metadata(&dest)?.len();
        }
        Ok(img)
    }
}
