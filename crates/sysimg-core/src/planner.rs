//! Version allocation and delta-base selection.

use sysimg_schema::ImageEntry;
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::tree::{Device, Tree, TreeError};

/// What the next import of one device should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlan {
    /// Version the next image gets.
    pub next_version: u64,
    /// Latest full image on the device, used to classify files as new.
    pub last_full: Option<ImageEntry>,
    /// Full images on this device that deltas should be generated from.
    pub delta_bases: Vec<ImageEntry>,
}

/// Plans the next image of a device.
#[derive(Debug, Clone, Copy)]
pub struct VersionPlanner<'a> {
    tree: &'a Tree,
}

impl<'a> VersionPlanner<'a> {
    /// Planner over `tree`.
    pub fn new(tree: &'a Tree) -> Self {
        Self { tree }
    }

    /// Plan the next image of `device` in `channel`.
    ///
    /// A `deltabase` channel contributes a base only if its latest full
    /// version is also published as a full image on this device. Missing
    /// channels and devices are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error only if this device's own index cannot be read.
    pub fn plan(&self, channel: &ChannelConfig, device: &Device) -> Result<ImagePlan, TreeError> {
        let index = device.index()?;
        let last_full = index.latest_full().cloned();
        let next_version = last_full
            .as_ref()
            .map_or(channel.versionbase, |img| img.version + 1);

        let mut delta_bases: Vec<ImageEntry> = Vec::new();
        for base_channel in &channel.deltabase {
            let base_device = match self.tree.get_device(base_channel, device.name()) {
                Ok(d) => d,
                Err(err) => {
                    warn!(
                        "skipping delta base {base_channel}/{}: {err}",
                        device.name()
                    );
                    continue;
                }
            };
            let base_latest = match base_device.index() {
                Ok(base_index) => base_index.latest_full().map(|img| img.version),
                Err(err) => {
                    warn!("skipping delta base {base_channel}: {err}");
                    continue;
                }
            };
            let Some(version) = base_latest else {
                debug!("{base_channel}/{} has no full image yet", device.name());
                continue;
            };
            if delta_bases.iter().any(|b| b.version == version) {
                continue;
            }
            match index.full_images().find(|img| img.version == version) {
                Some(img) => delta_bases.push(img.clone()),
                None => debug!(
                    "{base_channel} version {version} is not published on {}/{}",
                    device.channel(),
                    device.name()
                ),
            }
        }

        Ok(ImagePlan {
            next_version,
            last_full,
            delta_bases,
        })
    }
}
