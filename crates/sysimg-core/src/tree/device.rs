//! One device's image list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use sysimg_schema::{
    DeviceIndex, FileEntry, ImageEntry, ImageKey, ImageType, Sha256Digest, VersionDetail,
};
use tracing::info;

use super::{TreeError, manifest, url_path};
use crate::keys::{KeyHierarchy, signature_path};

/// An image about to be published.
#[derive(Debug, Clone)]
pub struct NewImage {
    /// Full or delta.
    pub kind: ImageType,
    /// Image version.
    pub version: u64,
    /// Base version of a delta.
    pub base: Option<u64>,
    /// Free-form description.
    pub description: String,
    /// Component tags.
    pub version_detail: VersionDetail,
    /// Absolute paths inside the publish root; each needs a `.asc` next to it.
    pub files: Vec<PathBuf>,
    /// Oldest version that may upgrade to this image.
    pub minversion: Option<u64>,
    /// Whether clients must reboot into it.
    pub bootme: bool,
}

impl NewImage {
    /// Full image of `files`.
    pub fn full(version: u64, files: Vec<PathBuf>) -> Self {
        Self {
            kind: ImageType::Full,
            version,
            base: None,
            description: String::new(),
            version_detail: VersionDetail::new(),
            files,
            minversion: None,
            bootme: false,
        }
    }

    /// Delta from `base` to `version`.
    pub fn delta(base: u64, version: u64, files: Vec<PathBuf>) -> Self {
        Self {
            kind: ImageType::Delta,
            base: Some(base),
            ..Self::full(version, files)
        }
    }

    /// Replace the component tags.
    pub fn with_version_detail(mut self, detail: VersionDetail) -> Self {
        self.version_detail = detail;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Identity within the device index.
    pub fn key(&self) -> ImageKey {
        ImageKey {
            kind: self.kind,
            version: self.version,
            base: self.base,
        }
    }
}

/// Handle on `<publish>/<channel>/<device>/index.json`.
#[derive(Debug, Clone)]
pub struct Device {
    pub(super) root: PathBuf,
    pub(super) channel: String,
    pub(super) name: String,
    pub(super) keys: Arc<KeyHierarchy>,
}

impl Device {
    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the index.
    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.channel).join(&self.name)
    }

    /// Path of `index.json`.
    pub fn index_path(&self) -> PathBuf {
        self.dir().join(sysimg_schema::INDEX_FILE)
    }

    /// # Errors
    ///
    /// Returns [`TreeError::Malformed`] if the index is not valid JSON.
    pub fn index(&self) -> Result<DeviceIndex, TreeError> {
        manifest::load(&self.index_path())
    }

    /// # Errors
    ///
    /// See [`Device::index`].
    pub fn list_images(&self) -> Result<Vec<ImageEntry>, TreeError> {
        Ok(self.index()?.images)
    }

    /// # Errors
    ///
    /// See [`Device::index`].
    pub fn get_image(&self, key: &ImageKey) -> Result<Option<ImageEntry>, TreeError> {
        Ok(self.index()?.get(key).cloned())
    }

    /// Append an image to the index.
    ///
    /// Every file (and its signature) must already exist under the publish
    /// root; the index is only rewritten once all of them have been hashed.
    ///
    /// # Errors
    ///
    /// Rejects images without files, duplicates, non-increasing full
    /// versions and deltas whose base is not a full image on this device.
    pub fn create_image(&self, image: &NewImage) -> Result<ImageEntry, TreeError> {
        let mut entries = self.create_images(std::slice::from_ref(image))?;
        entries
            .pop()
            .ok_or_else(|| TreeError::InvalidImage(image.key().to_string()))
    }

    /// Append several images in a single index commit. Either all of them
    /// are published or none is.
    ///
    /// # Errors
    ///
    /// Same as [`Device::create_image`], for any of the images.
    pub fn create_images(&self, images: &[NewImage]) -> Result<Vec<ImageEntry>, TreeError> {
        if let Some(empty) = images.iter().find(|img| img.files.is_empty()) {
            return Err(TreeError::InvalidImage(format!(
                "{} has no files",
                empty.key()
            )));
        }

        let entries = self.update_index(|index| {
            let mut entries = Vec::with_capacity(images.len());
            for image in images {
                validate_new(index, image)?;
                let entry = ImageEntry {
                    kind: image.kind,
                    version: image.version,
                    base: image.base,
                    description: image.description.clone(),
                    version_detail: image.version_detail.clone(),
                    files: self.file_entries(&image.files)?,
                    phased_percentage: None,
                    minversion: image.minversion,
                    bootme: image.bootme,
                };
                index.images.push(entry.clone());
                entries.push(entry);
            }
            Ok(entries)
        })?;
        for entry in &entries {
            info!(
                "published {} on {}/{}",
                entry.key(),
                self.channel,
                self.name
            );
        }
        Ok(entries)
    }

    /// Remove one image from the index. Files stay until garbage collection.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::MissingImage`] if no such image exists.
    pub fn remove_image(&self, key: &ImageKey) -> Result<ImageEntry, TreeError> {
        self.update_index(|index| {
            let pos = index
                .images
                .iter()
                .position(|img| img.key() == *key)
                .ok_or_else(|| TreeError::MissingImage(key.to_string()))?;
            Ok(index.images.remove(pos))
        })
    }

    /// Keep the `fullcount` newest full images and the deltas based on them.
    /// Returns what was dropped from the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or committed.
    pub fn expire_images(&self, fullcount: usize) -> Result<Vec<ImageEntry>, TreeError> {
        self.update_index(|index| {
            let mut full: Vec<u64> = index.full_images().map(|img| img.version).collect();
            full.sort_unstable_by(|a, b| b.cmp(a));
            full.truncate(fullcount);

            let (kept, removed): (Vec<_>, Vec<_>) =
                index.images.drain(..).partition(|img| match img.kind {
                    ImageType::Full => full.contains(&img.version),
                    ImageType::Delta => img.base.is_some_and(|base| full.contains(&base)),
                });
            index.images = kept;
            Ok(removed)
        })
    }

    /// Replace the description of one image.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::MissingImage`] if no such image exists.
    pub fn set_description(&self, key: &ImageKey, description: &str) -> Result<(), TreeError> {
        self.update_index(|index| {
            let img = index
                .images
                .iter_mut()
                .find(|img| img.key() == *key)
                .ok_or_else(|| TreeError::MissingImage(key.to_string()))?;
            img.description = description.to_string();
            Ok(())
        })
    }

    /// Tag `version` in the version detail of its full image and of every
    /// delta leading to it. An empty tag removes the current one.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidTag`] for tags containing separators and
    /// [`TreeError::MissingImage`] if `version` is not published.
    pub fn set_tag(&self, version: u64, tag: &str) -> Result<(), TreeError> {
        self.update_index(|index| {
            let mut tagged = 0;
            for img in index.images.iter_mut().filter(|img| img.version == version) {
                img.version_detail.set_tag(tag)?;
                tagged += 1;
            }
            if tagged == 0 {
                return Err(TreeError::MissingImage(format!("version {version}")));
            }
            Ok(())
        })?;
        info!("tagged {}/{} {version} as '{tag}'", self.channel, self.name);
        Ok(())
    }

    /// Tag carried by `version`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::MissingImage`] if `version` is not published.
    pub fn get_tag(&self, version: u64) -> Result<Option<String>, TreeError> {
        self.index()?
            .images
            .iter()
            .find(|img| img.version == version)
            .map(|img| img.version_detail.tag().map(ToString::to_string))
            .ok_or_else(|| TreeError::MissingImage(format!("version {version}")))
    }

    /// Stage a rollout of the latest image to `percentage` of devices.
    /// `100` removes the field.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidPercentage`] above 100 and
    /// [`TreeError::NotLatest`] for any version but the newest.
    pub fn set_phased_percentage(&self, version: u64, percentage: u8) -> Result<(), TreeError> {
        if percentage > 100 {
            return Err(TreeError::InvalidPercentage(percentage));
        }
        self.update_index(|index| {
            let latest = index.latest_version();
            if latest != Some(version) {
                return Err(TreeError::NotLatest(version));
            }
            for img in index.images.iter_mut().filter(|img| img.version == version) {
                img.phased_percentage = (percentage < 100).then_some(percentage);
            }
            Ok(())
        })
    }

    /// Phased percentage of `version`; unphased images report 100.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::MissingImage`] if `version` is not published.
    pub fn get_phased_percentage(&self, version: u64) -> Result<u8, TreeError> {
        let index = self.index()?;
        let img = index
            .images
            .iter()
            .find(|img| img.version == version)
            .ok_or_else(|| TreeError::MissingImage(format!("version {version}")))?;
        Ok(img.phased_percentage.unwrap_or(100))
    }

    /// Load, mutate, and commit the index if it changed.
    pub(super) fn update_index<T>(
        &self,
        f: impl FnOnce(&mut DeviceIndex) -> Result<T, TreeError>,
    ) -> Result<T, TreeError> {
        let path = self.index_path();
        let exists = path.exists();
        let before: DeviceIndex = manifest::load(&path)?;
        let mut index = before.clone();
        let out = f(&mut index)?;
        index.normalize_phasing();
        if !exists || index.images != before.images {
            index.global.generated_at = Some(Utc::now().format("%a %b %d %H:%M:%S UTC %Y").to_string());
            std::fs::create_dir_all(self.dir())?;
            manifest::commit(&path, &index, &self.keys, Some(&self.name))?;
        }
        Ok(out)
    }

    fn file_entries(&self, files: &[PathBuf]) -> Result<Vec<FileEntry>, TreeError> {
        files
            .iter()
            .enumerate()
            .map(|(order, path)| self.file_entry(order as u32, path))
            .collect()
    }

    fn file_entry(&self, order: u32, path: &Path) -> Result<FileEntry, TreeError> {
        let sig = signature_path(path);
        for p in [path, sig.as_path()] {
            if !p.is_file() {
                return Err(TreeError::MissingFile(p.to_path_buf()));
            }
        }
        Ok(FileEntry {
            order,
            path: url_path(&self.root, path)?,
            signature: url_path(&self.root, &sig)?,
            checksum: Sha256Digest::of_file(path)?,
            size: std::fs::metadata(path)?.len(),
        })
    }
}

fn validate_new(index: &DeviceIndex, image: &NewImage) -> Result<(), TreeError> {
    let key = image.key();
    if index.get(&key).is_some() {
        return Err(TreeError::DuplicateImage(key.to_string()));
    }
    match (image.kind, image.base) {
        (ImageType::Full, Some(_)) => Err(TreeError::InvalidImage(format!(
            "{key}: full images have no base"
        ))),
        (ImageType::Delta, None) => Err(TreeError::InvalidImage(format!(
            "{key}: delta images need a base"
        ))),
        (ImageType::Delta, Some(base)) => {
            if !index.has_full(base) {
                return Err(TreeError::MissingBase { base });
            }
            if base >= image.version {
                return Err(TreeError::InvalidImage(format!(
                    "{key}: base must be older than the target"
                )));
            }
            Ok(())
        }
        (ImageType::Full, None) => match index.latest_full() {
            Some(latest) if latest.version >= image.version => {
                Err(TreeError::VersionNotIncreasing {
                    version: image.version,
                    latest: latest.version,
                })
            }
            _ => Ok(()),
        },
    }
}
