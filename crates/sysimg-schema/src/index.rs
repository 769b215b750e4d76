//! Per-device `index.json`: the ordered list of published images.
//!
//! ```json
//! {
//!   "global": {"generated_at": "Mon Jan 01 00:00:00 UTC 2024"},
//!   "images": [
//!     {"type": "full", "version": 100, "description": "", "version_detail": "a=1",
//!      "files": [{"order": 0, "path": "/pool/a-1.tar.xz",
//!                 "signature": "/pool/a-1.tar.xz.asc",
//!                 "checksum": "<sha256>", "size": 1024}]}
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::hash::Sha256Digest;
use crate::version_detail::VersionDetail;

/// Full images are self-contained, deltas upgrade from `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// Self-contained image.
    Full,
    /// Upgrade from a base version.
    Delta,
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Delta => write!(f, "delta"),
        }
    }
}

/// One published file. Paths are URL paths relative to the publish root
/// and always start with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Position in which clients apply the file.
    #[serde(default)]
    pub order: u32,
    /// URL path of the file.
    pub path: String,
    /// URL path of its signature.
    pub signature: String,
    /// SHA256 of the file.
    pub checksum: Sha256Digest,
    /// Size in bytes.
    pub size: u64,
}

/// Identity of an image within one device: `(type, version, base)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageKey {
    /// Full or delta.
    pub kind: ImageType,
    /// Image version.
    pub version: u64,
    /// Base version of a delta.
    pub base: Option<u64>,
}

impl ImageKey {
    /// Key of the full image `version`.
    pub fn full(version: u64) -> Self {
        Self {
            kind: ImageType::Full,
            version,
            base: None,
        }
    }

    /// Key of the delta from `base` to `version`.
    pub fn delta(base: u64, version: u64) -> Self {
        Self {
            kind: ImageType::Delta,
            version,
            base: Some(base),
        }
    }
}

impl std::fmt::Display for ImageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.base {
            Some(base) => write!(f, "{} {base}->{}", self.kind, self.version),
            None => write!(f, "{} {}", self.kind, self.version),
        }
    }
}

/// One image of a device index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Full or delta.
    #[serde(rename = "type")]
    pub kind: ImageType,
    /// Image version.
    pub version: u64,
    /// Base version of a delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<u64>,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Component tags.
    #[serde(default, skip_serializing_if = "VersionDetail::is_empty")]
    pub version_detail: VersionDetail,
    /// Files in apply order.
    pub files: Vec<FileEntry>,
    #[serde(
        rename = "phased-percentage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    /// Share of clients offered the image, when phased.
    pub phased_percentage: Option<u8>,
    /// Oldest version that may upgrade to this image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minversion: Option<u64>,
    /// Whether clients must reboot into it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bootme: bool,
}

impl ImageEntry {
    /// Identity of this image.
    pub fn key(&self) -> ImageKey {
        ImageKey {
            kind: self.kind,
            version: self.version,
            base: self.base,
        }
    }

    /// Whether this is a full image.
    pub fn is_full(&self) -> bool {
        self.kind == ImageType::Full
    }

    /// Every path this image keeps alive: files and their signatures.
    pub fn referenced_paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .flat_map(|f| [f.path.as_str(), f.signature.as_str()])
    }

    /// Whether `path` is one of the files.
    pub fn contains_path(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }
}

/// Index-wide metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGlobal {
    /// When the index was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
}

/// Contents of a device `index.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIndex {
    /// Index-wide metadata.
    #[serde(default)]
    pub global: IndexGlobal,
    /// Every published image.
    #[serde(default)]
    pub images: Vec<ImageEntry>,
}

impl DeviceIndex {
    /// Full images, in index order.
    pub fn full_images(&self) -> impl Iterator<Item = &ImageEntry> {
        self.images.iter().filter(|img| img.is_full())
    }

    /// Highest-versioned full image.
    pub fn latest_full(&self) -> Option<&ImageEntry> {
        self.full_images().max_by_key(|img| img.version)
    }

    /// Highest version of any image, full or delta.
    pub fn latest_version(&self) -> Option<u64> {
        self.images.iter().map(|img| img.version).max()
    }

    /// Whether full image `version` exists.
    pub fn has_full(&self, version: u64) -> bool {
        self.full_images().any(|img| img.version == version)
    }

    /// Image with `key`.
    pub fn get(&self, key: &ImageKey) -> Option<&ImageEntry> {
        self.images.iter().find(|img| img.key() == *key)
    }

    /// Mutable image with `key`.
    pub fn get_mut(&mut self, key: &ImageKey) -> Option<&mut ImageEntry> {
        self.images.iter_mut().find(|img| img.key() == *key)
    }

    /// Drop `phased-percentage` from everything but the newest version.
    pub fn normalize_phasing(&mut self) {
        let Some(latest) = self.latest_version() else {
            return;
        };
        for img in &mut self.images {
            if img.version != latest {
                img.phased_percentage = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "global": {"generated_at": "Mon Jan 01 00:00:00 UTC 2024"},
        "images": [
            {"type": "full", "version": 100, "description": "first",
             "version_detail": "a=1",
             "files": [{"order": 0, "path": "/pool/a-1.tar.xz",
                        "signature": "/pool/a-1.tar.xz.asc",
                        "checksum": "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
                        "size": 11}]},
            {"type": "full", "version": 101,
             "files": [{"path": "/pool/a-2.tar.xz",
                        "signature": "/pool/a-2.tar.xz.asc",
                        "checksum": "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
                        "size": 11}],
             "phased-percentage": 20},
            {"type": "delta", "version": 101, "base": 100,
             "files": [{"path": "/pool/a-2.tar.xz",
                        "signature": "/pool/a-2.tar.xz.asc",
                        "checksum": "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
                        "size": 11}]}
        ]
    }"#;

    #[test]
    fn test_parse_sample_index() {
        let index: DeviceIndex = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(index.images.len(), 3);
        assert_eq!(index.latest_full().unwrap().version, 101);
        assert!(index.has_full(100));
        assert!(!index.has_full(99));

        let delta = index.get(&ImageKey::delta(100, 101)).unwrap();
        assert_eq!(delta.kind, ImageType::Delta);
        assert_eq!(index.images[1].phased_percentage, Some(20));
        assert_eq!(index.images[0].version_detail.get("a"), Some("1"));
    }

    #[test]
    fn test_full_image_omits_optional_fields() {
        let index: DeviceIndex = serde_json::from_str(SAMPLE).unwrap();
        let json = serde_json::to_value(&index.images[0]).unwrap();
        assert!(json.get("base").is_none());
        assert!(json.get("phased-percentage").is_none());
        assert!(json.get("bootme").is_none());
        assert_eq!(json["type"], "full");
    }

    #[test]
    fn test_referenced_paths_include_signatures() {
        let index: DeviceIndex = serde_json::from_str(SAMPLE).unwrap();
        let paths: Vec<_> = index.images[0].referenced_paths().collect();
        assert_eq!(paths, vec!["/pool/a-1.tar.xz", "/pool/a-1.tar.xz.asc"]);
    }

    #[test]
    fn test_normalize_phasing_keeps_latest_only() {
        let mut index: DeviceIndex = serde_json::from_str(SAMPLE).unwrap();
        index.images[0].phased_percentage = Some(50);
        index.normalize_phasing();
        assert_eq!(index.images[0].phased_percentage, None);
        assert_eq!(index.images[1].phased_percentage, Some(20));
    }

    #[test]
    fn test_empty_index_parses() {
        let index: DeviceIndex = serde_json::from_str("{}").unwrap();
        assert!(index.latest_full().is_none());
        assert_eq!(index.latest_version(), None);
    }
}
