//! Wire formats of a published system-image tree.
//!
//! The publisher writes these files and mirrors read them back, so they live
//! in their own crate with no I/O dependencies.

pub mod channels;
/// Validated SHA256 digests.
pub mod hash;
pub mod index;
pub mod version_detail;

// Re-exports
pub use channels::{ChannelEntry, ChannelsFile, DeviceEntry, KeyringRef, ResolvedDevice};
pub use hash::*;
pub use index::{DeviceIndex, FileEntry, ImageEntry, ImageKey, ImageType, IndexGlobal};
pub use version_detail::{TagError, VersionDetail};

/// Name of the top-level manifest in a publish root.
pub const CHANNELS_FILE: &str = "channels.json";

/// Name of the per-device manifest.
pub const INDEX_FILE: &str = "index.json";

/// Suffix of detached signature files.
pub const SIGNATURE_SUFFIX: &str = ".asc";
