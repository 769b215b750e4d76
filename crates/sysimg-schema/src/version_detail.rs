//! Ordered component tags describing what went into an image.
//!
//! On the wire this is a single comma-joined string such as
//! `ubuntu=20240101,device=20231220,version=101`. Generators append to it
//! while an image is being assembled.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const TAG_KEY: &str = "tag";
const TAG_PREFIX: &str = "tag=";

/// Tags that cannot be stored in a version detail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    /// The tag contains `,` or `=`.
    #[error("invalid tag '{0}': tags may not contain ',' or '='")]
    Invalid(String),
}

/// Comma-joined list of `key=value` (or free-form) component tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionDetail(Vec<String>);

impl VersionDetail {
    /// Empty version detail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a wire string. Empty segments are dropped.
    pub fn parse(s: &str) -> Self {
        Self(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(ToString::to_string)
                .collect(),
        )
    }

    /// Append a free-form entry.
    pub fn push(&mut self, entry: impl Into<String>) {
        self.0.push(entry.into());
    }

    /// Append `key=value`.
    pub fn push_pair(&mut self, key: &str, value: impl std::fmt::Display) {
        self.0.push(format!("{key}={value}"));
    }

    /// Entries in order.
    pub fn entries(&self) -> &[String] {
        &self.0
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of the first `key=` entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Replace any existing `tag=` entry. An empty tag just clears it.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::Invalid`] if the tag contains a separator.
    pub fn set_tag(&mut self, tag: &str) -> Result<(), TagError> {
        if tag.contains(',') || tag.contains('=') {
            return Err(TagError::Invalid(tag.to_string()));
        }
        self.clear_tag();
        if !tag.is_empty() {
            self.push_pair(TAG_KEY, tag);
        }
        Ok(())
    }

    /// Drop the `tag=` entry.
    pub fn clear_tag(&mut self) {
        self.0.retain(|entry| !entry.starts_with(TAG_PREFIX));
    }

    /// Value of the `tag=` entry.
    pub fn tag(&self) -> Option<&str> {
        self.get(TAG_KEY)
    }
}

impl std::fmt::Display for VersionDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

impl Serialize for VersionDetail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionDetail {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}
