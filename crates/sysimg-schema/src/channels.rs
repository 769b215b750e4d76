//! Top-level `channels.json`: channel → device → index pointer.
//!
//! A device entry either owns an index (`{"index": "/stable/mako/index.json"}`)
//! or forwards to another channel's device
//! (`{"redirect": "devel", "device": "mako", "index": "..."}`). Redirect
//! entries keep a copy of the target's index path so that clients which do
//! not understand redirects still land somewhere valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Hops followed before a redirect chain is considered a loop.
const MAX_REDIRECT_HOPS: usize = 8;

/// Keyring attached to a device (e.g. a device-signing keyring).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringRef {
    /// URL path of the keyring archive.
    pub path: String,
    /// URL path of its signature.
    pub signature: String,
}

/// One device of a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// URL path of the device index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Channel this device forwards to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    /// Target device name of a redirect, when it differs from this entry's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Keyring attached to the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyring: Option<KeyringRef>,
}

impl DeviceEntry {
    /// Entry pointing at `index`.
    pub fn with_index(index: impl Into<String>) -> Self {
        Self {
            index: Some(index.into()),
            ..Self::default()
        }
    }

    /// Whether the entry forwards elsewhere.
    pub fn is_redirect(&self) -> bool {
        self.redirect.is_some()
    }

    /// `(channel, device)` this entry forwards to, if it is a redirect.
    pub fn redirect_target<'a>(&'a self, own_name: &'a str) -> Option<(&'a str, &'a str)> {
        self.redirect
            .as_deref()
            .map(|channel| (channel, self.device.as_deref().unwrap_or(own_name)))
    }
}

/// One channel of `channels.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Devices by name.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
    /// Channel whose images this channel mirrors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Channel this whole channel forwards to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    /// Hidden from channel listings.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

/// A device after redirects have been followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    /// Channel owning the index.
    pub channel: String,
    /// Device owning the index.
    pub device: String,
    /// URL path of the index, if any.
    pub index: Option<String>,
}

/// Contents of `channels.json`: channels by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelsFile {
    channels: BTreeMap<String, ChannelEntry>,
}

impl ChannelsFile {
    /// Empty channel list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel `channel`.
    pub fn get(&self, channel: &str) -> Option<&ChannelEntry> {
        self.channels.get(channel)
    }

    /// Mutable channel `channel`.
    pub fn get_mut(&mut self, channel: &str) -> Option<&mut ChannelEntry> {
        self.channels.get_mut(channel)
    }

    /// Whether `channel` exists.
    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Add or replace a channel.
    pub fn insert(&mut self, name: impl Into<String>, entry: ChannelEntry) {
        self.channels.insert(name.into(), entry);
    }

    /// Remove a channel.
    pub fn remove(&mut self, channel: &str) -> Option<ChannelEntry> {
        self.channels.remove(channel)
    }

    /// Channel names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Channels by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelEntry)> {
        self.channels.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Mutable channels by name.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut ChannelEntry)> {
        self.channels.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Entry of `device` in `channel`.
    pub fn device(&self, channel: &str, device: &str) -> Option<&DeviceEntry> {
        self.get(channel)?.devices.get(device)
    }

    /// Devices of `channel` that own their own index. Redirects are never
    /// generation targets.
    pub fn generation_targets(&self, channel: &str) -> Vec<&str> {
        let Some(entry) = self.get(channel) else {
            return Vec::new();
        };
        if entry.redirect.is_some() {
            return Vec::new();
        }
        entry
            .devices
            .iter()
            .filter(|(_, dev)| !dev.is_redirect())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Follow device and channel redirects to the entry that owns an index.
    ///
    /// Returns `None` for unknown devices, dangling redirects and loops.
    pub fn resolve(&self, channel: &str, device: &str) -> Option<ResolvedDevice> {
        let mut channel = channel;
        let mut device = device;
        for _ in 0..MAX_REDIRECT_HOPS {
            let chan = self.get(channel)?;
            if let Some(target) = chan.redirect.as_deref() {
                channel = target;
                continue;
            }
            let entry = chan.devices.get(device)?;
            match entry.redirect_target(device) {
                Some((next_channel, next_device)) => {
                    channel = next_channel;
                    device = next_device;
                }
                None => {
                    return Some(ResolvedDevice {
                        channel: channel.to_string(),
                        device: device.to_string(),
                        index: entry.index.clone(),
                    });
                }
            }
        }
        None
    }

    /// Every path this file points at: device indexes and keyrings.
    pub fn referenced_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for entry in self.channels.values() {
            for dev in entry.devices.values() {
                if let Some(index) = dev.index.as_deref() {
                    out.push(index);
                }
                if let Some(keyring) = &dev.keyring {
                    out.push(keyring.path.as_str());
                    out.push(keyring.signature.as_str());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "stable": {
            "devices": {
                "mako": {"index": "/stable/mako/index.json"},
                "flo": {"redirect": "devel", "index": "/devel/flo/index.json"}
            }
        },
        "devel": {
            "devices": {
                "flo": {"index": "/devel/flo/index.json"},
                "grouper": {"redirect": "devel", "device": "flo"}
            }
        },
        "legacy": {"devices": {}, "redirect": "stable", "hidden": true}
    }"#;

    fn sample() -> ChannelsFile {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_generation_targets_skip_redirects() {
        let channels = sample();
        assert_eq!(channels.generation_targets("stable"), vec!["mako"]);
        assert_eq!(channels.generation_targets("devel"), vec!["flo"]);
        assert!(channels.generation_targets("legacy").is_empty());
        assert!(channels.generation_targets("missing").is_empty());
    }

    #[test]
    fn test_resolve_follows_device_redirects() {
        let channels = sample();
        let resolved = channels.resolve("stable", "flo").unwrap();
        assert_eq!(resolved.channel, "devel");
        assert_eq!(resolved.device, "flo");

        let renamed = channels.resolve("devel", "grouper").unwrap();
        assert_eq!(renamed.device, "flo");
        assert_eq!(renamed.index.as_deref(), Some("/devel/flo/index.json"));
    }

    #[test]
    fn test_resolve_follows_channel_redirect() {
        let channels = sample();
        let resolved = channels.resolve("legacy", "mako").unwrap();
        assert_eq!(resolved.channel, "stable");
    }

    #[test]
    fn test_resolve_detects_loops() {
        let mut channels = ChannelsFile::new();
        let mut a = ChannelEntry::default();
        a.devices.insert(
            "x".into(),
            DeviceEntry {
                redirect: Some("b".into()),
                ..DeviceEntry::default()
            },
        );
        let mut b = ChannelEntry::default();
        b.devices.insert(
            "x".into(),
            DeviceEntry {
                redirect: Some("a".into()),
                ..DeviceEntry::default()
            },
        );
        channels.insert("a", a);
        channels.insert("b", b);
        assert!(channels.resolve("a", "x").is_none());
    }

    #[test]
    fn test_roundtrip_keeps_hidden_and_omits_defaults() {
        let channels = sample();
        let json = serde_json::to_value(&channels).unwrap();
        assert_eq!(json["legacy"]["hidden"], true);
        assert!(json["stable"].get("hidden").is_none());
        assert!(json["stable"]["devices"]["mako"].get("redirect").is_none());
    }
}
