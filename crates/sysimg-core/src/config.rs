//! Publisher configuration (`etc/config.toml`).
//!
//! ```toml
//! [global]
//! public_fqdn = "system-image.example.com"
//! public_http_port = 80
//! public_https_port = 443
//!
//! [mirror_default]
//! ssh_user = "mirror"
//! ssh_key = "secret/ssh/mirror"
//! ssh_port = 22
//! ssh_command = "imports/sync-mirror"
//!
//! [mirrors.a]
//! ssh_host = "a.example.com"
//!
//! [channels.stable]
//! type = "auto"
//! versionbase = 100
//! fullcount = 10
//! deltabase = ["stable", "devel"]
//!
//! [[channels.stable.files]]
//! name = "ubuntu"
//! generator = "http"
//! arguments = ["https://cdimage.example.com/latest.tar.xz"]
//! options = { name = "ubuntu" }
//! ```
//!
//! Relative paths resolve against `base_path`, which defaults to
//! `$SYSIMG_ROOT` (or the current directory).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the instance root.
pub const ROOT_ENV: &str = "SYSIMG_ROOT";

const DEFAULT_GENERATOR_TIMEOUT_SECS: u64 = 20 * 60;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_KEY_EXPIRY_DAYS: u32 = 730;

/// Why a configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unknown keys.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Parser error.
        source: toml::de::Error,
    },

    /// A mirror lacks a required SSH setting.
    #[error("mirror '{mirror}' is missing '{field}'")]
    MissingMirrorField {
        /// Mirror name.
        mirror: String,
        /// Missing setting.
        field: &'static str,
    },

    /// A channel file entry is unusable.
    #[error("channel '{channel}' file '{file}': {reason}")]
    InvalidFile {
        /// Channel declaring the file.
        channel: String,
        /// Name of the file entry.
        file: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// How a channel receives new images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Rebuilt by every import run.
    Auto,
    /// Only changed by hand.
    #[default]
    Manual,
}

/// One entry of a channel's `files` list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileSpec {
    /// Logical file name, optionally `name,device` to scope it to one device.
    pub name: String,
    /// Registry key of the generator producing this file.
    pub generator: String,
    /// Positional generator arguments.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Named generator options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl FileSpec {
    /// Base name without any device override.
    pub fn base_name(&self) -> &str {
        self.name.split_once(',').map_or(&self.name, |(name, _)| name)
    }

    /// Device this spec is restricted to, if any.
    pub fn device_override(&self) -> Option<&str> {
        self.name.split_once(',').map(|(_, device)| device)
    }
}

/// One `[channels.<name>]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Channel name.
    pub name: String,
    /// Import behavior.
    pub kind: ChannelType,
    /// Version number the first image of this channel starts from.
    pub versionbase: u64,
    /// Full images kept per device; `0` keeps everything.
    pub fullcount: usize,
    /// Channels whose latest full image may serve as a delta base, in order.
    pub deltabase: Vec<String>,
    /// Files making up every image, in order.
    pub files: Vec<FileSpec>,
}

/// SSH trigger for one push mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTrigger {
    /// Mirror name.
    pub name: String,
    /// Host to connect to.
    pub ssh_host: String,
    /// Login user.
    pub ssh_user: String,
    /// Private key for the connection.
    pub ssh_key: PathBuf,
    /// SSH port.
    pub ssh_port: u16,
    /// Command run on the mirror.
    pub ssh_command: String,
}

/// Key validity per role. Master keys never expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPolicy {
    /// Lifetime of the image-signing key.
    pub image_signing_days: u32,
    /// Lifetime of device-signing keys.
    pub device_signing_days: u32,
    /// Lifetime of the blacklist key.
    pub blacklist_days: u32,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            image_signing_days: DEFAULT_KEY_EXPIRY_DAYS,
            device_signing_days: DEFAULT_KEY_EXPIRY_DAYS,
            blacklist_days: DEFAULT_KEY_EXPIRY_DAYS,
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance root every relative path resolves against.
    pub base_path: PathBuf,
    /// Signing key hierarchy.
    pub key_path: PathBuf,
    /// Publish root served to clients.
    pub publish_path: PathBuf,
    /// Scratch space and the publish lock.
    pub state_path: PathBuf,
    /// Host name clients reach the server at.
    pub public_fqdn: String,
    /// `0` disables the port.
    pub public_http_port: u16,
    /// HTTPS port; `0` disables it.
    pub public_https_port: u16,
    /// Upper bound for one generator call.
    pub generator_timeout: Duration,
    /// Upper bound for one download.
    pub fetch_timeout: Duration,
    /// Concurrent downloads of `sysimg-mirror`.
    pub mirror_workers: usize,
    /// Key lifetimes.
    pub keys: KeyPolicy,
    /// Push mirrors triggered after an import.
    pub mirrors: BTreeMap<String, MirrorTrigger>,
    /// Channels by name.
    pub channels: BTreeMap<String, ChannelConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawGlobal {
    base_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    publish_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
    public_fqdn: Option<String>,
    public_http_port: Option<u16>,
    public_https_port: Option<u16>,
    generator_timeout_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
    mirror_workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawKeys {
    image_signing_days: Option<u32>,
    device_signing_days: Option<u32>,
    blacklist_days: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawMirror {
    ssh_host: Option<String>,
    ssh_user: Option<String>,
    ssh_key: Option<PathBuf>,
    ssh_port: Option<u16>,
    ssh_command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawChannel {
    #[serde(rename = "type")]
    kind: ChannelType,
    versionbase: Option<u64>,
    fullcount: usize,
    deltabase: Option<Vec<String>>,
    files: Vec<FileSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    global: RawGlobal,
    keys: RawKeys,
    mirror_default: RawMirror,
    mirrors: BTreeMap<String, RawMirror>,
    channels: BTreeMap<String, RawChannel>,
}

impl Config {
    /// Default config location: `$SYSIMG_ROOT/etc/config.toml`, else
    /// `./etc/config.toml`.
    pub fn default_path() -> PathBuf {
        instance_root().join("etc").join("config.toml")
    }

    /// Load and resolve a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable, not valid TOML,
    /// or describes an incomplete mirror or file spec.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path, None)
    }

    /// Parse config text. `base_override` replaces `[global] base_path`.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn from_toml_str(
        content: &str,
        origin: &Path,
        base_override: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        Self::resolve(raw, base_override)
    }

    fn resolve(raw: RawConfig, base_override: Option<&Path>) -> Result<Self, ConfigError> {
        let g = raw.global;
        let base_path = base_override
            .map(Path::to_path_buf)
            .or(g.base_path)
            .unwrap_or_else(instance_root);
        let under_base = |p: Option<PathBuf>, default: &str| {
            let p = p.unwrap_or_else(|| PathBuf::from(default));
            if p.is_absolute() { p } else { base_path.join(p) }
        };

        let key_path = under_base(g.key_path, "secret/keys");
        let publish_path = under_base(g.publish_path, "www");
        let state_path = under_base(g.state_path, "state");

        let mut mirrors = BTreeMap::new();
        for (name, raw_mirror) in raw.mirrors {
            let trigger = resolve_mirror(&name, raw_mirror, &raw.mirror_default, &base_path)?;
            mirrors.insert(name, trigger);
        }

        let mut channels = BTreeMap::new();
        for (name, raw_channel) in raw.channels {
            for file in &raw_channel.files {
                if file.name.is_empty() || file.base_name().is_empty() {
                    return Err(ConfigError::InvalidFile {
                        channel: name.clone(),
                        file: file.name.clone(),
                        reason: "empty file name".into(),
                    });
                }
                if file.generator.is_empty() {
                    return Err(ConfigError::InvalidFile {
                        channel: name.clone(),
                        file: file.name.clone(),
                        reason: "missing generator".into(),
                    });
                }
            }
            let channel = ChannelConfig {
                kind: raw_channel.kind,
                versionbase: raw_channel.versionbase.unwrap_or(1),
                fullcount: raw_channel.fullcount,
                deltabase: raw_channel
                    .deltabase
                    .unwrap_or_else(|| vec![name.clone()]),
                files: raw_channel.files,
                name: name.clone(),
            };
            channels.insert(name, channel);
        }

        let defaults = KeyPolicy::default();
        Ok(Self {
            key_path,
            publish_path,
            state_path,
            public_fqdn: g.public_fqdn.unwrap_or_else(|| "localhost".into()),
            public_http_port: g.public_http_port.unwrap_or(80),
            public_https_port: g.public_https_port.unwrap_or(443),
            generator_timeout: Duration::from_secs(
                g.generator_timeout_secs
                    .unwrap_or(DEFAULT_GENERATOR_TIMEOUT_SECS),
            ),
            fetch_timeout: Duration::from_secs(
                g.fetch_timeout_secs.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
            mirror_workers: g.mirror_workers.unwrap_or_else(num_cpus::get).max(1),
            keys: KeyPolicy {
                image_signing_days: raw
                    .keys
                    .image_signing_days
                    .unwrap_or(defaults.image_signing_days),
                device_signing_days: raw
                    .keys
                    .device_signing_days
                    .unwrap_or(defaults.device_signing_days),
                blacklist_days: raw.keys.blacklist_days.unwrap_or(defaults.blacklist_days),
            },
            mirrors,
            channels,
            base_path,
        })
    }

    /// Channels rebuilt by the importer, in name order.
    pub fn auto_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels
            .values()
            .filter(|c| c.kind == ChannelType::Auto)
    }

    /// Path of the global publish lock.
    pub fn lock_path(&self) -> PathBuf {
        self.state_path.join("global.lock")
    }
}

fn resolve_mirror(
    name: &str,
    raw: RawMirror,
    defaults: &RawMirror,
    base_path: &Path,
) -> Result<MirrorTrigger, ConfigError> {
    let missing = |field| ConfigError::MissingMirrorField {
        mirror: name.to_string(),
        field,
    };
    let ssh_key = raw
        .ssh_key
        .or_else(|| defaults.ssh_key.clone())
        .ok_or_else(|| missing("ssh_key"))?;
    Ok(MirrorTrigger {
        name: name.to_string(),
        ssh_host: raw.ssh_host.ok_or_else(|| missing("ssh_host"))?,
        ssh_user: raw
            .ssh_user
            .or_else(|| defaults.ssh_user.clone())
            .ok_or_else(|| missing("ssh_user"))?,
        ssh_key: if ssh_key.is_absolute() {
            ssh_key
        } else {
            base_path.join(ssh_key)
        },
        ssh_port: raw.ssh_port.or(defaults.ssh_port).unwrap_or(22),
        ssh_command: raw
            .ssh_command
            .or_else(|| defaults.ssh_command.clone())
            .ok_or_else(|| missing("ssh_command"))?,
    })
}

fn instance_root() -> PathBuf {
    std::env::var_os(ROOT_ENV)
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Config, ConfigError> {
        Config::from_toml_str(content, Path::new("test.toml"), Some(Path::new("/srv/si")))
    }

    #[test]
    fn test_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.publish_path, PathBuf::from("/srv/si/www"));
        assert_eq!(config.key_path, PathBuf::from("/srv/si/secret/keys"));
        assert_eq!(config.lock_path(), PathBuf::from("/srv/si/state/global.lock"));
        assert_eq!(config.public_http_port, 80);
        assert_eq!(config.generator_timeout, Duration::from_secs(1200));
        assert!(config.mirror_workers >= 1);
        assert_eq!(config.keys, KeyPolicy::default());
    }

    #[test]
    fn test_channel_defaults() {
        let config = parse(
            r#"
            [channels.stable]
            type = "auto"

            [[channels.stable.files]]
            name = "ubuntu"
            generator = "http"
            arguments = ["https://example.com/ubuntu.tar.xz"]

            [[channels.stable.files]]
            name = "device,mako"
            generator = "http"
            options = { monitor = "https://example.com/version" }

            [channels.archive]
            "#,
        )
        .unwrap();

        let stable = &config.channels["stable"];
        assert_eq!(stable.kind, ChannelType::Auto);
        assert_eq!(stable.versionbase, 1);
        assert_eq!(stable.fullcount, 0);
        assert_eq!(stable.deltabase, vec!["stable".to_string()]);
        assert_eq!(stable.files[1].base_name(), "device");
        assert_eq!(stable.files[1].device_override(), Some("mako"));
        assert_eq!(stable.files[0].device_override(), None);

        assert_eq!(config.channels["archive"].kind, ChannelType::Manual);
        let auto: Vec<_> = config.auto_channels().map(|c| c.name.as_str()).collect();
        assert_eq!(auto, vec!["stable"]);
    }

    #[test]
    fn test_mirror_inherits_defaults() {
        let config = parse(
            r#"
            [mirror_default]
            ssh_user = "mirror"
            ssh_key = "secret/ssh/key"
            ssh_command = "sync"

            [mirrors.a]
            ssh_host = "a.example.com"
            ssh_port = 2222
            "#,
        )
        .unwrap();
        let a = &config.mirrors["a"];
        assert_eq!(a.ssh_user, "mirror");
        assert_eq!(a.ssh_key, PathBuf::from("/srv/si/secret/ssh/key"));
        assert_eq!(a.ssh_port, 2222);
    }

    #[test]
    fn test_mirror_missing_host_is_error() {
        let err = parse(
            r#"
            [mirrors.a]
            ssh_user = "x"
            ssh_key = "/k"
            ssh_command = "c"
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingMirrorField { field: "ssh_host", .. }
        ));
    }

    #[test]
    fn test_file_without_generator_is_error() {
        let err = parse(
            r#"
            [[channels.stable.files]]
            name = "ubuntu"
            generator = ""
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFile { .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            parse("[global]\nbogus = 1\n"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
