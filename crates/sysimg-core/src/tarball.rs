//! Small zstd-compressed tarballs the publisher creates itself: the
//! per-version `channel.ini` tarball and public keyring archives.
//!
//! Entries are written with fixed ownership, mode and mtime so rebuilding a
//! tarball from the same inputs yields identical bytes.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use sysimg_schema::VersionDetail;

use crate::config::Config;
use crate::keys::KeyringMeta;

/// Path of the channel configuration inside a version tarball.
pub const CHANNEL_INI_PATH: &str = "system/etc/system-image/channel.ini";

const ZSTD_LEVEL: i32 = 19;

const VERSION_PREFIX: &str = "version-";
const VERSION_SUFFIX: &str = ".tar.zst";

/// File name of the version tarball for `version`.
pub fn version_tarball_name(version: u64) -> String {
    format!("{VERSION_PREFIX}{version}{VERSION_SUFFIX}")
}

/// Whether a URL path or file name points at a version tarball.
pub fn is_version_tarball(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.strip_prefix(VERSION_PREFIX)
        .and_then(|rest| rest.strip_suffix(VERSION_SUFFIX))
        .is_some_and(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
}

/// Public address of the publishing server, baked into every version tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Host name.
    pub base: String,
    /// HTTP port; `0` disables it.
    pub http_port: u16,
    /// HTTPS port; `0` disables it.
    pub https_port: u16,
}

impl From<&Config> for ServiceEndpoint {
    fn from(config: &Config) -> Self {
        Self {
            base: config.public_fqdn.clone(),
            http_port: config.public_http_port,
            https_port: config.public_https_port,
        }
    }
}

/// Inputs of a version tarball.
#[derive(Debug, Clone)]
pub struct VersionTarball<'a> {
    /// Channel the tarball is published in.
    pub channel: &'a str,
    /// Device the tarball is for.
    pub device: &'a str,
    /// Image version.
    pub version: u64,
    /// Set when the tarball is generated for an alias channel.
    pub channel_target: Option<&'a str>,
    /// Component tags copied into `channel.ini`.
    pub version_detail: Option<&'a VersionDetail>,
}

impl VersionTarball<'_> {
    /// Contents of `channel.ini`.
    pub fn channel_ini(&self, endpoint: &ServiceEndpoint) -> String {
        let port = |p: u16| {
            if p == 0 {
                "disabled".to_string()
            } else {
                p.to_string()
            }
        };
        let mut ini = format!(
            "[service]\nbase: {}\nhttp_port: {}\nhttps_port: {}\nchannel: {}\ndevice: {}\nbuild_number: {}\n",
            endpoint.base,
            port(endpoint.http_port),
            port(endpoint.https_port),
            self.channel,
            self.device,
            self.version,
        );
        if let Some(target) = self.channel_target {
            ini.push_str(&format!("channel_target: {target}\n"));
        }
        if let Some(detail) = self.version_detail.filter(|d| !d.is_empty()) {
            ini.push_str(&format!("version_detail: {detail}\n"));
        }
        ini
    }

    /// Write the tarball to `dest`, replacing anything there.
    ///
    /// # Errors
    ///
    /// Returns an error if `dest` cannot be written.
    pub fn write(&self, endpoint: &ServiceEndpoint, dest: &Path) -> io::Result<()> {
        write_tarball(dest, &[(CHANNEL_INI_PATH, self.channel_ini(endpoint).as_bytes())])
    }
}

/// Pack a public keyring into `dest` as `keyring.json`.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn write_keyring_tarball(meta: &KeyringMeta, dest: &Path) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(meta)?;
    write_tarball(dest, &[("keyring.json", json.as_slice())])
}

fn write_tarball(dest: &Path, entries: &[(&str, &[u8])]) -> io::Result<()> {
    let file = File::create(dest)?;
    let encoder = zstd::Encoder::new(file, ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        builder.append_data(&mut header, name, *data)?;
    }
    let mut file = builder.into_inner()?.finish()?;
    file.flush()?;
    file.sync_all()
}

/// Read one entry back out of a tarball written by this module.
#[cfg(test)]
pub(crate) fn read_entry(path: &Path, name: &str) -> io::Result<Option<String>> {
    use std::io::Read;

    let decoder = zstd::Decoder::new(File::open(path)?)?;
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == name {
            let mut out = String::new();
            entry.read_to_string(&mut out)?;
            return Ok(Some(out));
        }
    }
    Ok(None)
}
