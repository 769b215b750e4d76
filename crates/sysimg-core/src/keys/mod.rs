//! Signing-key hierarchy.
//!
//! | Role             | Certified by   | Signs                                  |
//! |------------------|----------------|----------------------------------------|
//! | `archive-master` | (root)         | image-master                           |
//! | `image-master`   | archive-master | image-signing, blacklist               |
//! | `image-signing`  | image-master   | published artifacts, manifests, device keys |
//! | `device-signing` | image-signing  | artifacts of one device (override)     |
//! | `blacklist`      | image-master   | the revocation list                    |
//!
//! [`KeyHierarchy::sign_file`] is the only way to produce an artifact
//! signature, and [`KeyHierarchy::sign_file_as`] the only way to sign a
//! published keyring. Both check expiry, revocation and the certification
//! chain of the chosen key before signing, so callers never sign with a key
//! a client would reject.

mod bootstrap;
mod material;
mod signature;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysimg_schema::{SIGNATURE_SUFFIX, Sha256Digest};
use thiserror::Error;
use tracing::debug;

use crate::io::remove_if_exists;

pub use bootstrap::{BootstrapAction, BootstrapOutcome};
pub use material::{KeyMaterial, KeyringMeta};
pub use signature::DetachedSignature;

const BLACKLIST_FILE: &str = "blacklist.json";
const DEVICE_KEYS_DIR: &str = "device-signing";

/// Key hierarchy failures.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key material could not be read or written.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A keyring document did not (de)serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key material on disk is unusable.
    #[error("malformed key material in {path}: {reason}")]
    Malformed {
        /// Offending file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// No key exists for the role or device.
    #[error("no {0} key available")]
    MissingKey(String),

    /// The key has expired.
    #[error("key {fingerprint} ({identity}) expired at {expired_at}")]
    Expired {
        /// Fingerprint of the key.
        fingerprint: String,
        /// Identity of the key.
        identity: String,
        /// When it expired.
        expired_at: DateTime<Utc>,
    },

    /// The key is on the blacklist.
    #[error("key {0} is blacklisted")]
    Blacklisted(String),

    /// The parent certification does not verify.
    #[error("key {fingerprint} has a broken chain of trust: {reason}")]
    BrokenChain {
        /// Fingerprint of the key whose chain is broken.
        fingerprint: String,
        /// Why verification failed.
        reason: String,
    },

    /// A signature is already present.
    #[error("signature {0} already exists")]
    SignatureExists(PathBuf),

    /// The detached signature is missing.
    #[error("missing signature {0}")]
    MissingSignature(PathBuf),

    /// The signature does not match the file.
    #[error("invalid signature for {0}")]
    BadSignature(PathBuf),

    /// No known key has this fingerprint.
    #[error("unknown signer {0}")]
    UnknownSigner(String),
}

/// Position of a key in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyRole {
    /// Root of trust, certifies the image master.
    ArchiveMaster,
    /// Certifies image-signing and blacklist keys.
    ImageMaster,
    /// Signs manifests and artifacts.
    ImageSigning,
    /// Per-device key certified by image-signing.
    DeviceSigning,
    /// Lists revoked keys.
    Blacklist,
}

impl KeyRole {
    /// Roles created by a bootstrap run, parents first.
    pub const BOOTSTRAP_ORDER: [KeyRole; 4] = [
        KeyRole::ArchiveMaster,
        KeyRole::ImageMaster,
        KeyRole::ImageSigning,
        KeyRole::Blacklist,
    ];

    /// Directory name under the key root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::ArchiveMaster => "archive-master",
            Self::ImageMaster => "image-master",
            Self::ImageSigning => "image-signing",
            Self::DeviceSigning => DEVICE_KEYS_DIR,
            Self::Blacklist => "blacklist",
        }
    }

    /// Title used in key identities.
    pub fn title(self) -> &'static str {
        match self {
            Self::ArchiveMaster => "Archive Master",
            Self::ImageMaster => "Image Master",
            Self::ImageSigning => "Image Signing",
            Self::DeviceSigning => "Device Signing",
            Self::Blacklist => "Blacklist",
        }
    }

    /// Role that certifies this one.
    pub fn parent(self) -> Option<KeyRole> {
        match self {
            Self::ArchiveMaster => None,
            Self::ImageMaster => Some(Self::ArchiveMaster),
            Self::ImageSigning | Self::Blacklist => Some(Self::ImageMaster),
            Self::DeviceSigning => Some(Self::ImageSigning),
        }
    }

    /// Whether the key never expires.
    pub fn is_master(self) -> bool {
        matches!(self, Self::ArchiveMaster | Self::ImageMaster)
    }
}

impl std::fmt::Display for KeyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BlacklistFile {
    revoked: BTreeSet<String>,
}

/// All key material under one key directory, plus the revocation list.
#[derive(Debug)]
pub struct KeyHierarchy {
    root: PathBuf,
    roles: BTreeMap<KeyRole, KeyMaterial>,
    devices: BTreeMap<String, KeyMaterial>,
    revoked: BTreeSet<String>,
}

impl KeyHierarchy {
    /// Load every key found under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if a key directory is malformed or the blacklist is
    /// present but not validly signed by the blacklist key.
    pub fn open(root: &Path) -> Result<Self, KeyError> {
        let mut roles = BTreeMap::new();
        for role in KeyRole::BOOTSTRAP_ORDER {
            if let Some(key) = KeyMaterial::load(&root.join(role.dir_name()))? {
                roles.insert(role, key);
            }
        }

        let mut devices = BTreeMap::new();
        let device_root = root.join(DEVICE_KEYS_DIR);
        if device_root.is_dir() {
            for entry in std::fs::read_dir(&device_root)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(key) = KeyMaterial::load(&entry.path())? {
                    devices.insert(entry.file_name().to_string_lossy().into_owned(), key);
                }
            }
        }

        let mut keys = Self {
            root: root.to_path_buf(),
            roles,
            devices,
            revoked: BTreeSet::new(),
        };
        keys.revoked = keys.load_blacklist()?;
        debug!(
            "loaded {} role keys, {} device keys, {} revoked",
            keys.roles.len(),
            keys.devices.len(),
            keys.revoked.len()
        );
        Ok(keys)
    }

    /// Key root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key of `role`, if loaded.
    pub fn key(&self, role: KeyRole) -> Option<&KeyMaterial> {
        self.roles.get(&role)
    }

    /// Device-signing key of `device`, if any.
    pub fn device_key(&self, device: &str) -> Option<&KeyMaterial> {
        self.devices.get(device)
    }

    /// Directory holding a role's key material.
    pub fn role_dir(&self, role: KeyRole) -> PathBuf {
        self.root.join(role.dir_name())
    }

    /// Whether `fingerprint` is on the blacklist.
    pub fn is_revoked(&self, fingerprint: &str) -> bool {
        self.revoked.contains(fingerprint)
    }

    /// The key that signs artifacts for `device`: its device-signing key if
    /// one exists, the image-signing key otherwise. The key is validated.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MissingKey`] if no signing key exists, or the
    /// validation error of the selected key.
    pub fn signer_for(&self, device: Option<&str>) -> Result<&KeyMaterial, KeyError> {
        let key = device
            .and_then(|d| self.devices.get(d))
            .or_else(|| self.roles.get(&KeyRole::ImageSigning))
            .ok_or_else(|| KeyError::MissingKey(KeyRole::ImageSigning.to_string()))?;
        self.validate(key, Utc::now())?;
        Ok(key)
    }

    /// Check that `key` is unexpired, not revoked, and certified all the
    /// way up to the archive master, as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first violation found walking up the chain.
    pub fn validate(&self, key: &KeyMaterial, now: DateTime<Utc>) -> Result<(), KeyError> {
        let mut current = key;
        loop {
            let meta = &current.meta;
            if self.is_revoked(&meta.fingerprint) {
                return Err(KeyError::Blacklisted(meta.fingerprint.clone()));
            }
            let expired = meta
                .expires
                .filter(|_| !meta.role.is_master() && meta.is_expired_at(now));
            if let Some(expired_at) = expired {
                return Err(KeyError::Expired {
                    fingerprint: meta.fingerprint.clone(),
                    identity: meta.identity.clone(),
                    expired_at,
                });
            }
            let Some(parent_role) = meta.role.parent() else {
                return Ok(());
            };
            let parent = self.roles.get(&parent_role).ok_or_else(|| KeyError::BrokenChain {
                fingerprint: meta.fingerprint.clone(),
                reason: format!("no {parent_role} key"),
            })?;
            if !current.is_certified_by(parent) {
                return Err(KeyError::BrokenChain {
                    fingerprint: meta.fingerprint.clone(),
                    reason: format!("not certified by {parent_role} {}", parent.fingerprint()),
                });
            }
            current = parent;
        }
    }

    /// Sign `path` for `device`, writing `<path>.asc`.
    ///
    /// # Errors
    ///
    /// Refuses to overwrite an existing signature, and to sign with an
    /// expired, revoked or uncertified key.
    pub fn sign_file(&self, device: Option<&str>, path: &Path) -> Result<PathBuf, KeyError> {
        let dest = signature_path(path);
        self.sign_file_to(device, path, &dest)?;
        Ok(dest)
    }

    /// Like [`KeyHierarchy::sign_file`] with an explicit destination.
    ///
    /// # Errors
    ///
    /// See [`KeyHierarchy::sign_file`].
    pub fn sign_file_to(
        &self,
        device: Option<&str>,
        path: &Path,
        dest: &Path,
    ) -> Result<(), KeyError> {
        let key = self.signer_for(device)?;
        write_signature(key, path, dest)
    }

    /// Sign `path` with the key of `role` itself, writing `<path>.asc`.
    /// Published keyrings are vouched for this way by their parent role.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MissingKey`] if `role` has no key, and otherwise
    /// fails like [`KeyHierarchy::sign_file`].
    pub fn sign_file_as(&self, role: KeyRole, path: &Path) -> Result<PathBuf, KeyError> {
        let key = self
            .roles
            .get(&role)
            .ok_or_else(|| KeyError::MissingKey(role.to_string()))?;
        self.validate(key, Utc::now())?;
        let dest = signature_path(path);
        write_signature(key, path, &dest)?;
        Ok(dest)
    }

    /// Verify `<path>.asc` against the hierarchy.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature is missing, unparsable, made by an
    /// unknown or invalid key, or does not match the file.
    pub fn verify_file(&self, path: &Path) -> Result<&KeyMaterial, KeyError> {
        let sig_path = signature_path(path);
        let text = std::fs::read_to_string(&sig_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                KeyError::MissingSignature(sig_path.clone())
            } else {
                KeyError::Io(err)
            }
        })?;
        let detached =
            DetachedSignature::parse(&text).ok_or_else(|| KeyError::BadSignature(sig_path.clone()))?;
        let key = self
            .find_by_fingerprint(&detached.signer)
            .ok_or_else(|| KeyError::UnknownSigner(detached.signer.clone()))?;
        self.validate(key, Utc::now())?;

        let digest = Sha256Digest::of_file(path)?;
        if key.verify(&digest.to_bytes(), &detached.signature) {
            Ok(key)
        } else {
            Err(KeyError::BadSignature(path.to_path_buf()))
        }
    }

    /// Add `fingerprint` to the blacklist and re-sign it.
    ///
    /// # Errors
    ///
    /// Returns an error if the blacklist key is missing or invalid, or the
    /// list cannot be written.
    pub fn revoke(&mut self, fingerprint: &str) -> Result<(), KeyError> {
        let blacklist_key = self
            .roles
            .get(&KeyRole::Blacklist)
            .ok_or_else(|| KeyError::MissingKey(KeyRole::Blacklist.to_string()))?;
        if blacklist_key.fingerprint() == fingerprint {
            return Err(KeyError::BrokenChain {
                fingerprint: fingerprint.to_string(),
                reason: "the blacklist key cannot revoke itself".into(),
            });
        }
        self.validate(blacklist_key, Utc::now())?;

        let mut revoked = self.revoked.clone();
        revoked.insert(fingerprint.to_string());
        let file = BlacklistFile { revoked };

        let path = self.root.join(BLACKLIST_FILE);
        let tmp = path.with_extension("json.new");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        let tmp_sig = signature_path(&tmp);
        remove_if_exists(&tmp_sig)?;
        write_signature(blacklist_key, &tmp, &tmp_sig)?;
        std::fs::rename(&tmp_sig, signature_path(&path))?;
        std::fs::rename(&tmp, &path)?;

        self.revoked = file.revoked;
        Ok(())
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> Option<&KeyMaterial> {
        self.roles
            .values()
            .chain(self.devices.values())
            .find(|key| key.fingerprint() == fingerprint)
    }

    fn load_blacklist(&self) -> Result<BTreeSet<String>, KeyError> {
        let path = self.root.join(BLACKLIST_FILE);
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        let key = self
            .roles
            .get(&KeyRole::Blacklist)
            .ok_or_else(|| KeyError::MissingKey(KeyRole::Blacklist.to_string()))?;
        let sig_path = signature_path(&path);
        let text = std::fs::read_to_string(&sig_path)
            .map_err(|_| KeyError::MissingSignature(sig_path.clone()))?;
        let detached =
            DetachedSignature::parse(&text).ok_or_else(|| KeyError::BadSignature(sig_path.clone()))?;
        let digest = Sha256Digest::of_file(&path)?;
        if detached.signer != key.fingerprint() || !key.verify(&digest.to_bytes(), &detached.signature)
        {
            return Err(KeyError::BadSignature(path));
        }
        let file: BlacklistFile = serde_json::from_slice(&std::fs::read(&path)?)?;
        Ok(file.revoked)
    }
}

/// `<path>.asc`
pub fn signature_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(SIGNATURE_SUFFIX);
    PathBuf::from(os)
}

fn write_signature(key: &KeyMaterial, path: &Path, dest: &Path) -> Result<(), KeyError> {
    if dest.exists() {
        return Err(KeyError::SignatureExists(dest.to_path_buf()));
    }
    let digest = Sha256Digest::of_file(path)?;
    let detached = DetachedSignature {
        signer: key.fingerprint().to_string(),
        signature: key.sign(&digest.to_bytes()),
    };
    std::fs::write(dest, detached.to_armored())?;
    debug!("signed {} with {}", path.display(), key.meta.role);
    Ok(())
}
