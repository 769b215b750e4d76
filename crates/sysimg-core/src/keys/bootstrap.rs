//! One-time creation of the key hierarchy.

use std::path::Path;

use chrono::{TimeDelta, Utc};
use tracing::info;

use super::{DEVICE_KEYS_DIR, KeyError, KeyHierarchy, KeyMaterial, KeyRole};
use crate::config::KeyPolicy;

/// What bootstrap did with one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapAction {
    /// New material was generated.
    Created,
    /// Material was already present and left untouched.
    Existing,
}

/// One key handled by a bootstrap run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOutcome {
    /// Role of the key.
    pub role: KeyRole,
    /// Device of a device-signing key.
    pub device: Option<String>,
    /// Identity embedded in the key.
    pub identity: String,
    /// Key fingerprint.
    pub fingerprint: String,
    /// Whether it was created.
    pub action: BootstrapAction,
}

impl KeyHierarchy {
    /// Create every missing role key under `root`, parents first.
    ///
    /// Existing keys are reported and never regenerated, so running this
    /// twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if existing material is malformed or new material
    /// cannot be written.
    pub fn bootstrap(
        root: &Path,
        policy: &KeyPolicy,
        email: &str,
        prefix: &str,
    ) -> Result<Vec<BootstrapOutcome>, KeyError> {
        std::fs::create_dir_all(root)?;
        let mut outcomes = Vec::new();
        for role in KeyRole::BOOTSTRAP_ORDER {
            let identity = identity(prefix, role, None, email);
            outcomes.push(ensure_key(root, &root.join(role.dir_name()), role, identity, policy, None)?);
        }
        Ok(outcomes)
    }

    /// Create the device-signing key for `device` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MissingKey`] if the image-signing key has not been
    /// bootstrapped yet.
    pub fn create_device_key(
        root: &Path,
        policy: &KeyPolicy,
        device: &str,
        email: &str,
        prefix: &str,
    ) -> Result<BootstrapOutcome, KeyError> {
        let dir = root.join(DEVICE_KEYS_DIR).join(device);
        let identity = identity(prefix, KeyRole::DeviceSigning, Some(device), email);
        ensure_key(
            root,
            &dir,
            KeyRole::DeviceSigning,
            identity,
            policy,
            Some(device.to_string()),
        )
    }
}

fn ensure_key(
    root: &Path,
    dir: &Path,
    role: KeyRole,
    identity: String,
    policy: &KeyPolicy,
    model: Option<String>,
) -> Result<BootstrapOutcome, KeyError> {
    if let Some(existing) = KeyMaterial::load(dir)? {
        info!("{role} key already exists: {}", existing.meta.identity);
        return Ok(BootstrapOutcome {
            role,
            device: model,
            identity: existing.meta.identity.clone(),
            fingerprint: existing.meta.fingerprint.clone(),
            action: BootstrapAction::Existing,
        });
    }

    let validity = validity_days(role, policy).map(|days| TimeDelta::days(i64::from(days)));
    let mut key = KeyMaterial::generate(role, identity, Utc::now(), validity, model.clone());
    if let Some(parent_role) = role.parent() {
        let parent_dir = root.join(parent_role.dir_name());
        let parent = KeyMaterial::load(&parent_dir)?
            .ok_or_else(|| KeyError::MissingKey(parent_role.to_string()))?;
        key.certify_with(&parent);
    }
    key.save(dir)?;
    info!("created {role} key {}", key.fingerprint());

    Ok(BootstrapOutcome {
        role,
        device: model,
        identity: key.meta.identity.clone(),
        fingerprint: key.meta.fingerprint.clone(),
        action: BootstrapAction::Created,
    })
}

/// Days of validity; `None` (or zero) never expires.
fn validity_days(role: KeyRole, policy: &KeyPolicy) -> Option<u32> {
    let days = match role {
        KeyRole::ArchiveMaster | KeyRole::ImageMaster => return None,
        KeyRole::ImageSigning => policy.image_signing_days,
        KeyRole::DeviceSigning => policy.device_signing_days,
        KeyRole::Blacklist => policy.blacklist_days,
    };
    (days > 0).then_some(days)
}

fn identity(prefix: &str, role: KeyRole, device: Option<&str>, email: &str) -> String {
    let prefix = prefix.trim();
    let lead = if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix} ")
    };
    match device {
        Some(device) => format!("{lead}{} Key ({device}) <{email}>", role.title()),
        None => format!("{lead}{} Key <{email}>", role.title()),
    }
}
