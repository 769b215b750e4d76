//! On-disk key material: one directory per key holding `secret.key` and
//! `keyring.json`.

use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sysimg_schema::Blake3Hash;

use super::{KeyError, KeyRole};

const SECRET_FILE: &str = "secret.key";
const KEYRING_FILE: &str = "keyring.json";
const FINGERPRINT_LEN: usize = 40;

/// Public half of a key, as stored in `keyring.json` and shipped in
/// keyring tarballs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringMeta {
    /// Role of the key.
    pub role: KeyRole,
    /// Human-readable identity, e.g. `[ACME] Image Signing <ops@acme.test>`.
    pub identity: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    /// Hex fingerprint of the public key.
    pub fingerprint: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Expiry, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    /// Device a device-signing key is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Fingerprint of the certifying parent key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certified_by: Option<String>,
    /// Base64 signature of the parent key over [`KeyringMeta::certification_message`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certification: Option<String>,
}

impl KeyringMeta {
    /// Bytes a parent key signs to vouch for this key.
    pub fn certification_message(&self) -> Vec<u8> {
        let expires = self
            .expires
            .map_or_else(|| "never".to_string(), |e| e.to_rfc3339());
        format!(
            "sysimg-certify\n{}\n{}\n{}\n{}\n",
            self.role, self.fingerprint, self.public_key, expires
        )
        .into_bytes()
    }

    /// Whether the key has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| now >= expires)
    }
}

/// A loaded key pair.
pub struct KeyMaterial {
    /// Public metadata.
    pub meta: KeyringMeta,
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("role", &self.meta.role)
            .field("identity", &self.meta.identity)
            .field("fingerprint", &self.meta.fingerprint)
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Generate a fresh key. `validity` of `None` never expires.
    pub fn generate(
        role: KeyRole,
        identity: String,
        created: DateTime<Utc>,
        validity: Option<TimeDelta>,
        model: Option<String>,
    ) -> Self {
        let mut secret_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut secret_bytes);
        let signing = SigningKey::from_bytes(&secret_bytes);
        let verifying = signing.verifying_key();

        let meta = KeyringMeta {
            role,
            identity,
            public_key: b64().encode(verifying.to_bytes()),
            fingerprint: fingerprint_of(&verifying),
            created,
            expires: validity.map(|v| created + v),
            model,
            certified_by: None,
            certification: None,
        };
        Self {
            meta,
            signing,
            verifying,
        }
    }

    /// Have `parent` sign this key's certification message.
    pub fn certify_with(&mut self, parent: &KeyMaterial) {
        let signature = parent.sign(&self.meta.certification_message());
        self.meta.certified_by = Some(parent.meta.fingerprint.clone());
        self.meta.certification = Some(b64().encode(signature.to_bytes()));
    }

    /// Whether `parent` really certified this key.
    pub fn is_certified_by(&self, parent: &KeyMaterial) -> bool {
        if self.meta.certified_by.as_deref() != Some(parent.meta.fingerprint.as_str()) {
            return false;
        }
        let Some(encoded) = self.meta.certification.as_deref() else {
            return false;
        };
        let Some(signature) = decode_signature(encoded) else {
            return false;
        };
        parent
            .verifying
            .verify(&self.meta.certification_message(), &signature)
            .is_ok()
    }

    /// Fingerprint of the public key.
    pub fn fingerprint(&self) -> &str {
        &self.meta.fingerprint
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub(crate) fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying.verify(message, signature).is_ok()
    }

    /// Load a key directory. Returns `Ok(None)` if no key lives there.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Malformed`] if the files exist but do not
    /// describe a consistent key pair.
    pub fn load(dir: &Path) -> Result<Option<Self>, KeyError> {
        let keyring_path = dir.join(KEYRING_FILE);
        let secret_path = dir.join(SECRET_FILE);
        if !keyring_path.exists() {
            return Ok(None);
        }
        let malformed = |reason: &str| KeyError::Malformed {
            path: dir.to_path_buf(),
            reason: reason.to_string(),
        };

        let meta: KeyringMeta = serde_json::from_slice(&std::fs::read(&keyring_path)?)?;
        let secret_b64 = std::fs::read_to_string(&secret_path)?;
        let secret = b64()
            .decode(secret_b64.trim())
            .map_err(|_| malformed("secret key is not base64"))?;
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| malformed("secret key must be 32 bytes"))?;

        let signing = SigningKey::from_bytes(&secret);
        let verifying = signing.verifying_key();
        if b64().encode(verifying.to_bytes()) != meta.public_key {
            return Err(malformed("public key does not match secret key"));
        }
        if fingerprint_of(&verifying) != meta.fingerprint {
            return Err(malformed("fingerprint does not match public key"));
        }

        Ok(Some(Self {
            meta,
            signing,
            verifying,
        }))
    }

    /// Write `secret.key` (owner-only) and `keyring.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or files cannot be written.
    pub fn save(&self, dir: &Path) -> Result<(), KeyError> {
        std::fs::create_dir_all(dir)?;
        let secret_path = dir.join(SECRET_FILE);
        std::fs::write(&secret_path, b64().encode(self.signing.to_bytes()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::write(
            dir.join(KEYRING_FILE),
            serde_json::to_vec_pretty(&self.meta)?,
        )?;
        Ok(())
    }

    /// Path of the public keyring file inside a key directory.
    pub fn keyring_path(dir: &Path) -> PathBuf {
        dir.join(KEYRING_FILE)
    }
}

fn fingerprint_of(key: &VerifyingKey) -> String {
    Blake3Hash::compute(key.as_bytes())
        .short(FINGERPRINT_LEN)
        .to_uppercase()
}

pub(crate) fn b64() -> &'static base64::engine::GeneralPurpose {
    &base64::engine::general_purpose::STANDARD
}

pub(crate) fn decode_signature(encoded: &str) -> Option<Signature> {
    let raw = b64().decode(encoded.trim()).ok()?;
    let raw: [u8; 64] = raw.try_into().ok()?;
    Some(Signature::from_bytes(&raw))
}
