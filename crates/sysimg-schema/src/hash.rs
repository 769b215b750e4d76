use std::io::Read;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// A validated SHA256 digest (64 lowercase hex characters).
///
/// Every checksum in `index.json` goes through this type, so a malformed
/// manifest fails at parse time instead of at comparison time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the hex portion is not exactly 64 ASCII hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let hex = s.strip_prefix("sha256:").unwrap_or(&s);

        if hex.len() != 64 {
            anyhow::bail!(
                "Invalid SHA256 digest: expected 64 hex characters, got {} in '{s}'",
                hex.len(),
            );
        }

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Invalid SHA256 digest: contains non-hex characters in '{s}'");
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Digest of an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Wrap a finished hasher.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Stream a file through SHA256.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::from_hasher(hasher))
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw 32 digest bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Validated at construction, decode cannot fail.
        if let Ok(raw) = hex::decode(&self.0) {
            out.copy_from_slice(&raw);
        }
        out
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// BLAKE3 hash, used for key fingerprints and pool naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blake3Hash(String);

impl Blake3Hash {
    /// Compute BLAKE3 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    /// Get the hash as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `n` hex characters, for short identifiers.
    pub fn short(&self, n: usize) -> &str {
        &self.0[..n.min(self.0.len())]
    }
}

impl std::fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_digest_validation() {
        let valid = "a".repeat(64);
        assert!(Sha256Digest::new(&valid).is_ok());

        let prefixed = format!("sha256:{valid}");
        assert_eq!(Sha256Digest::new(prefixed).unwrap().as_str(), valid);

        assert!(Sha256Digest::new("abc").is_err());
        assert!(Sha256Digest::new("z".repeat(64)).is_err());
    }

    #[test]
    fn test_sha256_digest_normalizes_case() {
        let upper = "ABCDEF".repeat(10) + "ABCD";
        let digest = Sha256Digest::new(upper).unwrap();
        assert_eq!(digest.as_str(), "abcdef".repeat(10) + "abcd");
    }

    #[test]
    fn test_sha256_digest_serde_rejects_invalid() {
        let parsed: Result<Sha256Digest, _> = serde_json::from_str("\"not-a-digest\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_file_digest_matches_bytes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let from_file = Sha256Digest::of_file(tmp.path()).unwrap();
        assert_eq!(from_file, Sha256Digest::of_bytes(b"hello world"));
        assert_eq!(
            from_file.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(from_file.to_bytes()[0], 0xb9);
    }

    #[test]
    fn test_blake3_short() {
        let hash = Blake3Hash::compute(b"key");
        assert_eq!(hash.short(16).len(), 16);
        assert!(hash.as_str().starts_with(hash.short(8)));
    }
}
