//! Armored detached signatures (`<file>.asc`).
//!
//! ```text
//! -----BEGIN SYSIMG SIGNATURE-----
//! Signer: 3F1C...
//!
//! <base64 ed25519 signature over the file's SHA-256 digest>
//! -----END SYSIMG SIGNATURE-----
//! ```

use base64::Engine;
use ed25519_dalek::Signature;

use super::material::{b64, decode_signature};

const BEGIN: &str = "-----BEGIN SYSIMG SIGNATURE-----";
const END: &str = "-----END SYSIMG SIGNATURE-----";
const SIGNER_HEADER: &str = "Signer: ";

/// Detached signature over one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedSignature {
    /// Fingerprint of the signing key.
    pub signer: String,
    /// Ed25519 signature.
    pub signature: Signature,
}

impl DetachedSignature {
    /// Armored text form written to `.asc` files.
    pub fn to_armored(&self) -> String {
        format!(
            "{BEGIN}\n{SIGNER_HEADER}{}\n\n{}\n{END}\n",
            self.signer,
            b64().encode(self.signature.to_bytes())
        )
    }

    /// Parse an armored block; `None` if it is not one.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines().map(str::trim);
        if lines.next()? != BEGIN {
            return None;
        }
        let signer = lines.next()?.strip_prefix(SIGNER_HEADER)?.to_string();
        let body: String = lines
            .take_while(|line| *line != END)
            .filter(|line| !line.is_empty())
            .collect();
        if !text.trim_end().ends_with(END) {
            return None;
        }
        Some(Self {
            signer,
            signature: decode_signature(&body)?,
        })
    }
}
