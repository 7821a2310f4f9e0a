//! License payload and the artifact wire format.
//!
//! An artifact is a self-describing byte sequence:
//!
//! ```text
//! offset  size  field
//! 0       4     magic b"SNTL"
//! 4       1     format version
//! 5       1     algorithm tag
//! 6       4     payload length N (big endian)
//! 10      N     payload (JSON)
//! 10+N    64    signature trailer
//! ```
//!
//! The signature covers everything before the trailer, header included.

use std::collections::BTreeSet;

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64_URL};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{LicenseError, LicenseResult};
use crate::verdict::AuthorityTerms;

pub const MAGIC: &[u8; 4] = b"SNTL";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 10;
pub const SIGNATURE_LEN: usize = 64;

/// Signature algorithms understood by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Ed25519,
}

impl SignatureAlgorithm {
    pub fn tag(&self) -> u8 {
        match self {
            SignatureAlgorithm::Ed25519 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(SignatureAlgorithm::Ed25519),
            _ => None,
        }
    }
}

/// Typed license fields carried inside a signed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicensePayload {
    pub license_id: String,
    pub product_id: u64,
    pub holder: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entitlements: BTreeSet<String>,
    #[serde(default)]
    pub max_offline_grace_days: u32,
}

impl LicensePayload {
    /// True once `at` has reached the expiry. Licenses without expiry never expire.
    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| at >= expires)
    }

    pub fn has_entitlement(&self, name: &str) -> bool {
        self.entitlements.contains(name)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::days(i64::from(self.max_offline_grace_days))
    }

    /// Copy of this payload with the authority's current terms applied.
    ///
    /// The authority may extend expiry or change entitlements without
    /// reissuing the artifact.
    pub fn with_terms(&self, terms: &AuthorityTerms) -> Self {
        Self {
            expires_at: terms.expires_at,
            entitlements: terms.entitlements.clone(),
            ..self.clone()
        }
    }
}

/// Helpers for building and decoding artifacts.
pub struct LicenseArtifact;

impl LicenseArtifact {
    /// Bytes an external signer must sign for `payload`.
    pub fn signing_input(payload: &LicensePayload) -> LicenseResult<Vec<u8>> {
        let body = serde_json::to_vec(payload).map_err(|e| {
            LicenseError::InvalidSignature(format!("payload cannot be serialized: {e}"))
        })?;
        let len = u32::try_from(body.len()).map_err(|_| {
            LicenseError::InvalidSignature("payload exceeds the artifact size limit".to_string())
        })?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.push(SignatureAlgorithm::Ed25519.tag());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Append the detached signature to a signing input.
    pub fn assemble(signing_input: &[u8], signature: &[u8]) -> LicenseResult<Vec<u8>> {
        if signature.len() != SIGNATURE_LEN {
            return Err(LicenseError::InvalidSignature(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                signature.len()
            )));
        }
        let mut out = Vec::with_capacity(signing_input.len() + SIGNATURE_LEN);
        out.extend_from_slice(signing_input);
        out.extend_from_slice(signature);
        Ok(out)
    }

    /// Decode an artifact pasted as text.
    ///
    /// Accepts the standard and the URL-safe base64 alphabets.
    pub fn from_text(text: &str) -> LicenseResult<Vec<u8>> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        B64.decode(&compact)
            .or_else(|_| B64_URL.decode(compact.trim_end_matches('=')))
            .map_err(|e| LicenseError::InvalidSignature(format!("artifact is not base64: {e}")))
    }

    pub fn to_text(artifact: &[u8]) -> String {
        B64.encode(artifact)
    }
}

/// An artifact split into its parts. Nothing here is authenticated yet.
#[derive(Debug)]
pub(crate) struct RawArtifact<'a> {
    pub algorithm_tag: u8,
    pub signed: &'a [u8],
    pub payload: &'a [u8],
    pub signature: &'a [u8],
}

impl<'a> RawArtifact<'a> {
    pub(crate) fn split(raw: &'a [u8]) -> LicenseResult<Self> {
        if raw.len() < HEADER_LEN + SIGNATURE_LEN {
            return Err(LicenseError::InvalidSignature(
                "artifact is too short".to_string(),
            ));
        }
        if &raw[..4] != MAGIC {
            return Err(LicenseError::InvalidSignature(
                "artifact has an unknown magic".to_string(),
            ));
        }
        if raw[4] != FORMAT_VERSION {
            return Err(LicenseError::InvalidSignature(format!(
                "unsupported artifact format version {}",
                raw[4]
            )));
        }

        let algorithm_tag = raw[5];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&raw[6..HEADER_LEN]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        let expected = HEADER_LEN
            .checked_add(payload_len)
            .and_then(|n| n.checked_add(SIGNATURE_LEN));
        if expected != Some(raw.len()) {
            return Err(LicenseError::InvalidSignature(
                "artifact length does not match its header".to_string(),
            ));
        }

        let signed_end = HEADER_LEN + payload_len;
        Ok(Self {
            algorithm_tag,
            signed: &raw[..signed_end],
            payload: &raw[HEADER_LEN..signed_end],
            signature: &raw[signed_end..],
        })
    }
}
