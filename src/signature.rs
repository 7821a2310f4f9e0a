//! Signature verification for license artifacts.
//!
//! `verify` is a pure function of its inputs: it splits the artifact, checks
//! the Ed25519 trailer against the product's public key and only then parses
//! the payload. Verification is delegated to `ring`, which does not
//! short-circuit on the first differing byte.

use ring::signature::{UnparsedPublicKey, ED25519};

use crate::errors::{LicenseError, LicenseResult};
use crate::payload::{LicensePayload, RawArtifact, SignatureAlgorithm};
use crate::product::PublicKey;

/// Ed25519 public keys are 32 bytes.
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureVerifier;

impl SignatureVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Authenticate `raw_artifact` and return its parsed payload.
    pub fn verify(&self, raw_artifact: &[u8], public_key: &PublicKey) -> LicenseResult<LicensePayload> {
        let raw = RawArtifact::split(raw_artifact)?;

        match SignatureAlgorithm::from_tag(raw.algorithm_tag) {
            Some(SignatureAlgorithm::Ed25519) => {
                verify_ed25519(raw.signed, raw.signature, public_key)?;
            }
            None => {
                return Err(LicenseError::InvalidSignature(format!(
                    "unsupported signature algorithm tag {}",
                    raw.algorithm_tag
                )));
            }
        }

        serde_json::from_slice(raw.payload).map_err(|e| {
            LicenseError::InvalidSignature(format!("signed payload is malformed: {e}"))
        })
    }
}

fn verify_ed25519(message: &[u8], signature: &[u8], public_key: &PublicKey) -> LicenseResult<()> {
    if public_key.as_bytes().len() != ED25519_PUBLIC_KEY_LEN {
        return Err(LicenseError::InvalidSignature(format!(
            "public key must be {ED25519_PUBLIC_KEY_LEN} bytes for Ed25519, got {}",
            public_key.as_bytes().len()
        )));
    }

    UnparsedPublicKey::new(&ED25519, public_key.as_bytes())
        .verify(message, signature)
        .map_err(|_| LicenseError::InvalidSignature("signature does not match".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{LicenseArtifact, FORMAT_VERSION, HEADER_LEN};
    use chrono::{Duration, Utc};
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn keypair() -> Ed25519KeyPair {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap()
    }

    fn public_key(pair: &Ed25519KeyPair) -> PublicKey {
        PublicKey::from_bytes(pair.public_key().as_ref().to_vec()).unwrap()
    }

    fn payload() -> LicensePayload {
        LicensePayload {
            license_id: "LIC-SIG-1".to_string(),
            product_id: 42,
            holder: "Acme Ltd".to_string(),
            issued_at: Utc::now(),
            expires_at: Some(Utc::now() + Duration::days(30)),
            entitlements: ["export".to_string()].into_iter().collect(),
            max_offline_grace_days: 7,
        }
    }

    fn sign(pair: &Ed25519KeyPair, payload: &LicensePayload) -> Vec<u8> {
        let input = LicenseArtifact::signing_input(payload).unwrap();
        let sig = pair.sign(&input);
        LicenseArtifact::assemble(&input, sig.as_ref()).unwrap()
    }

    #[test]
    fn valid_artifact_verifies() {
        let pair = keypair();
        let expected = payload();
        let artifact = sign(&pair, &expected);

        let parsed = SignatureVerifier::new()
            .verify(&artifact, &public_key(&pair))
            .expect("artifact should verify");
        assert_eq!(parsed, expected);
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let pair = keypair();
        let key = public_key(&pair);
        let artifact = sign(&pair, &payload());
        let verifier = SignatureVerifier::new();

        for byte in 0..artifact.len() {
            for bit in 0..8 {
                let mut mutated = artifact.clone();
                mutated[byte] ^= 1 << bit;
                let result = verifier.verify(&mutated, &key);
                assert!(
                    matches!(result, Err(LicenseError::InvalidSignature(_))),
                    "flip of bit {bit} in byte {byte} was accepted"
                );
            }
        }
    }

    #[test]
    fn foreign_key_is_rejected() {
        let artifact = sign(&keypair(), &payload());
        let other = public_key(&keypair());

        assert!(matches!(
            SignatureVerifier::new().verify(&artifact, &other),
            Err(LicenseError::InvalidSignature(_))
        ));
    }

    #[test]
    fn unsupported_algorithm_tag_is_rejected() {
        let pair = keypair();
        let mut input = LicenseArtifact::signing_input(&payload()).unwrap();
        input[5] = 9;
        // Signed correctly, but with a tag the verifier does not know.
        let sig = pair.sign(&input);
        let artifact = LicenseArtifact::assemble(&input, sig.as_ref()).unwrap();

        let err = SignatureVerifier::new()
            .verify(&artifact, &public_key(&pair))
            .unwrap_err();
        assert!(err.to_string().contains("unsupported signature algorithm"));
    }

    #[test]
    fn signed_garbage_payload_is_rejected() {
        let pair = keypair();
        let body = b"not json";
        let mut input = Vec::new();
        input.extend_from_slice(b"SNTL");
        input.push(FORMAT_VERSION);
        input.push(1);
        input.extend_from_slice(&(body.len() as u32).to_be_bytes());
        input.extend_from_slice(body);
        assert_eq!(input.len(), HEADER_LEN + body.len());

        let sig = pair.sign(&input);
        let artifact = LicenseArtifact::assemble(&input, sig.as_ref()).unwrap();

        assert!(matches!(
            SignatureVerifier::new().verify(&artifact, &public_key(&pair)),
            Err(LicenseError::InvalidSignature(_))
        ));
    }

    #[test]
    fn short_public_key_is_rejected() {
        let artifact = sign(&keypair(), &payload());
        let key = PublicKey::from_bytes(vec![1u8; 16]).unwrap();
        assert!(SignatureVerifier::new().verify(&artifact, &key).is_err());
    }
}
