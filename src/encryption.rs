//! At-rest sealing for cached engine state.
//!
//! Records are sealed with AES-256-GCM under a key derived from a storage
//! namespace and the product's public key. The GCM tag makes any edit of a
//! stored verdict or clock mark detectable on load.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use rand::rngs::OsRng;
use rand::TryRngCore;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use ring::digest::{Context, SHA256};

use crate::errors::{LicenseError, LicenseResult};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes (96-bit).
pub const NONCE_SIZE: usize = 12;

/// Derive a sealing key for one storage namespace.
///
///   key = SHA256("sentinel_store_v1:" || namespace || ":" || material)
pub fn derive_storage_key(namespace: &str, material: &[u8]) -> [u8; KEY_SIZE] {
    let mut ctx = Context::new(&SHA256);
    ctx.update(b"sentinel_store_v1:");
    ctx.update(namespace.as_bytes());
    ctx.update(b":");
    ctx.update(material);
    let hash = ctx.finish();

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(hash.as_ref());
    key
}

fn random_nonce() -> LicenseResult<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| LicenseError::EncryptionError(format!("nonce generation failed: {e}")))?;
    Ok(nonce)
}

/// Seal bytes with AES-256-GCM.
///
/// Output format:
///   [nonce (12 bytes)] || [ciphertext+tag]
pub fn seal(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> LicenseResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let nonce_bytes = random_nonce()?;
    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| LicenseError::EncryptionError(format!("encryption failed: {e}")))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.append(&mut ciphertext);
    Ok(output)
}

/// Open bytes produced by [`seal`].
pub fn open(sealed: &[u8], key: &[u8; KEY_SIZE]) -> LicenseResult<Vec<u8>> {
    if sealed.len() <= NONCE_SIZE {
        return Err(LicenseError::DecryptionError(
            "sealed record too short".to_string(),
        ));
    }

    let (nonce_bytes, ct) = sealed.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ct)
        .map_err(|e| LicenseError::DecryptionError(format!("decryption failed: {e}")))
}

/// Seal bytes and return a Base64 string.
pub fn seal_to_base64(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> LicenseResult<String> {
    Ok(B64.encode(seal(plaintext, key)?))
}

/// Open a Base64 record previously produced by [`seal_to_base64`].
pub fn open_from_base64(sealed_b64: &str, key: &[u8; KEY_SIZE]) -> LicenseResult<Vec<u8>> {
    let decoded = B64
        .decode(sealed_b64.trim())
        .map_err(|e| LicenseError::DecryptionError(format!("base64 decode failed: {e}")))?;
    open(&decoded, key)
}
