//! Error types for the Sentinel validation engine.
//!
//! Only two kinds are fatal to `LicenseManager::validate()`: an artifact that
//! fails authentication and an artifact issued for another product. Network
//! failures trigger the offline path, clock tampering becomes an `Invalid`
//! verdict and persistence failures become a warning on the result.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Transport-level failure while talking to the license authority.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// The round trip did not complete within the configured timeout.
    #[error("authority request timed out")]
    Timeout,
    /// DNS failure, connection refused, TLS failure and similar.
    #[error("could not reach authority: {0}")]
    Connect(String),
    /// The authority answered with a non-success HTTP status.
    #[error("authority returned HTTP status {0}")]
    Status(u16),
    /// The authority answered with a body we could not interpret.
    #[error("unexpected authority response: {0}")]
    Protocol(String),
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if err.is_decode() {
            NetworkError::Protocol(err.to_string())
        } else if let Some(status) = err.status() {
            NetworkError::Status(status.as_u16())
        } else {
            NetworkError::Connect(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum LicenseError {
    /// Tampered, truncated or foreign artifact.
    #[error("invalid license signature: {0}")]
    InvalidSignature(String),

    /// The artifact authenticates but was issued for a different product.
    #[error("license was issued for product {found}, expected product {expected}")]
    ProductMismatch { expected: u64, found: u64 },

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// The system clock reads earlier than the highest time ever observed.
    #[error("clock tamper suspected: clock reads {observed}, highest observed time is {high_water}")]
    ClockTamperSuspected {
        observed: DateTime<Utc>,
        high_water: DateTime<Utc>,
    },

    #[error("persistence error: {0}")]
    PersistenceError(String),

    #[error("invalid product definition: {0}")]
    InvalidProduct(String),

    /// No license has been validated by this manager yet.
    #[error("no license has been validated")]
    NoLicense,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("storage error: {0}")]
    StorageError(#[from] std::io::Error),
}

impl From<serde_json::Error> for LicenseError {
    fn from(err: serde_json::Error) -> Self {
        LicenseError::PersistenceError(format!("serialization failed: {err}"))
    }
}

impl LicenseError {
    /// True for errors that must abort validation without any fallback.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LicenseError::InvalidSignature(_) | LicenseError::ProductMismatch { .. }
        )
    }
}

pub type LicenseResult<T> = Result<T, LicenseError>;
