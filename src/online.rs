//! Online validation against the license authority.
//!
//! One call performs exactly one round trip. Transport failures come back as
//! [`NetworkError`] and no verdict is made up; the caller falls back to the
//! offline path. A successful answer carries fresh terms (the authority may
//! extend a license without reissuing the artifact) and a revocation update.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::NetworkError;
use crate::payload::LicensePayload;
use crate::product::Product;
use crate::revocation::{RevocationEntry, RevocationUpdate};
use crate::verdict::{AuthorityTerms, Verdict, VerdictReason, VerdictSource, VerdictStatus};

/// Request payload for the authority status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityRequest {
    pub product_id: u64,
    pub license_id: String,
}

/// License status as reported by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityStatus {
    Valid,
    Expired,
    Revoked,
    /// Unknown license, or one the authority refuses to honour.
    Invalid,
}

/// Response payload for the authority status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityResponse {
    pub status: AuthorityStatus,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entitlements: BTreeSet<String>,
    #[serde(default)]
    pub revocation_snapshot: RevocationUpdate,
    pub server_time: DateTime<Utc>,
}

/// Transport to the license authority.
#[async_trait]
pub trait AuthorityTransport: Send + Sync {
    async fn check(&self, request: &AuthorityRequest) -> Result<AuthorityResponse, NetworkError>;
}

/// Verdict plus the authority data the manager must commit with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityVerdict {
    pub verdict: Verdict,
    pub revocations: RevocationUpdate,
    pub server_time: DateTime<Utc>,
}

pub struct OnlineValidator {
    transport: Arc<dyn AuthorityTransport>,
}

impl OnlineValidator {
    pub fn new(transport: Arc<dyn AuthorityTransport>) -> Self {
        Self { transport }
    }

    pub async fn validate(
        &self,
        payload: &LicensePayload,
        product: &Product,
    ) -> Result<AuthorityVerdict, NetworkError> {
        let request = AuthorityRequest {
            product_id: product.id(),
            license_id: payload.license_id.clone(),
        };

        let response = self.transport.check(&request).await?;
        debug!(
            license_id = %payload.license_id,
            status = ?response.status,
            "Authority answered"
        );

        Ok(authority_verdict(payload, response))
    }
}

/// Map an authority response to a verdict. Pure.
///
/// A `Revoked` answer also lists the license in the returned revocation
/// update, so the revocation outlives this verdict even when the feed did not
/// carry it.
pub fn authority_verdict(payload: &LicensePayload, response: AuthorityResponse) -> AuthorityVerdict {
    let server_time = response.server_time;
    let mut revocations = response.revocation_snapshot;
    let listed = revocations
        .revoked
        .iter()
        .any(|e| e.license_id == payload.license_id);

    let expired_by_date = response.expires_at.is_some_and(|exp| exp <= server_time);

    let (status, reason) = match response.status {
        AuthorityStatus::Revoked => {
            if !listed {
                revocations.revoked.push(RevocationEntry {
                    license_id: payload.license_id.clone(),
                    revoked_at: server_time,
                });
            }
            (VerdictStatus::Revoked, Some(VerdictReason::RevocationListed))
        }
        _ if listed => (VerdictStatus::Revoked, Some(VerdictReason::RevocationListed)),
        AuthorityStatus::Invalid => (VerdictStatus::Invalid, Some(VerdictReason::AuthorityRejected)),
        AuthorityStatus::Expired => (VerdictStatus::Expired, Some(VerdictReason::LicenseExpired)),
        AuthorityStatus::Valid if expired_by_date => {
            (VerdictStatus::Expired, Some(VerdictReason::LicenseExpired))
        }
        AuthorityStatus::Valid => (VerdictStatus::Valid, None),
    };

    let terms = AuthorityTerms {
        confirmed_at: server_time,
        status,
        expires_at: response.expires_at,
        entitlements: response.entitlements,
    };

    let mut verdict = Verdict::new(status, server_time, VerdictSource::Online)
        .with_valid_until(response.expires_at)
        .with_terms(Some(terms));
    verdict.reason = reason;

    AuthorityVerdict {
        verdict,
        revocations,
        server_time,
    }
}

#[cfg(feature = "http")]
pub use http::HttpAuthority;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use reqwest::Client;
    use std::time::Duration;

    /// Path of the status endpoint, relative to the authority base URL.
    pub const STATUS_PATH: &str = "/api/v1/licenses/status";

    /// JSON-over-HTTPS transport.
    pub struct HttpAuthority {
        client: Client,
        base_url: String,
    }

    impl HttpAuthority {
        pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NetworkError> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| NetworkError::Connect(format!("failed to build HTTP client: {e}")))?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            })
        }

        pub fn status_url(&self) -> String {
            format!("{}{}", self.base_url, STATUS_PATH)
        }
    }

    #[async_trait]
    impl AuthorityTransport for HttpAuthority {
        async fn check(&self, request: &AuthorityRequest) -> Result<AuthorityResponse, NetworkError> {
            let resp = self
                .client
                .post(self.status_url())
                .json(request)
                .send()
                .await?; // → NetworkError::Connect | Timeout

            if !resp.status().is_success() {
                return Err(NetworkError::Status(resp.status().as_u16()));
            }

            resp.json::<AuthorityResponse>()
                .await
                .map_err(|e| NetworkError::Protocol(format!("failed to parse status response: {e}")))
        }
    }
}
