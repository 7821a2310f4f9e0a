//! Offline validation.
//!
//! Decides a verdict from nothing but the authenticated payload, the last
//! persisted verdict, one trust clock reading and the last synced revocation
//! snapshot. There is no hidden state: identical inputs always give the same
//! verdict.
//!
//! Precedence, highest first:
//!
//! 1. revoked license id → `Revoked`
//! 2. clock rollback → `Invalid` (clock tamper suspected)
//! 3. no online history for this payload → signature alone decides
//!    `Valid` / `Expired` from the payload expiry
//! 4. last authority answer was a refusal → that refusal stands
//! 5. grace window since the last online check used up → `Expired`
//! 6. authoritative expiry reached → `Expired`
//! 7. otherwise → `GracePeriod`

use chrono::{DateTime, Utc};

use crate::clock::ClockReading;
use crate::payload::LicensePayload;
use crate::revocation::RevocationSnapshot;
use crate::verdict::{AuthorityTerms, Verdict, VerdictReason, VerdictSource, VerdictStatus};

#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineValidator;

impl OfflineValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(
        &self,
        payload: &LicensePayload,
        cached: Option<&Verdict>,
        reading: &ClockReading,
        revocations: &RevocationSnapshot,
    ) -> Verdict {
        let now = reading.effective_now();
        // Terms are carried forward even when the verdict is decided early.
        let carried_terms = cached.and_then(|v| v.terms.clone());

        if revocations.is_revoked(&payload.license_id) {
            return offline(VerdictStatus::Revoked, now, carried_terms)
                .with_reason(VerdictReason::RevocationListed);
        }

        if reading.is_rolled_back() {
            return offline(VerdictStatus::Invalid, now, carried_terms)
                .with_reason(VerdictReason::ClockTamperSuspected);
        }

        let terms = match applicable_terms(payload, cached) {
            Some(terms) => terms,
            None => return signature_only(payload, now, carried_terms),
        };

        if terms.status != VerdictStatus::Valid {
            let (status, reason) = match terms.status {
                VerdictStatus::Revoked => (VerdictStatus::Revoked, VerdictReason::RevocationListed),
                VerdictStatus::Expired => (VerdictStatus::Expired, VerdictReason::LicenseExpired),
                _ => (VerdictStatus::Invalid, VerdictReason::AuthorityRejected),
            };
            return offline(status, now, carried_terms)
                .with_valid_until(terms.expires_at)
                .with_reason(reason);
        }

        let elapsed = now - terms.confirmed_at;
        if elapsed < chrono::Duration::zero() {
            // Trusted time earlier than an authority confirmation: the
            // high-water mark was lost or reset.
            return offline(VerdictStatus::Invalid, now, carried_terms)
                .with_reason(VerdictReason::ClockTamperSuspected);
        }

        let grace_ends = terms.confirmed_at + payload.offline_grace();
        if elapsed > payload.offline_grace() {
            return offline(VerdictStatus::Expired, now, carried_terms)
                .with_valid_until(Some(grace_ends))
                .with_reason(VerdictReason::GraceExhausted);
        }

        if let Some(expires_at) = terms.expires_at {
            if now >= expires_at {
                return offline(VerdictStatus::Expired, now, carried_terms)
                    .with_valid_until(Some(expires_at))
                    .with_reason(VerdictReason::LicenseExpired);
            }
        }

        let valid_until = match terms.expires_at {
            Some(expires_at) => expires_at.min(grace_ends),
            None => grace_ends,
        };
        offline(VerdictStatus::GracePeriod, now, carried_terms).with_valid_until(Some(valid_until))
    }
}

fn offline(status: VerdictStatus, now: DateTime<Utc>, terms: Option<AuthorityTerms>) -> Verdict {
    Verdict::new(status, now, VerdictSource::Offline).with_terms(terms)
}

/// Online terms that apply to `payload`, if it has ever been confirmed online.
///
/// A cached verdict older than the payload belongs to an earlier license.
fn applicable_terms<'a>(
    payload: &LicensePayload,
    cached: Option<&'a Verdict>,
) -> Option<&'a AuthorityTerms> {
    let cached = cached?;
    if cached.checked_at < payload.issued_at {
        return None;
    }
    cached
        .terms
        .as_ref()
        .filter(|terms| terms.confirmed_at >= payload.issued_at)
}

fn signature_only(
    payload: &LicensePayload,
    now: DateTime<Utc>,
    terms: Option<AuthorityTerms>,
) -> Verdict {
    let status = if payload.is_expired_at(now) {
        VerdictStatus::Expired
    } else {
        VerdictStatus::Valid
    };
    let verdict = offline(status, now, terms).with_valid_until(payload.expires_at);
    if status == VerdictStatus::Expired {
        verdict.with_reason(VerdictReason::LicenseExpired)
    } else {
        verdict
    }
}
