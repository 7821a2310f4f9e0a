//! Validation verdicts.
//!
//! A `Verdict` is the engine's current determination of whether a license can
//! be used, together with where that determination came from. Verdicts are
//! values: every validation produces a new one and the previous one is
//! replaced, never edited.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Valid,
    Expired,
    Revoked,
    Invalid,
    /// Offline, but still inside the grace window granted by the license.
    GracePeriod,
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictStatus::Valid => "valid",
            VerdictStatus::Expired => "expired",
            VerdictStatus::Revoked => "revoked",
            VerdictStatus::Invalid => "invalid",
            VerdictStatus::GracePeriod => "grace_period",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Online,
    Offline,
    /// Read back from the cache without a new validation.
    Cached,
}

impl fmt::Display for VerdictSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictSource::Online => "online",
            VerdictSource::Offline => "offline",
            VerdictSource::Cached => "cached",
        };
        f.write_str(s)
    }
}

/// Why a verdict has the status it has, where the status alone is ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    /// The clock moved backwards; the host should prompt for re-synchronization.
    ClockTamperSuspected,
    /// The offline grace window since the last online check is used up.
    GraceExhausted,
    /// The license expiry has been reached.
    LicenseExpired,
    /// The license id is in the revocation snapshot.
    RevocationListed,
    /// The authority does not recognise the license.
    AuthorityRejected,
}

/// The authority's answer from the last completed online check.
///
/// Only an answer with `status == Valid` opens an offline grace window. Any
/// other status is repeated by offline validation until the authority is
/// reached again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityTerms {
    /// Authority time of the answer; offline grace is measured from here.
    pub confirmed_at: DateTime<Utc>,
    pub status: VerdictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entitlements: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    pub source: VerdictSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerdictReason>,
    /// Last authoritative terms; carried forward unchanged by offline verdicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<AuthorityTerms>,
}

impl Verdict {
    pub fn new(status: VerdictStatus, checked_at: DateTime<Utc>, source: VerdictSource) -> Self {
        Self {
            status,
            checked_at,
            valid_until: None,
            source,
            reason: None,
            terms: None,
        }
    }

    pub fn with_valid_until(mut self, valid_until: Option<DateTime<Utc>>) -> Self {
        self.valid_until = valid_until;
        self
    }

    pub fn with_reason(mut self, reason: VerdictReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_terms(mut self, terms: Option<AuthorityTerms>) -> Self {
        self.terms = terms;
        self
    }

    /// True when the host may honour the license's entitlements.
    pub fn is_usable(&self) -> bool {
        matches!(self.status, VerdictStatus::Valid | VerdictStatus::GracePeriod)
    }

    pub fn is_clock_tamper(&self) -> bool {
        self.reason == Some(VerdictReason::ClockTamperSuspected)
    }

    /// Time of the last completed online check, if any.
    pub fn last_online_check(&self) -> Option<DateTime<Utc>> {
        self.terms.as_ref().map(|t| t.confirmed_at)
    }

    /// True when the last completed online check confirmed the license.
    pub fn authority_confirmed(&self) -> bool {
        self.terms
            .as_ref()
            .is_some_and(|t| t.status == VerdictStatus::Valid)
    }

    /// Copy of this verdict as served from the cache.
    pub fn as_cached(&self) -> Self {
        Self {
            source: VerdictSource::Cached,
            ..self.clone()
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.status, self.source, self.checked_at.to_rfc3339())?;
        if let Some(until) = self.valid_until {
            write!(f, ", valid until {}", until.to_rfc3339())?;
        }
        Ok(())
    }
}
