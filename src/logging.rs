//! Structured logging for license validation.
//!
//! Validation outcomes are emitted as `tracing` events inside a
//! `license_event` span so hosts can route them with their own subscriber.
//! [`init_logging`] installs a plain `fmt` subscriber for hosts that have none.

use std::sync::OnceLock;

use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::verdict::{Verdict, VerdictStatus};

/// License event types emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseEvent {
    /// Authority confirmed the license
    Validated,
    /// Offline validation inside the grace window
    GracePeriod,
    /// License or grace window ran out
    Expired,
    /// License id is revoked
    Revoked,
    /// Rejected by the authority or the trust clock
    Invalid,
    /// Artifact failed to authenticate
    ValidationFailed,
    /// Authority unreachable, falling back offline
    FallbackOffline,
    /// Cached state could not be read or written
    PersistenceFailed,
}

impl std::fmt::Display for LicenseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LicenseEvent::Validated => "validated",
            LicenseEvent::GracePeriod => "grace_period",
            LicenseEvent::Expired => "expired",
            LicenseEvent::Revoked => "revoked",
            LicenseEvent::Invalid => "invalid",
            LicenseEvent::ValidationFailed => "validation_failed",
            LicenseEvent::FallbackOffline => "fallback_offline",
            LicenseEvent::PersistenceFailed => "persistence_failed",
        };
        write!(f, "{}", s)
    }
}

impl From<VerdictStatus> for LicenseEvent {
    fn from(status: VerdictStatus) -> Self {
        match status {
            VerdictStatus::Valid => LicenseEvent::Validated,
            VerdictStatus::GracePeriod => LicenseEvent::GracePeriod,
            VerdictStatus::Expired => LicenseEvent::Expired,
            VerdictStatus::Revoked => LicenseEvent::Revoked,
            VerdictStatus::Invalid => LicenseEvent::Invalid,
        }
    }
}

impl LicenseEvent {
    fn is_warning(&self) -> bool {
        !matches!(self, LicenseEvent::Validated | LicenseEvent::GracePeriod)
    }
}

/// Log a license event.
///
/// # Arguments
///
/// * `event` - The type of license event
/// * `license_id` - The license ID
/// * `details` - Optional additional details about the event
pub fn log_license_event(event: LicenseEvent, license_id: &str, details: Option<&str>) {
    let span = info_span!(
        "license_event",
        event = %event,
        license_id = %license_id,
    );
    let _enter = span.enter();

    if event.is_warning() {
        if let Some(d) = details {
            warn!(reason = %d, "License event occurred");
        } else {
            warn!("License event occurred");
        }
    } else if let Some(d) = details {
        info!(details = %d, "License event occurred");
    } else {
        info!("License event occurred");
    }
}

/// Log the verdict reached for a license.
pub fn log_verdict(product_id: u64, license_id: &str, verdict: &Verdict) {
    let span = info_span!(
        "license_verdict",
        product_id = product_id,
        source = %verdict.source,
    );
    let _enter = span.enter();

    let reason = verdict.reason.map(|r| format!("{r:?}"));
    log_license_event(verdict.status.into(), license_id, reason.as_deref());
}

static LOGGING_INIT: OnceLock<bool> = OnceLock::new();

/// Install a `tracing-subscriber` fmt subscriber.
///
/// Runs at most once per process. Returns `true` when this call (or an earlier
/// one) installed the subscriber; `false` when logging is disabled or another
/// global subscriber was already set by the host.
pub fn init_logging(config: &LoggingConfig) -> bool {
    *LOGGING_INIT.get_or_init(|| {
        if !config.enabled {
            return false;
        }

        let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .is_ok()
    })
}
