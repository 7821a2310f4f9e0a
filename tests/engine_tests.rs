mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use common::{valid_response, HangingAuthority, ScriptedAuthority, Vendor};
use sentinel::{
    AuthorityStatus, LicenseError, LicenseManager, MemoryPersistence, MockClock, NetworkError,
    Persistence, RevocationEntry, RevocationSnapshot, Verdict, VerdictReason, VerdictSource,
    VerdictStatus,
};

/// Persistence that refuses every write.
struct ReadOnlyDisk;

#[async_trait]
impl Persistence for ReadOnlyDisk {
    async fn load_cached_verdict(&self, _: u64) -> sentinel::LicenseResult<Option<Verdict>> {
        Ok(None)
    }
    async fn store_cached_verdict(&self, _: u64, _: &Verdict) -> sentinel::LicenseResult<()> {
        Err(LicenseError::PersistenceError("disk is read-only".to_string()))
    }
    async fn load_high_water_clock(&self) -> sentinel::LicenseResult<Option<DateTime<Utc>>> {
        Ok(None)
    }
    async fn store_high_water_clock(&self, _: DateTime<Utc>) -> sentinel::LicenseResult<()> {
        Err(LicenseError::PersistenceError("disk is read-only".to_string()))
    }
    async fn load_revocations(&self, _: u64) -> sentinel::LicenseResult<Option<RevocationSnapshot>> {
        Ok(None)
    }
    async fn store_revocations(
        &self,
        _: u64,
        _: &RevocationSnapshot,
    ) -> sentinel::LicenseResult<()> {
        Err(LicenseError::PersistenceError("disk is read-only".to_string()))
    }
}

fn manager(
    vendor: &Vendor,
    authority: Arc<dyn sentinel::AuthorityTransport>,
    persistence: Arc<dyn Persistence>,
    clock: Arc<MockClock>,
) -> LicenseManager {
    LicenseManager::builder(vendor.product.clone())
        .transport(authority)
        .persistence(persistence)
        .clock(clock)
        .timeout(StdDuration::from_millis(250))
        .build()
        .expect("manager should build")
}

#[tokio::test]
async fn reachable_authority_gives_online_valid() {
    let now = Utc::now();
    let vendor = Vendor::new();
    let mgr = manager(
        &vendor,
        ScriptedAuthority::answering(Ok(valid_response(now))),
        Arc::new(MemoryPersistence::new()),
        Arc::new(MockClock::new(now)),
    );

    let artifact = vendor.sign(&vendor.payload("LIC-E2E-1", now));
    let validation = mgr.validate(&artifact).await.expect("validate failed");

    assert_eq!(validation.verdict.status, VerdictStatus::Valid);
    assert_eq!(validation.verdict.source, VerdictSource::Online);
}

#[tokio::test]
async fn unreachable_authority_without_cache_gives_offline_valid() {
    let now = Utc::now();
    let vendor = Vendor::new();
    let mgr = manager(
        &vendor,
        ScriptedAuthority::unreachable(),
        Arc::new(MemoryPersistence::new()),
        Arc::new(MockClock::new(now)),
    );

    let artifact = vendor.sign(&vendor.payload("LIC-E2E-2", now));
    let validation = mgr.validate(&artifact).await.expect("validate failed");

    assert_eq!(validation.verdict.status, VerdictStatus::Valid);
    assert_eq!(validation.verdict.source, VerdictSource::Offline);
    assert!(mgr.has_entitlement("export"));
}

#[tokio::test]
async fn stale_online_verdict_past_grace_is_expired() {
    let now = Utc::now();
    let vendor = Vendor::new();
    let store = Arc::new(MemoryPersistence::new());
    let issued = now - Duration::days(20);

    // Last successful online check was ten days ago.
    let last_online = now - Duration::days(10);
    let online = sentinel::online::authority_verdict(
        &vendor.payload("LIC-E2E-3", issued),
        valid_response(last_online),
    );
    store
        .store_cached_verdict(vendor.product.id(), &online.verdict)
        .await
        .unwrap();

    let mgr = manager(
        &vendor,
        ScriptedAuthority::unreachable(),
        store,
        Arc::new(MockClock::new(now)),
    );
    let artifact = vendor.sign(&vendor.payload("LIC-E2E-3", issued));
    let validation = mgr.validate(&artifact).await.expect("validate failed");

    assert_eq!(validation.verdict.status, VerdictStatus::Expired);
    assert_eq!(validation.verdict.source, VerdictSource::Offline);
    assert_eq!(validation.verdict.reason, Some(VerdictReason::GraceExhausted));
}

#[tokio::test]
async fn grace_boundary_is_inclusive() {
    let start = Utc::now();
    let vendor = Vendor::new();
    let clock = Arc::new(MockClock::new(start));
    let authority = ScriptedAuthority::answering(Ok(valid_response(start)));
    let mgr = manager(
        &vendor,
        authority.clone(),
        Arc::new(MemoryPersistence::new()),
        clock.clone(),
    );
    let artifact = vendor.sign(&vendor.payload("LIC-GRACE", start - Duration::days(1)));
    mgr.validate(&artifact).await.unwrap();

    authority.set(Err(NetworkError::Timeout));
    clock.set(start + Duration::days(7));
    let at_edge = mgr.validate(&artifact).await.unwrap().verdict;
    assert_eq!(at_edge.status, VerdictStatus::GracePeriod);
    assert_eq!(at_edge.valid_until, Some(start + Duration::days(7)));

    clock.set(start + Duration::days(7) + Duration::seconds(1));
    let past_edge = mgr.validate(&artifact).await.unwrap().verdict;
    assert_eq!(past_edge.status, VerdictStatus::Expired);
}

#[tokio::test]
async fn online_success_overwrites_grace() {
    let start = Utc::now();
    let vendor = Vendor::new();
    let clock = Arc::new(MockClock::new(start));
    let authority = ScriptedAuthority::answering(Ok(valid_response(start)));
    let mgr = manager(
        &vendor,
        authority.clone(),
        Arc::new(MemoryPersistence::new()),
        clock.clone(),
    );
    let artifact = vendor.sign(&vendor.payload("LIC-OVERWRITE", start - Duration::days(1)));
    mgr.validate(&artifact).await.unwrap();

    authority.set(Err(NetworkError::Status(502)));
    clock.advance(Duration::days(6));
    assert_eq!(
        mgr.validate(&artifact).await.unwrap().verdict.status,
        VerdictStatus::GracePeriod
    );

    let back = start + Duration::days(6);
    authority.set(Ok(valid_response(back)));
    let online = mgr.validate(&artifact).await.unwrap().verdict;
    assert_eq!(online.status, VerdictStatus::Valid);
    assert_eq!(online.last_online_check(), Some(back));

    // Grace is measured from the new confirmation.
    authority.set(Err(NetworkError::Timeout));
    clock.advance(Duration::days(5));
    assert_eq!(
        mgr.validate(&artifact).await.unwrap().verdict.status,
        VerdictStatus::GracePeriod
    );
}

#[tokio::test]
async fn timeout_falls_back_offline() {
    let now = Utc::now();
    let vendor = Vendor::new();
    let mgr = manager(
        &vendor,
        Arc::new(HangingAuthority),
        Arc::new(MemoryPersistence::new()),
        Arc::new(MockClock::new(now)),
    );

    let artifact = vendor.sign(&vendor.payload("LIC-SLOW", now));
    let verdict = mgr.validate(&artifact).await.unwrap().verdict;
    assert_eq!(verdict.source, VerdictSource::Offline);
    assert_eq!(verdict.status, VerdictStatus::Valid);
}

#[tokio::test]
async fn clock_rollback_gives_invalid() {
    let start = Utc::now();
    let vendor = Vendor::new();
    let clock = Arc::new(MockClock::new(start));
    let authority = ScriptedAuthority::answering(Ok(valid_response(start)));
    let mgr = manager(
        &vendor,
        authority.clone(),
        Arc::new(MemoryPersistence::new()),
        clock.clone(),
    );
    let artifact = vendor.sign(&vendor.payload("LIC-ROLLBACK", start - Duration::days(1)));
    mgr.validate(&artifact).await.unwrap();

    authority.set(Err(NetworkError::Timeout));
    clock.set(start - Duration::hours(1));
    let verdict = mgr.validate(&artifact).await.unwrap().verdict;

    assert_eq!(verdict.status, VerdictStatus::Invalid);
    assert!(verdict.is_clock_tamper());
    assert_eq!(verdict.checked_at, start);
}

#[tokio::test]
async fn revoked_id_overrides_grace() {
    let start = Utc::now();
    let vendor = Vendor::new();
    let clock = Arc::new(MockClock::new(start));
    let authority = ScriptedAuthority::answering(Ok(valid_response(start)));
    let mgr = manager(
        &vendor,
        authority.clone(),
        Arc::new(MemoryPersistence::new()),
        clock.clone(),
    );

    // A sibling license gets revoked; ours is still fine.
    let artifact = vendor.sign(&vendor.payload("LIC-KEEP", start - Duration::days(1)));
    let mut response = valid_response(start);
    response.revocation_snapshot.revoked.push(RevocationEntry {
        license_id: "LIC-GONE".to_string(),
        revoked_at: start,
    });
    authority.set(Ok(response));
    assert_eq!(
        mgr.validate(&artifact).await.unwrap().verdict.status,
        VerdictStatus::Valid
    );

    // Now ours is revoked as well; the feed carries it while we are online.
    let mut response = valid_response(start + Duration::hours(1));
    response.status = AuthorityStatus::Valid;
    response.revocation_snapshot.revoked.push(RevocationEntry {
        license_id: "LIC-KEEP".to_string(),
        revoked_at: start + Duration::hours(1),
    });
    clock.set(start + Duration::hours(1));
    authority.set(Ok(response));
    assert_eq!(
        mgr.validate(&artifact).await.unwrap().verdict.status,
        VerdictStatus::Revoked
    );

    // Offline inside the grace window: revocation still wins.
    authority.set(Err(NetworkError::Timeout));
    clock.advance(Duration::days(1));
    assert_eq!(
        mgr.validate(&artifact).await.unwrap().verdict.status,
        VerdictStatus::Revoked
    );
}

#[tokio::test]
async fn persistence_failure_is_a_warning() {
    let now = Utc::now();
    let vendor = Vendor::new();
    let mgr = manager(
        &vendor,
        ScriptedAuthority::answering(Ok(valid_response(now))),
        Arc::new(ReadOnlyDisk),
        Arc::new(MockClock::new(now)),
    );

    let artifact = vendor.sign(&vendor.payload("LIC-RO", now));
    let validation = mgr.validate(&artifact).await.expect("validate should not fail");

    assert_eq!(validation.verdict.status, VerdictStatus::Valid);
    let warning = validation.persistence_warning.expect("warning expected");
    assert!(warning.contains("read-only"));
    assert_eq!(mgr.status().unwrap().status, VerdictStatus::Valid);
}

#[tokio::test]
async fn in_memory_verdict_used_when_cache_write_failed() {
    let start = Utc::now();
    let vendor = Vendor::new();
    let clock = Arc::new(MockClock::new(start));
    let authority = ScriptedAuthority::answering(Ok(valid_response(start)));
    let mgr = manager(&vendor, authority.clone(), Arc::new(ReadOnlyDisk), clock.clone());
    let artifact = vendor.sign(&vendor.payload("LIC-RO-2", start - Duration::days(1)));
    mgr.validate(&artifact).await.unwrap();

    authority.set(Err(NetworkError::Timeout));
    clock.advance(Duration::days(2));
    let verdict = mgr.validate(&artifact).await.unwrap().verdict;
    assert_eq!(verdict.status, VerdictStatus::GracePeriod);
}

#[tokio::test]
async fn foreign_artifact_is_rejected() {
    let now = Utc::now();
    let vendor = Vendor::new();
    let impostor = Vendor::new();
    let mgr = manager(
        &vendor,
        ScriptedAuthority::answering(Ok(valid_response(now))),
        Arc::new(MemoryPersistence::new()),
        Arc::new(MockClock::new(now)),
    );

    let artifact = impostor.sign(&impostor.payload("LIC-FAKE", now));
    assert!(matches!(
        mgr.validate(&artifact).await,
        Err(LicenseError::InvalidSignature(_))
    ));
    assert!(mgr.status().is_none());
}

#[tokio::test]
async fn concurrent_validations_share_one_manager() {
    let now = Utc::now();
    let vendor = Vendor::new();
    let mgr = Arc::new(manager(
        &vendor,
        ScriptedAuthority::answering(Ok(valid_response(now))),
        Arc::new(MemoryPersistence::new()),
        Arc::new(MockClock::new(now)),
    ));
    let artifact = Arc::new(vendor.sign(&vendor.payload("LIC-PAR", now)));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let mgr = mgr.clone();
        let artifact = artifact.clone();
        handles.push(tokio::spawn(async move { mgr.validate(&artifact).await }));
    }
    for handle in handles {
        let validation = handle.await.unwrap().unwrap();
        assert_eq!(validation.verdict.status, VerdictStatus::Valid);
    }
    assert_eq!(mgr.status().unwrap().status, VerdictStatus::Valid);
}

#[tokio::test]
async fn authority_refusal_is_not_usable_offline() {
    for (answer, expected) in [
        (AuthorityStatus::Revoked, VerdictStatus::Revoked),
        (AuthorityStatus::Invalid, VerdictStatus::Invalid),
        (AuthorityStatus::Expired, VerdictStatus::Expired),
    ] {
        let start = Utc::now();
        let vendor = Vendor::new();
        let clock = Arc::new(MockClock::new(start));
        let mut response = valid_response(start);
        response.status = answer;
        let authority = ScriptedAuthority::answering(Ok(response));
        let mgr = manager(
            &vendor,
            authority.clone(),
            Arc::new(MemoryPersistence::new()),
            clock.clone(),
        );
        let artifact = vendor.sign(&vendor.payload("LIC-REFUSED", start - Duration::days(1)));

        assert_eq!(mgr.validate(&artifact).await.unwrap().verdict.status, expected);

        authority.set(Err(NetworkError::Timeout));
        clock.advance(Duration::hours(1));
        let verdict = mgr.validate(&artifact).await.unwrap().verdict;

        assert_eq!(verdict.source, VerdictSource::Offline);
        assert_eq!(verdict.status, expected, "{answer:?} after going offline");
        assert!(!verdict.is_usable());
        assert!(!mgr.has_entitlement("export"));
        assert!(!mgr.status().unwrap().is_usable());
    }
}

#[tokio::test]
async fn device_clock_behind_authority_stays_in_grace() {
    let server = Utc::now();
    let vendor = Vendor::new();
    let clock = Arc::new(MockClock::new(server - Duration::minutes(65)));
    let authority = ScriptedAuthority::answering(Ok(valid_response(server)));
    let mgr = manager(
        &vendor,
        authority.clone(),
        Arc::new(MemoryPersistence::new()),
        clock.clone(),
    );
    let artifact = vendor.sign(&vendor.payload("LIC-SKEW", server - Duration::days(1)));
    mgr.validate(&artifact).await.unwrap();

    authority.set(Err(NetworkError::Timeout));
    clock.advance(Duration::hours(1));
    let verdict = mgr.validate(&artifact).await.unwrap().verdict;

    assert_eq!(verdict.status, VerdictStatus::GracePeriod);
    assert!(!verdict.is_clock_tamper());
    assert_eq!(verdict.checked_at, server + Duration::hours(1));
}
