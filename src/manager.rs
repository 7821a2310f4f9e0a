//! License manager: the façade hosts talk to.
//!
//! A manager is bound to one [`Product`]. `validate` authenticates an
//! artifact, asks the authority, falls back to offline rules when the
//! authority cannot be reached, persists the verdict and publishes it for
//! cheap reads through [`status`](LicenseManager::status).
//!
//! Managers are shared: [`ManagerRegistry`] hands out one `Arc` per product id
//! and [`license_manager`] does so for the whole process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock, TrustClock};
use crate::config::{get_config, SentinelConfig};
use crate::errors::{LicenseError, LicenseResult, NetworkError};
use crate::logging::{init_logging, log_license_event, log_verdict, LicenseEvent};
use crate::offline::OfflineValidator;
use crate::online::{AuthorityTransport, AuthorityVerdict, OnlineValidator};
use crate::payload::LicensePayload;
use crate::persistence::{FilePersistence, MemoryPersistence, Persistence};
use crate::product::Product;
use crate::revocation::{RevocationChecker, RevocationSnapshot};
use crate::signature::SignatureVerifier;
use crate::verdict::{Verdict, VerdictReason, VerdictStatus};

/// Default bound on one authority round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default rollback tolerance of the trust clock.
pub const DEFAULT_CLOCK_TOLERANCE: Duration = Duration::from_secs(60);

/// Result of one `validate` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub verdict: Verdict,
    /// Set when cached state could not be read or written. The verdict is
    /// still authoritative for this call.
    pub persistence_warning: Option<String>,
}

#[derive(Debug, Default)]
struct Published {
    verdict: Option<Verdict>,
    license: Option<LicensePayload>,
}

pub struct LicenseManager {
    product: Arc<Product>,
    verifier: SignatureVerifier,
    online: OnlineValidator,
    offline: OfflineValidator,
    clock: TrustClock,
    revocations: RevocationChecker,
    persistence: Arc<dyn Persistence>,
    timeout: Duration,
    /// Serialises the read-modify-persist sequence of `validate`.
    session: tokio::sync::Mutex<()>,
    published: RwLock<Published>,
}

impl std::fmt::Debug for LicenseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseManager")
            .field("product", &self.product.id())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LicenseManager {
    pub fn builder(product: impl Into<Arc<Product>>) -> LicenseManagerBuilder {
        LicenseManagerBuilder::new(product.into())
    }

    /// Manager with the default collaborators described by `config`: HTTP
    /// transport, sealed files under the storage directory and the system
    /// clock.
    pub fn from_config(
        product: impl Into<Arc<Product>>,
        config: &SentinelConfig,
    ) -> LicenseResult<Self> {
        let product = product.into();

        let persistence: Arc<dyn Persistence> = match config.storage.resolve_dir() {
            Some(dir) => Arc::new(FilePersistence::new(
                dir.join(product.id().to_string()),
                product.public_key().as_bytes(),
            )),
            None => {
                warn!("No storage directory available, cached verdicts will not survive restarts");
                Arc::new(MemoryPersistence::new())
            }
        };

        let builder = Self::builder(product)
            .persistence(persistence)
            .timeout(config.authority.timeout())
            .clock_tolerance(Duration::from_secs(config.clock.rollback_tolerance_secs));

        #[cfg(feature = "http")]
        let builder = builder.transport(Arc::new(
            crate::online::HttpAuthority::new(config.authority.url.clone(), config.authority.timeout())
                .map_err(|e| LicenseError::ConfigError(e.to_string()))?,
        ));

        builder.build()
    }

    pub fn product(&self) -> &Product {
        &self.product
    }

    /// Validate `artifact` and publish the resulting verdict.
    ///
    /// Fails only for artifacts that do not authenticate or belong to another
    /// product. Network and persistence trouble never fail the call.
    pub async fn validate(&self, artifact: &[u8]) -> LicenseResult<Validation> {
        let payload = match self
            .verifier
            .verify(artifact, self.product.public_key())
        {
            Ok(payload) => payload,
            Err(e) => {
                log_license_event(LicenseEvent::ValidationFailed, "unknown", Some(&e.to_string()));
                return Err(e);
            }
        };

        if payload.product_id != self.product.id() {
            log_license_event(
                LicenseEvent::ValidationFailed,
                &payload.license_id,
                Some("product mismatch"),
            );
            return Err(LicenseError::ProductMismatch {
                expected: self.product.id(),
                found: payload.product_id,
            });
        }

        let session = self.session.lock().await;
        let mut warnings = Vec::new();
        self.refresh_revocations(&mut warnings).await;

        let cached = self.cached_verdict(&mut warnings).await;
        if let Some(previous) = &cached {
            self.clock.raise_floor(previous.checked_at).await;
        }
        let reading = self.clock.reading().await;

        let attempt = match tokio::time::timeout(
            self.timeout,
            self.online.validate(&payload, &self.product),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout),
        };

        let (verdict, snapshot) = match attempt {
            Ok(AuthorityVerdict {
                verdict,
                revocations,
                server_time,
            }) => {
                let snapshot = self.revocations.snapshot().apply(&revocations, server_time);
                let verdict = if snapshot.is_revoked(&payload.license_id) {
                    revoke(verdict)
                } else {
                    verdict
                };
                if let Err(e) = self
                    .persistence
                    .store_revocations(self.product.id(), &snapshot)
                    .await
                {
                    warnings.push(format!("revocation snapshot not stored: {e}"));
                }
                self.clock.resync(server_time).await;
                (verdict, Some(snapshot))
            }
            Err(e) => {
                log_license_event(
                    LicenseEvent::FallbackOffline,
                    &payload.license_id,
                    Some(&e.to_string()),
                );
                let snapshot = self.revocations.snapshot();
                let verdict = self
                    .offline
                    .validate(&payload, cached.as_ref(), &reading, &snapshot);
                (verdict, None)
            }
        };

        if let Err(e) = self
            .persistence
            .store_cached_verdict(self.product.id(), &verdict)
            .await
        {
            warnings.push(format!("verdict not stored: {e}"));
        }

        // Publish. No await from here on, so a dropped call publishes nothing
        // or everything.
        if let Some(snapshot) = snapshot {
            self.revocations.replace(snapshot);
        }
        {
            let mut published = self.write_published();
            published.verdict = Some(verdict.clone());
            published.license = Some(payload.clone());
        }
        drop(session);

        log_verdict(self.product.id(), &payload.license_id, &verdict);
        let persistence_warning = if warnings.is_empty() {
            None
        } else {
            let joined = warnings.join("; ");
            log_license_event(
                LicenseEvent::PersistenceFailed,
                &payload.license_id,
                Some(&joined),
            );
            Some(joined)
        };

        Ok(Validation {
            verdict,
            persistence_warning,
        })
    }

    /// The most recently validated payload, with authority-refreshed terms.
    pub fn license_info(&self) -> LicenseResult<LicensePayload> {
        let published = self.read_published();
        let license = published.license.as_ref().ok_or(LicenseError::NoLicense)?;
        Ok(effective_license(license, published.verdict.as_ref()))
    }

    /// Current verdict, labelled as served from the cache.
    pub fn status(&self) -> Option<Verdict> {
        self.read_published().verdict.as_ref().map(Verdict::as_cached)
    }

    /// True when the current verdict is usable and grants `name`.
    pub fn has_entitlement(&self, name: &str) -> bool {
        let published = self.read_published();
        match (&published.verdict, &published.license) {
            (Some(verdict), Some(license)) if verdict.is_usable() => {
                effective_license(license, Some(verdict)).has_entitlement(name)
            }
            _ => false,
        }
    }

    /// Populate [`status`](Self::status) from persistence, e.g. at startup.
    ///
    /// Does not replace a verdict already produced by `validate`.
    pub async fn load_cached(&self) -> LicenseResult<Option<Verdict>> {
        let _session = self.session.lock().await;
        let mut warnings = Vec::new();
        self.refresh_revocations(&mut warnings).await;

        let stored = self
            .persistence
            .load_cached_verdict(self.product.id())
            .await?;

        if let Some(verdict) = &stored {
            self.clock.raise_floor(verdict.checked_at).await;
            let mut published = self.write_published();
            if published.verdict.is_none() {
                published.verdict = Some(verdict.clone());
            }
        }

        Ok(stored.map(|v| v.as_cached()))
    }

    /// Adopt the persisted revocation snapshot unless the one in memory is
    /// newer.
    ///
    /// Runs at the start of every session, so a snapshot that was stored by a
    /// call dropped before it could publish still takes effect.
    async fn refresh_revocations(&self, warnings: &mut Vec<String>) {
        match self.persistence.load_revocations(self.product.id()).await {
            Ok(Some(stored)) => {
                if stored.synced_at() >= self.revocations.snapshot().synced_at() {
                    debug!(entries = stored.len(), "Loaded revocation snapshot");
                    self.revocations.replace(stored);
                }
            }
            Ok(None) => {}
            Err(e) => warnings.push(format!("revocation snapshot not loaded: {e}")),
        }
    }

    /// Last persisted verdict, or the in-memory one when loading fails.
    async fn cached_verdict(&self, warnings: &mut Vec<String>) -> Option<Verdict> {
        match self.persistence.load_cached_verdict(self.product.id()).await {
            Ok(Some(verdict)) => Some(verdict),
            Ok(None) => self.read_published().verdict.clone(),
            Err(e) => {
                warnings.push(format!("cached verdict not loaded: {e}"));
                self.read_published().verdict.clone()
            }
        }
    }

    fn read_published(&self) -> std::sync::RwLockReadGuard<'_, Published> {
        match self.published.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_published(&self) -> std::sync::RwLockWriteGuard<'_, Published> {
        match self.published.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A revocation on record outranks whatever the authority said this time.
fn revoke(mut verdict: Verdict) -> Verdict {
    verdict.status = VerdictStatus::Revoked;
    verdict.reason = Some(VerdictReason::RevocationListed);
    if let Some(terms) = verdict.terms.as_mut() {
        terms.status = VerdictStatus::Revoked;
    }
    verdict
}

fn effective_license(license: &LicensePayload, verdict: Option<&Verdict>) -> LicensePayload {
    match verdict.and_then(|v| v.terms.as_ref()) {
        Some(terms) if terms.confirmed_at >= license.issued_at => license.with_terms(terms),
        _ => license.clone(),
    }
}

pub struct LicenseManagerBuilder {
    product: Arc<Product>,
    transport: Option<Arc<dyn AuthorityTransport>>,
    persistence: Option<Arc<dyn Persistence>>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    clock_tolerance: Duration,
}

impl LicenseManagerBuilder {
    fn new(product: Arc<Product>) -> Self {
        Self {
            product,
            transport: None,
            persistence: None,
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_TIMEOUT,
            clock_tolerance: DEFAULT_CLOCK_TOLERANCE,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn AuthorityTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to [`MemoryPersistence`].
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn clock_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_tolerance = tolerance;
        self
    }

    pub fn build(self) -> LicenseResult<LicenseManager> {
        let transport = self.transport.ok_or_else(|| {
            LicenseError::ConfigError("no authority transport configured".to_string())
        })?;
        if self.timeout.is_zero() {
            return Err(LicenseError::ConfigError(
                "authority timeout must be greater than 0".to_string(),
            ));
        }
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(MemoryPersistence::new()));

        Ok(LicenseManager {
            clock: TrustClock::new(self.clock, persistence.clone(), self.clock_tolerance),
            product: self.product,
            verifier: SignatureVerifier::new(),
            online: OnlineValidator::new(transport),
            offline: OfflineValidator::new(),
            revocations: RevocationChecker::new(RevocationSnapshot::new()),
            persistence,
            timeout: self.timeout,
            session: tokio::sync::Mutex::new(()),
            published: RwLock::new(Published::default()),
        })
    }
}

/// One shared manager per product id.
#[derive(Debug, Default)]
pub struct ManagerRegistry {
    managers: Mutex<HashMap<u64, Arc<LicenseManager>>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the manager for `product`, building it with `build` on first
    /// access.
    ///
    /// The registry lock is held while `build` runs, so concurrent first
    /// callers wait and then receive the same instance. A failed build leaves
    /// the slot empty for the next caller.
    ///
    /// A product whose id is already registered under a different public key
    /// is rejected with [`LicenseError::InvalidProduct`].
    pub fn get_or_init<F>(&self, product: &Product, build: F) -> LicenseResult<Arc<LicenseManager>>
    where
        F: FnOnce() -> LicenseResult<LicenseManager>,
    {
        let mut managers = match self.managers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(existing) = managers.get(&product.id()) {
            if existing.product().public_key() != product.public_key() {
                warn!(
                    product_id = product.id(),
                    registered = %existing.product().public_key().fingerprint(),
                    requested = %product.public_key().fingerprint(),
                    "Product id already registered with another public key"
                );
                return Err(LicenseError::InvalidProduct(format!(
                    "product {} is already registered with a different public key",
                    product.id()
                )));
            }
            return Ok(existing.clone());
        }

        let manager = Arc::new(build()?);
        debug!(product_id = product.id(), "Created license manager");
        managers.insert(product.id(), manager.clone());
        Ok(manager)
    }

    pub fn get(&self, product_id: u64) -> Option<Arc<LicenseManager>> {
        match self.managers.lock() {
            Ok(guard) => guard.get(&product_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&product_id).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        match self.managers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: OnceLock<ManagerRegistry> = OnceLock::new();

/// Process-wide manager for `product`, built from the global configuration.
pub fn license_manager(product: &Product) -> LicenseResult<Arc<LicenseManager>> {
    let registry = REGISTRY.get_or_init(ManagerRegistry::new);
    registry.get_or_init(product, || {
        let config = get_config()?;
        init_logging(&config.logging);
        LicenseManager::from_config(product.clone(), config)
    })
}
