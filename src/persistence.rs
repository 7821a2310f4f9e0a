//! Persistence collaborator for cached engine state.
//!
//! The engine stores the last verdict per product, the last synced revocation
//! snapshot per product, and the trust clock's high-water mark and offset
//! from authority time. The format is opaque to the engine.
//!
//! ## Implementations
//!
//! **`FilePersistence`**: JSON records sealed with AES-256-GCM, one file per
//! record, written to a temporary file and renamed into place so a reader
//! never observes a partial write.
//!
//! **`MemoryPersistence`**: process-local maps, for hosts that keep state
//! elsewhere and for tests.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::encryption::{derive_storage_key, open_from_base64, seal_to_base64, KEY_SIZE};
use crate::errors::{LicenseError, LicenseResult};
use crate::revocation::RevocationSnapshot;
use crate::verdict::Verdict;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_cached_verdict(&self, product_id: u64) -> LicenseResult<Option<Verdict>>;

    async fn store_cached_verdict(&self, product_id: u64, verdict: &Verdict) -> LicenseResult<()>;

    async fn load_high_water_clock(&self) -> LicenseResult<Option<DateTime<Utc>>>;

    async fn store_high_water_clock(&self, at: DateTime<Utc>) -> LicenseResult<()>;

    /// Authority time minus local time at the last resync.
    async fn load_clock_offset(&self) -> LicenseResult<Option<Duration>> {
        Ok(None)
    }

    async fn store_clock_offset(&self, _offset: Duration) -> LicenseResult<()> {
        Ok(())
    }

    async fn load_revocations(&self, product_id: u64) -> LicenseResult<Option<RevocationSnapshot>>;

    async fn store_revocations(
        &self,
        product_id: u64,
        snapshot: &RevocationSnapshot,
    ) -> LicenseResult<()>;
}

// === In-memory ===

#[derive(Debug, Default)]
struct MemoryState {
    verdicts: HashMap<u64, Verdict>,
    revocations: HashMap<u64, RevocationSnapshot>,
    high_water: Option<DateTime<Utc>>,
    clock_offset: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> LicenseResult<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| LicenseError::PersistenceError("memory store lock poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load_cached_verdict(&self, product_id: u64) -> LicenseResult<Option<Verdict>> {
        self.with_state(|s| s.verdicts.get(&product_id).cloned())
    }

    async fn store_cached_verdict(&self, product_id: u64, verdict: &Verdict) -> LicenseResult<()> {
        self.with_state(|s| {
            s.verdicts.insert(product_id, verdict.clone());
        })
    }

    async fn load_high_water_clock(&self) -> LicenseResult<Option<DateTime<Utc>>> {
        self.with_state(|s| s.high_water)
    }

    async fn store_high_water_clock(&self, at: DateTime<Utc>) -> LicenseResult<()> {
        self.with_state(|s| {
            s.high_water = Some(at);
        })
    }

    async fn load_clock_offset(&self) -> LicenseResult<Option<Duration>> {
        self.with_state(|s| s.clock_offset)
    }

    async fn store_clock_offset(&self, offset: Duration) -> LicenseResult<()> {
        self.with_state(|s| {
            s.clock_offset = Some(offset);
        })
    }

    async fn load_revocations(&self, product_id: u64) -> LicenseResult<Option<RevocationSnapshot>> {
        self.with_state(|s| s.revocations.get(&product_id).cloned())
    }

    async fn store_revocations(
        &self,
        product_id: u64,
        snapshot: &RevocationSnapshot,
    ) -> LicenseResult<()> {
        self.with_state(|s| {
            s.revocations.insert(product_id, snapshot.clone());
        })
    }
}

// === Sealed files ===

const CLOCK_FILE: &str = "clock.enc";
const CLOCK_OFFSET_FILE: &str = "clock-offset.enc";

#[derive(Debug, Serialize, Deserialize)]
struct ClockRecord {
    high_water: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClockOffsetRecord {
    offset_ms: i64,
}

/// Sealed, file-backed persistence rooted at one directory.
pub struct FilePersistence {
    dir: PathBuf,
    key: [u8; KEY_SIZE],
}

impl FilePersistence {
    /// `key_material` binds the sealing key to the installation, usually the
    /// product's public key.
    pub fn new(dir: impl Into<PathBuf>, key_material: &[u8]) -> Self {
        let dir = dir.into();
        let key = derive_storage_key(&dir.to_string_lossy(), key_material);
        Self { dir, key }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn verdict_file(product_id: u64) -> String {
        format!("verdict-{product_id}.enc")
    }

    fn revocations_file(product_id: u64) -> String {
        format!("revocations-{product_id}.enc")
    }

    async fn write_record<T: Serialize>(&self, name: &str, record: &T) -> LicenseResult<()> {
        let json = serde_json::to_vec(record)?;
        let sealed = seal_to_base64(&json, &self.key)?;

        fs::create_dir_all(&self.dir).await?;

        let target = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, sealed).await?;
        fs::rename(&tmp, &target).await?;

        log::debug!("Stored {} in {}", name, self.dir.display());
        Ok(())
    }

    async fn read_record<T: DeserializeOwned>(&self, name: &str) -> LicenseResult<Option<T>> {
        let path = self.dir.join(name);
        let sealed = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("No stored {} in {}", name, self.dir.display());
                return Ok(None);
            }
            Err(e) => return Err(LicenseError::StorageError(e)),
        };

        let json = open_from_base64(&sealed, &self.key).map_err(|e| {
            LicenseError::PersistenceError(format!("stored {name} cannot be opened: {e}"))
        })?;

        serde_json::from_slice(&json).map(Some).map_err(|e| {
            LicenseError::PersistenceError(format!("stored {name} is malformed: {e}"))
        })
    }

    /// Remove every record in the directory (no-op for missing files).
    pub async fn clear(&self, product_id: u64) -> LicenseResult<()> {
        for name in [
            Self::verdict_file(product_id),
            Self::revocations_file(product_id),
            CLOCK_FILE.to_string(),
            CLOCK_OFFSET_FILE.to_string(),
        ] {
            match fs::remove_file(self.dir.join(&name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(LicenseError::StorageError(e)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn load_cached_verdict(&self, product_id: u64) -> LicenseResult<Option<Verdict>> {
        self.read_record(&Self::verdict_file(product_id)).await
    }

    async fn store_cached_verdict(&self, product_id: u64, verdict: &Verdict) -> LicenseResult<()> {
        self.write_record(&Self::verdict_file(product_id), verdict)
            .await
    }

    async fn load_high_water_clock(&self) -> LicenseResult<Option<DateTime<Utc>>> {
        let record: Option<ClockRecord> = self.read_record(CLOCK_FILE).await?;
        Ok(record.map(|r| r.high_water))
    }

    async fn store_high_water_clock(&self, at: DateTime<Utc>) -> LicenseResult<()> {
        self.write_record(CLOCK_FILE, &ClockRecord { high_water: at })
            .await
    }

    async fn load_clock_offset(&self) -> LicenseResult<Option<Duration>> {
        let record: Option<ClockOffsetRecord> = self.read_record(CLOCK_OFFSET_FILE).await?;
        Ok(record.map(|r| Duration::milliseconds(r.offset_ms)))
    }

    async fn store_clock_offset(&self, offset: Duration) -> LicenseResult<()> {
        let record = ClockOffsetRecord {
            offset_ms: offset.num_milliseconds(),
        };
        self.write_record(CLOCK_OFFSET_FILE, &record).await
    }

    async fn load_revocations(&self, product_id: u64) -> LicenseResult<Option<RevocationSnapshot>> {
        self.read_record(&Self::revocations_file(product_id)).await
    }

    async fn store_revocations(
        &self,
        product_id: u64,
        snapshot: &RevocationSnapshot,
    ) -> LicenseResult<()> {
        self.write_record(&Self::revocations_file(product_id), snapshot)
            .await
    }
}
