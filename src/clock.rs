//! Tamper-resistant notion of "now".
//!
//! `TrustClock` wraps a [`Clock`] source and remembers the highest time it has
//! ever observed. A reading that falls behind that high-water mark by more
//! than the configured tolerance is reported as suspected tampering instead of
//! being accepted, so rewinding the system clock cannot stretch a grace
//! window. The rest of the engine never reads the raw system clock.
//!
//! Each resync with the license authority also records how far the local
//! clock is from authority time. That offset is applied to every later
//! reading, so a device clock that simply runs behind is not mistaken for a
//! rewound one.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::errors::LicenseError;
use crate::persistence::Persistence;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.lock() = at;
    }

    /// Move the clock by `by`; negative durations rewind it.
    pub fn advance(&self, by: Duration) {
        let mut guard = self.lock();
        *guard += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// A reading that fell behind the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTamper {
    pub observed: DateTime<Utc>,
    pub high_water: DateTime<Utc>,
}

impl From<ClockTamper> for LicenseError {
    fn from(t: ClockTamper) -> Self {
        LicenseError::ClockTamperSuspected {
            observed: t.observed,
            high_water: t.high_water,
        }
    }
}

/// Outcome of one trust clock reading, as consumed by the validators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockReading {
    Trusted(DateTime<Utc>),
    RolledBack(ClockTamper),
}

impl ClockReading {
    /// Best available notion of "now": the high-water mark on rollback.
    pub fn effective_now(&self) -> DateTime<Utc> {
        match self {
            ClockReading::Trusted(at) => *at,
            ClockReading::RolledBack(t) => t.high_water,
        }
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, ClockReading::RolledBack(_))
    }
}

impl From<Result<DateTime<Utc>, ClockTamper>> for ClockReading {
    fn from(result: Result<DateTime<Utc>, ClockTamper>) -> Self {
        match result {
            Ok(at) => ClockReading::Trusted(at),
            Err(t) => ClockReading::RolledBack(t),
        }
    }
}

#[derive(Debug)]
struct HighWater {
    loaded: bool,
    mark: Option<DateTime<Utc>>,
    /// Authority time minus source time at the last resync.
    offset: Duration,
}

impl Default for HighWater {
    fn default() -> Self {
        Self {
            loaded: false,
            mark: None,
            offset: Duration::zero(),
        }
    }
}

pub struct TrustClock {
    source: Arc<dyn Clock>,
    persistence: Arc<dyn Persistence>,
    tolerance: Duration,
    high_water: tokio::sync::Mutex<HighWater>,
}

impl TrustClock {
    pub fn new(
        source: Arc<dyn Clock>,
        persistence: Arc<dyn Persistence>,
        tolerance: std::time::Duration,
    ) -> Self {
        Self {
            source,
            persistence,
            tolerance: Duration::from_std(tolerance).unwrap_or_else(|_| Duration::zero()),
            high_water: tokio::sync::Mutex::new(HighWater::default()),
        }
    }

    /// Current trusted time, or the tamper condition.
    ///
    /// The source reading is corrected by the last known offset from
    /// authority time. Readings ahead of the high-water mark advance and
    /// persist it. Readings behind it within the tolerance return the mark
    /// itself.
    pub async fn now(&self) -> Result<DateTime<Utc>, ClockTamper> {
        let mut hw = self.high_water.lock().await;
        self.ensure_loaded(&mut hw).await;
        let observed = self.source.now() + hw.offset;

        match hw.mark {
            Some(mark) if observed < mark => {
                if mark - observed <= self.tolerance {
                    debug!(%observed, %mark, "Clock slightly behind high-water mark");
                    Ok(mark)
                } else {
                    warn!(%observed, high_water = %mark, "Clock rollback detected");
                    Err(ClockTamper {
                        observed,
                        high_water: mark,
                    })
                }
            }
            _ => {
                hw.mark = Some(observed);
                self.persist(observed).await;
                Ok(observed)
            }
        }
    }

    pub async fn reading(&self) -> ClockReading {
        self.now().await.into()
    }

    pub async fn high_water(&self) -> Option<DateTime<Utc>> {
        let mut hw = self.high_water.lock().await;
        self.ensure_loaded(&mut hw).await;
        hw.mark
    }

    /// Correction applied to source readings.
    pub async fn offset(&self) -> Duration {
        let mut hw = self.high_water.lock().await;
        self.ensure_loaded(&mut hw).await;
        hw.offset
    }

    /// Raise the mark to at least `at` without reading the clock.
    ///
    /// Used to seed the mark from other evidence of elapsed time, such as the
    /// `checked_at` of a cached verdict.
    pub async fn raise_floor(&self, at: DateTime<Utc>) {
        let mut hw = self.high_water.lock().await;
        self.ensure_loaded(&mut hw).await;
        if hw.mark.map_or(true, |mark| at > mark) {
            hw.mark = Some(at);
            self.persist(at).await;
        }
    }

    /// Replace the mark with authoritative time from the license authority
    /// and record the source clock's offset from it.
    ///
    /// Unlike [`raise_floor`](Self::raise_floor) this may move the mark
    /// backwards, clearing a tamper condition caused by a clock that ran ahead.
    pub async fn resync(&self, server_time: DateTime<Utc>) {
        let mut hw = self.high_water.lock().await;
        hw.loaded = true;

        let offset = server_time - self.source.now();
        if hw.offset != offset {
            debug!(
                offset_ms = offset.num_milliseconds(),
                "Recording clock offset from authority time"
            );
            hw.offset = offset;
            if let Err(e) = self.persistence.store_clock_offset(offset).await {
                warn!(error = %e, "Could not persist clock offset");
            }
        }

        if hw.mark != Some(server_time) {
            debug!(%server_time, previous = ?hw.mark, "Resynchronizing trust clock");
            hw.mark = Some(server_time);
            self.persist(server_time).await;
        }
    }

    async fn ensure_loaded(&self, hw: &mut HighWater) {
        if hw.loaded {
            return;
        }
        match self.persistence.load_high_water_clock().await {
            Ok(stored) => {
                // Keep any mark raised in memory before the first load.
                hw.mark = match (hw.mark, stored) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            Err(e) => warn!(error = %e, "Could not load clock high-water mark"),
        }
        match self.persistence.load_clock_offset().await {
            Ok(Some(offset)) => hw.offset = offset,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not load clock offset"),
        }
        hw.loaded = true;
    }

    async fn persist(&self, at: DateTime<Utc>) {
        if let Err(e) = self.persistence.store_high_water_clock(at).await {
            warn!(error = %e, "Could not persist clock high-water mark");
        }
    }
}
