//! Revocation snapshot and checker.
//!
//! Entries are only ever added by merging authority data and only removed when
//! the authority feed prunes them explicitly. An id that is absent from the
//! snapshot is never treated as revoked.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    pub license_id: String,
    pub revoked_at: DateTime<Utc>,
}

/// Revocation data delivered with an authority response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationUpdate {
    #[serde(default)]
    pub revoked: Vec<RevocationEntry>,
    /// Ids the authority explicitly removes from the list.
    #[serde(default)]
    pub pruned: Vec<String>,
}

/// The most recently known set of revoked license ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationSnapshot {
    entries: BTreeMap<String, RevocationEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    synced_at: Option<DateTime<Utc>>,
}

impl RevocationSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = RevocationEntry>) -> Self {
        let mut snapshot = Self::new();
        snapshot.merge(entries);
        snapshot
    }

    pub fn is_revoked(&self, license_id: &str) -> bool {
        self.entries.contains_key(license_id)
    }

    pub fn entry(&self, license_id: &str) -> Option<&RevocationEntry> {
        self.entries.get(license_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    /// The first recorded revocation of an id wins.
    fn merge(&mut self, entries: impl IntoIterator<Item = RevocationEntry>) {
        for entry in entries {
            self.entries
                .entry(entry.license_id.clone())
                .and_modify(|existing| {
                    if entry.revoked_at < existing.revoked_at {
                        existing.revoked_at = entry.revoked_at;
                    }
                })
                .or_insert(entry);
        }
    }

    /// New snapshot with `update` applied; `self` is left untouched.
    pub fn apply(&self, update: &RevocationUpdate, synced_at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        for id in &update.pruned {
            next.entries.remove(id);
        }
        next.merge(update.revoked.iter().cloned());
        next.synced_at = Some(synced_at);
        next
    }
}

/// Shared, thread-safe view of the current revocation snapshot.
#[derive(Debug, Default)]
pub struct RevocationChecker {
    snapshot: RwLock<RevocationSnapshot>,
}

impl RevocationChecker {
    pub fn new(snapshot: RevocationSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn is_revoked(&self, license_id: &str) -> bool {
        self.read().is_revoked(license_id)
    }

    pub fn entry(&self, license_id: &str) -> Option<RevocationEntry> {
        self.read().entry(license_id).cloned()
    }

    pub fn snapshot(&self) -> RevocationSnapshot {
        self.read().clone()
    }

    pub fn replace(&self, snapshot: RevocationSnapshot) {
        let mut guard = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = snapshot;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RevocationSnapshot> {
        // A panic while holding the lock cannot leave a half-written snapshot:
        // writers only swap in a fully built value.
        match self.snapshot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(id: &str, at: DateTime<Utc>) -> RevocationEntry {
        RevocationEntry {
            license_id: id.to_string(),
            revoked_at: at,
        }
    }

    #[test]
    fn unknown_id_is_not_revoked() {
        let checker = RevocationChecker::default();
        assert!(!checker.is_revoked("LIC-1"));
    }

    #[test]
    fn apply_merges_and_prunes_without_touching_original() {
        let now = Utc::now();
        let original = RevocationSnapshot::from_entries([entry("A", now), entry("B", now)]);

        let update = RevocationUpdate {
            revoked: vec![entry("C", now)],
            pruned: vec!["A".to_string()],
        };
        let next = original.apply(&update, now);

        assert!(!next.is_revoked("A"));
        assert!(next.is_revoked("B"));
        assert!(next.is_revoked("C"));
        assert_eq!(next.synced_at(), Some(now));

        assert!(original.is_revoked("A"));
        assert!(!original.is_revoked("C"));
    }

    #[test]
    fn absent_entries_are_not_implicitly_deleted() {
        let now = Utc::now();
        let original = RevocationSnapshot::from_entries([entry("A", now)]);
        let next = original.apply(&RevocationUpdate::default(), now);
        assert!(next.is_revoked("A"));
    }

    #[test]
    fn earliest_revocation_time_is_kept() {
        let now = Utc::now();
        let earlier = now - Duration::days(2);
        let snapshot = RevocationSnapshot::from_entries([entry("A", now)]);
        let next = snapshot.apply(
            &RevocationUpdate {
                revoked: vec![entry("A", earlier)],
                pruned: vec![],
            },
            now,
        );
        assert_eq!(next.entry("A").map(|e| e.revoked_at), Some(earlier));
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn checker_replace_swaps_snapshot() {
        let checker = RevocationChecker::default();
        checker.replace(RevocationSnapshot::from_entries([entry("X", Utc::now())]));
        assert!(checker.is_revoked("X"));
        assert!(checker.entry("X").is_some());
        assert_eq!(checker.snapshot().len(), 1);
    }
}
