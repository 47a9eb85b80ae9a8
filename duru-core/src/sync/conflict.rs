//! Last-writer-wins ordering
//!
//! Versions of one entity are ordered by `(updated_at, entity_id,
//! origin_device)`. The id component only matters when versions of
//! different entities are compared; for one entity the device id settles
//! equal timestamps, so every replica picks the same winner.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionKey<'a> {
    pub updated_at: DateTime<Utc>,
    pub entity_id: &'a str,
    pub origin_device: &'a str,
}

impl<'a> VersionKey<'a> {
    pub fn new(updated_at: DateTime<Utc>, entity_id: &'a str, origin_device: &'a str) -> Self {
        Self {
            updated_at,
            entity_id,
            origin_device,
        }
    }
}

impl Ord for VersionKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.updated_at
            .cmp(&other.updated_at)
            .then_with(|| self.entity_id.cmp(other.entity_id))
            .then_with(|| self.origin_device.cmp(other.origin_device))
    }
}

impl PartialOrd for VersionKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Apply the remote version
    RemoteWins,
    /// Keep the local version
    LocalWins,
    /// Same version on both sides
    Identical,
}

pub fn resolve(local: &VersionKey<'_>, remote: &VersionKey<'_>) -> Resolution {
    match remote.cmp(local) {
        Ordering::Greater => Resolution::RemoteWins,
        Ordering::Less => Resolution::LocalWins,
        Ordering::Equal => Resolution::Identical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_later_timestamp_wins() {
        let t = Utc::now();
        let local = VersionKey::new(t, "n1", "dev-a");
        let remote = VersionKey::new(t + Duration::seconds(1), "n1", "dev-b");

        assert_eq!(resolve(&local, &remote), Resolution::RemoteWins);
        assert_eq!(resolve(&remote, &local), Resolution::LocalWins);
    }

    #[test]
    fn test_tie_break_is_symmetric() {
        let t = Utc::now();
        let a = VersionKey::new(t, "n1", "dev-a");
        let b = VersionKey::new(t, "n1", "dev-b");

        // Both replicas agree that dev-b's version wins
        assert_eq!(resolve(&a, &b), Resolution::RemoteWins);
        assert_eq!(resolve(&b, &a), Resolution::LocalWins);
    }

    #[test]
    fn test_entity_id_orders_before_device() {
        let t = Utc::now();
        let a = VersionKey::new(t, "a", "dev-z");
        let b = VersionKey::new(t, "b", "dev-a");
        assert!(a < b);
    }

    #[test]
    fn test_identical_versions() {
        let t = Utc::now();
        let a = VersionKey::new(t, "n1", "dev-a");
        assert_eq!(resolve(&a, &a.clone()), Resolution::Identical);
    }
}
