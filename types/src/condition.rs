use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical condition keys.
pub const VOLUME_READY: &str = "storage.volume_ready";
pub const ARCHIVE_READY: &str = "storage.archive_ready";
pub const CONTAINER_READY: &str = "infra.container_ready";
pub const HEALTHY: &str = "policy.healthy";

/// Reasons used by the observer for the storage/infra conditions.
pub mod reason {
    pub const VOLUME_FOUND: &str = "VolumeFound";
    pub const VOLUME_NOT_FOUND: &str = "VolumeNotFound";
    pub const CONTAINER_SERVING: &str = "ContainerServing";
    pub const CONTAINER_NOT_SERVING: &str = "ContainerNotServing";
    pub const ARCHIVE_UPLOADED: &str = "ArchiveUploaded";
    pub const ARCHIVE_CORRUPTED: &str = "ArchiveCorrupted";
    pub const ARCHIVE_EXPIRED: &str = "ArchiveExpired";
    pub const ARCHIVE_NOT_FOUND: &str = "ArchiveNotFound";
    pub const NO_ARCHIVE: &str = "NoArchive";

    // policy.healthy reasons, in evaluation priority order.
    pub const CONTAINER_WITHOUT_VOLUME: &str = "ContainerWithoutVolume";
    pub const ARCHIVE_ACCESS_ERROR: &str = "ArchiveAccessError";
    pub const ALL_CONDITIONS_MET: &str = "AllConditionsMet";
}

/// A named boolean predicate over real resources.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub status: bool,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Unix ms of the last `status` flip. Updating reason/message alone
    /// does not move it.
    pub last_transition_time: i64,
}

/// The condition map persisted as JSONB on the workspace row.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Conditions(pub BTreeMap<String, Condition>);

impl Conditions {
    pub fn get(&self, key: &str) -> Option<&Condition> {
        self.0.get(key)
    }

    /// Status of a condition, false when it was never observed.
    pub fn status(&self, key: &str) -> bool {
        self.0.get(key).map(|c| c.status).unwrap_or(false)
    }

    pub fn reason(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|c| c.reason.as_str())
    }

    /// Upsert a condition, preserving `last_transition_time` unless the
    /// status actually flipped.
    pub fn set(&mut self, key: &str, status: bool, reason: &str, message: &str, now_ms: i64) {
        match self.0.get_mut(key) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now_ms;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => {
                self.0.insert(
                    key.to_string(),
                    Condition {
                        status,
                        reason: reason.to_string(),
                        message: message.to_string(),
                        last_transition_time: now_ms,
                    },
                );
            }
        }
    }

    pub fn volume_ready(&self) -> bool {
        self.status(VOLUME_READY)
    }

    pub fn archive_ready(&self) -> bool {
        self.status(ARCHIVE_READY)
    }

    pub fn container_ready(&self) -> bool {
        self.status(CONTAINER_READY)
    }

    pub fn healthy(&self) -> bool {
        // A workspace with no observations yet is treated as healthy; the
        // observer writes the real verdict on its first pass.
        self.0.get(HEALTHY).map(|c| c.status).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_time_moves_only_on_status_flip() {
        let mut conditions = Conditions::default();
        conditions.set(VOLUME_READY, true, reason::VOLUME_FOUND, "", 1_000);
        assert_eq!(
            conditions.get(VOLUME_READY).unwrap().last_transition_time,
            1_000
        );

        // Same status, later tick: reason refreshed, transition time kept.
        conditions.set(VOLUME_READY, true, reason::VOLUME_FOUND, "", 2_000);
        assert_eq!(
            conditions.get(VOLUME_READY).unwrap().last_transition_time,
            1_000
        );

        conditions.set(VOLUME_READY, false, reason::VOLUME_NOT_FOUND, "", 3_000);
        let c = conditions.get(VOLUME_READY).unwrap();
        assert_eq!(c.last_transition_time, 3_000);
        assert_eq!(c.reason, reason::VOLUME_NOT_FOUND);
    }

    #[test]
    fn unobserved_conditions_default_closed_except_health() {
        let conditions = Conditions::default();
        assert!(!conditions.volume_ready());
        assert!(!conditions.archive_ready());
        assert!(!conditions.container_ready());
        assert!(conditions.healthy());
    }

    #[test]
    fn conditions_round_trip_as_json() {
        let mut conditions = Conditions::default();
        conditions.set(CONTAINER_READY, true, reason::CONTAINER_SERVING, "", 42);
        conditions.set(
            HEALTHY,
            false,
            reason::ARCHIVE_ACCESS_ERROR,
            "archive blob missing",
            43,
        );
        let json = serde_json::to_value(&conditions).unwrap();
        let back: Conditions = serde_json::from_value(json).unwrap();
        assert_eq!(back, conditions);
    }
}
