//! Archive garbage collector. Sweeps the object store hourly against a
//! read-consistent protection snapshot of the database, holding every
//! orphan for two hours before deletion so in-flight uploads (30 min, up
//! to 3 attempts) can never be swept mid-write.

use crate::actuator::objectstore::ObjectStore;
use crate::{channels, db, metrics};
use anyhow::{Context, Result};
use codehub_types::{Phase, meta_key, op_prefix, workspace_prefix};
use deadpool_postgres::Pool;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PERIOD: Duration = Duration::from_secs(60 * 60);

/// Orphans must be seen across two sweeps at least this far apart.
pub const ORPHAN_HOLD: Duration = Duration::from_secs(2 * 60 * 60);

/// Orphan marks self-expire well past any plausible sweep gap.
const ORPHAN_MARK_TTL_SECS: u64 = 14 * 24 * 60 * 60;

/// Archive paths the sweep must not delete.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProtectionSet {
    objects: HashSet<String>,
    prefixes: Vec<String>,
}

impl ProtectionSet {
    pub fn is_protected(&self, key: &str) -> bool {
        self.objects.contains(key) || self.prefixes.iter().any(|p| key.starts_with(p))
    }
}

/// One pass over the row snapshot, case-split by priority:
///
/// 1. soft-deleted rows keep their referenced archive object (until the
///    delete operation clears the pointer) but lose op-id protection;
/// 2. unhealthy rows keep both the object and the op-id prefix;
/// 3. any other row with an op-id keeps the prefix.
///
/// A referenced `archive_key` is always protected (with its sidecar):
/// op-id churn from later operations must never expose the blob a live
/// workspace still points at.
pub fn build_protection_set(rows: &[db::GcRow]) -> ProtectionSet {
    let mut set = ProtectionSet::default();
    for row in rows {
        if let Some(key) = &row.archive_key {
            set.objects.insert(key.clone());
            set.objects.insert(meta_key(key));
        }
        if row.deleted {
            // Priority 1: op-id protection is dropped on user delete.
            continue;
        }
        if !row.healthy {
            if let Some(op_id) = row.op_id {
                set.prefixes.push(op_prefix(row.id, op_id));
            }
            continue;
        }
        if let Some(op_id) = row.op_id {
            set.prefixes.push(op_prefix(row.id, op_id));
        }
    }
    set
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepAction {
    /// Protected, or orphaned but still inside the hold window.
    Keep,
    /// Protected again after having been marked: forget the mark.
    Unmark,
    /// First orphan sighting: record the timestamp, touch nothing.
    Mark,
    /// Orphaned across the full hold window: delete.
    Delete,
}

pub fn sweep_action(
    protected: bool,
    first_seen_ms: Option<i64>,
    now_ms: i64,
    hold: Duration,
) -> SweepAction {
    match (protected, first_seen_ms) {
        (true, Some(_)) => SweepAction::Unmark,
        (true, None) => SweepAction::Keep,
        (false, None) => SweepAction::Mark,
        (false, Some(first_seen)) => {
            if now_ms.saturating_sub(first_seen) >= hold.as_millis() as i64 {
                SweepAction::Delete
            } else {
                SweepAction::Keep
            }
        }
    }
}

pub struct ArchiveGc {
    pool: Pool,
    redis: deadpool_redis::Pool,
    store: ObjectStore,
}

impl ArchiveGc {
    pub fn new(pool: Pool, redis: deadpool_redis::Pool, store: ObjectStore) -> Self {
        Self { pool, redis, store }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            if let Err(e) = self.sweep().await {
                tracing::warn!(error = ?e, "gc sweep failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(PERIOD) => {}
            }
        }
    }

    pub async fn sweep(&self) -> Result<()> {
        // Snapshot before listing: anything uploaded after this point
        // belongs to a row the NEXT sweep will protect, and is younger
        // than the hold window anyway.
        let rows = db::gc_snapshot(&self.pool).await?;
        let protection = build_protection_set(&rows);
        let keys = self
            .store
            .list_keys(codehub_types::ARCHIVE_ROOT)
            .await
            .map_err(|e| anyhow::anyhow!("failed to list archives: {e}"))?;

        let now = codehub_common::now_ms();
        let mut deleted = 0usize;
        let mut protected_count = 0usize;
        for key in &keys {
            let protected = protection.is_protected(key);
            if protected {
                protected_count += 1;
            }
            let first_seen = self.orphan_mark(key).await?;
            match sweep_action(protected, first_seen, now, ORPHAN_HOLD) {
                SweepAction::Keep => {}
                SweepAction::Unmark => self.clear_orphan_mark(key).await?,
                SweepAction::Mark => self.set_orphan_mark(key, now).await?,
                SweepAction::Delete => {
                    tracing::info!(%key, "deleting orphaned archive object");
                    self.store
                        .delete(key)
                        .await
                        .map_err(|e| anyhow::anyhow!("failed to delete {key}: {e}"))?;
                    self.clear_orphan_mark(key).await?;
                    deleted += 1;
                }
            }
        }
        metrics::gc_sweep(keys.len(), deleted, protected_count);

        self.hard_delete_drained(&rows, &keys).await?;
        Ok(())
    }

    /// Soft-deleted rows whose phase reached DELETED and whose archive
    /// prefix is empty have nothing real left; drop the row.
    async fn hard_delete_drained(&self, rows: &[db::GcRow], keys: &[String]) -> Result<()> {
        for row in rows {
            if !row.deleted || row.phase != Phase::Deleted {
                continue;
            }
            let prefix = workspace_prefix(row.id);
            if keys.iter().any(|k| k.starts_with(&prefix)) {
                continue;
            }
            if db::hard_delete(&self.pool, row.id).await? {
                tracing::info!(workspace = %row.id, "hard-deleted workspace row");
            }
        }
        Ok(())
    }

    async fn orphan_mark(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.redis.get().await.context("redis unavailable")?;
        Ok(conn.get(channels::orphan_key(key)).await?)
    }

    async fn set_orphan_mark(&self, key: &str, now_ms: i64) -> Result<()> {
        let mut conn = self.redis.get().await.context("redis unavailable")?;
        conn.set_ex::<_, _, ()>(channels::orphan_key(key), now_ms, ORPHAN_MARK_TTL_SECS)
            .await?;
        Ok(())
    }

    async fn clear_orphan_mark(&self, key: &str) -> Result<()> {
        let mut conn = self.redis.get().await.context("redis unavailable")?;
        conn.del::<_, ()>(channels::orphan_key(key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codehub_types::archive_key;
    use uuid::Uuid;

    fn row(
        id: Uuid,
        deleted: bool,
        healthy: bool,
        op_id: Option<Uuid>,
        archive_key: Option<String>,
    ) -> db::GcRow {
        db::GcRow {
            id,
            deleted,
            healthy,
            phase: if deleted { Phase::Deleting } else { Phase::Standby },
            op_id,
            archive_key,
        }
    }

    #[test]
    fn live_rows_protect_pointer_and_op_prefix() {
        let ws = Uuid::new_v4();
        let op_a = Uuid::new_v4();
        let op_b = Uuid::new_v4();
        let key_a = archive_key(ws, op_a);

        // archive_key still points at A's upload while op B (say a later
        // STARTING claim) owns the op_id column.
        let rows = vec![row(ws, false, true, Some(op_b), Some(key_a.clone()))];
        let set = build_protection_set(&rows);

        assert!(set.is_protected(&key_a));
        assert!(set.is_protected(&meta_key(&key_a)));
        assert!(set.is_protected(&archive_key(ws, op_b)));
        // A's prefix is not covered once the pointer is all that remains.
        let stray = format!("archives/{ws}/{op_a}/attempt.tmp");
        assert!(!set.is_protected(&stray));
    }

    #[test]
    fn soft_delete_drops_op_id_protection_but_keeps_the_pointer() {
        let ws = Uuid::new_v4();
        let op = Uuid::new_v4();
        let key = archive_key(ws, op);

        let rows = vec![row(ws, true, false, Some(op), Some(key.clone()))];
        let set = build_protection_set(&rows);

        assert!(set.is_protected(&key));
        // Priority 1 beats priority 2/3: no prefix protection.
        let sibling = format!("archives/{ws}/{op}/other.bin");
        assert!(!set.is_protected(&sibling));
    }

    #[test]
    fn unhealthy_rows_protect_both() {
        let ws = Uuid::new_v4();
        let op = Uuid::new_v4();
        let rows = vec![row(ws, false, false, Some(op), None)];
        let set = build_protection_set(&rows);
        assert!(set.is_protected(&archive_key(ws, op)));
        assert!(set.is_protected(&format!("archives/{ws}/{op}/partial.bin")));
    }

    #[test]
    fn orphans_survive_one_sweep_and_die_after_the_hold() {
        let now = 10_000_000;
        let hold = ORPHAN_HOLD;

        // First sighting: mark only.
        assert_eq!(sweep_action(false, None, now, hold), SweepAction::Mark);

        // Seen again inside the hold: keep.
        let seen = now - (hold.as_millis() as i64) + 1;
        assert_eq!(sweep_action(false, Some(seen), now, hold), SweepAction::Keep);

        // Hold elapsed: delete.
        let seen = now - hold.as_millis() as i64;
        assert_eq!(sweep_action(false, Some(seen), now, hold), SweepAction::Delete);
    }

    #[test]
    fn reprotected_objects_lose_their_mark() {
        let now = 10_000_000;
        assert_eq!(
            sweep_action(true, Some(now - 1), now, ORPHAN_HOLD),
            SweepAction::Unmark
        );
        assert_eq!(sweep_action(true, None, now, ORPHAN_HOLD), SweepAction::Keep);
    }

    /// Scenario: op-id churn from two successive ARCHIVING operations —
    /// the superseded path becomes deletable, the live one never does.
    #[test]
    fn superseded_archive_path_is_reclaimed_on_the_hold_rule() {
        let ws = Uuid::new_v4();
        let op_a = Uuid::new_v4();
        let op_b = Uuid::new_v4();
        let key_a = archive_key(ws, op_a);
        let key_b = archive_key(ws, op_b);

        let rows = vec![row(ws, false, true, Some(op_b), Some(key_b.clone()))];
        let set = build_protection_set(&rows);

        let t0 = 1_000_000;
        // Path A: orphan at t0 — marked, not deleted.
        assert!(!set.is_protected(&key_a));
        assert_eq!(sweep_action(false, None, t0, ORPHAN_HOLD), SweepAction::Mark);
        // Two hours later it goes.
        let t1 = t0 + ORPHAN_HOLD.as_millis() as i64;
        assert_eq!(
            sweep_action(false, Some(t0), t1, ORPHAN_HOLD),
            SweepAction::Delete
        );
        // Path B stays protected through both sweeps.
        assert!(set.is_protected(&key_b));
        assert!(set.is_protected(&meta_key(&key_b)));
    }
}
