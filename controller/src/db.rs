use anyhow::{Context, Result};
use codehub_types::{
    Conditions, DesiredState, ErrorInfo, HomeCtx, Operation, Phase, Workspace,
};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

/// NOTIFY channel fed by the row-update trigger.
pub const CHANGES_CHANNEL: &str = "workspace_changes";

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                owner_user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                memo TEXT,
                image_ref TEXT NOT NULL,
                instance_backend TEXT NOT NULL DEFAULT 'docker',
                storage_backend TEXT NOT NULL DEFAULT 'docker',
                desired_state TEXT NOT NULL DEFAULT 'PENDING',
                deleted_at BIGINT,
                standby_ttl_seconds BIGINT NOT NULL DEFAULT 300,
                archive_ttl_seconds BIGINT NOT NULL DEFAULT 604800,
                last_access_at BIGINT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                conditions JSONB NOT NULL DEFAULT '{}',
                phase TEXT NOT NULL DEFAULT 'PENDING',
                observed_at BIGINT,
                operation TEXT NOT NULL DEFAULT 'NONE',
                op_started_at BIGINT,
                op_id UUID,
                archive_key TEXT,
                home_ctx JSONB NOT NULL DEFAULT '{}',
                error_info JSONB,
                error_count INT NOT NULL DEFAULT 0
            )
            "#,
            &[],
        )
        .await
        .context("failed to create workspaces table")?;

    // Hot-path partial indexes. Soft-deleted rows are excluded everywhere
    // except the in-flight scan, which must still see their DELETING ops.
    for (name, ddl) in [
        (
            "idx_workspaces_ttl",
            r#"
            CREATE INDEX IF NOT EXISTS idx_workspaces_ttl
            ON workspaces (phase, last_access_at)
            WHERE operation = 'NONE' AND deleted_at IS NULL
            "#,
        ),
        (
            "idx_workspaces_reconcile",
            r#"
            CREATE INDEX IF NOT EXISTS idx_workspaces_reconcile
            ON workspaces (updated_at)
            WHERE phase <> desired_state OR operation <> 'NONE'
            "#,
        ),
        (
            "idx_workspaces_inflight",
            r#"
            CREATE INDEX IF NOT EXISTS idx_workspaces_inflight
            ON workspaces (op_started_at)
            WHERE operation <> 'NONE'
            "#,
        ),
        (
            "idx_workspaces_owner_running",
            r#"
            CREATE INDEX IF NOT EXISTS idx_workspaces_owner_running
            ON workspaces (owner_user_id)
            WHERE (phase = 'RUNNING' OR operation = 'STARTING') AND deleted_at IS NULL
            "#,
        ),
    ] {
        client
            .execute(ddl, &[])
            .await
            .with_context(|| format!("failed to create {name}"))?;
    }

    client
        .execute(
            r#"
            CREATE OR REPLACE FUNCTION workspaces_notify() RETURNS trigger AS $fn$
            DECLARE
                hint TEXT := '';
            BEGIN
                IF NEW.phase IS DISTINCT FROM OLD.phase THEN
                    hint := hint || 'phase,';
                END IF;
                IF NEW.desired_state IS DISTINCT FROM OLD.desired_state THEN
                    hint := hint || 'desired_state,';
                END IF;
                IF NEW.operation IS DISTINCT FROM OLD.operation THEN
                    hint := hint || 'operation,';
                END IF;
                IF NEW.error_info IS DISTINCT FROM OLD.error_info THEN
                    hint := hint || 'error_info,';
                END IF;
                PERFORM pg_notify(
                    'workspace_changes',
                    json_build_object('id', NEW.id, 'hint', rtrim(hint, ','))::text
                );
                RETURN NEW;
            END;
            $fn$ LANGUAGE plpgsql
            "#,
            &[],
        )
        .await
        .context("failed to create notify function")?;

    client
        .execute("DROP TRIGGER IF EXISTS workspaces_notify ON workspaces", &[])
        .await
        .context("failed to drop stale trigger")?;

    client
        .execute(
            r#"
            CREATE TRIGGER workspaces_notify
            AFTER UPDATE ON workspaces
            FOR EACH ROW EXECUTE FUNCTION workspaces_notify()
            "#,
            &[],
        )
        .await
        .context("failed to create update trigger")?;

    tracing::info!("database schema initialized");
    Ok(())
}

const WORKSPACE_COLUMNS: &str = r#"
    id, owner_user_id, name, description, memo, image_ref,
    instance_backend, storage_backend, desired_state, deleted_at,
    standby_ttl_seconds, archive_ttl_seconds, last_access_at,
    created_at, updated_at, conditions, phase, observed_at,
    operation, op_started_at, op_id, archive_key, home_ctx,
    error_info, error_count
"#;

pub fn workspace_from_row(row: &Row) -> Result<Workspace> {
    let desired: String = row.get("desired_state");
    let phase: String = row.get("phase");
    let operation: String = row.get("operation");
    let conditions: serde_json::Value = row.get("conditions");
    let home_ctx: serde_json::Value = row.get("home_ctx");
    let error_info: Option<serde_json::Value> = row.get("error_info");

    Ok(Workspace {
        id: row.get("id"),
        owner_user_id: row.get("owner_user_id"),
        name: row.get("name"),
        description: row.get("description"),
        memo: row.get("memo"),
        image_ref: row.get("image_ref"),
        instance_backend: row.get("instance_backend"),
        storage_backend: row.get("storage_backend"),
        desired_state: desired
            .parse::<DesiredState>()
            .context("bad desired_state column")?,
        deleted_at: row.get("deleted_at"),
        standby_ttl_seconds: row.get("standby_ttl_seconds"),
        archive_ttl_seconds: row.get("archive_ttl_seconds"),
        last_access_at: row.get("last_access_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        conditions: serde_json::from_value::<Conditions>(conditions)
            .context("bad conditions column")?,
        phase: phase.parse::<Phase>().context("bad phase column")?,
        observed_at: row.get("observed_at"),
        operation: operation
            .parse::<Operation>()
            .context("bad operation column")?,
        op_started_at: row.get("op_started_at"),
        op_id: row.get("op_id"),
        archive_key: row.get("archive_key"),
        home_ctx: serde_json::from_value::<HomeCtx>(home_ctx).context("bad home_ctx column")?,
        error_info: error_info
            .map(serde_json::from_value::<ErrorInfo>)
            .transpose()
            .context("bad error_info column")?,
        error_count: row.get("error_count"),
    })
}

pub async fn get_workspace(pool: &Pool, id: Uuid) -> Result<Option<Workspace>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query workspace")?;
    row.as_ref().map(workspace_from_row).transpose()
}

/// Every row that still exists, soft-deleted included. The observer walks
/// this set.
pub async fn list_all(pool: &Pool) -> Result<Vec<Workspace>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces ORDER BY created_at"),
            &[],
        )
        .await
        .context("failed to list workspaces")?;
    rows.iter().map(workspace_from_row).collect()
}

/// Rows the reconciler has work for: diverged or mid-operation.
pub async fn reconcile_candidates(pool: &Pool) -> Result<Vec<Workspace>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {WORKSPACE_COLUMNS} FROM workspaces
                WHERE phase <> desired_state OR operation <> 'NONE'
                ORDER BY updated_at
                "#
            ),
            &[],
        )
        .await
        .context("failed to scan reconcile candidates")?;
    rows.iter().map(workspace_from_row).collect()
}

pub async fn ttl_candidates(pool: &Pool) -> Result<Vec<Workspace>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {WORKSPACE_COLUMNS} FROM workspaces
                WHERE phase IN ('RUNNING', 'STANDBY')
                  AND operation = 'NONE'
                  AND deleted_at IS NULL
                "#
            ),
            &[],
        )
        .await
        .context("failed to scan ttl candidates")?;
    rows.iter().map(workspace_from_row).collect()
}

pub async fn any_operation_in_flight(pool: &Pool) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM workspaces WHERE operation <> 'NONE')",
            &[],
        )
        .await
        .context("failed to check in-flight operations")?;
    Ok(row.get(0))
}

/// Observer write: conditions, phase, observed_at in one statement.
pub async fn write_observation(
    pool: &Pool,
    id: Uuid,
    conditions: &Conditions,
    phase: Phase,
    observed_at: i64,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    let conditions =
        serde_json::to_value(conditions).context("failed to serialize conditions")?;
    client
        .execute(
            r#"
            UPDATE workspaces
            SET conditions = $2, phase = $3, observed_at = $4
            WHERE id = $1
            "#,
            &[&id, &conditions, &phase.as_str(), &observed_at],
        )
        .await
        .context("failed to write observation")?;
    Ok(())
}

/// The single coordination primitive: claim an operation only if the slot
/// is free. Returns false when another reconciler won the race.
pub async fn claim_operation(
    pool: &Pool,
    id: Uuid,
    operation: Operation,
    op_id: Uuid,
    now_ms: i64,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET operation = $2, op_started_at = $3, op_id = $4
            WHERE id = $1 AND operation = 'NONE'
            "#,
            &[&id, &operation.as_str(), &now_ms, &op_id],
        )
        .await
        .context("failed to claim operation")?;
    Ok(updated == 1)
}

/// Progress write guard: only the claim holder may touch the row.
pub async fn persist_archive_key(
    pool: &Pool,
    id: Uuid,
    operation: Operation,
    op_id: Uuid,
    archive_key: &str,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET archive_key = $4
            WHERE id = $1 AND operation = $2 AND op_id = $3
            "#,
            &[&id, &operation.as_str(), &op_id, &archive_key],
        )
        .await
        .context("failed to persist archive key")?;
    Ok(updated == 1)
}

pub async fn persist_restore_marker(
    pool: &Pool,
    id: Uuid,
    operation: Operation,
    op_id: Uuid,
    marker: &str,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET home_ctx = jsonb_set(home_ctx, '{restore_marker}', to_jsonb($4::text))
            WHERE id = $1 AND operation = $2 AND op_id = $3
            "#,
            &[&id, &operation.as_str(), &op_id, &marker],
        )
        .await
        .context("failed to persist restore marker")?;
    Ok(updated == 1)
}

/// Record a failed attempt without giving up the claim. Keeps
/// `policy.healthy` intact because `is_terminal` stays false.
pub async fn record_attempt_failure(
    pool: &Pool,
    id: Uuid,
    operation: Operation,
    op_id: Uuid,
    error: &ErrorInfo,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let error = serde_json::to_value(error).context("failed to serialize error info")?;
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET error_info = $4, error_count = error_count + 1
            WHERE id = $1 AND operation = $2 AND op_id = $3
            "#,
            &[&id, &operation.as_str(), &op_id, &error],
        )
        .await
        .context("failed to record attempt failure")?;
    Ok(updated == 1)
}

/// The terminal ERROR transition: error_info + released claim in one
/// statement. `op_id` is kept as GC protection.
pub async fn fail_operation(
    pool: &Pool,
    id: Uuid,
    operation: Operation,
    op_id: Uuid,
    error: &ErrorInfo,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let error = serde_json::to_value(error).context("failed to serialize error info")?;
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET error_info = $4,
                operation = 'NONE',
                op_started_at = NULL,
                error_count = error_count + 1
            WHERE id = $1 AND operation = $2 AND op_id = $3
            "#,
            &[&id, &operation.as_str(), &op_id, &error],
        )
        .await
        .context("failed to write terminal error")?;
    Ok(updated == 1)
}

/// Successful completion: release the claim, clear error bookkeeping.
/// `op_id` stays behind as GC protection for the archive it may have
/// written.
pub async fn complete_operation(
    pool: &Pool,
    id: Uuid,
    operation: Operation,
    op_id: Uuid,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET operation = 'NONE',
                op_started_at = NULL,
                error_info = NULL,
                error_count = 0
            WHERE id = $1 AND operation = $2 AND op_id = $3
            "#,
            &[&id, &operation.as_str(), &op_id],
        )
        .await
        .context("failed to complete operation")?;
    Ok(updated == 1)
}

/// DELETING completion also drops the archive pointer and op-id so the row
/// derives to DELETED and the GC can reclaim the whole prefix.
pub async fn complete_deleting(
    pool: &Pool,
    id: Uuid,
    op_id: Uuid,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET operation = 'NONE',
                op_started_at = NULL,
                op_id = NULL,
                archive_key = NULL,
                home_ctx = home_ctx - 'restore_marker',
                error_info = NULL,
                error_count = 0
            WHERE id = $1 AND operation = 'DELETING' AND op_id = $2
            "#,
            &[&id, &op_id],
        )
        .await
        .context("failed to complete deletion")?;
    Ok(updated == 1)
}

/// The ARCHIVED -> PENDING step: forget the archive pointer. The objects
/// themselves are deleted by the caller (and swept by GC if that is
/// interrupted, since op_id protection goes with the pointer).
pub async fn release_archive(
    pool: &Pool,
    id: Uuid,
    archive_key: &str,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET archive_key = NULL,
                op_id = NULL,
                home_ctx = home_ctx - 'restore_marker'
            WHERE id = $1 AND operation = 'NONE' AND archive_key = $2
            "#,
            &[&id, &archive_key],
        )
        .await
        .context("failed to release archive")?;
    Ok(updated == 1)
}

/// Admin recovery from ERROR: clear the terminal record; the next
/// observation re-derives a live phase from real conditions.
pub async fn clear_error(pool: &Pool, id: Uuid) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET error_info = NULL, error_count = 0
            WHERE id = $1
            "#,
            &[&id],
        )
        .await
        .context("failed to clear error")?;
    Ok(updated == 1)
}

/// Row snapshot the GC builds its protection set from.
pub struct GcRow {
    pub id: Uuid,
    pub deleted: bool,
    pub healthy: bool,
    pub phase: Phase,
    pub op_id: Option<Uuid>,
    pub archive_key: Option<String>,
}

pub async fn gc_snapshot(pool: &Pool) -> Result<Vec<GcRow>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            r#"
            SELECT id,
                   deleted_at IS NOT NULL AS deleted,
                   COALESCE((conditions -> 'policy.healthy' ->> 'status')::boolean, true) AS healthy,
                   phase,
                   op_id,
                   archive_key
            FROM workspaces
            "#,
            &[],
        )
        .await
        .context("failed to snapshot rows for gc")?;
    rows.iter()
        .map(|row| {
            let phase: String = row.get("phase");
            Ok(GcRow {
                id: row.get("id"),
                deleted: row.get("deleted"),
                healthy: row.get("healthy"),
                phase: phase.parse::<Phase>().context("bad phase column")?,
                op_id: row.get("op_id"),
                archive_key: row.get("archive_key"),
            })
        })
        .collect()
}

/// Final stage of deletion: remove the row once nothing real remains.
pub async fn hard_delete(pool: &Pool, id: Uuid) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let deleted = client
        .execute(
            "DELETE FROM workspaces WHERE id = $1 AND deleted_at IS NOT NULL AND phase = 'DELETED'",
            &[&id],
        )
        .await
        .context("failed to hard-delete workspace")?;
    Ok(deleted == 1)
}

/// Concurrent-RUNNING usage for quota checks: RUNNING rows plus STARTING
/// claims, per owner and global, in one query.
pub async fn running_counts(pool: &Pool, owner_user_id: &str) -> Result<(i64, i64)> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_one(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE owner_user_id = $1) AS owner_count,
                COUNT(*) AS global_count
            FROM workspaces
            WHERE (phase = 'RUNNING' OR operation = 'STARTING')
              AND deleted_at IS NULL
            "#,
            &[&owner_user_id],
        )
        .await
        .context("failed to count running workspaces")?;
    Ok((row.get("owner_count"), row.get("global_count")))
}

/// Fields the API may set at creation time.
pub struct NewWorkspace {
    pub owner_user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub memo: Option<String>,
    pub image_ref: String,
    pub instance_backend: String,
    pub storage_backend: String,
    pub desired_state: DesiredState,
    pub standby_ttl_seconds: i64,
    pub archive_ttl_seconds: i64,
}

pub async fn insert_workspace(pool: &Pool, new: &NewWorkspace, now_ms: i64) -> Result<Workspace> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO workspaces (
                    owner_user_id, name, description, memo, image_ref,
                    instance_backend, storage_backend, desired_state,
                    standby_ttl_seconds, archive_ttl_seconds,
                    last_access_at, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11, $11)
                RETURNING {WORKSPACE_COLUMNS}
                "#
            ),
            &[
                &new.owner_user_id,
                &new.name,
                &new.description,
                &new.memo,
                &new.image_ref,
                &new.instance_backend,
                &new.storage_backend,
                &new.desired_state.as_str(),
                &new.standby_ttl_seconds,
                &new.archive_ttl_seconds,
                &now_ms,
            ],
        )
        .await
        .context("failed to insert workspace")?;
    workspace_from_row(&row)
}

/// Patch the user-facing metadata columns. Only provided fields change.
pub async fn update_meta(
    pool: &Pool,
    id: Uuid,
    name: Option<&str>,
    description: Option<&str>,
    memo: Option<&str>,
    standby_ttl_seconds: Option<i64>,
    archive_ttl_seconds: Option<i64>,
    now_ms: i64,
) -> Result<Option<Workspace>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            &format!(
                r#"
                UPDATE workspaces
                SET name = COALESCE($2, name),
                    description = COALESCE($3, description),
                    memo = COALESCE($4, memo),
                    standby_ttl_seconds = COALESCE($5, standby_ttl_seconds),
                    archive_ttl_seconds = COALESCE($6, archive_ttl_seconds),
                    updated_at = $7
                WHERE id = $1
                RETURNING {WORKSPACE_COLUMNS}
                "#
            ),
            &[
                &id,
                &name,
                &description,
                &memo,
                &standby_ttl_seconds,
                &archive_ttl_seconds,
                &now_ms,
            ],
        )
        .await
        .context("failed to update workspace")?;
    row.as_ref().map(workspace_from_row).transpose()
}

/// The only write path for `desired_state`. Refused while an operation is
/// in flight; the caller surfaces that as a conflict.
pub async fn update_desired_state(
    pool: &Pool,
    id: Uuid,
    desired: DesiredState,
    now_ms: i64,
) -> Result<Option<Workspace>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            &format!(
                r#"
                UPDATE workspaces
                SET desired_state = $2, updated_at = $3
                WHERE id = $1 AND operation = 'NONE'
                RETURNING {WORKSPACE_COLUMNS}
                "#
            ),
            &[&id, &desired.as_str(), &now_ms],
        )
        .await
        .context("failed to update desired state")?;
    row.as_ref().map(workspace_from_row).transpose()
}

/// Soft delete: the marker plus the DELETED desire in one write, refused
/// while an operation is in flight.
pub async fn soft_delete(pool: &Pool, id: Uuid, now_ms: i64) -> Result<Option<Workspace>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            &format!(
                r#"
                UPDATE workspaces
                SET deleted_at = $2, desired_state = 'DELETED', updated_at = $2
                WHERE id = $1 AND operation = 'NONE' AND deleted_at IS NULL
                RETURNING {WORKSPACE_COLUMNS}
                "#
            ),
            &[&id, &now_ms],
        )
        .await
        .context("failed to soft-delete workspace")?;
    row.as_ref().map(workspace_from_row).transpose()
}

pub async fn record_activity(pool: &Pool, id: Uuid, now_ms: i64) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let updated = client
        .execute(
            "UPDATE workspaces SET last_access_at = $2 WHERE id = $1 AND deleted_at IS NULL",
            &[&id, &now_ms],
        )
        .await
        .context("failed to record activity")?;
    Ok(updated == 1)
}

pub async fn list_workspaces(
    pool: &Pool,
    owner_user_id: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Workspace>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = match owner_user_id {
        Some(owner) => {
            client
                .query(
                    &format!(
                        r#"
                        SELECT {WORKSPACE_COLUMNS} FROM workspaces
                        WHERE owner_user_id = $1 AND deleted_at IS NULL
                        ORDER BY created_at DESC
                        LIMIT $2 OFFSET $3
                        "#
                    ),
                    &[&owner, &limit, &offset],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!(
                        r#"
                        SELECT {WORKSPACE_COLUMNS} FROM workspaces
                        WHERE deleted_at IS NULL
                        ORDER BY created_at DESC
                        LIMIT $1 OFFSET $2
                        "#
                    ),
                    &[&limit, &offset],
                )
                .await
        }
    }
    .context("failed to list workspaces")?;
    rows.iter().map(workspace_from_row).collect()
}
