//! The service layer every `desired_state` mutation funnels through: the
//! HTTP front door, the proxy's wake-on-request, the TTL controller, and
//! the operator CLI all call the same methods, preserving the
//! single-writer split.

use crate::db;
use codehub_types::{DesiredState, Workspace};
use deadpool_postgres::Pool;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("workspace not found")]
    NotFound,
    /// Maps to 409 at the HTTP boundary.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Maps to 429 at the HTTP boundary.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Concurrent-RUNNING ceilings, checked before any transition that could
/// add a running workspace.
#[derive(Clone, Copy, Debug)]
pub struct ServiceLimits {
    pub max_running_per_user: i64,
    pub max_running_global: i64,
}

pub struct CreateWorkspace {
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

#[derive(Default)]
pub struct UpdateWorkspace {
    pub name: Option<String>,
    pub description: Option<String>,
    pub memo: Option<String>,
    pub standby_ttl_seconds: Option<i64>,
    pub archive_ttl_seconds: Option<i64>,
    pub desired_state: Option<DesiredState>,
}

pub struct WorkspaceService {
    pool: Pool,
    limits: ServiceLimits,
}

impl WorkspaceService {
    pub fn new(pool: Pool, limits: ServiceLimits) -> Self {
        Self { pool, limits }
    }

    pub async fn create(&self, req: CreateWorkspace) -> ServiceResult<Workspace> {
        if req.name.trim().is_empty() {
            return Err(ServiceError::Invalid("name must not be empty".into()));
        }
        if req.image_ref.trim().is_empty() {
            return Err(ServiceError::Invalid("image_ref must not be empty".into()));
        }
        if req.desired_state == DesiredState::Running {
            self.check_quota(&req.owner_user_id).await?;
        }
        let now = codehub_common::now_ms();
        let new = db::NewWorkspace {
            owner_user_id: req.owner_user_id,
            name: req.name,
            description: req.description,
            memo: req.memo,
            image_ref: req.image_ref,
            instance_backend: req.instance_backend,
            storage_backend: req.storage_backend,
            desired_state: req.desired_state,
            standby_ttl_seconds: req.standby_ttl_seconds,
            archive_ttl_seconds: req.archive_ttl_seconds,
        };
        Ok(db::insert_workspace(&self.pool, &new, now).await?)
    }

    pub async fn get(&self, id: Uuid) -> ServiceResult<Workspace> {
        db::get_workspace(&self.pool, id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    pub async fn list(
        &self,
        owner_user_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> ServiceResult<Vec<Workspace>> {
        if limit <= 0 {
            return Err(ServiceError::Invalid("limit must be positive".into()));
        }
        if offset < 0 {
            return Err(ServiceError::Invalid("offset must be non-negative".into()));
        }
        Ok(db::list_workspaces(&self.pool, owner_user_id, limit.min(1000), offset).await?)
    }

    /// Patch metadata and, when requested, the desired state. The desired
    /// write is the guarded one; metadata changes are never refused.
    pub async fn update(&self, id: Uuid, patch: UpdateWorkspace) -> ServiceResult<Workspace> {
        let now = codehub_common::now_ms();
        let mut current = db::update_meta(
            &self.pool,
            id,
            patch.name.as_deref(),
            patch.description.as_deref(),
            patch.memo.as_deref(),
            patch.standby_ttl_seconds,
            patch.archive_ttl_seconds,
            now,
        )
        .await?
        .ok_or(ServiceError::NotFound)?;

        if let Some(desired) = patch.desired_state
            && desired != current.desired_state
        {
            current = self.set_desired_state(id, desired).await?;
        }
        Ok(current)
    }

    /// Request a new target phase. Refused with a conflict while an
    /// operation is in flight; refused with a quota error when RUNNING
    /// would exceed the concurrent ceilings.
    pub async fn set_desired_state(
        &self,
        id: Uuid,
        desired: DesiredState,
    ) -> ServiceResult<Workspace> {
        let current = self.get(id).await?;
        if current.deleted_at.is_some() && desired != DesiredState::Deleted {
            return Err(ServiceError::Conflict(
                "workspace is being deleted".to_string(),
            ));
        }
        if desired == DesiredState::Running && current.desired_state != DesiredState::Running {
            self.check_quota(&current.owner_user_id).await?;
        }
        let now = codehub_common::now_ms();
        match db::update_desired_state(&self.pool, id, desired, now).await? {
            Some(ws) => Ok(ws),
            None => {
                // The guard lost: either the row is gone or an operation
                // holds the slot.
                match db::get_workspace(&self.pool, id).await? {
                    Some(ws) => Err(ServiceError::Conflict(format!(
                        "operation {} in flight",
                        ws.operation
                    ))),
                    None => Err(ServiceError::NotFound),
                }
            }
        }
    }

    /// Soft delete: marks the row and declares the DELETED desire. Real
    /// resources are torn down by the reconciler; the row disappears once
    /// the GC has drained the archives.
    pub async fn delete(&self, id: Uuid) -> ServiceResult<Workspace> {
        let now = codehub_common::now_ms();
        match db::soft_delete(&self.pool, id, now).await? {
            Some(ws) => Ok(ws),
            None => match db::get_workspace(&self.pool, id).await? {
                Some(ws) if ws.deleted_at.is_some() => Ok(ws),
                Some(ws) => Err(ServiceError::Conflict(format!(
                    "operation {} in flight",
                    ws.operation
                ))),
                None => Err(ServiceError::NotFound),
            },
        }
    }

    /// Proxy activity ping.
    pub async fn record_activity(&self, id: Uuid) -> ServiceResult<()> {
        let now = codehub_common::now_ms();
        if db::record_activity(&self.pool, id, now).await? {
            Ok(())
        } else {
            Err(ServiceError::NotFound)
        }
    }

    /// Manual ERROR recovery: clear the terminal record and the counter;
    /// the next observation re-derives a live phase from real conditions.
    pub async fn reset_error(&self, id: Uuid) -> ServiceResult<()> {
        if db::clear_error(&self.pool, id).await? {
            Ok(())
        } else {
            Err(ServiceError::NotFound)
        }
    }

    async fn check_quota(&self, owner_user_id: &str) -> ServiceResult<()> {
        let (owner, global) = db::running_counts(&self.pool, owner_user_id).await?;
        if owner >= self.limits.max_running_per_user {
            return Err(ServiceError::QuotaExceeded(format!(
                "user already has {owner} running workspaces (max {})",
                self.limits.max_running_per_user
            )));
        }
        if global >= self.limits.max_running_global {
            return Err(ServiceError::QuotaExceeded(format!(
                "{global} workspaces running globally (max {})",
                self.limits.max_running_global
            )));
        }
        Ok(())
    }
}
