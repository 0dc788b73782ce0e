use crate::{Conditions, DesiredState, ErrorInfo, Operation, Phase};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backend-private storage context persisted as JSONB. The core schema
/// never grows backend-specific columns; anything a provider needs to
/// remember lives here.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct HomeCtx {
    /// Set to the archive key once a restore has fully populated the
    /// volume. Equality with `archive_key` is the restore completion
    /// predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_marker: Option<String>,
}

/// One user-owned (container, volume [, archive]) triple — the only
/// first-class entity in the system. Field groups mirror the single-writer
/// split: identity/meta (API), observed (ResourceObserver), operation
/// (OperationController).
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Workspace {
    pub id: Uuid,
    pub owner_user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub memo: Option<String>,
    pub image_ref: String,
    pub instance_backend: String,
    pub storage_backend: String,
    pub desired_state: DesiredState,
    pub deleted_at: Option<i64>,
    pub standby_ttl_seconds: i64,
    pub archive_ttl_seconds: i64,
    pub last_access_at: i64,
    pub created_at: i64,
    pub updated_at: i64,

    pub conditions: Conditions,
    pub phase: Phase,
    pub observed_at: Option<i64>,

    pub operation: Operation,
    pub op_started_at: Option<i64>,
    pub op_id: Option<Uuid>,
    pub archive_key: Option<String>,
    pub home_ctx: HomeCtx,
    pub error_info: Option<ErrorInfo>,
    pub error_count: i32,
}

impl Workspace {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn has_operation(&self) -> bool {
        self.operation != Operation::None
    }

    /// True when the recorded error is terminal; drives the P3 health
    /// predicate and the ERROR phase.
    pub fn has_terminal_error(&self) -> bool {
        self.error_info
            .as_ref()
            .map(|e| e.is_terminal)
            .unwrap_or(false)
    }
}
