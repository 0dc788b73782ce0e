//! TTL controller: turns idleness signals into `desired_state` requests.
//! It never mutates `phase` or `operation` — all writes go through the
//! service layer like any other client.

use crate::service::{ServiceError, WorkspaceService};
use crate::{channels, db, metrics};
use anyhow::Result;
use codehub_types::{DesiredState, Operation, Phase, Workspace};
use deadpool_postgres::Pool;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PERIOD: Duration = Duration::from_secs(60);

/// Liveness signals the proxy maintains in Redis for one workspace.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdleSignals {
    /// `ws_conn:{id}`; absent counts as zero.
    pub connections: i64,
    /// Whether `idle_timer:{id}` still exists. Expiry is the idle signal.
    pub idle_timer_present: bool,
}

/// The TTL rule table. Pure so the cadence loop stays trivial.
pub fn ttl_decision(ws: &Workspace, signals: IdleSignals, now_ms: i64) -> Option<DesiredState> {
    if ws.operation != Operation::None {
        return None;
    }
    match ws.phase {
        Phase::Running => {
            (signals.connections == 0 && !signals.idle_timer_present)
                .then_some(DesiredState::Standby)
        }
        Phase::Standby => {
            let ttl_ms = ws.archive_ttl_seconds.saturating_mul(1000);
            (now_ms.saturating_sub(ws.last_access_at) > ttl_ms).then_some(DesiredState::Archived)
        }
        _ => None,
    }
}

pub struct TtlController {
    pool: Pool,
    redis: deadpool_redis::Pool,
    service: Arc<WorkspaceService>,
}

impl TtlController {
    pub fn new(pool: Pool, redis: deadpool_redis::Pool, service: Arc<WorkspaceService>) -> Self {
        Self {
            pool,
            redis,
            service,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(PERIOD) => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = ?e, "ttl tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let now = codehub_common::now_ms();
        for ws in db::ttl_candidates(&self.pool).await? {
            let signals = match self.read_signals(&ws).await {
                Ok(signals) => signals,
                Err(e) => {
                    // Redis is advisory: no signals, no transition.
                    tracing::warn!(workspace = %ws.id, error = ?e, "failed to read idle signals");
                    continue;
                }
            };
            let Some(target) = ttl_decision(&ws, signals, now) else {
                continue;
            };
            tracing::info!(workspace = %ws.id, phase = %ws.phase, %target, "ttl transition");
            match self.service.set_desired_state(ws.id, target).await {
                Ok(_) => metrics::ttl_transition(target.as_str()),
                // Races with a fresh claim or a quota ceiling are expected;
                // the next cadence re-evaluates.
                Err(ServiceError::Conflict(msg)) => {
                    tracing::debug!(workspace = %ws.id, %msg, "ttl transition conflicted")
                }
                Err(ServiceError::QuotaExceeded(msg)) => {
                    tracing::debug!(workspace = %ws.id, %msg, "ttl transition over quota")
                }
                Err(e) => tracing::warn!(workspace = %ws.id, error = ?e, "ttl transition failed"),
            }
        }
        Ok(())
    }

    async fn read_signals(&self, ws: &Workspace) -> Result<IdleSignals> {
        let mut conn = self.redis.get().await?;
        let connections: Option<i64> = conn.get(channels::ws_conn_key(ws.id)).await?;
        let idle_timer_present: bool = conn.exists(channels::idle_timer_key(ws.id)).await?;
        Ok(IdleSignals {
            connections: connections.unwrap_or(0),
            idle_timer_present,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codehub_types::{Conditions, HomeCtx};
    use uuid::Uuid;

    fn workspace(phase: Phase, last_access_at: i64) -> Workspace {
        Workspace {
            id: Uuid::nil(),
            owner_user_id: "u".into(),
            name: "w".into(),
            description: None,
            memo: None,
            image_ref: "img".into(),
            instance_backend: "docker".into(),
            storage_backend: "docker".into(),
            desired_state: DesiredState::Running,
            deleted_at: None,
            standby_ttl_seconds: 300,
            archive_ttl_seconds: 3600,
            last_access_at,
            created_at: 0,
            updated_at: 0,
            conditions: Conditions::default(),
            phase,
            observed_at: None,
            operation: Operation::None,
            op_started_at: None,
            op_id: None,
            archive_key: None,
            home_ctx: HomeCtx::default(),
            error_info: None,
            error_count: 0,
        }
    }

    const IDLE: IdleSignals = IdleSignals {
        connections: 0,
        idle_timer_present: false,
    };

    #[test]
    fn running_goes_standby_only_when_fully_idle() {
        let ws = workspace(Phase::Running, 0);
        assert_eq!(ttl_decision(&ws, IDLE, 10_000), Some(DesiredState::Standby));

        // A live connection holds the workspace up.
        let busy = IdleSignals {
            connections: 2,
            idle_timer_present: false,
        };
        assert_eq!(ttl_decision(&ws, busy, 10_000), None);

        // The grace timer still ticking holds it up too.
        let grace = IdleSignals {
            connections: 0,
            idle_timer_present: true,
        };
        assert_eq!(ttl_decision(&ws, grace, 10_000), None);
    }

    #[test]
    fn standby_archives_after_the_access_ttl() {
        let ws = workspace(Phase::Standby, 1_000_000);
        let ttl_ms = ws.archive_ttl_seconds * 1000;

        assert_eq!(ttl_decision(&ws, IDLE, 1_000_000 + ttl_ms), None);
        assert_eq!(
            ttl_decision(&ws, IDLE, 1_000_000 + ttl_ms + 1),
            Some(DesiredState::Archived)
        );
    }

    #[test]
    fn in_flight_operations_suppress_ttl() {
        let mut ws = workspace(Phase::Running, 0);
        ws.operation = Operation::Stopping;
        assert_eq!(ttl_decision(&ws, IDLE, i64::MAX), None);
    }

    #[test]
    fn other_phases_are_ignored() {
        for phase in [Phase::Pending, Phase::Archived, Phase::Error, Phase::Deleting] {
            let ws = workspace(phase, 0);
            assert_eq!(ttl_decision(&ws, IDLE, i64::MAX), None);
        }
    }
}
