//! ResourceObserver: turns reality into rows. Probes the actuators, writes
//! conditions and the derived phase, and never touches operation or
//! desired fields.

use crate::actuator::Actuators;
use crate::{db, metrics, planner};
use anyhow::{Context, Result};
use bytes::Bytes;
use codehub_types::{
    ARCHIVE_READY, CONTAINER_READY, HEALTHY, Phase, VOLUME_READY, Workspace, reason,
};
use deadpool_postgres::Pool;
use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Base probe period.
const BASE_PERIOD: Duration = Duration::from_secs(30);
/// Accelerated period while any operation is in flight.
const FAST_PERIOD: Duration = Duration::from_secs(2);
/// Per-tick probe fan-out.
const FANOUT: usize = 10;

pub struct Observer {
    pool: Pool,
    actuators: Arc<Actuators>,
}

impl Observer {
    pub fn new(pool: Pool, actuators: Arc<Actuators>) -> Self {
        Self { pool, actuators }
    }

    /// Loop forever: periodic full sweeps, plus immediate single-workspace
    /// probes whenever a `monitor:trigger` hint arrives.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        mut hints: broadcast::Receiver<Bytes>,
    ) -> Result<()> {
        loop {
            let period = match db::any_operation_in_flight(&self.pool).await {
                Ok(true) => FAST_PERIOD,
                Ok(false) => BASE_PERIOD,
                Err(e) => {
                    tracing::warn!(error = ?e, "observer failed to read in-flight state");
                    BASE_PERIOD
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = self.observe_all().await {
                        tracing::warn!(error = ?e, "observer sweep failed");
                    }
                }
                hint = hints.recv() => match hint {
                    Ok(payload) => {
                        if let Ok(text) = std::str::from_utf8(&payload)
                            && let Ok(id) = text.trim().parse::<Uuid>()
                        {
                            self.observe_id(id).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Hint feed is down; fall back to pure cadence.
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(period) => {
                                if let Err(e) = self.observe_all().await {
                                    tracing::warn!(error = ?e, "observer sweep failed");
                                }
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }
    }

    pub async fn observe_all(&self) -> Result<()> {
        let started = Instant::now();
        let workspaces = db::list_all(&self.pool)
            .await
            .context("failed to list workspaces")?;
        let total = workspaces.len();

        let mut phases: HashMap<Phase, usize> = HashMap::new();
        let mut results = stream::iter(workspaces)
            .map(|ws| async move {
                let id = ws.id;
                let phase = self.observe_one(&ws).await;
                (id, phase)
            })
            .buffer_unordered(FANOUT);
        while let Some((id, phase)) = results.next().await {
            match phase {
                Ok(phase) => *phases.entry(phase).or_default() += 1,
                // A probe failure means "no change this tick" for that
                // workspace; siblings are unaffected.
                Err(e) => tracing::warn!(workspace = %id, error = ?e, "probe failed"),
            }
        }
        for (phase, count) in &phases {
            metrics::phase_count(phase.as_str(), *count);
        }
        metrics::observe_tick(total, started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn observe_id(&self, id: Uuid) {
        match db::get_workspace(&self.pool, id).await {
            Ok(Some(ws)) => {
                if let Err(e) = self.observe_one(&ws).await {
                    tracing::warn!(workspace = %id, error = ?e, "probe failed");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(workspace = %id, error = ?e, "failed to load workspace"),
        }
    }

    /// Probe one workspace and write conditions + phase + observed_at.
    async fn observe_one(&self, ws: &Workspace) -> Result<Phase> {
        let instance = self.actuators.instance(&ws.instance_backend)?;
        let storage = self.actuators.storage(&ws.storage_backend)?;

        let volume = storage.volume_exists(ws.id).await?;
        let running = instance.is_running(ws.id).await?;
        let archive = match &ws.archive_key {
            Some(key) => Some(storage.archive_accessible(key).await?),
            None => None,
        };

        let now = codehub_common::now_ms();
        let mut conditions = ws.conditions.clone();
        conditions.set(
            VOLUME_READY,
            volume,
            if volume {
                reason::VOLUME_FOUND
            } else {
                reason::VOLUME_NOT_FOUND
            },
            "",
            now,
        );
        conditions.set(
            CONTAINER_READY,
            running,
            if running {
                reason::CONTAINER_SERVING
            } else {
                reason::CONTAINER_NOT_SERVING
            },
            "",
            now,
        );
        match &archive {
            Some((ok, why)) => conditions.set(ARCHIVE_READY, *ok, why, "", now),
            None => conditions.set(ARCHIVE_READY, false, reason::NO_ARCHIVE, "", now),
        }

        let terminal = ws
            .error_info
            .as_ref()
            .filter(|e| e.is_terminal)
            .map(|e| e.reason);
        let (healthy, why) = planner::evaluate_health(
            volume,
            running,
            ws.archive_key.is_some(),
            archive.as_ref().map(|(ok, _)| *ok).unwrap_or(false),
            terminal,
        );
        let message = ws
            .error_info
            .as_ref()
            .filter(|e| e.is_terminal)
            .map(|e| e.message.clone())
            .unwrap_or_default();
        conditions.set(HEALTHY, healthy, &why, &message, now);

        let phase = planner::derive_phase(&conditions, ws.is_deleted());

        // Skip the write when nothing moved; observed_at alone is not
        // worth a row version and a NOTIFY.
        if conditions != ws.conditions || phase != ws.phase || ws.observed_at.is_none() {
            db::write_observation(&self.pool, ws.id, &conditions, phase, now).await?;
        }
        Ok(phase)
    }
}
