//! OperationController: reconciles `phase -> desired_state` by selecting,
//! claiming, driving, and concluding exactly one operation per workspace.

use crate::actuator::Actuators;
use crate::planner::{self, AttemptVerdict, Decision, MAX_ATTEMPTS, RETRY_DELAY};
use crate::{channels, db, metrics};
use anyhow::{Context, Result};
use codehub_types::{ErrorInfo, ErrorReason, Operation, Workspace};
use deadpool_postgres::Pool;
use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BASE_PERIOD: Duration = Duration::from_secs(30);
/// Accelerated period while anything is diverged or in flight.
const FAST_PERIOD: Duration = Duration::from_secs(3);
const FANOUT: usize = 10;

pub struct Reconciler {
    pool: Pool,
    redis: deadpool_redis::Pool,
    actuators: Arc<Actuators>,
    /// Local execution tasks keyed by workspace. Purely an optimization to
    /// avoid double-driving a sequence; correctness rests on the CAS and
    /// guarded writes.
    in_flight: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(pool: Pool, redis: deadpool_redis::Pool, actuators: Arc<Actuators>) -> Self {
        Self {
            pool,
            redis,
            actuators,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        loop {
            let busy = match Self::tick(&self, &cancel).await {
                Ok(busy) => busy,
                Err(e) => {
                    tracing::warn!(error = ?e, "reconcile tick failed");
                    false
                }
            };
            let period = if busy { FAST_PERIOD } else { BASE_PERIOD };
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abort_local_tasks().await;
                    return Ok(());
                }
                _ = tokio::time::sleep(period) => {}
            }
        }
    }

    async fn abort_local_tasks(&self) {
        let mut tasks = self.in_flight.lock().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    /// One pass over the diverged/in-flight rows. Returns whether there is
    /// still work pending, which drives the accelerated cadence.
    async fn tick(this: &Arc<Self>, cancel: &CancellationToken) -> Result<bool> {
        this.in_flight.lock().await.retain(|_, h| !h.is_finished());

        let candidates = db::reconcile_candidates(&this.pool)
            .await
            .context("failed to scan for reconcile candidates")?;
        let busy = !candidates.is_empty();

        let mut results = stream::iter(candidates)
            .map(|ws| {
                let this = this.clone();
                let cancel = cancel.clone();
                async move {
                    let id = ws.id;
                    (id, this.handle_workspace(ws, cancel).await)
                }
            })
            .buffer_unordered(FANOUT);
        while let Some((id, result)) = results.next().await {
            if let Err(e) = result {
                tracing::warn!(workspace = %id, error = ?e, "reconcile failed");
            }
        }
        Ok(busy)
    }

    async fn handle_workspace(
        self: Arc<Self>,
        ws: Workspace,
        cancel: CancellationToken,
    ) -> Result<()> {
        if ws.has_operation() {
            return self.advance_operation(ws, cancel).await;
        }

        match planner::next_decision(ws.phase, ws.desired_state) {
            Decision::Noop => Ok(()),
            Decision::ReleaseArchive => self.release_archive(&ws).await,
            Decision::Claim(operation) => self.claim_and_execute(ws, operation, cancel).await,
        }
    }

    /// Advance or finalize an operation that is already on the row: check
    /// the completion predicate against observed conditions, enforce the
    /// deadline, or (re)start the actuator sequence — in that order.
    async fn advance_operation(
        self: Arc<Self>,
        ws: Workspace,
        cancel: CancellationToken,
    ) -> Result<()> {
        let operation = ws.operation;
        let Some(op_id) = ws.op_id else {
            // Unreachable through this codebase's writers; leave the row
            // for an operator rather than guessing.
            tracing::error!(workspace = %ws.id, %operation, "operation without op_id");
            return Ok(());
        };

        if planner::operation_complete(operation, &ws) {
            self.finalize(&ws, operation, op_id).await?;
            return Ok(());
        }

        let now = codehub_common::now_ms();
        let deadline_ms = planner::operation_deadline(operation).as_millis() as i64;
        let started = ws.op_started_at.unwrap_or(now);
        if now.saturating_sub(started) > deadline_ms {
            let error = ErrorInfo::terminal(
                ErrorReason::Timeout,
                format!("{operation} exceeded its {}s deadline", deadline_ms / 1000),
                operation,
                0,
                now,
            );
            if db::fail_operation(&self.pool, ws.id, operation, op_id, &error).await? {
                metrics::operation_failed(operation.as_str(), "Timeout", true);
                self.hint(ws.id).await;
            }
            return Ok(());
        }

        // No local driver (claimed this tick, or inherited after a leader
        // restart): start one.
        self.spawn_execution(&ws, operation, op_id, cancel).await;
        Ok(())
    }

    async fn claim_and_execute(
        self: Arc<Self>,
        ws: Workspace,
        operation: Operation,
        cancel: CancellationToken,
    ) -> Result<()> {
        let op_id = Uuid::new_v4();
        let now = codehub_common::now_ms();
        if !db::claim_operation(&self.pool, ws.id, operation, op_id, now).await? {
            // Another reconciler selected the work.
            return Ok(());
        }
        tracing::info!(workspace = %ws.id, %operation, %op_id, "claimed operation");
        metrics::operation_claimed(operation.as_str());
        self.hint(ws.id).await;
        self.spawn_execution(&ws, operation, op_id, cancel).await;
        Ok(())
    }

    async fn spawn_execution(
        self: Arc<Self>,
        ws: &Workspace,
        operation: Operation,
        op_id: Uuid,
        cancel: CancellationToken,
    ) {
        let mut tasks = self.in_flight.lock().await;
        if tasks.get(&ws.id).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let id = ws.id;
        let this = self.clone();
        let ws = ws.clone();
        let handle = tokio::spawn(async move {
            this.execute_operation(ws, operation, op_id, cancel).await;
        });
        tasks.insert(id, handle);
    }

    /// Drive the actuator sequence to success or a terminal error, racing
    /// the operation deadline. Success here does NOT finalize the row: the
    /// completion predicate is checked against observed conditions on a
    /// later tick, because reality is authoritative.
    async fn execute_operation(
        &self,
        ws: Workspace,
        operation: Operation,
        op_id: Uuid,
        cancel: CancellationToken,
    ) {
        let started = ws.op_started_at.unwrap_or_else(codehub_common::now_ms);
        let elapsed = codehub_common::now_ms().saturating_sub(started).max(0) as u64;
        let deadline = planner::operation_deadline(operation)
            .saturating_sub(Duration::from_millis(elapsed));

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(deadline) => {
                let error = ErrorInfo::terminal(
                    ErrorReason::Timeout,
                    format!("{operation} exceeded its deadline"),
                    operation,
                    0,
                    codehub_common::now_ms(),
                );
                match db::fail_operation(&self.pool, ws.id, operation, op_id, &error).await {
                    Ok(true) => {
                        metrics::operation_failed(operation.as_str(), "Timeout", true);
                        self.hint(ws.id).await;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(workspace = %ws.id, error = ?e, "failed to record timeout"),
                }
            }
            _ = self.attempt_loop(&ws, operation, op_id, &cancel) => {}
        }
    }

    async fn attempt_loop(
        &self,
        ws: &Workspace,
        operation: Operation,
        op_id: Uuid,
        cancel: &CancellationToken,
    ) {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.run_sequence(ws, operation, op_id).await {
                Ok(()) => {
                    // Nudge the observer so the completion predicate can be
                    // evaluated against fresh conditions promptly.
                    self.hint(ws.id).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        workspace = %ws.id, %operation, attempt,
                        reason = %e.reason, error = %e.message,
                        "operation attempt failed"
                    );
                    let now = codehub_common::now_ms();
                    match planner::attempt_verdict(e.reason, e.retryable, attempt) {
                        AttemptVerdict::Retry => {
                            let transient = ErrorInfo::transient(
                                e.reason, &e.message, operation, attempt, now,
                            );
                            if let Err(db_err) = db::record_attempt_failure(
                                &self.pool, ws.id, operation, op_id, &transient,
                            )
                            .await
                            {
                                tracing::warn!(workspace = %ws.id, error = ?db_err, "failed to record attempt");
                            }
                            metrics::operation_failed(operation.as_str(), e.reason.as_str(), false);
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(RETRY_DELAY) => {}
                            }
                        }
                        AttemptVerdict::Terminal(reason) => {
                            let error =
                                ErrorInfo::terminal(reason, &e.message, operation, attempt, now);
                            match db::fail_operation(&self.pool, ws.id, operation, op_id, &error)
                                .await
                            {
                                Ok(true) => {
                                    metrics::operation_failed(
                                        operation.as_str(),
                                        reason.as_str(),
                                        true,
                                    );
                                    self.hint(ws.id).await;
                                }
                                Ok(false) => {}
                                Err(db_err) => {
                                    tracing::warn!(workspace = %ws.id, error = ?db_err, "failed to record terminal error")
                                }
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    /// The idempotent actuator sequence for one operation attempt.
    async fn run_sequence(
        &self,
        ws: &Workspace,
        operation: Operation,
        op_id: Uuid,
    ) -> crate::error::ActuatorResult<()> {
        use crate::error::ActuatorError;

        let instance = self.actuators.instance(&ws.instance_backend)?;
        let storage = self.actuators.storage(&ws.storage_backend)?;

        match operation {
            Operation::None => Ok(()),

            Operation::Provisioning => storage.provision(ws.id).await,

            Operation::CreateEmptyArchive => {
                storage.provision(ws.id).await?;
                let key = storage.archive(ws.id, op_id).await?;
                // The uploaded archive must be on the row before the
                // volume goes away.
                self.persist_key(ws.id, operation, op_id, &key).await?;
                storage.delete_volume(ws.id).await
            }

            Operation::Restoring => {
                let Some(key) = ws.archive_key.clone() else {
                    return Err(ActuatorError::new(
                        ErrorReason::Mismatch,
                        "restore requested but no archive_key on the row",
                    ));
                };
                storage.provision(ws.id).await?;
                let marker = storage.restore(ws.id, &key).await?;
                if !db::persist_restore_marker(&self.pool, ws.id, operation, op_id, &marker)
                    .await
                    .map_err(|e| ActuatorError::unreachable(e.to_string()))?
                {
                    return Err(ActuatorError::non_retryable(
                        ErrorReason::Mismatch,
                        "lost operation claim while persisting restore marker",
                    ));
                }
                Ok(())
            }

            Operation::Starting => instance.start(ws.id, &ws.image_ref).await,

            Operation::Stopping => instance.delete(ws.id).await,

            Operation::Archiving => {
                let key = storage.archive(ws.id, op_id).await?;
                self.persist_key(ws.id, operation, op_id, &key).await?;
                storage.delete_volume(ws.id).await
            }

            Operation::Deleting => {
                // Container before volume; archives are left for the GC.
                instance.delete(ws.id).await?;
                storage.delete_volume(ws.id).await
            }
        }
    }

    async fn persist_key(
        &self,
        id: Uuid,
        operation: Operation,
        op_id: Uuid,
        key: &str,
    ) -> crate::error::ActuatorResult<()> {
        use crate::error::ActuatorError;
        if !db::persist_archive_key(&self.pool, id, operation, op_id, key)
            .await
            .map_err(|e| ActuatorError::unreachable(e.to_string()))?
        {
            return Err(ActuatorError::non_retryable(
                ErrorReason::Mismatch,
                "lost operation claim while persisting archive key",
            ));
        }
        Ok(())
    }

    /// The completion predicate held: release the claim.
    async fn finalize(&self, ws: &Workspace, operation: Operation, op_id: Uuid) -> Result<()> {
        let done = match operation {
            Operation::Deleting => db::complete_deleting(&self.pool, ws.id, op_id).await?,
            _ => db::complete_operation(&self.pool, ws.id, operation, op_id).await?,
        };
        if done {
            tracing::info!(workspace = %ws.id, %operation, "operation complete");
            metrics::operation_completed(operation.as_str());
            self.hint(ws.id).await;
        }
        Ok(())
    }

    /// ARCHIVED -> PENDING: clear the pointer first (dropping op-id
    /// protection with it), then delete the objects. If the delete is
    /// interrupted the GC reclaims them on the two-hour rule.
    async fn release_archive(&self, ws: &Workspace) -> Result<()> {
        let Some(key) = ws.archive_key.clone() else {
            // Phase said ARCHIVED but the pointer is already gone; the
            // next observation will re-derive PENDING.
            return Ok(());
        };
        if !db::release_archive(&self.pool, ws.id, &key).await? {
            return Ok(());
        }
        tracing::info!(workspace = %ws.id, %key, "released archive");
        if let Ok(storage) = self.actuators.storage(&ws.storage_backend)
            && let Err(e) = storage.delete_archive(&key).await
        {
            tracing::warn!(workspace = %ws.id, %key, error = %e, "archive delete deferred to gc");
        }
        self.hint(ws.id).await;
        Ok(())
    }

    async fn hint(&self, id: Uuid) {
        codehub_common::redis::publish_hint(
            &self.redis,
            channels::MONITOR_TRIGGER,
            &id.to_string(),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codehub_types::Phase;

    /// The DELETED phase never reaches the planner through the candidate
    /// scan (phase == desired and no operation), and a DELETING claim is
    /// what any deleted-but-present row converges to.
    #[test]
    fn deletion_claims_only_through_deleting_phase() {
        use codehub_types::DesiredState;
        assert_eq!(
            planner::next_decision(Phase::Deleting, DesiredState::Deleted),
            Decision::Claim(Operation::Deleting)
        );
        assert_eq!(
            planner::next_decision(Phase::Deleted, DesiredState::Deleted),
            Decision::Noop
        );
    }
}
