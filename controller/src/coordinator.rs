//! Coordinator: advisory-lock leader election plus the lifecycle of the
//! five loops. Exactly one process in the fleet drives reconciliation;
//! followers park in candidacy and re-attempt after a short jittered wait.

use crate::actuator::Actuators;
use crate::actuator::objectstore::ObjectStore;
use crate::cdc::CdcBridge;
use crate::gc::ArchiveGc;
use crate::metrics;
use crate::observer::Observer;
use crate::reconciler::Reconciler;
use crate::service::WorkspaceService;
use crate::ttl::TtlController;
use anyhow::{Context, Result};
use codehub_common::args::{PostgresArgs, RedisArgs};
use codehub_common::postgres::DedicatedConn;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Advisory lock key for leadership ("codehub!" in hex). Session-scoped:
/// losing the dedicated connection releases it.
const LEADER_LOCK_KEY: i64 = 0x636F_6465_6875_6221;

/// Keep-alive cadence on the lock connection.
const KEEPALIVE: Duration = Duration::from_secs(5);

pub struct Coordinator {
    pub pg_args: PostgresArgs,
    pub redis_args: RedisArgs,
    pub pool: deadpool_postgres::Pool,
    pub redis: deadpool_redis::Pool,
    pub actuators: Arc<Actuators>,
    pub store: ObjectStore,
    pub service: Arc<WorkspaceService>,
}

impl Coordinator {
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let conn = match codehub_common::postgres::connect_dedicated(&self.pg_args).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = ?e, "candidacy connection failed");
                    codehub_common::wait::wait(&cancel, 4).await.ok();
                    continue;
                }
            };
            let acquired = match try_acquire(&conn).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    tracing::warn!(error = ?e, "advisory lock attempt failed");
                    false
                }
            };
            if !acquired {
                drop(conn);
                codehub_common::wait::wait(&cancel, 4).await.ok();
                continue;
            }

            println!("{}", "👑 Acquired leadership; starting control loops".green());
            metrics::leadership(true);
            Self::lead(&self, conn, &cancel).await;
            metrics::leadership(false);
            eprintln!("{}", "lost leadership; stopping control loops".yellow());
        }
    }

    /// Run the loops until the lock connection dies or shutdown arrives.
    async fn lead(this: &Arc<Self>, mut conn: DedicatedConn, cancel: &CancellationToken) {
        let leader_cancel = cancel.child_token();

        // Observer hints fan in over a broadcast channel fed by the
        // monitor:trigger subscription.
        let (hint_tx, hint_rx) = tokio::sync::broadcast::channel(256);
        let hint_task = {
            let cancel = leader_cancel.clone();
            let redis_args = this.redis_args.clone();
            tokio::spawn(async move {
                codehub_common::redis::listen_for_hints(
                    cancel,
                    redis_args,
                    hint_tx,
                    crate::channels::MONITOR_TRIGGER,
                )
                .await
                .ok();
            })
        };

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = vec![("hints", hint_task)];

        tasks.push((
            "observer",
            spawn_loop(leader_cancel.clone(), {
                let this = this.clone();
                move |cancel| {
                    let observer = Observer::new(this.pool.clone(), this.actuators.clone());
                    let hints = hint_rx.resubscribe();
                    async move { observer.run(cancel, hints).await }
                }
            }),
        ));
        tasks.push((
            "reconciler",
            spawn_loop(leader_cancel.clone(), {
                let this = this.clone();
                move |cancel| {
                    let reconciler = Arc::new(Reconciler::new(
                        this.pool.clone(),
                        this.redis.clone(),
                        this.actuators.clone(),
                    ));
                    async move { reconciler.run(cancel).await }
                }
            }),
        ));
        tasks.push((
            "ttl",
            spawn_loop(leader_cancel.clone(), {
                let this = this.clone();
                move |cancel| {
                    let ttl = TtlController::new(
                        this.pool.clone(),
                        this.redis.clone(),
                        this.service.clone(),
                    );
                    async move { ttl.run(cancel).await }
                }
            }),
        ));
        tasks.push((
            "gc",
            spawn_loop(leader_cancel.clone(), {
                let this = this.clone();
                move |cancel| {
                    let gc = ArchiveGc::new(
                        this.pool.clone(),
                        this.redis.clone(),
                        this.store.clone(),
                    );
                    async move { gc.run(cancel).await }
                }
            }),
        ));
        tasks.push((
            "cdc",
            spawn_loop(leader_cancel.clone(), {
                let this = this.clone();
                move |cancel| {
                    let bridge = CdcBridge::new(this.pg_args.clone(), this.redis.clone());
                    async move { bridge.run(cancel).await }
                }
            }),
        ));

        // Keep-alive: leadership holds exactly as long as this session.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut conn.driver => {
                    tracing::warn!("leader lock connection closed");
                    break;
                }
                _ = tokio::time::sleep(KEEPALIVE) => {
                    if let Err(e) = conn.client.execute("SELECT 1", &[]).await {
                        tracing::warn!(error = %e, "leader keep-alive failed");
                        break;
                    }
                }
            }
        }

        leader_cancel.cancel();
        for (name, task) in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                tracing::error!(loop_name = name, error = ?e, "loop task panicked");
            }
        }
    }
}

async fn try_acquire(conn: &DedicatedConn) -> Result<bool> {
    let row = conn
        .client
        .query_one("SELECT pg_try_advisory_lock($1)", &[&LEADER_LOCK_KEY])
        .await
        .context("failed to attempt advisory lock")?;
    Ok(row.get(0))
}

/// Run a loop body forever under the leader token: an error logs, sleeps,
/// and restarts the loop; it never takes the other loops down with it.
fn spawn_loop<F, Fut>(cancel: CancellationToken, mut body: F) -> JoinHandle<()>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match body(cancel.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!(error = ?e, "control loop failed; restarting");
                    if codehub_common::wait::wait(&cancel, 4).await.is_err() {
                        return;
                    }
                }
            }
        }
    })
}
