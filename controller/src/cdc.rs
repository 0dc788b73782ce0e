//! Change-data-capture bridge: forwards the row-update NOTIFY stream to
//! per-workspace Redis channels so SSE handlers in the API layer can
//! multiplex to browsers. Delivery is advisory — consumers resolve every
//! notification by reading the row.

use crate::{channels, db, metrics};
use anyhow::{Context, Result, bail};
use codehub_common::args::PostgresArgs;
use futures::stream;
use serde::Deserialize;
use tokio_postgres::AsyncMessage;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Deserialize)]
struct ChangePayload {
    id: Uuid,
    #[serde(default)]
    hint: String,
}

pub struct CdcBridge {
    pg_args: PostgresArgs,
    redis: deadpool_redis::Pool,
}

impl CdcBridge {
    pub fn new(pg_args: PostgresArgs, redis: deadpool_redis::Pool) -> Self {
        Self { pg_args, redis }
    }

    /// Hold a dedicated LISTEN connection and republish until cancelled.
    /// Connection loss surfaces as an error; the coordinator restarts the
    /// bridge while leadership holds.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let (client, mut connection) = codehub_common::postgres::connect_raw(&self.pg_args)
            .await
            .context("cdc failed to connect")?;

        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));

        // The client must issue LISTEN on the same session the messages
        // arrive on; driving the connection and the query concurrently.
        let listen_sql = format!("LISTEN {}", db::CHANGES_CHANNEL);
        let listen = client.batch_execute(&listen_sql);
        tokio::pin!(listen);

        let mut listening = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = &mut listen, if !listening => {
                    result.context("cdc failed to LISTEN")?;
                    listening = true;
                    tracing::info!(channel = db::CHANGES_CHANNEL, "cdc bridge listening");
                }
                message = messages.next() => match message {
                    Some(Ok(AsyncMessage::Notification(notification))) => {
                        self.forward(notification.payload()).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => bail!("cdc connection failed: {e}"),
                    None => bail!("cdc connection closed"),
                }
            }
        }
    }

    async fn forward(&self, payload: &str) {
        let parsed: ChangePayload = match serde_json::from_str(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(payload, error = %e, "unparseable change notification");
                return;
            }
        };
        codehub_common::redis::publish_hint(
            &self.redis,
            &channels::workspace_channel(parsed.id),
            &format!(
                "{{\"id\":\"{}\",\"hint\":\"{}\"}}",
                parsed.id, parsed.hint
            ),
        )
        .await;
        metrics::cdc_forwarded();
    }
}
