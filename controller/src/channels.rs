//! Redis key and channel names. Everything here is advisory state: losing
//! it degrades latency or GC precision, never correctness.

use uuid::Uuid;

/// Observer hint channel, published by the reconciler at operation start
/// and finish.
pub const MONITOR_TRIGGER: &str = "monitor:trigger";

/// Per-workspace fan-out channel fed by the CDC bridge.
pub fn workspace_channel(id: Uuid) -> String {
    format!("workspace:{id}")
}

/// Live websocket connection count, maintained by the proxy.
pub fn ws_conn_key(id: Uuid) -> String {
    format!("ws_conn:{id}")
}

/// Ephemeral idle key, reset by the proxy on disconnect; its expiry is the
/// idle signal.
pub fn idle_timer_key(id: Uuid) -> String {
    format!("idle_timer:{id}")
}

/// First-sighting timestamp for an unprotected archive object.
pub fn orphan_key(path: &str) -> String {
    format!("orphan:{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_embed_the_identifier() {
        let id: Uuid = "7a0a4f4e-9a71-4f0c-bb1d-90e2f5a40c10".parse().unwrap();
        assert_eq!(
            workspace_channel(id),
            "workspace:7a0a4f4e-9a71-4f0c-bb1d-90e2f5a40c10"
        );
        assert_eq!(ws_conn_key(id), "ws_conn:7a0a4f4e-9a71-4f0c-bb1d-90e2f5a40c10");
        assert_eq!(
            idle_timer_key(id),
            "idle_timer:7a0a4f4e-9a71-4f0c-bb1d-90e2f5a40c10"
        );
        assert_eq!(
            orphan_key("archives/a/b/home.tar.zst"),
            "orphan:archives/a/b/home.tar.zst"
        );
    }
}
