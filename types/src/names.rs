use uuid::Uuid;

/// Prefix every archive object lives under.
pub const ARCHIVE_ROOT: &str = "archives/";

/// DNS-1123-safe container name for a workspace.
pub fn container_name(workspace_id: Uuid) -> String {
    format!("ws-{workspace_id}")
}

/// Home volume name for a workspace.
pub fn volume_name(workspace_id: Uuid) -> String {
    format!("ws-{workspace_id}-home")
}

/// Object key of the archive blob written by an operation attempt.
pub fn archive_key(workspace_id: Uuid, op_id: Uuid) -> String {
    format!("archives/{workspace_id}/{op_id}/home.tar.zst")
}

/// Object key of the integrity sidecar next to an archive blob.
pub fn meta_key(archive_key: &str) -> String {
    format!("{archive_key}.meta")
}

/// Prefix protecting every attempt of one operation.
pub fn op_prefix(workspace_id: Uuid, op_id: Uuid) -> String {
    format!("archives/{workspace_id}/{op_id}/")
}

/// Prefix holding everything a workspace ever archived.
pub fn workspace_prefix(workspace_id: Uuid) -> String {
    format!("archives/{workspace_id}/")
}

/// Split an object key under `archives/` into its workspace and op ids.
/// Sidecar keys parse the same as their blob.
pub fn parse_archive_key(key: &str) -> Option<(Uuid, Uuid)> {
    let rest = key.strip_prefix(ARCHIVE_ROOT)?;
    let mut parts = rest.splitn(3, '/');
    let workspace_id = parts.next()?.parse().ok()?;
    let op_id = parts.next()?.parse().ok()?;
    parts.next()?;
    Some((workspace_id, op_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Uuid, Uuid) {
        (
            "7a0a4f4e-9a71-4f0c-bb1d-90e2f5a40c10".parse().unwrap(),
            "3f1f9c2a-0d5b-4e46-8f7a-6f2f4ab0d9e4".parse().unwrap(),
        )
    }

    #[test]
    fn names_are_deterministic_and_dns_safe() {
        let (ws, _) = ids();
        assert_eq!(
            container_name(ws),
            "ws-7a0a4f4e-9a71-4f0c-bb1d-90e2f5a40c10"
        );
        assert_eq!(
            volume_name(ws),
            "ws-7a0a4f4e-9a71-4f0c-bb1d-90e2f5a40c10-home"
        );
        assert!(
            container_name(ws)
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
    }

    #[test]
    fn archive_key_layout() {
        let (ws, op) = ids();
        let key = archive_key(ws, op);
        assert_eq!(
            key,
            "archives/7a0a4f4e-9a71-4f0c-bb1d-90e2f5a40c10/3f1f9c2a-0d5b-4e46-8f7a-6f2f4ab0d9e4/home.tar.zst"
        );
        assert_eq!(meta_key(&key), format!("{key}.meta"));
        assert!(key.starts_with(&op_prefix(ws, op)));
        assert!(key.starts_with(&workspace_prefix(ws)));
    }

    #[test]
    fn parse_round_trips_blob_and_sidecar() {
        let (ws, op) = ids();
        let key = archive_key(ws, op);
        assert_eq!(parse_archive_key(&key), Some((ws, op)));
        assert_eq!(parse_archive_key(&meta_key(&key)), Some((ws, op)));
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        assert_eq!(parse_archive_key("backups/x/y/home.tar.zst"), None);
        assert_eq!(parse_archive_key("archives/not-a-uuid/x/home.tar.zst"), None);
        assert_eq!(
            parse_archive_key("archives/7a0a4f4e-9a71-4f0c-bb1d-90e2f5a40c10"),
            None
        );
    }
}
