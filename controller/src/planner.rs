//! Pure decision logic for the reconcile loops. Everything here is a
//! function of row state; the loops own all I/O.

use codehub_types::{
    Conditions, DesiredState, ErrorReason, Operation, Phase, Workspace, reason,
};
use std::time::Duration;

/// Attempts per operation invocation before the ERROR transition.
pub const MAX_ATTEMPTS: u32 = 3;

/// Fixed pause between attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// What the reconciler should do with a workspace this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Converged, unhealthy-without-consent, or nothing sensible to do.
    Noop,
    /// Claim the given operation via the CAS idiom.
    Claim(Operation),
    /// ARCHIVED -> PENDING: drop the archive pointer and delete the
    /// objects. Not an operation; completes inline.
    ReleaseArchive,
}

/// Single-step operation selection. Only called when no operation is in
/// flight; deletion is keyed on the derived phase, everything else on the
/// (phase, desired_state) table.
pub fn next_decision(phase: Phase, desired: DesiredState) -> Decision {
    use DesiredState as D;
    use Phase as P;

    match (phase, desired) {
        // Deletion axis. DELETED rows are done; DELETING rows keep the
        // delete operation running no matter what is desired.
        (P::Deleted, _) => Decision::Noop,
        (P::Deleting, _) => Decision::Claim(Operation::Deleting),

        // ERROR is terminal for the planner except operator-driven
        // cleanup. Recovery is manual: clear error_info, let the observer
        // re-derive a live phase.
        (P::Error, D::Deleted) => Decision::Claim(Operation::Deleting),
        (P::Error, _) => Decision::Noop,

        (P::Pending, D::Pending) => Decision::Noop,
        (P::Pending, D::Archived) => Decision::Claim(Operation::CreateEmptyArchive),
        (P::Pending, D::Standby | D::Running) => Decision::Claim(Operation::Provisioning),
        (P::Pending, D::Deleted) => Decision::Claim(Operation::Deleting),

        (P::Archived, D::Archived) => Decision::Noop,
        (P::Archived, D::Standby | D::Running) => Decision::Claim(Operation::Restoring),
        (P::Archived, D::Pending) => Decision::ReleaseArchive,
        (P::Archived, D::Deleted) => Decision::Claim(Operation::Deleting),

        (P::Standby, D::Standby) => Decision::Noop,
        (P::Standby, D::Running) => Decision::Claim(Operation::Starting),
        (P::Standby, D::Archived | D::Pending) => Decision::Claim(Operation::Archiving),
        // Soft delete flips the derived phase to DELETING before the
        // planner sees the row; a STANDBY/RUNNING row asking for DELETED
        // is a stale observation. Wait for the observer.
        (P::Standby, D::Deleted) => Decision::Noop,

        (P::Running, D::Running) => Decision::Noop,
        (P::Running, D::Standby | D::Archived | D::Pending) => {
            Decision::Claim(Operation::Stopping)
        }
        (P::Running, D::Deleted) => Decision::Noop,
    }
}

/// The `policy.healthy` verdict in strict priority order.
pub fn evaluate_health(
    volume_ready: bool,
    container_ready: bool,
    has_archive_key: bool,
    archive_ready: bool,
    terminal_error: Option<ErrorReason>,
) -> (bool, String) {
    // P1: a container without its volume breaks the layering invariant.
    if container_ready && !volume_ready {
        return (false, reason::CONTAINER_WITHOUT_VOLUME.to_string());
    }
    // P2: a referenced archive that cannot be read.
    if has_archive_key && !archive_ready {
        return (false, reason::ARCHIVE_ACCESS_ERROR.to_string());
    }
    // P3: a terminal error recorded by the reconciler. The observer only
    // copies the reason; it never authors error_info.
    if let Some(reason) = terminal_error {
        return (false, reason.as_str().to_string());
    }
    (true, reason::ALL_CONDITIONS_MET.to_string())
}

/// Phase derivation from observed conditions and the soft-delete marker.
pub fn derive_phase(conditions: &Conditions, deleted: bool) -> Phase {
    let volume = conditions.volume_ready();
    let container = conditions.container_ready();
    let archive = conditions.archive_ready();
    let healthy = conditions.healthy();

    if deleted {
        return if volume || container || archive {
            Phase::Deleting
        } else {
            Phase::Deleted
        };
    }
    if !healthy {
        return Phase::Error;
    }
    match (volume, container, archive) {
        (true, true, _) => Phase::Running,
        (true, false, _) => Phase::Standby,
        (false, _, true) => Phase::Archived,
        (false, _, false) => Phase::Pending,
    }
}

/// Completion predicates, checked against observed conditions rather than
/// actuator return values: reality is authoritative.
pub fn operation_complete(operation: Operation, ws: &Workspace) -> bool {
    let c = &ws.conditions;
    match operation {
        Operation::None => true,
        Operation::CreateEmptyArchive => c.archive_ready() && !c.volume_ready(),
        Operation::Provisioning => c.volume_ready(),
        Operation::Restoring => {
            c.volume_ready()
                && ws.archive_key.is_some()
                && ws.home_ctx.restore_marker == ws.archive_key
        }
        Operation::Starting => c.container_ready(),
        Operation::Stopping => !c.container_ready() && c.volume_ready(),
        Operation::Archiving => {
            !c.volume_ready() && c.archive_ready() && ws.archive_key.is_some()
        }
        Operation::Deleting => !c.container_ready() && !c.volume_ready(),
    }
}

/// Per-operation deadline; exceeding it is an immediate terminal Timeout.
pub fn operation_deadline(operation: Operation) -> Duration {
    match operation {
        Operation::None => Duration::ZERO,
        Operation::Provisioning
        | Operation::CreateEmptyArchive
        | Operation::Starting
        | Operation::Stopping => Duration::from_secs(5 * 60),
        Operation::Restoring | Operation::Archiving => Duration::from_secs(30 * 60),
        Operation::Deleting => Duration::from_secs(10 * 60),
    }
}

/// Outcome of one failed attempt: retry in place, or conclude with the
/// given terminal reason. Timeout never reaches this path (the deadline
/// race handles it), which keeps Timeout and RetryExceeded mutually
/// exclusive.
pub fn attempt_verdict(reason: ErrorReason, retryable: bool, attempt: u32) -> AttemptVerdict {
    if !retryable {
        return AttemptVerdict::Terminal(reason);
    }
    if attempt >= MAX_ATTEMPTS {
        return AttemptVerdict::Terminal(ErrorReason::RetryExceeded);
    }
    AttemptVerdict::Retry
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptVerdict {
    Retry,
    Terminal(ErrorReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use codehub_types::{HomeCtx, VOLUME_READY, ARCHIVE_READY, CONTAINER_READY, HEALTHY};
    use uuid::Uuid;

    fn conditions(volume: bool, container: bool, archive: bool, healthy: bool) -> Conditions {
        let mut c = Conditions::default();
        c.set(VOLUME_READY, volume, "t", "", 0);
        c.set(CONTAINER_READY, container, "t", "", 0);
        c.set(ARCHIVE_READY, archive, "t", "", 0);
        c.set(HEALTHY, healthy, "t", "", 0);
        c
    }

    fn workspace(volume: bool, container: bool, archive: bool) -> Workspace {
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
            archive_ttl_seconds: 604_800,
            last_access_at: 0,
            created_at: 0,
            updated_at: 0,
            conditions: conditions(volume, container, archive, true),
            phase: Phase::Pending,
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

    #[test]
    fn selection_table_is_single_step() {
        use Decision::*;
        let cases = [
            (Phase::Pending, DesiredState::Archived, Claim(Operation::CreateEmptyArchive)),
            (Phase::Pending, DesiredState::Standby, Claim(Operation::Provisioning)),
            (Phase::Pending, DesiredState::Running, Claim(Operation::Provisioning)),
            (Phase::Archived, DesiredState::Standby, Claim(Operation::Restoring)),
            (Phase::Archived, DesiredState::Running, Claim(Operation::Restoring)),
            (Phase::Archived, DesiredState::Pending, ReleaseArchive),
            (Phase::Standby, DesiredState::Running, Claim(Operation::Starting)),
            (Phase::Standby, DesiredState::Archived, Claim(Operation::Archiving)),
            (Phase::Standby, DesiredState::Pending, Claim(Operation::Archiving)),
            (Phase::Running, DesiredState::Standby, Claim(Operation::Stopping)),
            (Phase::Running, DesiredState::Archived, Claim(Operation::Stopping)),
            (Phase::Running, DesiredState::Pending, Claim(Operation::Stopping)),
            (Phase::Pending, DesiredState::Deleted, Claim(Operation::Deleting)),
            (Phase::Archived, DesiredState::Deleted, Claim(Operation::Deleting)),
            (Phase::Error, DesiredState::Deleted, Claim(Operation::Deleting)),
        ];
        for (phase, desired, expected) in cases {
            assert_eq!(next_decision(phase, desired), expected, "{phase} -> {desired}");
        }
    }

    #[test]
    fn converged_rows_are_noops() {
        for (phase, desired) in [
            (Phase::Pending, DesiredState::Pending),
            (Phase::Archived, DesiredState::Archived),
            (Phase::Standby, DesiredState::Standby),
            (Phase::Running, DesiredState::Running),
            (Phase::Deleted, DesiredState::Deleted),
        ] {
            assert_eq!(next_decision(phase, desired), Decision::Noop);
        }
    }

    #[test]
    fn error_waits_for_manual_recovery_unless_deleted() {
        assert_eq!(next_decision(Phase::Error, DesiredState::Running), Decision::Noop);
        assert_eq!(next_decision(Phase::Error, DesiredState::Pending), Decision::Noop);
        assert_eq!(
            next_decision(Phase::Error, DesiredState::Deleted),
            Decision::Claim(Operation::Deleting)
        );
    }

    #[test]
    fn running_to_pending_traverses_every_level() {
        // RUNNING -> PENDING must pass STOPPING, ARCHIVING, then the
        // archive release; never a two-level jump.
        let desired = DesiredState::Pending;
        assert_eq!(
            next_decision(Phase::Running, desired),
            Decision::Claim(Operation::Stopping)
        );
        assert_eq!(
            next_decision(Phase::Standby, desired),
            Decision::Claim(Operation::Archiving)
        );
        assert_eq!(next_decision(Phase::Archived, desired), Decision::ReleaseArchive);
        assert_eq!(next_decision(Phase::Pending, desired), Decision::Noop);
    }

    #[test]
    fn health_priority_order() {
        // P1 beats P2 beats P3.
        let (ok, reason) = evaluate_health(false, true, true, false, Some(ErrorReason::DataLost));
        assert!(!ok);
        assert_eq!(reason, "ContainerWithoutVolume");

        let (ok, reason) = evaluate_health(true, true, true, false, Some(ErrorReason::DataLost));
        assert!(!ok);
        assert_eq!(reason, "ArchiveAccessError");

        let (ok, reason) = evaluate_health(true, true, true, true, Some(ErrorReason::DataLost));
        assert!(!ok);
        assert_eq!(reason, "DataLost");

        let (ok, reason) = evaluate_health(true, true, true, true, None);
        assert!(ok);
        assert_eq!(reason, "AllConditionsMet");
    }

    #[test]
    fn no_archive_key_means_archive_condition_cannot_fail_health() {
        let (ok, _) = evaluate_health(true, false, false, false, None);
        assert!(ok);
    }

    #[test]
    fn phase_derivation_matches_condition_matrix() {
        let cases = [
            (conditions(true, true, false, true), false, Phase::Running),
            (conditions(true, false, false, true), false, Phase::Standby),
            (conditions(false, false, true, true), false, Phase::Archived),
            (conditions(false, false, false, true), false, Phase::Pending),
            (conditions(true, false, false, false), false, Phase::Error),
            (conditions(true, false, false, true), true, Phase::Deleting),
            (conditions(false, false, true, true), true, Phase::Deleting),
            (conditions(false, false, false, true), true, Phase::Deleted),
            // Soft delete wins over health loss.
            (conditions(false, false, false, false), true, Phase::Deleted),
        ];
        for (conditions, deleted, expected) in cases {
            assert_eq!(derive_phase(&conditions, deleted), expected);
        }
    }

    #[test]
    fn completion_predicates_read_reality() {
        let mut ws = workspace(true, false, false);
        assert!(operation_complete(Operation::Provisioning, &ws));
        assert!(operation_complete(Operation::Stopping, &ws));
        assert!(!operation_complete(Operation::Starting, &ws));

        ws = workspace(true, true, false);
        assert!(operation_complete(Operation::Starting, &ws));
        assert!(!operation_complete(Operation::Stopping, &ws));

        // Archiving needs the blob visible, the volume gone, and the
        // pointer persisted.
        ws = workspace(false, false, true);
        assert!(!operation_complete(Operation::Archiving, &ws));
        ws.archive_key = Some("archives/x/y/home.tar.zst".into());
        assert!(operation_complete(Operation::Archiving, &ws));
        assert!(operation_complete(Operation::CreateEmptyArchive, &ws));

        ws = workspace(false, false, false);
        assert!(operation_complete(Operation::Deleting, &ws));
        ws = workspace(true, false, false);
        assert!(!operation_complete(Operation::Deleting, &ws));
    }

    #[test]
    fn restore_completes_only_when_marker_matches_pointer() {
        let key = "archives/a/b/home.tar.zst".to_string();
        let mut ws = workspace(true, false, true);
        ws.archive_key = Some(key.clone());
        assert!(!operation_complete(Operation::Restoring, &ws));

        ws.home_ctx.restore_marker = Some("archives/a/old/home.tar.zst".into());
        assert!(!operation_complete(Operation::Restoring, &ws));

        ws.home_ctx.restore_marker = Some(key);
        assert!(operation_complete(Operation::Restoring, &ws));
    }

    #[test]
    fn deadlines_match_operation_weight() {
        assert_eq!(operation_deadline(Operation::Provisioning), Duration::from_secs(300));
        assert_eq!(operation_deadline(Operation::Starting), Duration::from_secs(300));
        assert_eq!(operation_deadline(Operation::Restoring), Duration::from_secs(1800));
        assert_eq!(operation_deadline(Operation::Archiving), Duration::from_secs(1800));
        assert_eq!(operation_deadline(Operation::Deleting), Duration::from_secs(600));
    }

    #[test]
    fn attempt_verdicts_exhaust_then_terminal() {
        assert_eq!(
            attempt_verdict(ErrorReason::Unreachable, true, 1),
            AttemptVerdict::Retry
        );
        assert_eq!(
            attempt_verdict(ErrorReason::Unreachable, true, 2),
            AttemptVerdict::Retry
        );
        assert_eq!(
            attempt_verdict(ErrorReason::Unreachable, true, MAX_ATTEMPTS),
            AttemptVerdict::Terminal(ErrorReason::RetryExceeded)
        );
        // DataLost is terminal on the first attempt.
        assert_eq!(
            attempt_verdict(ErrorReason::DataLost, false, 1),
            AttemptVerdict::Terminal(ErrorReason::DataLost)
        );
        // DISK_FULL style: ActionFailed but flagged non-retryable.
        assert_eq!(
            attempt_verdict(ErrorReason::ActionFailed, false, 1),
            AttemptVerdict::Terminal(ErrorReason::ActionFailed)
        );
    }

    /// Scenario: cold start to running, the observable (phase, operation)
    /// ladder from the pure functions alone.
    #[test]
    fn cold_start_walks_pending_standby_running() {
        let desired = DesiredState::Running;

        // (PENDING, NONE): planner picks PROVISIONING.
        let mut c = conditions(false, false, false, true);
        assert_eq!(derive_phase(&c, false), Phase::Pending);
        assert_eq!(
            next_decision(Phase::Pending, desired),
            Decision::Claim(Operation::Provisioning)
        );

        // Volume appears: (STANDBY, NONE), planner picks STARTING.
        c = conditions(true, false, false, true);
        assert_eq!(derive_phase(&c, false), Phase::Standby);
        let ws = workspace(true, false, false);
        assert!(operation_complete(Operation::Provisioning, &ws));
        assert_eq!(
            next_decision(Phase::Standby, desired),
            Decision::Claim(Operation::Starting)
        );

        // Container serves: (RUNNING, NONE), converged.
        c = conditions(true, true, false, true);
        assert_eq!(derive_phase(&c, false), Phase::Running);
        let ws = workspace(true, true, false);
        assert!(operation_complete(Operation::Starting, &ws));
        assert_eq!(next_decision(Phase::Running, desired), Decision::Noop);
    }
}
