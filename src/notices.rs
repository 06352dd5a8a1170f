//! User-facing text for scan sessions, and the glue that keeps one progress notice per
//! session in sync with its tracker.

use crate::error::{SessionAbortedError, StartScanError};
use crate::notifications::{NewNotification, NotificationKind, NotificationPatch, NotificationStore};
use crate::tracker::{ScanTracker, TrackingHandle};
use crate::types::{ScanSessionStatus, SessionState, StartScanResponse};

/// How a terminal session ended, from the user's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    CompletedWithFailures { completed: u32, failed: u32 },
    Aborted(SessionAbortedError),
}

/// `None` while the session is still running.
pub fn outcome(status: &ScanSessionStatus) -> Option<SessionOutcome> {
    match status.status {
        SessionState::Running => None,
        SessionState::Failed => Some(SessionOutcome::Aborted(SessionAbortedError {
            session_id: status.session_id.clone(),
        })),
        SessionState::Completed if status.failed_scans > 0 => {
            Some(SessionOutcome::CompletedWithFailures {
                completed: status.completed_scans,
                failed: status.failed_scans,
            })
        }
        SessionState::Completed => Some(SessionOutcome::Completed),
    }
}

pub fn progress_text(status: &ScanSessionStatus) -> String {
    let mut text = format!(
        "{} of {} scans finished",
        status.finished_scans(),
        status.total_scans
    );
    if status.failed_scans > 0 {
        text.push_str(&format!(" ({} failed)", status.failed_scans));
    }
    text
}

/// Persistent notice shown while a session runs.
pub fn progress_notice(status: &ScanSessionStatus) -> NewNotification {
    NewNotification::new(NotificationKind::Info, "Scan in progress")
        .with_message(progress_text(status))
        .with_session(status.clone())
        .persistent()
}

pub fn outcome_notice(status: &ScanSessionStatus) -> NewNotification {
    let new = match outcome(status) {
        None => return progress_notice(status),
        Some(SessionOutcome::Completed) => {
            NewNotification::new(NotificationKind::Success, "Scan completed").with_message(
                format!("All {} scans completed successfully", status.completed_scans),
            )
        }
        Some(SessionOutcome::CompletedWithFailures { completed, failed }) => {
            NewNotification::new(NotificationKind::Warning, "Scan completed with failures")
                .with_message(format!("{completed} completed, {failed} failed"))
        }
        Some(SessionOutcome::Aborted(err)) => {
            NewNotification::new(NotificationKind::Error, "Scan failed").with_message(format!(
                "{err} after {} of {} scans",
                status.finished_scans(),
                status.total_scans
            ))
        }
    };
    new.with_session(status.clone())
}

pub fn start_failure_notice(err: &StartScanError) -> NewNotification {
    NewNotification::new(NotificationKind::Error, "Scan failed to start")
        .with_message(err.user_message())
}

/// Track `initial` and mirror it into `store`: one persistent progress notice while the
/// session runs, replaced by exactly one outcome notice when it ends.
///
/// Calling this again for a session that is already tracked reuses the existing notice and
/// does not post a second outcome. Stopping the tracker drops the progress notice.
pub fn track_with_notices(
    tracker: &ScanTracker,
    store: &NotificationStore,
    initial: StartScanResponse,
) -> TrackingHandle {
    let session_id = initial.session_id.clone();
    let seeded = ScanSessionStatus::from_started(&initial);
    store.session_notice(&session_id, progress_notice(&seeded));

    let updates = store.clone();
    let update_id = session_id.clone();
    let on_update = move |status: &ScanSessionStatus| {
        if let Some(id) = updates.notice_for_session(&update_id) {
            updates.update(
                id,
                NotificationPatch::default()
                    .message(progress_text(status))
                    .session(status.clone()),
            );
        }
    };

    let completions = store.clone();
    let complete_id = session_id;
    let on_complete = move |status: &ScanSessionStatus| {
        // Only the caller that still owns the session binding posts the outcome.
        if let Some(id) = completions.take_session_notice(&complete_id) {
            completions.remove(id);
            completions.add(outcome_notice(status));
        }
    };

    let handle = tracker.start_tracking(initial, on_update, on_complete);
    let stops = store.clone();
    let stop_id = handle.session_id().to_string();
    handle.on_stop(move |_| {
        if let Some(id) = stops.take_session_notice(&stop_id) {
            stops.remove(id);
        }
    });
    handle
}
