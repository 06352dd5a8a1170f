//! Per-session progress tracking.
//!
//! A tracked session is observed through two unreliable sources at once: `scan_*` push
//! messages and a fixed-interval poll of the session-status endpoint. [`SessionProgress`]
//! merges both into one [`ScanSessionStatus`]; the merge is order-independent because the
//! first terminal report for a scan wins and nothing ever moves a scan backwards.
//! [`ScanTracker`] runs one task per session and guarantees every `on_complete` callback
//! fires exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Notify};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ScanApi;
use crate::config::TrackerConfig;
use crate::connection::MessageFeed;
use crate::error::PollError;
use crate::messages::WebSocketMessage;
use crate::types::{
    now_rfc3339, ScanInfo, ScanSessionStatus, ScanState, SessionState, StartScanResponse,
};

pub type StatusCallback = Arc<dyn Fn(&ScanSessionStatus) + Send + Sync>;

/// Merged view of one session. Pure: no timers, no I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProgress {
    status: ScanSessionStatus,
    /// Scans known from the start response; anything after this index was discovered later.
    seeded: usize,
    reported_completed: u32,
    reported_failed: u32,
    aborted: bool,
    backend_completed: bool,
}

impl SessionProgress {
    pub fn new(started: &StartScanResponse) -> Self {
        let status = ScanSessionStatus::from_started(started);
        let seeded = status.scans.len();
        let mut progress = Self {
            status,
            seeded,
            reported_completed: 0,
            reported_failed: 0,
            aborted: false,
            backend_completed: false,
        };
        progress.recount();
        progress
    }

    pub fn status(&self) -> &ScanSessionStatus {
        &self.status
    }

    pub fn into_status(self) -> ScanSessionStatus {
        self.status
    }

    pub fn session_id(&self) -> &str {
        &self.status.session_id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge a push message. Returns whether anything changed.
    pub fn apply_message(&mut self, message: &WebSocketMessage) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some((event, state)) = message.scan_report() else {
            return false;
        };
        if event.session_id != self.status.session_id {
            return false;
        }
        let Some(scan_id) = event.scan_id.as_deref() else {
            return false;
        };
        let discovered = ScanInfo {
            id: scan_id.to_string(),
            scan_type: event.scan_type.clone().unwrap_or_default(),
            target: event.target.clone().unwrap_or_default(),
            status: ScanState::Queued,
            task_id: None,
            created_at: String::new(),
            completed_at: None,
        };
        let changed = self.merge_scan(discovered, state, event.timestamp.as_deref());
        self.settle(changed)
    }

    /// Merge a polled session status. Returns whether anything changed.
    pub fn apply_poll(&mut self, polled: &ScanSessionStatus) -> bool {
        if self.is_terminal() || polled.session_id != self.status.session_id {
            return false;
        }
        let mut changed = false;
        for scan in &polled.scans {
            let discovered = ScanInfo {
                status: ScanState::Queued,
                completed_at: None,
                ..scan.clone()
            };
            changed |= self.merge_scan(discovered, scan.status, scan.completed_at.as_deref());
        }
        if polled.completed_scans > self.reported_completed {
            self.reported_completed = polled.completed_scans;
            changed = true;
        }
        if polled.failed_scans > self.reported_failed {
            self.reported_failed = polled.failed_scans;
            changed = true;
        }
        if polled.total_scans > self.status.total_scans {
            self.status.total_scans = polled.total_scans;
            changed = true;
        }
        match polled.status {
            SessionState::Failed if !self.aborted => {
                self.aborted = true;
                changed = true;
            }
            SessionState::Completed if !self.backend_completed => {
                self.backend_completed = true;
                changed = true;
            }
            _ => {}
        }
        if self.status.completed_at.is_none() && polled.completed_at.is_some() {
            self.status.completed_at = polled.completed_at.clone();
            changed = true;
        }
        self.settle(changed)
    }

    /// Record a completion time if the session is terminal and none was reported.
    pub fn stamp_completion(&mut self, at: String) {
        if self.is_terminal() && self.status.completed_at.is_none() {
            self.status.completed_at = Some(at);
        }
    }

    fn merge_scan(&mut self, discovered: ScanInfo, state: ScanState, at: Option<&str>) -> bool {
        let mut changed = false;
        let idx = match self.status.scans.iter().position(|s| s.id == discovered.id) {
            Some(idx) => {
                changed |= fill_missing(&mut self.status.scans[idx], &discovered);
                idx
            }
            None => {
                let id = discovered.id.clone();
                self.status.scans.push(discovered);
                // Keep late discoveries in a stable order whatever source saw them first.
                self.status.scans[self.seeded..].sort_by(|a, b| a.id.cmp(&b.id));
                changed = true;
                self.status
                    .scans
                    .iter()
                    .position(|s| s.id == id)
                    .unwrap_or(self.status.scans.len() - 1)
            }
        };

        let scan = &mut self.status.scans[idx];
        if scan.status.is_terminal() {
            // First terminal report wins. A later agreeing report may only fill the timestamp.
            if scan.status == state && scan.completed_at.is_none() {
                if let Some(at) = at {
                    scan.completed_at = Some(at.to_string());
                    changed = true;
                }
            }
            return changed;
        }
        if state.rank() > scan.status.rank() {
            scan.status = state;
            if state.is_terminal() {
                scan.completed_at = at.map(str::to_string);
            }
            changed = true;
        }
        changed
    }

    fn settle(&mut self, changed: bool) -> bool {
        if changed {
            self.recount();
        }
        changed
    }

    /// Counts come from the merged per-scan states. Backend aggregates only fill in for
    /// scans that are not listed yet, so no scan is ever counted twice.
    fn recount(&mut self) {
        let derived = |state: ScanState| {
            self.status.scans.iter().filter(|s| s.status == state).count() as u32
        };
        let (derived_completed, derived_failed) =
            (derived(ScanState::Completed), derived(ScanState::Failed));
        let listed = u32::try_from(self.status.scans.len()).unwrap_or(u32::MAX);
        let total = self.status.total_scans.max(listed);
        let unlisted = total - listed;

        let extra_completed = self
            .reported_completed
            .saturating_sub(derived_completed)
            .min(unlisted);
        let extra_failed = self
            .reported_failed
            .saturating_sub(derived_failed)
            .min(unlisted - extra_completed);
        let completed = derived_completed + extra_completed;
        let failed = derived_failed + extra_failed;

        self.status.total_scans = total;
        self.status.completed_scans = completed;
        self.status.failed_scans = failed;
        self.status.status = if self.aborted {
            SessionState::Failed
        } else if completed + failed == total || self.backend_completed {
            SessionState::Completed
        } else {
            SessionState::Running
        };
    }
}

fn fill_missing(scan: &mut ScanInfo, from: &ScanInfo) -> bool {
    let mut changed = false;
    for (slot, value) in [
        (&mut scan.scan_type, &from.scan_type),
        (&mut scan.target, &from.target),
        (&mut scan.created_at, &from.created_at),
    ] {
        if slot.is_empty() && !value.is_empty() {
            slot.clone_from(value);
            changed = true;
        }
    }
    if scan.task_id.is_none() && from.task_id.is_some() {
        scan.task_id.clone_from(&from.task_id);
        changed = true;
    }
    changed
}

struct SessionShared {
    progress: SessionProgress,
    on_update: Vec<StatusCallback>,
    on_complete: Vec<StatusCallback>,
    on_stop: Vec<StatusCallback>,
    finished: bool,
    stopped: bool,
}

#[derive(Clone)]
struct SessionEntry {
    shared: Arc<Mutex<SessionShared>>,
    cancel: CancellationToken,
    nudge: Arc<Notify>,
    /// Flipped once tracking ended and every completion callback has returned.
    done: Arc<watch::Sender<bool>>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionEntry {
    fn same(&self, other: &SessionEntry) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn is_terminal(&self) -> bool {
        relock(&self.shared).progress.is_terminal()
    }

    fn snapshot(&self) -> ScanSessionStatus {
        relock(&self.shared).progress.status().clone()
    }

    /// Run a merge and notify `on_update` subscribers if it changed anything.
    fn apply(&self, merge: impl FnOnce(&mut SessionProgress) -> bool) {
        let (status, callbacks) = {
            let mut shared = relock(&self.shared);
            if shared.finished || !merge(&mut shared.progress) {
                return;
            }
            shared.progress.stamp_completion(now_rfc3339());
            (shared.progress.status().clone(), shared.on_update.clone())
        };
        debug_assert!(status.finished_scans() <= status.total_scans);
        for callback in &callbacks {
            callback(&status);
        }
    }

    fn emit_update(&self) {
        let (status, callbacks) = {
            let shared = relock(&self.shared);
            if shared.finished {
                return;
            }
            (shared.progress.status().clone(), shared.on_update.clone())
        };
        for callback in &callbacks {
            callback(&status);
        }
    }

    /// Mark finished and hand back the completion callbacks, once.
    fn close(&self) -> Option<(ScanSessionStatus, Vec<StatusCallback>)> {
        let mut shared = relock(&self.shared);
        if shared.finished {
            return None;
        }
        shared.finished = true;
        shared.on_update.clear();
        shared.on_stop.clear();
        let callbacks = std::mem::take(&mut shared.on_complete);
        Some((shared.progress.status().clone(), callbacks))
    }

    /// Cancel the task and run the `on_stop` callbacks, unless the session already ended.
    fn halt(&self) -> bool {
        self.cancel.cancel();
        let stopped = {
            let mut shared = relock(&self.shared);
            if shared.finished {
                None
            } else {
                shared.finished = true;
                shared.stopped = true;
                shared.on_update.clear();
                shared.on_complete.clear();
                let callbacks = std::mem::take(&mut shared.on_stop);
                Some((shared.progress.status().clone(), callbacks))
            }
        };
        let halted = stopped.is_some();
        if let Some((status, callbacks)) = stopped {
            for callback in &callbacks {
                callback(&status);
            }
        }
        self.done.send_replace(true);
        halted
    }
}

struct TrackerInner {
    api: Arc<dyn ScanApi>,
    feed: Option<MessageFeed>,
    config: TrackerConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl TrackerInner {
    /// Drop the registry entry if it still belongs to `entry`.
    fn release(&self, session_id: &str, entry: &SessionEntry) {
        let mut sessions = relock(&self.sessions);
        if sessions.get(session_id).is_some_and(|e| e.same(entry)) {
            sessions.remove(session_id);
        }
    }

    fn cancel(&self, session_id: &str, entry: &SessionEntry) {
        self.release(session_id, entry);
        if entry.halt() {
            info!(%session_id, "stopped tracking scan session");
        }
    }
}

/// Runs one tracking task per scan session.
#[derive(Clone)]
pub struct ScanTracker {
    inner: Arc<TrackerInner>,
}

impl fmt::Debug for ScanTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanTracker")
            .field("config", &self.inner.config)
            .field("active", &self.active_sessions())
            .finish()
    }
}

impl ScanTracker {
    /// `feed` is the push fan-out to listen on; `None` tracks by polling alone.
    pub fn new(api: Arc<dyn ScanApi>, feed: Option<MessageFeed>, config: TrackerConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                api,
                feed,
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Track the session described by `initial`.
    ///
    /// Idempotent per `session_id`: while a session is tracked, further calls attach their
    /// callbacks to the running tracker instead of starting a second one, and the new
    /// `on_update` immediately receives the current status. Each call's `on_complete` runs
    /// exactly once, when the session turns terminal; never after `stop`.
    pub fn start_tracking<U, C>(
        &self,
        initial: StartScanResponse,
        on_update: U,
        on_complete: C,
    ) -> TrackingHandle
    where
        U: Fn(&ScanSessionStatus) + Send + Sync + 'static,
        C: Fn(&ScanSessionStatus) + Send + Sync + 'static,
    {
        let on_update: StatusCallback = Arc::new(on_update);
        let on_complete: StatusCallback = Arc::new(on_complete);
        let session_id = initial.session_id.clone();

        let mut sessions = relock(&self.inner.sessions);
        if let Some(entry) = sessions.get(&session_id).cloned() {
            let snapshot = {
                let mut shared = relock(&entry.shared);
                shared.on_update.push(on_update.clone());
                shared.on_complete.push(on_complete);
                shared.progress.status().clone()
            };
            drop(sessions);
            debug!(%session_id, "session already tracked; attaching callbacks");
            on_update(&snapshot);
            return self.handle(session_id, entry);
        }

        let entry = SessionEntry {
            shared: Arc::new(Mutex::new(SessionShared {
                progress: SessionProgress::new(&initial),
                on_update: vec![on_update],
                on_complete: vec![on_complete],
                on_stop: Vec::new(),
                finished: false,
                stopped: false,
            })),
            cancel: CancellationToken::new(),
            nudge: Arc::new(Notify::new()),
            done: Arc::new(watch::channel(false).0),
        };
        sessions.insert(session_id.clone(), entry.clone());
        drop(sessions);

        // Subscribe before the task starts so nothing published in between is missed.
        let events = self.inner.feed.as_ref().map(MessageFeed::subscribe);
        info!(
            %session_id,
            node = %initial.node_uuid,
            total = initial.total_scans,
            "tracking scan session"
        );
        tokio::spawn(run_session(
            self.inner.clone(),
            session_id.clone(),
            entry.clone(),
            events,
        ));
        self.handle(session_id, entry)
    }

    fn handle(&self, session_id: String, entry: SessionEntry) -> TrackingHandle {
        TrackingHandle {
            session_id,
            entry,
            tracker: Arc::downgrade(&self.inner),
        }
    }

    /// Cancel tracking of `session_id` without firing `on_complete`.
    pub fn stop(&self, session_id: &str) -> bool {
        let entry = relock(&self.inner.sessions).get(session_id).cloned();
        match entry {
            Some(entry) => {
                self.inner.cancel(session_id, &entry);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let entries: Vec<_> = relock(&self.inner.sessions).drain().collect();
        for (session_id, entry) in entries {
            self.inner.cancel(&session_id, &entry);
        }
    }

    pub fn is_tracking(&self, session_id: &str) -> bool {
        relock(&self.inner.sessions).contains_key(session_id)
    }

    pub fn status(&self, session_id: &str) -> Option<ScanSessionStatus> {
        let entry = relock(&self.inner.sessions).get(session_id).cloned();
        entry.map(|e| e.snapshot())
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<_> = relock(&self.inner.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Handle to one tracked session. Dropping it does not stop tracking; call [`stop`].
///
/// [`stop`]: TrackingHandle::stop
#[derive(Clone)]
pub struct TrackingHandle {
    session_id: String,
    entry: SessionEntry,
    tracker: Weak<TrackerInner>,
}

impl fmt::Debug for TrackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingHandle")
            .field("session_id", &self.session_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl TrackingHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> ScanSessionStatus {
        self.entry.snapshot()
    }

    /// True once the session completed or tracking was stopped.
    pub fn is_finished(&self) -> bool {
        relock(&self.entry.shared).finished
    }

    /// Resolves once the session completed and its `on_complete` callbacks ran, or once
    /// tracking was stopped.
    pub async fn finished(&self) {
        let mut done = self.entry.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Poll the session status now instead of waiting for the next interval.
    pub fn refresh(&self) {
        self.entry.nudge.notify_one();
    }

    /// Stop polling and drop the push subscription; `on_complete` will not fire.
    pub fn stop(&self) {
        match self.tracker.upgrade() {
            Some(tracker) => tracker.cancel(&self.session_id, &self.entry),
            None => {
                self.entry.halt();
            }
        }
    }

    /// Run `callback` when tracking is stopped before the session ended. Runs right away if
    /// that already happened; never runs once the session completed.
    pub fn on_stop<F>(&self, callback: F)
    where
        F: Fn(&ScanSessionStatus) + Send + Sync + 'static,
    {
        let status = {
            let mut shared = relock(&self.entry.shared);
            if !shared.finished {
                shared.on_stop.push(Arc::new(callback));
                return;
            }
            if !shared.stopped {
                return;
            }
            shared.progress.status().clone()
        };
        callback(&status);
    }
}

async fn next_push(
    events: &mut Option<broadcast::Receiver<WebSocketMessage>>,
) -> Result<WebSocketMessage, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_session(
    inner: Arc<TrackerInner>,
    session_id: String,
    entry: SessionEntry,
    mut events: Option<broadcast::Receiver<WebSocketMessage>>,
) {
    let mut poll = time::interval(inner.config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    entry.emit_update();

    while !entry.is_terminal() {
        tokio::select! {
            biased;
            _ = entry.cancel.cancelled() => {
                debug!(%session_id, "tracking task cancelled");
                return;
            }
            received = next_push(&mut events) => match received {
                Ok(message) => {
                    if let Some((event, _)) = message.scan_report() {
                        if event.session_id == session_id && event.scan_id.is_none() {
                            // Session-level hint without a scan id: ask the backend.
                            poll.reset_immediately();
                        }
                    }
                    entry.apply(|p| p.apply_message(&message));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%session_id, skipped, "push subscription lagged; polling now");
                    poll.reset_immediately();
                }
                Err(RecvError::Closed) => {
                    debug!(%session_id, "push feed closed; polling only");
                    events = None;
                }
            },
            _ = entry.nudge.notified() => poll.reset_immediately(),
            _ = poll.tick() => {
                let polled = tokio::select! {
                    biased;
                    _ = entry.cancel.cancelled() => return,
                    polled = inner.api.session_status(&session_id) => polled,
                };
                match polled {
                    Ok(status) => entry.apply(|p| p.apply_poll(&status)),
                    Err(source) => {
                        let err = PollError {
                            target: format!("session {session_id}"),
                            source,
                        };
                        warn!(error = %err, "session status poll failed; retrying");
                    }
                }
            }
        }
    }

    inner.release(&session_id, &entry);
    relock(&entry.shared).progress.stamp_completion(now_rfc3339());
    if let Some((status, callbacks)) = entry.close() {
        info!(
            %session_id,
            status = ?status.status,
            completed = status.completed_scans,
            failed = status.failed_scans,
            total = status.total_scans,
            "scan session finished"
        );
        for callback in &callbacks {
            callback(&status);
        }
    }
    entry.done.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ScanEvent;

    fn scan(id: &str) -> ScanInfo {
        ScanInfo {
            id: id.to_string(),
            scan_type: "nmap".into(),
            target: "10.0.0.1".into(),
            status: ScanState::Queued,
            task_id: None,
            created_at: "2024-05-01T10:00:00Z".into(),
            completed_at: None,
        }
    }

    fn started(ids: &[&str]) -> StartScanResponse {
        StartScanResponse {
            session_id: "s1".into(),
            node_uuid: "node-1".into(),
            organization_uuid: "org-1".into(),
            total_scans: ids.len() as u32,
            scans: ids.iter().map(|id| scan(id)).collect(),
            created_at: "2024-05-01T10:00:00Z".into(),
        }
    }

    fn event(scan_id: &str) -> ScanEvent {
        ScanEvent {
            session_id: "s1".into(),
            scan_id: Some(scan_id.into()),
            ..Default::default()
        }
    }

    fn polled(progress: &SessionProgress, states: &[(&str, ScanState)]) -> ScanSessionStatus {
        let mut status = progress.status().clone();
        for (id, state) in states {
            if let Some(s) = status.scans.iter_mut().find(|s| s.id == *id) {
                s.status = *state;
            }
        }
        status
    }

    #[test]
    fn first_terminal_report_wins() {
        let mut p = SessionProgress::new(&started(&["a", "b"]));
        assert!(p.apply_message(&WebSocketMessage::ScanCompleted(event("a"))));
        assert!(!p.apply_message(&WebSocketMessage::ScanFailed(event("a"))));
        let poll = polled(&p, &[("a", ScanState::Failed)]);
        p.apply_poll(&poll);
        assert_eq!(p.status().scans[0].status, ScanState::Completed);
        assert_eq!(p.status().completed_scans, 1);
        assert_eq!(p.status().failed_scans, 0);
    }

    #[test]
    fn running_never_regresses_to_queued() {
        let mut p = SessionProgress::new(&started(&["a", "b"]));
        p.apply_message(&WebSocketMessage::ScanStarted(event("a")));
        let poll = polled(&p, &[("a", ScanState::Queued)]);
        p.apply_poll(&poll);
        assert_eq!(p.status().scans[0].status, ScanState::Running);
    }

    #[test]
    fn push_and_poll_reach_completed_with_failures() {
        let mut p = SessionProgress::new(&started(&["a", "b", "c"]));
        p.apply_message(&WebSocketMessage::ScanCompleted(event("a")));
        p.apply_message(&WebSocketMessage::ScanCompleted(event("b")));
        assert!(!p.is_terminal());
        let mut poll = p.status().clone();
        poll.scans[2].status = ScanState::Failed;
        poll.scans[0].status = ScanState::Running;
        poll.scans[1].status = ScanState::Running;
        p.apply_poll(&poll);
        let s = p.status();
        assert_eq!((s.completed_scans, s.failed_scans), (2, 1));
        assert_eq!(s.status, SessionState::Completed);
    }

    #[test]
    fn backend_failure_is_terminal_regardless_of_counts() {
        let mut p = SessionProgress::new(&started(&["a"]));
        let mut poll = p.status().clone();
        poll.status = SessionState::Failed;
        assert!(p.apply_poll(&poll));
        assert_eq!(p.status().status, SessionState::Failed);
        assert_eq!(p.status().finished_scans(), 0);
        assert!(p.is_terminal());
    }

    #[test]
    fn other_sessions_are_ignored() {
        let mut p = SessionProgress::new(&started(&["a"]));
        let mut foreign = event("a");
        foreign.session_id = "s2".into();
        assert!(!p.apply_message(&WebSocketMessage::ScanCompleted(foreign)));
        assert!(!p.apply_message(&WebSocketMessage::Pong));
    }

    #[test]
    fn counts_never_exceed_total() {
        let mut p = SessionProgress::new(&started(&["a"]));
        let mut poll = p.status().clone();
        poll.completed_scans = 3;
        poll.failed_scans = 1;
        p.apply_poll(&poll);
        let s = p.status();
        assert!(s.completed_scans + s.failed_scans <= s.total_scans);
    }

    #[test]
    fn late_discovered_scans_are_ordered_by_id() {
        let mut p = SessionProgress::new(&StartScanResponse {
            total_scans: 2,
            scans: Vec::new(),
            ..started(&[])
        });
        p.apply_message(&WebSocketMessage::ScanProgress(event("z")));
        p.apply_message(&WebSocketMessage::ScanProgress(event("m")));
        let ids: Vec<_> = p.status().scans.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["m", "z"]);
    }

    #[test]
    fn agreeing_late_report_fills_timestamp() {
        let mut p = SessionProgress::new(&started(&["a", "b"]));
        p.apply_message(&WebSocketMessage::ScanCompleted(event("a")));
        let mut poll = p.status().clone();
        poll.scans[0].completed_at = Some("2024-05-01T10:05:00Z".into());
        p.apply_poll(&poll);
        assert_eq!(
            p.status().scans[0].completed_at.as_deref(),
            Some("2024-05-01T10:05:00Z")
        );
    }

    #[test]
    fn conflicting_aggregate_does_not_count_a_scan_twice() {
        let mut p = SessionProgress::new(&started(&["a", "b"]));
        p.apply_message(&WebSocketMessage::ScanFailed(event("a")));
        let mut poll = polled(&p, &[("a", ScanState::Completed), ("b", ScanState::Running)]);
        poll.completed_scans = 1;
        poll.failed_scans = 0;
        p.apply_poll(&poll);

        let s = p.status();
        assert_eq!(s.scans[0].status, ScanState::Failed);
        assert_eq!(s.scans[1].status, ScanState::Running);
        assert_eq!((s.completed_scans, s.failed_scans), (0, 1));
        assert_eq!(s.status, SessionState::Running);
    }

    #[test]
    fn aggregates_only_fill_unlisted_scans() {
        let mut p = SessionProgress::new(&StartScanResponse {
            total_scans: 3,
            ..started(&["a"])
        });
        let mut poll = p.status().clone();
        poll.completed_scans = 2;
        poll.failed_scans = 2;
        p.apply_poll(&poll);
        let s = p.status();
        assert_eq!((s.completed_scans, s.failed_scans), (2, 0));
        assert_eq!(s.status, SessionState::Running);
    }

    #[test]
    fn huge_reported_counts_saturate() {
        let mut p = SessionProgress::new(&started(&["a", "b"]));
        let mut poll = p.status().clone();
        poll.completed_scans = u32::MAX;
        poll.failed_scans = 1;
        p.apply_poll(&poll);
        let s = p.status();
        assert!(s.finished_scans() <= s.total_scans);
        assert_eq!(s.status, SessionState::Running);
    }

    enum Report {
        Push(WebSocketMessage),
        Poll(ScanSessionStatus),
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for rest in permutations(n - 1) {
            for at in 0..=rest.len() {
                let mut order = rest.clone();
                order.insert(at, n - 1);
                out.push(order);
            }
        }
        out
    }

    fn final_status(
        initial: &StartScanResponse,
        reports: &[Report],
        order: &[usize],
    ) -> ScanSessionStatus {
        let mut p = SessionProgress::new(initial);
        for &i in order {
            match &reports[i] {
                Report::Push(message) => p.apply_message(message),
                Report::Poll(status) => p.apply_poll(status),
            };
        }
        p.into_status()
    }

    fn assert_order_independent(initial: &StartScanResponse, reports: &[Report]) {
        let orders = permutations(reports.len());
        let expected = final_status(initial, reports, &orders[0]);
        assert!(expected.is_terminal());
        for order in &orders[1..] {
            assert_eq!(final_status(initial, reports, order), expected, "order {order:?}");
        }
    }

    #[test]
    fn every_interleaving_reaches_the_same_status() {
        let initial = started(&["a", "b", "c"]);
        let base = SessionProgress::new(&initial);
        let mut lagging = polled(&base, &[("a", ScanState::Running), ("c", ScanState::Running)]);
        lagging.completed_scans = 0;
        let mut leading = polled(&base, &[("a", ScanState::Running), ("b", ScanState::Running)]);
        leading.completed_scans = 2;
        leading.failed_scans = 1;
        let mut last = polled(
            &base,
            &[
                ("a", ScanState::Completed),
                ("b", ScanState::Failed),
                ("c", ScanState::Completed),
            ],
        );
        last.completed_scans = 2;
        last.failed_scans = 1;

        let reports = vec![
            Report::Push(WebSocketMessage::ScanStarted(event("a"))),
            Report::Push(WebSocketMessage::ScanCompleted(event("a"))),
            Report::Push(WebSocketMessage::ScanFailed(event("b"))),
            Report::Poll(lagging),
            Report::Poll(leading),
            Report::Poll(last),
        ];
        assert_order_independent(&initial, &reports);
        let done = final_status(&initial, &reports, &[0, 1, 2, 3, 4, 5]);
        assert_eq!((done.completed_scans, done.failed_scans), (2, 1));
        assert_eq!(done.status, SessionState::Completed);
    }

    #[test]
    fn every_interleaving_with_late_discovery_agrees() {
        let initial = StartScanResponse {
            total_scans: 2,
            ..started(&["a"])
        };
        let base = SessionProgress::new(&initial);
        let mut partial = polled(&base, &[("a", ScanState::Running)]);
        partial.completed_scans = 1;
        let mut full = polled(&base, &[("a", ScanState::Completed)]);
        full.scans.push(ScanInfo {
            status: ScanState::Completed,
            ..scan("b")
        });
        full.completed_scans = 2;

        let reports = vec![
            Report::Push(WebSocketMessage::ScanCompleted(ScanEvent {
                scan_type: Some("nmap".into()),
                target: Some("10.0.0.1".into()),
                ..event("b")
            })),
            Report::Poll(partial),
            Report::Poll(full),
        ];
        assert_order_independent(&initial, &reports);
    }

    #[test]
    fn empty_session_is_immediately_complete() {
        let p = SessionProgress::new(&started(&[]));
        assert!(p.is_terminal());
        assert_eq!(p.status().status, SessionState::Completed);
    }
}
