//! Ordered store of user-visible notices, each with its own expiry timer.
//!
//! The store is an explicitly owned handle (cheap to clone) rather than a process global;
//! [`crate::session::AppSession`] creates one per application session and clears it on
//! logout. All mutations apply in call order. Timers are spawned on the current tokio
//! runtime, so `add` must be called from within one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::types::ScanSessionStatus;

/// Default lifetime of a notice, in milliseconds.
pub const DEFAULT_DURATION_MS: u64 = 5_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NotificationId(u64);

impl NotificationId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for NotificationId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Success,
    Error,
    Warning,
    #[default]
    Info,
}

/// A stored notice.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// `0` means the notice stays until removed.
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_session_status: Option<ScanSessionStatus>,
}

/// A notice before the store has assigned its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: Option<String>,
    pub duration_ms: u64,
    pub scan_session_status: Option<ScanSessionStatus>,
}

impl NewNotification {
    pub fn new(kind: NotificationKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: None,
            duration_ms: DEFAULT_DURATION_MS,
            scan_session_status: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn persistent(self) -> Self {
        self.with_duration_ms(0)
    }

    pub fn with_session(mut self, status: ScanSessionStatus) -> Self {
        self.scan_session_status = Some(status);
        self
    }
}

/// Fields to merge into an existing notice. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationPatch {
    pub kind: Option<NotificationKind>,
    pub title: Option<String>,
    pub message: Option<Option<String>>,
    /// Recorded on the notice only; a running expiry timer is not affected.
    pub duration_ms: Option<u64>,
    pub scan_session_status: Option<Option<ScanSessionStatus>>,
}

impl NotificationPatch {
    pub fn kind(mut self, kind: NotificationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(Some(message.into()));
        self
    }

    pub fn session(mut self, status: ScanSessionStatus) -> Self {
        self.scan_session_status = Some(Some(status));
        self
    }

    fn apply(self, target: &mut Notification) {
        if let Some(kind) = self.kind {
            target.kind = kind;
        }
        if let Some(title) = self.title {
            target.title = title;
        }
        if let Some(message) = self.message {
            target.message = message;
        }
        if let Some(duration_ms) = self.duration_ms {
            target.duration_ms = duration_ms;
        }
        if let Some(status) = self.scan_session_status {
            target.scan_session_status = status;
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    next_id: u64,
    items: Vec<Notification>,
    timers: HashMap<NotificationId, AbortHandle>,
    sessions: HashMap<String, NotificationId>,
}

impl StoreInner {
    fn take(&mut self, id: NotificationId) -> bool {
        if let Some(timer) = self.timers.remove(&id) {
            timer.abort();
        }
        let before = self.items.len();
        self.items.retain(|n| n.id != id);
        self.items.len() != before
    }
}

/// Handle to the notification list. Clones share the same list.
#[derive(Debug, Clone)]
pub struct NotificationStore {
    inner: Arc<Mutex<StoreInner>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            revision: Arc::new(revision),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Append a notice and return its id. Starts the expiry timer unless the duration is 0.
    pub fn add(&self, new: NewNotification) -> NotificationId {
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = NotificationId(inner.next_id);
            let duration_ms = new.duration_ms;
            inner.items.push(Notification {
                id,
                kind: new.kind,
                title: new.title,
                message: new.message,
                duration_ms,
                scan_session_status: new.scan_session_status,
            });
            if duration_ms > 0 {
                let timer = spawn_expiry(
                    Arc::downgrade(&self.inner),
                    self.revision.clone(),
                    id,
                    Duration::from_millis(duration_ms),
                );
                inner.timers.insert(id, timer);
            }
            id
        };
        self.bump();
        id
    }

    /// Shallow-merge `patch` into the notice; unknown ids are ignored.
    pub fn update(&self, id: NotificationId, patch: NotificationPatch) -> bool {
        let updated = {
            let mut inner = self.lock();
            match inner.items.iter_mut().find(|n| n.id == id) {
                Some(target) => {
                    patch.apply(target);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.bump();
        }
        updated
    }

    pub fn remove(&self, id: NotificationId) -> bool {
        let removed = self.lock().take(id);
        if removed {
            self.bump();
        }
        removed
    }

    /// Remove every notice. Session bindings survive, as with [`remove`], so a running
    /// session still posts its outcome.
    ///
    /// [`remove`]: NotificationStore::remove
    pub fn clear_all(&self) {
        {
            let mut inner = self.lock();
            for (_, timer) in inner.timers.drain() {
                timer.abort();
            }
            inner.items.clear();
        }
        self.bump();
    }

    /// The notice bound to `session_id`, adding `new` the first time.
    ///
    /// The binding outlives the notice itself: once the user closes it, later calls return
    /// the same (now absent) id instead of re-adding, so updates become no-ops.
    pub fn session_notice(&self, session_id: &str, new: NewNotification) -> NotificationId {
        if let Some(id) = self.notice_for_session(session_id) {
            return id;
        }
        let id = self.add(new);
        let mut inner = self.lock();
        // Another caller may have bound the session between the lookup and the add.
        match inner.sessions.get(session_id) {
            Some(existing) => {
                let existing = *existing;
                drop(inner);
                self.remove(id);
                existing
            }
            None => {
                inner.sessions.insert(session_id.to_string(), id);
                id
            }
        }
    }

    pub fn notice_for_session(&self, session_id: &str) -> Option<NotificationId> {
        self.lock().sessions.get(session_id).copied()
    }

    /// Unbind the session's notice and return it. Only the first caller gets `Some`.
    pub fn take_session_notice(&self, session_id: &str) -> Option<NotificationId> {
        self.lock().sessions.remove(session_id)
    }

    pub fn get(&self, id: NotificationId) -> Option<Notification> {
        self.lock().items.iter().find(|n| n.id == id).cloned()
    }

    /// Notices in display order.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.lock().items.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revision counter bumped after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

fn spawn_expiry(
    inner: Weak<Mutex<StoreInner>>,
    revision: Arc<watch::Sender<u64>>,
    id: NotificationId,
    after: Duration,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let removed = {
            let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
            // Our own entry; drop it without aborting the running task.
            guard.timers.remove(&id);
            guard.take(id)
        };
        if removed {
            debug!(%id, "notification expired");
            revision.send_modify(|rev| *rev += 1);
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(title: &str) -> NewNotification {
        NewNotification::new(NotificationKind::Info, title)
    }

    #[tokio::test]
    async fn insertion_order_is_display_order() {
        let store = NotificationStore::new();
        let a = store.add(info("a"));
        let b = store.add(info("b"));
        assert_ne!(a, b);
        let titles: Vec<_> = store.snapshot().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_notice_expires() {
        let store = NotificationStore::new();
        let id = store.add(info("saved"));
        tokio::time::sleep(Duration::from_millis(4_990)).await;
        assert!(store.get(id).is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_notice_never_expires() {
        let store = NotificationStore::new();
        let id = store.add(info("scanning").persistent());
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert!(store.get(id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn update_does_not_reset_timer() {
        let store = NotificationStore::new();
        let id = store.add(info("x").with_duration_ms(1_000));
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(store.update(id, NotificationPatch::default().title("y").message("m")));
        let n = store.get(id).unwrap();
        assert_eq!(n.title, "y");
        assert_eq!(n.message.as_deref(), Some("m"));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.get(id).is_none());
    }

    #[tokio::test]
    async fn update_of_missing_id_is_noop() {
        let store = NotificationStore::new();
        assert!(!store.update(NotificationId(99), NotificationPatch::default().title("z")));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_cancels_timers() {
        let store = NotificationStore::new();
        store.add(info("a"));
        store.add(info("b").persistent());
        store.clear_all();
        assert!(store.is_empty());
        let after = store.add(info("c").persistent());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.snapshot()[0].id, after);
    }

    #[tokio::test]
    async fn session_notice_is_allocated_once() {
        let store = NotificationStore::new();
        let first = store.session_notice("s-1", info("scan").persistent());
        let second = store.session_notice("s-1", info("scan again").persistent());
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.take_session_notice("s-1"), Some(first));
        assert_eq!(store.take_session_notice("s-1"), None);
        // Unbinding leaves the notice in place.
        assert!(store.get(first).is_some());
    }

    #[tokio::test]
    async fn closed_session_notice_is_not_re_added() {
        let store = NotificationStore::new();
        let id = store.session_notice("s-2", info("scan").persistent());
        assert!(store.remove(id));
        assert_eq!(store.session_notice("s-2", info("scan").persistent()), id);
        assert!(store.is_empty());
        assert!(!store.update(id, NotificationPatch::default().message("1 of 2")));
        assert_eq!(store.take_session_notice("s-2"), Some(id));
    }

    #[tokio::test]
    async fn session_binding_survives_clear_all() {
        let store = NotificationStore::new();
        let id = store.session_notice("s-3", info("scan").persistent());
        store.clear_all();
        assert!(store.is_empty());
        assert_eq!(store.notice_for_session("s-3"), Some(id));
        assert_eq!(store.take_session_notice("s-3"), Some(id));
    }

    #[tokio::test]
    async fn revision_tracks_mutations() {
        let store = NotificationStore::new();
        let rx = store.subscribe();
        let id = store.add(info("a").persistent());
        store.update(id, NotificationPatch::default().kind(NotificationKind::Success));
        store.remove(id);
        assert_eq!(*rx.borrow(), 3);
    }
}
