//! The application session: one owner for the push connection, the notification store,
//! the scan tracker, per-node pollers and the lookup cache.
//!
//! Everything here lives exactly as long as the user is signed in; [`AppSession::logout`]
//! tears it all down.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::api::{HttpScanApi, ScanApi};
use crate::cache::LookupCache;
use crate::config::{PollerConfig, WatchConfig};
use crate::connection::{ConnectionHandler, ConnectionManager};
use crate::error::{ApiError, ConnectionError, StartScanError};
use crate::messages::WebSocketMessage;
use crate::notices::{start_failure_notice, track_with_notices};
use crate::notifications::NotificationStore;
use crate::poller::ScanPoller;
use crate::ports::normalize_ports;
use crate::tracker::{ScanTracker, TrackingHandle};
use crate::types::StartScanRequest;

/// Connection hooks of an application session.
struct SessionHandler {
    notifications: NotificationStore,
    authenticated: Arc<AtomicBool>,
}

impl ConnectionHandler for SessionHandler {
    fn on_message(&self, message: &WebSocketMessage) {
        if let WebSocketMessage::Notification(notice) = message {
            self.notifications.add(notice.clone().into());
        }
    }

    fn should_reconnect(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

struct NodeWatch {
    poller: ScanPoller,
    views: usize,
}

pub struct AppSession {
    api: Arc<dyn ScanApi>,
    connection: ConnectionManager,
    notifications: NotificationStore,
    tracker: ScanTracker,
    poller_config: PollerConfig,
    pollers: Mutex<HashMap<String, NodeWatch>>,
    cache: LookupCache,
    authenticated: Arc<AtomicBool>,
}

impl fmt::Debug for AppSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppSession")
            .field("connection", &self.connection)
            .field("tracker", &self.tracker)
            .field("notifications", &self.notifications.len())
            .finish()
    }
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppSession {
    /// Session talking to the configured HTTP backend.
    pub fn from_config(config: &WatchConfig) -> Result<Self, ApiError> {
        let api = HttpScanApi::new(&config.api())?;
        Ok(Self::new(config, Arc::new(api)))
    }

    pub fn new(config: &WatchConfig, api: Arc<dyn ScanApi>) -> Self {
        let connection = ConnectionManager::new(config.connection());
        let tracker = ScanTracker::new(api.clone(), Some(connection.feed()), config.tracker());
        Self {
            api,
            connection,
            notifications: NotificationStore::new(),
            tracker,
            poller_config: config.poller(),
            pollers: Mutex::new(HashMap::new()),
            cache: LookupCache::new(config.cache_dir.clone(), config.cache_ttl()),
            authenticated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn notifications(&self) -> &NotificationStore {
        &self.notifications
    }

    pub fn tracker(&self) -> &ScanTracker {
        &self.tracker
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Mark the session signed in and open the push channel.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.authenticated.store(true, Ordering::SeqCst);
        let handler = SessionHandler {
            notifications: self.notifications.clone(),
            authenticated: self.authenticated.clone(),
        };
        self.connection.connect_shared(Arc::new(handler)).await
    }

    /// Start a scan session on `node` and track it with a live progress notice.
    ///
    /// Failures are surfaced right away as an error notice and returned.
    pub async fn start_scan(
        &self,
        node: &str,
        scanners: Vec<String>,
        ports: Option<&str>,
    ) -> Result<TrackingHandle, StartScanError> {
        match self.launch(node, scanners, ports).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                warn!(node, error = %err, "scan session failed to start");
                self.notifications.add(start_failure_notice(&err));
                Err(err)
            }
        }
    }

    async fn launch(
        &self,
        node: &str,
        scanners: Vec<String>,
        ports: Option<&str>,
    ) -> Result<TrackingHandle, StartScanError> {
        let scanners: Vec<String> = scanners
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if scanners.is_empty() {
            return Err(StartScanError::NoScanners);
        }
        let ports = match ports.map(str::trim).filter(|p| !p.is_empty()) {
            Some(expr) => Some(
                normalize_ports(expr).map_err(|e| StartScanError::InvalidPorts(format!("{e:#}")))?,
            ),
            None => None,
        };

        let request = StartScanRequest { scanners, ports };
        let started = self.api.start_scan(node, &request).await?;
        if let Err(err) = self.cache.put(&scanners_key(node), &request.scanners).await {
            warn!(node, error = ?err, "failed to remember scanner selection");
        }
        info!(
            node,
            session_id = %started.session_id,
            total = started.total_scans,
            "scan session started"
        );
        self.poller_for(node).mark_scan_started();
        Ok(track_with_notices(&self.tracker, &self.notifications, started))
    }

    /// Scanner selection of the last scan started on `node`, while it is still cached.
    pub async fn remembered_scanners(&self, node: &str) -> Option<Vec<String>> {
        match self.cache.get(&scanners_key(node)).await {
            Ok(scanners) => scanners,
            Err(err) => {
                warn!(node, error = ?err, "failed to read cached scanner selection");
                None
            }
        }
    }

    /// The poller of `node`, created idle on first use.
    pub fn poller_for(&self, node: &str) -> ScanPoller {
        let mut pollers = relock(&self.pollers);
        pollers
            .entry(node.to_string())
            .or_insert_with(|| NodeWatch {
                poller: ScanPoller::new(self.api.clone(), node, self.poller_config),
                views: 0,
            })
            .poller
            .clone()
    }

    /// The poller of `node` if one was ever created; never allocates.
    pub fn existing_poller(&self, node: &str) -> Option<ScanPoller> {
        relock(&self.pollers).get(node).map(|watch| watch.poller.clone())
    }

    /// A view of `node` opened: start polling its running scans.
    pub fn watch_node(&self, node: &str) -> ScanPoller {
        let poller = self.poller_for(node);
        if let Some(watch) = relock(&self.pollers).get_mut(node) {
            watch.views += 1;
        }
        poller.start();
        poller
    }

    /// A view of `node` closed: stop polling once no view is left.
    pub fn unwatch_node(&self, node: &str) {
        let mut pollers = relock(&self.pollers);
        if let Some(watch) = pollers.get_mut(node) {
            watch.views = watch.views.saturating_sub(1);
            if watch.views == 0 {
                watch.poller.stop();
            }
        }
    }

    /// Sign out: stop every tracker and poller, close the push channel, drop all notices
    /// and cached lookups.
    pub async fn logout(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        self.tracker.stop_all();
        let pollers: Vec<_> = relock(&self.pollers).drain().collect();
        for (_, watch) in pollers {
            watch.poller.stop();
        }
        self.connection.disconnect().await;
        self.notifications.clear_all();
        if let Err(err) = self.cache.clear().await {
            warn!(error = ?err, "failed to clear lookup cache");
        }
        info!("session logged out");
    }
}

fn scanners_key(node: &str) -> String {
    format!("scanners-{node}")
}
