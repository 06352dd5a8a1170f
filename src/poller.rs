//! Running-scans indicator for one node.
//!
//! A [`ScanPoller`] refreshes the node's running-scan listing on a fixed interval while a
//! view of that node is open. Right after the user launches a scan the backend may not list
//! it yet, so a short grace window keeps the indicator at [`ActivityIndicator::Starting`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::ScanApi;
use crate::config::PollerConfig;
use crate::error::PollError;
use crate::ticker::{TickFlow, Ticker};
use crate::types::ScanInfo;

/// Latest listing plus whether a fetch is in flight.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct RunningScans {
    pub scans: Vec<ScanInfo>,
    pub loading: bool,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "state", content = "count", rename_all = "snake_case")]
pub enum ActivityIndicator {
    Idle,
    /// A scan was just launched and is not listed yet.
    Starting,
    Running(usize),
}

struct PollerInner {
    api: Arc<dyn ScanApi>,
    node: String,
    config: PollerConfig,
    state: watch::Sender<RunningScans>,
    grace_until: Mutex<Option<Instant>>,
    ticker: Mutex<Option<Ticker>>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PollerInner {
    async fn refresh(&self) -> Result<(), PollError> {
        self.state.send_modify(|s| s.loading = true);
        match self.api.running_scans(&self.node).await {
            Ok(scans) => {
                debug!(node = %self.node, running = scans.len(), "running scans refreshed");
                if !scans.is_empty() {
                    relock(&self.grace_until).take();
                }
                self.state.send_modify(|s| {
                    s.scans = scans;
                    s.loading = false;
                });
                Ok(())
            }
            Err(source) => {
                self.state.send_modify(|s| s.loading = false);
                Err(PollError {
                    target: format!("running scans of node {}", self.node),
                    source,
                })
            }
        }
    }
}

/// Polls one node's running scans. Clones share the same state and loop.
#[derive(Clone)]
pub struct ScanPoller {
    inner: Arc<PollerInner>,
}

impl fmt::Debug for ScanPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanPoller")
            .field("node", &self.inner.node)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ScanPoller {
    pub fn new(api: Arc<dyn ScanApi>, node: impl Into<String>, config: PollerConfig) -> Self {
        let (state, _) = watch::channel(RunningScans::default());
        Self {
            inner: Arc::new(PollerInner {
                api,
                node: node.into(),
                config,
                state,
                grace_until: Mutex::new(None),
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// Start the interval loop; the first refresh happens right away. No-op while running.
    pub fn start(&self) {
        let mut ticker = relock(&self.inner.ticker);
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *ticker = Some(Ticker::spawn(self.inner.config.interval, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return TickFlow::Stop;
                };
                if let Err(err) = inner.refresh().await {
                    warn!(error = %err, "running scans poll failed; keeping last listing");
                }
                TickFlow::Continue
            }
        }));
        debug!(node = %self.inner.node, "running scans poller started");
    }

    /// Stop the interval loop. The last listing stays readable.
    pub fn stop(&self) {
        if let Some(ticker) = relock(&self.inner.ticker).take() {
            ticker.stop();
            debug!(node = %self.inner.node, "running scans poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        relock(&self.inner.ticker)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Fetch the listing now. On failure the previous listing is kept.
    pub async fn refresh(&self) -> Result<(), PollError> {
        self.inner.refresh().await
    }

    pub fn snapshot(&self) -> RunningScans {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunningScans> {
        self.inner.state.subscribe()
    }

    /// Arm the start grace window and refresh early if the loop is running.
    pub fn mark_scan_started(&self) {
        let until = Instant::now() + self.inner.config.start_grace;
        *relock(&self.inner.grace_until) = Some(until);
        if let Some(ticker) = relock(&self.inner.ticker).as_ref() {
            ticker.nudge();
        }
    }

    pub fn indicator(&self) -> ActivityIndicator {
        let running = self.inner.state.borrow().scans.len();
        if running > 0 {
            return ActivityIndicator::Running(running);
        }
        let grace = *relock(&self.inner.grace_until);
        match grace {
            Some(until) if Instant::now() < until => ActivityIndicator::Starting,
            _ => ActivityIndicator::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::types::{ScanSessionStatus, ScanState, StartScanRequest, StartScanResponse};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time;

    #[derive(Default)]
    struct Listing {
        replies: Mutex<VecDeque<Result<Vec<ScanInfo>, ApiError>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScanApi for Listing {
        async fn start_scan(
            &self,
            _node: &str,
            _request: &StartScanRequest,
        ) -> Result<StartScanResponse, ApiError> {
            Err(ApiError::Url("unused".into()))
        }

        async fn session_status(&self, _session_id: &str) -> Result<ScanSessionStatus, ApiError> {
            Err(ApiError::Url("unused".into()))
        }

        async fn running_scans(&self, _node: &str) -> Result<Vec<ScanInfo>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn running(id: &str) -> ScanInfo {
        ScanInfo {
            id: id.into(),
            scan_type: "nmap".into(),
            target: "10.0.0.9".into(),
            status: ScanState::Running,
            task_id: None,
            created_at: "2024-05-01T10:00:00Z".into(),
            completed_at: None,
        }
    }

    fn poller(replies: Vec<Result<Vec<ScanInfo>, ApiError>>) -> (ScanPoller, Arc<Listing>) {
        let api = Arc::new(Listing {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        });
        let poller = ScanPoller::new(api.clone(), "node-1", PollerConfig::default());
        (poller, api)
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval_until_stopped() {
        let (poller, api) = poller(vec![Ok(vec![running("a")])]);
        poller.start();
        poller.start();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(poller.indicator(), ActivityIndicator::Running(1));

        time::sleep(Duration::from_secs(15)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
        assert_eq!(poller.indicator(), ActivityIndicator::Idle);

        poller.stop();
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_shows_starting_then_expires() {
        let (poller, _api) = poller(Vec::new());
        poller.mark_scan_started();
        poller.refresh().await.unwrap();
        assert_eq!(poller.indicator(), ActivityIndicator::Starting);

        time::advance(Duration::from_secs(46)).await;
        assert_eq!(poller.indicator(), ActivityIndicator::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn listed_scan_disarms_grace() {
        let (poller, _api) = poller(vec![Ok(vec![running("a")]), Ok(Vec::new())]);
        poller.mark_scan_started();
        poller.refresh().await.unwrap();
        assert_eq!(poller.indicator(), ActivityIndicator::Running(1));
        poller.refresh().await.unwrap();
        assert_eq!(poller.indicator(), ActivityIndicator::Idle);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_listing() {
        let (poller, _api) = poller(vec![
            Ok(vec![running("a"), running("b")]),
            Err(ApiError::Status {
                status: 503,
                message: None,
            }),
        ]);
        poller.refresh().await.unwrap();
        let err = poller.refresh().await.unwrap_err();
        assert!(err.to_string().contains("node-1"));
        let snap = poller.snapshot();
        assert_eq!(snap.scans.len(), 2);
        assert!(!snap.loading);
    }
}
