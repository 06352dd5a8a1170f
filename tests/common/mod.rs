#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use scanwatch::api::ScanApi;
use scanwatch::error::ApiError;
use scanwatch::types::{
    ScanInfo, ScanSessionStatus, ScanState, SessionState, StartScanRequest, StartScanResponse,
};

/// In-memory backend. Status polls pop queued replies first, then repeat the sticky status.
#[derive(Default)]
pub struct FakeApi {
    start: Mutex<Option<Result<StartScanResponse, (u16, Option<String>)>>>,
    queued: Mutex<VecDeque<Result<ScanSessionStatus, ApiError>>>,
    sticky: Mutex<Option<ScanSessionStatus>>,
    running: Mutex<Vec<ScanInfo>>,
    pub requests: Mutex<Vec<(String, StartScanRequest)>>,
    pub status_calls: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts_with(&self, response: StartScanResponse) {
        *self.start.lock().unwrap() = Some(Ok(response));
    }

    pub fn rejects_start(&self, status: u16, message: Option<&str>) {
        *self.start.lock().unwrap() = Some(Err((status, message.map(str::to_string))));
    }

    pub fn set_status(&self, status: ScanSessionStatus) {
        *self.sticky.lock().unwrap() = Some(status);
    }

    pub fn queue_status(&self, reply: Result<ScanSessionStatus, ApiError>) {
        self.queued.lock().unwrap().push_back(reply);
    }

    pub fn set_running(&self, scans: Vec<ScanInfo>) {
        *self.running.lock().unwrap() = scans;
    }

    pub fn polls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanApi for FakeApi {
    async fn start_scan(
        &self,
        node: &str,
        request: &StartScanRequest,
    ) -> Result<StartScanResponse, ApiError> {
        self.requests
            .lock()
            .unwrap()
            .push((node.to_string(), request.clone()));
        match self.start.lock().unwrap().clone() {
            Some(Ok(response)) => Ok(response),
            Some(Err((status, message))) => Err(ApiError::Status { status, message }),
            None => Err(ApiError::Status {
                status: 500,
                message: None,
            }),
        }
    }

    async fn session_status(&self, _session_id: &str) -> Result<ScanSessionStatus, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = self.queued.lock().unwrap().pop_front() {
            return reply;
        }
        match self.sticky.lock().unwrap().clone() {
            Some(status) => Ok(status),
            None => Err(ApiError::Status {
                status: 503,
                message: None,
            }),
        }
    }

    async fn running_scans(&self, _node: &str) -> Result<Vec<ScanInfo>, ApiError> {
        Ok(self.running.lock().unwrap().clone())
    }
}

pub fn scan(id: &str, status: ScanState) -> ScanInfo {
    ScanInfo {
        id: id.to_string(),
        scan_type: "nmap".to_string(),
        target: "10.0.0.1".to_string(),
        status,
        task_id: None,
        created_at: "2024-05-01T10:00:00Z".to_string(),
        completed_at: None,
    }
}

pub fn started(session_id: &str, ids: &[&str]) -> StartScanResponse {
    StartScanResponse {
        session_id: session_id.to_string(),
        node_uuid: "node-1".to_string(),
        organization_uuid: "org-1".to_string(),
        total_scans: ids.len() as u32,
        scans: ids.iter().map(|id| scan(id, ScanState::Queued)).collect(),
        created_at: "2024-05-01T10:00:00Z".to_string(),
    }
}

/// Backend view of `started` with the given per-scan states and session state.
pub fn polled(
    started: &StartScanResponse,
    states: &[(&str, ScanState)],
    session: SessionState,
) -> ScanSessionStatus {
    let mut status = ScanSessionStatus::from_started(started);
    for (id, state) in states {
        if let Some(s) = status.scans.iter_mut().find(|s| s.id == *id) {
            s.status = *state;
        }
    }
    status.completed_scans = status
        .scans
        .iter()
        .filter(|s| s.status == ScanState::Completed)
        .count() as u32;
    status.failed_scans = status
        .scans
        .iter()
        .filter(|s| s.status == ScanState::Failed)
        .count() as u32;
    status.status = session;
    status
}
