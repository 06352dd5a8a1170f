use serde::{Deserialize, Deserializer, Serialize};
use time::{format_description::well_known, OffsetDateTime};

/// Lifecycle of the single push connection.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// State of one scanner task inside a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Failed)
    }

    /// Position in the one-way `queued -> running -> terminal` progression.
    pub(crate) fn rank(self) -> u8 {
        match self {
            ScanState::Queued => 0,
            ScanState::Running => 1,
            ScanState::Completed | ScanState::Failed => 2,
        }
    }
}

/// Overall state of a scan session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Running,
    Completed,
    Failed,
}

/// One scanner invocation as reported by the backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanInfo {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub scan_type: String,
    pub target: String,
    pub status: ScanState,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub task_id: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
}

/// Live, merged view of a scan session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanSessionStatus {
    pub session_id: String,
    pub node_uuid: String,
    pub organization_uuid: String,
    pub status: SessionState,
    pub total_scans: u32,
    #[serde(default)]
    pub completed_scans: u32,
    #[serde(default)]
    pub failed_scans: u32,
    #[serde(default)]
    pub scans: Vec<ScanInfo>,
    pub created_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl ScanSessionStatus {
    /// Seed a running status from the start-scan response.
    pub fn from_started(started: &StartScanResponse) -> Self {
        Self {
            session_id: started.session_id.clone(),
            node_uuid: started.node_uuid.clone(),
            organization_uuid: started.organization_uuid.clone(),
            status: SessionState::Running,
            total_scans: started.total_scans,
            completed_scans: 0,
            failed_scans: 0,
            scans: started.scans.clone(),
            created_at: started.created_at.clone(),
            completed_at: None,
        }
    }

    pub fn finished_scans(&self) -> u32 {
        self.completed_scans.saturating_add(self.failed_scans)
    }

    pub fn is_terminal(&self) -> bool {
        self.status != SessionState::Running
    }
}

/// Body of the start-scan request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartScanRequest {
    pub scanners: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
}

/// Response of the start-scan call; seeds a tracker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartScanResponse {
    pub session_id: String,
    pub node_uuid: String,
    pub organization_uuid: String,
    pub total_scans: u32,
    #[serde(default)]
    pub scans: Vec<ScanInfo>,
    pub created_at: String,
}

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

/// Backends disagree on whether scan ids are numbers or strings; accept both.
pub(crate) fn id_string<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(de).map(RawId::into_string)
}

pub(crate) fn opt_id_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(de)?.map(RawId::into_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_info_accepts_numeric_ids() {
        let raw = r#"{"id": 42, "scan_type": "nmap", "target": "10.0.0.5",
                      "status": "queued", "task_id": 7, "created_at": "2024-01-01T00:00:00Z"}"#;
        let info: ScanInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.id, "42");
        assert_eq!(info.task_id.as_deref(), Some("7"));
        assert_eq!(info.completed_at, None);
    }

    #[test]
    fn terminal_states() {
        assert!(ScanState::Completed.is_terminal());
        assert!(ScanState::Failed.is_terminal());
        assert!(!ScanState::Running.is_terminal());
        assert!(ScanState::Queued.rank() < ScanState::Running.rank());
    }

    #[test]
    fn seeded_status_is_running_with_zero_counts() {
        let started = StartScanResponse {
            session_id: "s-1".into(),
            node_uuid: "n-1".into(),
            organization_uuid: "o-1".into(),
            total_scans: 2,
            scans: Vec::new(),
            created_at: "2024-01-01T00:00:00Z".into(),
        };
        let status = ScanSessionStatus::from_started(&started);
        assert_eq!(status.status, SessionState::Running);
        assert_eq!(status.finished_scans(), 0);
        assert!(!status.is_terminal());
    }
}
