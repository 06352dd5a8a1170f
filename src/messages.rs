//! Push-channel envelopes and their typed decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedMessageError;
use crate::notifications::{NewNotification, NotificationKind};
use crate::types::{opt_id_string, ScanState};

/// Raw `{ type, payload }` frame as it travels over the socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Application-level heartbeat probe.
    pub fn ping() -> Self {
        Self::new("ping", Value::Object(Default::default()))
    }
}

/// Payload of the `scan_*` push messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ScanEvent {
    pub session_id: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub scan_id: Option<String>,
    #[serde(default)]
    pub scan_type: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
    #[serde(default, alias = "completed_at")]
    pub timestamp: Option<String>,
}

/// Payload of a server-initiated `notification` message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PushNotice {
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
}

impl From<PushNotice> for NewNotification {
    fn from(notice: PushNotice) -> Self {
        let mut new = NewNotification::new(notice.kind, notice.title);
        new.message = notice.message;
        if let Some(ms) = notice.duration {
            new.duration_ms = ms;
        }
        new
    }
}

/// Known inbound push messages.
#[derive(Debug, Clone, PartialEq)]
pub enum WebSocketMessage {
    ScanStarted(ScanEvent),
    ScanProgress(ScanEvent),
    ScanCompleted(ScanEvent),
    ScanFailed(ScanEvent),
    Notification(PushNotice),
    Info(Value),
    Pong,
}

impl WebSocketMessage {
    /// Decode a text frame. `Ok(None)` means a well-formed envelope of a type this client
    /// does not know; callers drop it.
    pub fn parse(text: &str) -> Result<Option<Self>, MalformedMessageError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, MalformedMessageError> {
        let Envelope { kind, payload } = envelope;
        let scan = |payload: Value| -> Result<ScanEvent, MalformedMessageError> {
            serde_json::from_value(payload).map_err(|source| MalformedMessageError::Payload {
                kind: kind.clone(),
                source,
            })
        };
        let msg = match kind.as_str() {
            "scan_started" => WebSocketMessage::ScanStarted(scan(payload)?),
            "scan_progress" => WebSocketMessage::ScanProgress(scan(payload)?),
            "scan_completed" => WebSocketMessage::ScanCompleted(scan(payload)?),
            "scan_failed" => WebSocketMessage::ScanFailed(scan(payload)?),
            "notification" => WebSocketMessage::Notification(
                serde_json::from_value(payload).map_err(|source| {
                    MalformedMessageError::Payload {
                        kind: kind.clone(),
                        source,
                    }
                })?,
            ),
            "info" => WebSocketMessage::Info(payload),
            "pong" => WebSocketMessage::Pong,
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WebSocketMessage::ScanStarted(_) => "scan_started",
            WebSocketMessage::ScanProgress(_) => "scan_progress",
            WebSocketMessage::ScanCompleted(_) => "scan_completed",
            WebSocketMessage::ScanFailed(_) => "scan_failed",
            WebSocketMessage::Notification(_) => "notification",
            WebSocketMessage::Info(_) => "info",
            WebSocketMessage::Pong => "pong",
        }
    }

    /// The scan event carried by a `scan_*` message together with the per-scan state it
    /// reports.
    pub fn scan_report(&self) -> Option<(&ScanEvent, ScanState)> {
        match self {
            WebSocketMessage::ScanStarted(e) | WebSocketMessage::ScanProgress(e) => {
                Some((e, ScanState::Running))
            }
            WebSocketMessage::ScanCompleted(e) => Some((e, ScanState::Completed)),
            WebSocketMessage::ScanFailed(e) => Some((e, ScanState::Failed)),
            _ => None,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let payload = match self {
            WebSocketMessage::ScanStarted(e)
            | WebSocketMessage::ScanProgress(e)
            | WebSocketMessage::ScanCompleted(e)
            | WebSocketMessage::ScanFailed(e) => serde_json::to_value(e),
            WebSocketMessage::Notification(n) => serde_json::to_value(n),
            WebSocketMessage::Info(v) => Ok(v.clone()),
            WebSocketMessage::Pong => Ok(Value::Object(Default::default())),
        };
        Envelope::new(self.kind(), payload.unwrap_or(Value::Null))
    }
}
