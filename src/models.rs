//! Core data model and wire DTOs
//!
//! Defines the closed category set, the stored message shape shared with the
//! full-text index, agent lifecycle states, and the WebSocket frame unions.
//! Wire framing is a thin boundary encoder: internally everything is a typed
//! variant, and JSON `{type, data}` objects exist only at the socket edge.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Current UTC timestamp in RFC 3339 format with milliseconds
///
/// The single timestamp profile used on every wire field.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Derive the exactly-once message identity
///
/// `"{userId}|{email}|{uid}"` is the sole dedupe key: a message delivered
/// any number of times for the same account maps to the same id.
pub fn message_id(user_id: &str, email: &str, uid: u64) -> String {
    format!("{user_id}|{email}|{uid}")
}

/// Closed classification label set
///
/// Wire strings are fixed; `Uncategorized` is the sentinel returned when
/// neither the model nor the keyword fallback resolves a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Interested,
    #[serde(rename = "Meeting Booked")]
    MeetingBooked,
    #[serde(rename = "Not Interested")]
    NotInterested,
    Spam,
    #[serde(rename = "Out of Office")]
    OutOfOffice,
    Uncategorized,
}

impl Category {
    /// Exact wire string for this label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interested => "Interested",
            Self::MeetingBooked => "Meeting Booked",
            Self::NotInterested => "Not Interested",
            Self::Spam => "Spam",
            Self::OutOfOffice => "Out of Office",
            Self::Uncategorized => "Uncategorized",
        }
    }

    /// Match a free-form model response against the label set
    ///
    /// Comparison is trimmed and case-insensitive; anything else is `None`.
    pub fn parse_label(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        [
            Self::Interested,
            Self::MeetingBooked,
            Self::NotInterested,
            Self::Spam,
            Self::OutOfOffice,
            Self::Uncategorized,
        ]
        .into_iter()
        .find(|c| trimmed.eq_ignore_ascii_case(c.as_str()))
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message envelope extracted before ingestion
#[derive(Debug, Clone, Default)]
pub struct MessageEnvelope {
    /// Decoded Subject header (empty if absent)
    pub subject: String,
    /// Decoded From header (display form)
    pub from: String,
    /// Recipient addresses
    pub to: Vec<String>,
    /// Parsed Date header
    pub date: Option<DateTime<Utc>>,
}

/// Raw message handed from an agent to the ingestion pipeline
///
/// Created from the IMAP FETCH stream and discarded after ingestion.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Message UID within the selected mailbox
    pub uid: u64,
    /// Extracted envelope fields
    pub envelope: MessageEnvelope,
    /// Full RFC822 source bytes
    pub source: Vec<u8>,
    /// Server INTERNALDATE, used for the backfill cutoff
    pub internal_date: Option<DateTime<Utc>>,
}

/// Indexed message record and its wire shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Exactly-once identity: `"{userId}|{email}|{uid}"`
    pub id: String,
    /// Owning tenant
    pub user_id: String,
    /// Mailbox address
    pub email: String,
    /// Source folder (always the primary inbox in this revision)
    pub folder: String,
    /// IMAP UID the record was ingested from
    pub uid: u64,
    /// Decoded subject
    pub subject: String,
    /// Decoded sender
    pub from: String,
    /// Recipient addresses
    pub to: Vec<String>,
    /// Message date (Date header, falling back to INTERNALDATE, then ingest time)
    pub date: DateTime<Utc>,
    /// Message body decoded as UTF-8 (replacement on invalid bytes)
    pub body: String,
    pub is_read: bool,
    pub is_starred: bool,
    /// Classifier label
    pub category: Category,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Agent lifecycle state
///
/// Transitions follow the fixed machine: `Starting → Syncing → Idle`, any
/// failure to `Error`, retry re-enters `Starting`, and `Stopped` is
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Starting,
    Syncing,
    Idle,
    Error(String),
    Stopped,
}

impl AgentState {
    /// Lowercase wire label for `sync_status` frames
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Syncing => "syncing",
            Self::Idle => "idle",
            Self::Error(_) => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Error detail carried by the `Error` state
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(msg) => write!(f, "error: {msg}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Payload of a `connection` frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionData {
    pub user_id: String,
    pub at: String,
}

/// Payload of a `new_email` frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEmailData {
    pub email: StoredMessage,
    pub user_id: String,
    pub at: String,
}

/// Payload of a `sync_status` frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusData {
    pub user_id: String,
    pub email: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: String,
}

/// Payload of a `pong` frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PongData {
    pub at: String,
}

/// Payload of a `test_message` frame (administrative path)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMessageData {
    pub message: String,
    pub at: String,
}

/// Payload of a `broadcast` frame (administrative path)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastData {
    pub message: serde_json::Value,
    pub at: String,
}

/// Outbound WebSocket frame union
///
/// Serializes as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame {
    Connection(ConnectionData),
    NewEmail(NewEmailData),
    SyncStatus(SyncStatusData),
    Pong(PongData),
    TestMessage(TestMessageData),
    Broadcast(BroadcastData),
}

impl Frame {
    /// Email key for `sync_status` coalescing; `None` for other frames
    pub fn sync_status_email(&self) -> Option<&str> {
        match self {
            Self::SyncStatus(data) => Some(&data.email),
            _ => None,
        }
    }

    /// Whether this frame must never be coalesced or dropped
    pub fn is_new_email(&self) -> bool {
        matches!(self, Self::NewEmail(_))
    }
}

/// Inbound WebSocket frame union
///
/// Text frames are JSON with a `type` discriminator; unknown types are
/// ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Ping,
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    #[serde(other)]
    Unknown,
}
