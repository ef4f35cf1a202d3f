//! Shared data types: sessions, rooms, participants and messages.
//!
//! These mirror what the server sends once the transport has decoded it. They
//! carry no behaviour beyond small helpers; the components that own them decide
//! how and when they change.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type MessageId = String;
pub type RoomId = String;
pub type UserId = String;

/// Emoji → set of users who reacted with it.
pub type ReactionMap = BTreeMap<String, BTreeSet<UserId>>;

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An authenticated session, owned by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub auth_token: String,
    pub session_id: String,
    pub last_activity_at: u64,
}

impl Session {
    /// True once the session has been idle for longer than `window`.
    pub fn is_expired(&self, now_ms: u64, window: Duration) -> bool {
        now_ms.saturating_sub(self.last_activity_at) > window.as_millis() as u64
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user_id: self.user_id.clone(),
            auth_token: self.auth_token.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// What the connection manager needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: UserId,
    pub auth_token: String,
    pub session_id: String,
}

impl Credentials {
    /// Structural check only; the server still decides whether the token is good.
    pub fn is_well_formed(&self) -> bool {
        [&self.user_id, &self.auth_token, &self.session_id]
            .iter()
            .all(|s| !s.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Lifecycle of the one persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Fatal,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle         => write!(f, "idle"),
            ConnectionState::Connecting   => write!(f, "connecting"),
            ConnectionState::Connected    => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Fatal        => write!(f, "fatal"),
        }
    }
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

/// A member of a room, human or AI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub is_ai: bool,
}

/// Room configuration as returned by the room directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub metadata: RoomMetadata,
}

impl Room {
    /// Add `local` to the participant list if the server left it out.
    ///
    /// Returns true when the list was changed.
    pub fn ensure_participant(&mut self, local: &Participant) -> bool {
        if self.participants.iter().any(|p| p.id == local.id) {
            return false;
        }
        self.participants.push(local.clone());
        true
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Upload descriptor produced by the upload collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub filename: String,
    pub mimetype: String,
    pub size: u64,
}

/// Variant-specific message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    Text { text: String },
    File {
        file: FileDescriptor,
        #[serde(default)]
        caption: Option<String>,
    },
    Ai {
        text: String,
        #[serde(default)]
        model: Option<String>,
    },
    System { text: String },
}

impl MessageKind {
    /// Human-readable body, used by the terminal harness.
    pub fn body(&self) -> &str {
        match self {
            MessageKind::Text { text }
            | MessageKind::Ai { text, .. }
            | MessageKind::System { text } => text,
            MessageKind::File { file, caption } => caption.as_deref().unwrap_or(&file.filename),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub read_at: u64,
}

/// A committed timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(default)]
    pub readers: Vec<ReadReceipt>,
    #[serde(default)]
    pub reactions: ReactionMap,
}

impl Message {
    pub fn text(id: impl Into<String>, room_id: impl Into<String>, sender_id: impl Into<String>, timestamp: u64, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            timestamp,
            kind: MessageKind::Text { text: text.into() },
            readers: Vec::new(),
            reactions: ReactionMap::new(),
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self.kind, MessageKind::Ai { .. })
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.readers.iter().any(|r| r.user_id == user_id)
    }
}

/// Metadata sent with the first event of a streamed AI response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default)]
    pub model: Option<String>,
}

/// An AI response still being generated. Never part of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub partial_content: String,
    pub started_at: u64,
    /// Last time a start or chunk touched this entry.
    pub updated_at: u64,
    pub metadata: StreamMetadata,
}

/// Reported by the view so the core can reason about scroll position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ViewportMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ViewportMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }

    pub fn is_near_bottom(&self, threshold_px: f64) -> bool {
        self.distance_from_bottom() <= threshold_px
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
