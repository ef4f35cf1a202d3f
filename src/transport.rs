//! Collaborator seams: the wire transport, the auth provider and the room
//! directory, plus the decoded event types that cross them.
//!
//! Events are `serde` enums tagged by `"type"`, matching the JSON frames the
//! server speaks:
//!
//! ```text
//! client → server   {"type":"join_room","room_id":"R1"}
//! server → client   {"type":"ai_message_chunk","id":"m9","content":"Hel"}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};
use crate::model::{
    Credentials, FileDescriptor, Message, MessageId, ReactionMap, Room, RoomId, Session,
    StreamMetadata, UserId,
};

/// Capacity of a transport's server-event fan-out channel.
pub const EVENT_CHANNEL_CAP: usize = 512;

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// Options for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom { room_id: RoomId },
    LeaveRoom { room_id: RoomId },
    SendMessage { room_id: RoomId, client_id: String, content: String },
    SendFileMessage { room_id: RoomId, client_id: String, file: FileDescriptor },
    /// History page older than `before` (exclusive), or the newest page when `None`.
    FetchHistory {
        room_id: RoomId,
        #[serde(skip_serializing_if = "Option::is_none")]
        before: Option<u64>,
        limit: usize,
    },
    AddReaction { message_id: MessageId, emoji: String },
    RemoveReaction { message_id: MessageId, emoji: String },
    MarkAsRead { room_id: RoomId, message_ids: Vec<MessageId> },
    /// Keep this session after a duplicate-login warning.
    ContinueSession,
    Ping,
}

impl ClientEvent {
    /// Wire name, used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. }        => "join_room",
            ClientEvent::LeaveRoom { .. }       => "leave_room",
            ClientEvent::SendMessage { .. }     => "send_message",
            ClientEvent::SendFileMessage { .. } => "send_file_message",
            ClientEvent::FetchHistory { .. }    => "fetch_history",
            ClientEvent::AddReaction { .. }     => "add_reaction",
            ClientEvent::RemoveReaction { .. }  => "remove_reaction",
            ClientEvent::MarkAsRead { .. }      => "mark_as_read",
            ClientEvent::ContinueSession        => "continue_session",
            ClientEvent::Ping                   => "ping",
        }
    }
}

/// Acknowledgement payload of a [`Transport::request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Ack,
    Joined { room_id: RoomId },
    History { messages: Vec<Message>, has_more: bool },
    Pong,
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    // -- lifecycle ----------------------------------------------------------
    Connected,
    Disconnected { reason: String },
    ConnectError { message: String },
    Reconnected,

    // -- session ------------------------------------------------------------
    DuplicateLogin { device_info: String, ip_address: String },
    SessionEnded { reason: String },

    // -- room ---------------------------------------------------------------
    Message { message: Message },
    ParticipantsUpdated { room_id: RoomId, participants: Vec<crate::model::Participant> },

    // -- streamed AI responses ----------------------------------------------
    AiMessageStart {
        id: MessageId,
        room_id: RoomId,
        #[serde(default)]
        metadata: StreamMetadata,
    },
    AiMessageChunk { id: MessageId, content: String },
    AiMessageComplete { id: MessageId, message: Message },
    AiMessageError { id: MessageId, error: String },

    // -- reactions / receipts -----------------------------------------------
    ReactionUpdated { message_id: MessageId, reactions: ReactionMap },
    ReactionRejected { message_id: MessageId, emoji: String, reason: String },
    MessagesRead { room_id: RoomId, user_id: UserId, message_ids: Vec<MessageId>, read_at: u64 },
}

impl ServerEvent {
    /// Room the event belongs to, when the event itself says so.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Message { message } => Some(&message.room_id),
            ServerEvent::AiMessageComplete { message, .. } => Some(&message.room_id),
            ServerEvent::ParticipantsUpdated { room_id, .. }
            | ServerEvent::AiMessageStart { room_id, .. }
            | ServerEvent::MessagesRead { room_id, .. } => Some(room_id),
            _ => None,
        }
    }

    /// Lifecycle and session events belong to the connection manager, not a room.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ServerEvent::Connected
                | ServerEvent::Disconnected { .. }
                | ServerEvent::ConnectError { .. }
                | ServerEvent::Reconnected
                | ServerEvent::DuplicateLogin { .. }
                | ServerEvent::SessionEnded { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// One persistent bidirectional connection.
///
/// `subscribe` is the listener registration point: every receiver sees every
/// server event published after it was created, and dropping the receiver
/// unregisters it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the connection and complete the handshake.
    async fn connect(&self, opts: &ConnectOptions) -> std::result::Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self);

    /// Fire-and-forget send.
    async fn emit(&self, event: ClientEvent) -> std::result::Result<(), TransportError>;

    /// Send and wait for the server's acknowledgement.
    async fn request(&self, event: ClientEvent) -> std::result::Result<ServerReply, TransportError>;

    /// Liveness probe.
    async fn ping(&self) -> std::result::Result<(), TransportError> {
        match self.request(ClientEvent::Ping).await? {
            ServerReply::Pong | ServerReply::Ack => Ok(()),
            other => Err(TransportError::Io(format!("unexpected ping reply: {other:?}"))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

/// Authentication collaborator.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    async fn current_session(&self) -> Option<Session>;
    async fn refresh_session(&self) -> Result<Session>;
    async fn logout(&self);
}

/// Room metadata lookup (`GET room info by id`).
#[async_trait]
pub trait RoomDirectory: Send + Sync + 'static {
    async fn fetch_room(&self, room_id: &str) -> Result<Room>;
}

// ---------------------------------------------------------------------------
// ListenerSet
// ---------------------------------------------------------------------------

/// Tasks consuming server events on behalf of one room.
///
/// Registration is all-or-nothing: a new set replaces the old one as a whole,
/// and dropping a set aborts every task in it.
#[derive(Debug, Default)]
pub struct ListenerSet {
    room_id: RoomId,
    handles: Vec<JoinHandle<()>>,
}

impl ListenerSet {
    pub fn new(room_id: impl Into<RoomId>) -> Self {
        Self { room_id: room_id.into(), handles: Vec::new() }
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// True while every task in the set is still running.
    pub fn is_live(&self) -> bool {
        !self.handles.is_empty() && self.handles.iter().all(|h| !h.is_finished())
    }

    pub fn abort_all(&mut self) {
        for h in self.handles.drain(..) {
            h.abort();
        }
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
