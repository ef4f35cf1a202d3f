//! # roomsync
//!
//! Client-side synchronization core for a realtime chat room. Keeps the view
//! of one room consistent with the server over an unreliable persistent
//! connection: human messages, streamed AI replies and reaction/read-receipt
//! deltas are merged into one ordered, deduplicated timeline that survives
//! reconnects, duplicate-session takeovers and history paging.
//!
//! ```text
//!  ConnectionManager ──state / Reconnected──► RoomSession
//!                                               │
//!            ┌──────────────────┬───────────────┼──────────────────┐
//!            ▼                  ▼               ▼                  ▼
//!      TimelineStore ◄── StreamAssembler   ReactionReconciler   observables
//! ```
//!
//! The wire is reached only through the traits in [`transport`]; [`adapters`]
//! holds a WebSocket implementation and friends.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod reactions;
pub mod session;
pub mod streaming;
pub mod timeline;
pub mod transport;

pub use config::{
    AuthConfig, ConnectionConfig, ReactionConfig, SetupConfig, StreamingConfig, SyncConfig, TimelineConfig,
};
pub use connection::{Backoff, BackoffStep, ConnectionEvent, ConnectionManager};
pub use error::{Result, SyncError, TransportError};
pub use model::{
    ConnectionState, Credentials, FileDescriptor, Message, MessageKind, Participant, ReactionMap, ReadReceipt, Room,
    RoomMetadata, Session, StreamMetadata, StreamingMessage, ViewportMetrics,
};
pub use reactions::{ReactionOp, ReactionReconciler, ReadTracker};
pub use session::{CleanupReason, HistoryPage, Notice, RoomSession, RoomSessionBuilder, RoomStatus};
pub use streaming::StreamAssembler;
pub use timeline::{AppendOutcome, MergeOutcome, ScrollAnchor, TimelineStore};
pub use transport::{AuthProvider, ClientEvent, ConnectOptions, ListenerSet, RoomDirectory, ServerEvent, ServerReply, Transport};
