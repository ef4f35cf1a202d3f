//! Concrete collaborators: a WebSocket transport, an HTTP room directory and
//! an in-memory auth provider. The core only sees the traits in
//! [`crate::transport`].

pub mod auth;
pub mod http;
pub mod ws;

pub use auth::StaticAuth;
pub use http::{HttpRoomDirectory, HttpRoomDirectoryConfig};
pub use ws::{WsTransport, WsTransportConfig};
