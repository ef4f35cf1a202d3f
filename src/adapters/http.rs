//! HTTP room directory: `GET {base}/api/rooms/{id}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Result, SyncError, TransportError};
use crate::model::Room;
use crate::transport::RoomDirectory;

/// Settings for [`HttpRoomDirectory`].
#[derive(Debug, Clone)]
pub struct HttpRoomDirectoryConfig {
    /// API root, e.g. `http://127.0.0.1:8080`. Trailing slashes are ignored.
    pub base_url: String,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpRoomDirectoryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// [`RoomDirectory`] backed by the server's REST API.
#[derive(Debug, Clone)]
pub struct HttpRoomDirectory {
    config: HttpRoomDirectoryConfig,
    client: reqwest::Client,
}

impl HttpRoomDirectory {
    pub fn new(config: HttpRoomDirectoryConfig) -> Self {
        // Falls back to a default client instead of failing construction.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn room_url(&self, room_id: &str) -> String {
        format!("{}/api/rooms/{}", self.config.base_url, room_id)
    }
}

#[async_trait]
impl RoomDirectory for HttpRoomDirectory {
    async fn fetch_room(&self, room_id: &str) -> Result<Room> {
        let url = self.room_url(room_id);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Io(format!("{url}: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(format!("{url}: HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(TransportError::Rejected(format!("{url}: HTTP {}", status.as_u16())).into());
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Io(format!("{url}: {e}")))?;
        decode_room(&bytes).map_err(|e| TransportError::Rejected(format!("{url}: {e}")).into())
    }
}

/// Accepts both a bare `Room` and a `{ "room": Room }` envelope.
fn decode_room(bytes: &[u8]) -> std::result::Result<Room, serde_json::Error> {
    if let Ok(room) = serde_json::from_slice::<Room>(bytes) {
        return Ok(room);
    }
    #[derive(Deserialize)]
    struct Wrapped {
        room: Room,
    }
    serde_json::from_slice::<Wrapped>(bytes).map(|w| w.room)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_trims_trailing_slash() {
        let cfg = HttpRoomDirectoryConfig::new("http://localhost:8080/");
        assert_eq!(cfg.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_room_url_shape() {
        let dir = HttpRoomDirectory::new(HttpRoomDirectoryConfig::new("http://localhost:8080"));
        assert_eq!(dir.room_url("R1"), "http://localhost:8080/api/rooms/R1");
    }

    #[test]
    fn test_decode_bare_room() {
        let room = decode_room(br#"{"id":"R1","participants":[{"id":"u1","name":"Ada"}]}"#).unwrap();
        assert_eq!(room.id, "R1");
        assert_eq!(room.participants.len(), 1);
        assert!(!room.participants[0].is_ai);
    }

    #[test]
    fn test_decode_wrapped_room() {
        let room = decode_room(br#"{"room":{"id":"R2","metadata":{"name":"ops"}}}"#).unwrap();
        assert_eq!(room.id, "R2");
        assert_eq!(room.metadata.name, "ops");
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_room(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let mut cfg = HttpRoomDirectoryConfig::new("http://127.0.0.1:1");
        cfg.connect_timeout = Duration::from_millis(200);
        cfg.request_timeout = Duration::from_millis(500);
        let err = HttpRoomDirectory::new(cfg).fetch_room("R1").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Io(_))));
    }
}
