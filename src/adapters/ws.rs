//! JSON-over-WebSocket [`Transport`].
//!
//! Frames are UTF-8 JSON text messages. Client events carry an optional
//! `request_id`; the server answers acknowledged requests with a reply frame
//! echoing it:
//!
//! ```text
//! → {"type":"join_room","room_id":"R1","request_id":7}
//! ← {"type":"reply","request_id":7,"reply":{"type":"joined","room_id":"R1"}}
//! ← {"type":"reply","request_id":8,"error":"room is full"}
//! ← {"type":"message","message":{...}}
//! ```
//!
//! One writer task owns the sink; one reader task routes replies to their
//! waiting requests and everything else to the broadcast channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{ClientEvent, ConnectOptions, ServerEvent, ServerReply, Transport, EVENT_CHANNEL_CAP};

type ReplyResult = std::result::Result<ServerReply, TransportError>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ReplyResult>>>>;

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply { request_id: u64, result: ReplyResult },
    Event(ServerEvent),
}

#[derive(Deserialize)]
struct ReplyEnvelope {
    request_id: u64,
    #[serde(default)]
    reply: Option<ServerReply>,
    #[serde(default)]
    error: Option<String>,
}

/// Serialize a client event, tagging it with `request_id` when it expects a reply.
pub fn encode_frame(event: &ClientEvent, request_id: Option<u64>) -> std::result::Result<String, TransportError> {
    let mut value = serde_json::to_value(event).map_err(|e| TransportError::Io(format!("encode: {e}")))?;
    if let (Some(id), Some(obj)) = (request_id, value.as_object_mut()) {
        obj.insert("request_id".into(), id.into());
    }
    Ok(value.to_string())
}

pub fn decode_frame(text: &str) -> std::result::Result<Inbound, TransportError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| TransportError::Io(format!("decode: {e}")))?;
    if value.get("request_id").is_some() {
        let env: ReplyEnvelope =
            serde_json::from_value(value).map_err(|e| TransportError::Io(format!("decode reply: {e}")))?;
        let result = match (env.reply, env.error) {
            (_, Some(err)) => Err(TransportError::Rejected(err)),
            (Some(reply), None) => Ok(reply),
            (None, None) => Ok(ServerReply::Ack),
        };
        return Ok(Inbound::Reply { request_id: env.request_id, result });
    }
    serde_json::from_value(value)
        .map(Inbound::Event)
        .map_err(|e| TransportError::Io(format!("decode event: {e}")))
}

// ---------------------------------------------------------------------------
// WsTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// How long an acknowledged request waits for its reply.
    pub request_timeout: Duration,
}

impl WsTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), request_timeout: Duration::from_secs(10) }
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct WsTransport {
    config: WsTransportConfig,
    events_tx: broadcast::Sender<ServerEvent>,
    link: Mutex<Option<Link>>,
    pending: PendingMap,
    next_request: AtomicU64,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self {
            config,
            events_tx,
            link: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .map(|l| l.as_ref().map(|l| !l.reader.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    fn send_text(&self, text: String) -> std::result::Result<(), TransportError> {
        let guard = self.link.lock().map_err(|_| TransportError::NotConnected)?;
        let link = guard.as_ref().ok_or(TransportError::NotConnected)?;
        link.outbound
            .send(WsMessage::Text(text))
            .map_err(|_| TransportError::Closed("writer stopped".into()))
    }

    fn forget_request(&self, request_id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.remove(&request_id);
        }
    }
}

fn map_connect_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
            TransportError::Unauthorized(format!("handshake rejected with HTTP {}", resp.status().as_u16()))
        }
        other => TransportError::Io(other.to_string()),
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = match pending.lock() {
        Ok(mut p) => p.drain().collect(),
        Err(_) => return,
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(TransportError::Closed(reason.to_string())));
    }
}

fn route(text: &str, events: &broadcast::Sender<ServerEvent>, pending: &PendingMap) {
    match decode_frame(text) {
        Ok(Inbound::Reply { request_id, result }) => {
            let waiter = pending.lock().ok().and_then(|mut p| p.remove(&request_id));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => debug!(target: "roomsync::ws", request_id, "reply for unknown request"),
            }
        }
        Ok(Inbound::Event(event)) => {
            let _ = events.send(event);
        }
        Err(e) => warn!(target: "roomsync::ws", error = %e, "undecodable frame dropped"),
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, opts: &ConnectOptions) -> std::result::Result<(), TransportError> {
        self.disconnect().await;

        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Io(format!("invalid url {}: {e}", self.config.url)))?;
        let creds = &opts.credentials;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", creds.auth_token))
            .map_err(|e| TransportError::Unauthorized(format!("token not sendable: {e}")))?;
        request.headers_mut().insert("authorization", bearer);
        if let Ok(v) = HeaderValue::from_str(&creds.session_id) {
            request.headers_mut().insert("x-session-id", v);
        }
        if let Ok(v) = HeaderValue::from_str(&creds.user_id) {
            request.headers_mut().insert("x-user-id", v);
        }

        let (stream, _) = connect_async(request).await.map_err(map_connect_error)?;
        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!(target: "roomsync::ws", error = %e, "write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let events = self.events_tx.clone();
        let pending = Arc::clone(&self.pending);
        let pong_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => route(&text, &events, &pending),
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = pong_tx.send(WsMessage::Pong(payload));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            fail_pending(&pending, &reason);
            let _ = events.send(ServerEvent::Disconnected { reason });
        });

        if let Ok(mut link) = self.link.lock() {
            *link = Some(Link { outbound: out_tx, reader, writer });
        }
        info!(target: "roomsync::ws", url = %self.config.url, "websocket connected");
        let _ = self.events_tx.send(ServerEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        let link = self.link.lock().ok().and_then(|mut l| l.take());
        let Some(link) = link else { return };
        link.reader.abort();
        let _ = link.outbound.send(WsMessage::Close(None));
        drop(link.outbound);
        // The writer exits once the queue drains and the sender is gone.
        let _ = tokio::time::timeout(Duration::from_secs(1), link.writer).await;
        fail_pending(&self.pending, "disconnected");
        debug!(target: "roomsync::ws", "websocket closed");
    }

    async fn emit(&self, event: ClientEvent) -> std::result::Result<(), TransportError> {
        self.send_text(encode_frame(&event, None)?)
    }

    async fn request(&self, event: ClientEvent) -> std::result::Result<ServerReply, TransportError> {
        let name = event.name();
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            p.insert(request_id, tx);
        }
        let sent = encode_frame(&event, Some(request_id)).and_then(|text| self.send_text(text));
        if let Err(e) = sent {
            self.forget_request(request_id);
            return Err(e);
        }
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed(format!("{name}: connection dropped before reply"))),
            Err(_) => {
                self.forget_request(request_id);
                Err(TransportError::Io(format!("{name}: no reply within {:?}", self.config.request_timeout)))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Credentials;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn opts() -> ConnectOptions {
        ConnectOptions {
            credentials: Credentials { user_id: "u1".into(), auth_token: "tok".into(), session_id: "s1".into() },
        }
    }

    #[test]
    fn test_encode_adds_request_id() {
        let text = encode_frame(&ClientEvent::JoinRoom { room_id: "R1".into() }, Some(7)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v, json!({"type": "join_room", "room_id": "R1", "request_id": 7}));
    }

    #[test]
    fn test_encode_without_request_id() {
        let text = encode_frame(&ClientEvent::Ping, None).unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_decode_reply_ok() {
        let frame = r#"{"type":"reply","request_id":3,"reply":{"type":"joined","room_id":"R1"}}"#;
        assert_eq!(
            decode_frame(frame).unwrap(),
            Inbound::Reply { request_id: 3, result: Ok(ServerReply::Joined { room_id: "R1".into() }) }
        );
    }

    #[test]
    fn test_decode_reply_error() {
        let frame = r#"{"type":"reply","request_id":4,"error":"room is full"}"#;
        assert!(matches!(
            decode_frame(frame).unwrap(),
            Inbound::Reply { request_id: 4, result: Err(TransportError::Rejected(_)) }
        ));
    }

    #[test]
    fn test_decode_bare_reply_is_ack() {
        let frame = r#"{"type":"reply","request_id":5}"#;
        assert_eq!(decode_frame(frame).unwrap(), Inbound::Reply { request_id: 5, result: Ok(ServerReply::Ack) });
    }

    #[test]
    fn test_decode_event() {
        let frame = r#"{"type":"session_ended","reason":"admin"}"#;
        assert_eq!(
            decode_frame(frame).unwrap(),
            Inbound::Event(ServerEvent::SessionEnded { reason: "admin".into() })
        );
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(decode_frame("{").is_err());
        assert!(decode_frame(r#"{"type":"no_such_event"}"#).is_err());
    }

    #[tokio::test]
    async fn test_emit_without_connection_fails() {
        let t = WsTransport::new(WsTransportConfig::new("ws://127.0.0.1:1"));
        assert_eq!(t.emit(ClientEvent::Ping).await, Err(TransportError::NotConnected));
        assert_eq!(t.request(ClientEvent::Ping).await, Err(TransportError::NotConnected));
        assert!(t.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_reply_and_events_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                if v["type"] == "join_room" {
                    let id = v["request_id"].as_u64().unwrap();
                    let reply = json!({"type": "reply", "request_id": id, "reply": {"type": "joined", "room_id": "R1"}});
                    ws.send(WsMessage::Text(reply.to_string())).await.unwrap();
                    let start = json!({"type": "ai_message_start", "id": "m1", "room_id": "R1"});
                    ws.send(WsMessage::Text(start.to_string())).await.unwrap();
                }
            }
        });

        let t = WsTransport::new(WsTransportConfig::new(format!("ws://{addr}")));
        let mut events = t.subscribe();
        t.connect(&opts()).await.unwrap();
        assert!(t.is_connected());
        assert_eq!(events.recv().await.unwrap(), ServerEvent::Connected);

        let reply = t.request(ClientEvent::JoinRoom { room_id: "R1".into() }).await.unwrap();
        assert_eq!(reply, ServerReply::Joined { room_id: "R1".into() });
        assert!(matches!(events.recv().await.unwrap(), ServerEvent::AiMessageStart { .. }));

        t.disconnect().await;
        assert!(!t.is_connected());
    }
}
