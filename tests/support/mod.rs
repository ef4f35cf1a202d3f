//! Scripted collaborators for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use roomsync::{
    AuthProvider, ClientEvent, ConnectOptions, ConnectionManager, Credentials, Message, Notice, Participant,
    Room, RoomDirectory, RoomMetadata, RoomSession, ServerEvent, ServerReply, Session, SyncConfig, SyncError,
    Transport, TransportError,
};

pub const LOCAL_USER: &str = "u1";

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TransportState {
    connected: bool,
    connect_script: VecDeque<Result<(), TransportError>>,
    connect_fallback: Option<TransportError>,
    connect_calls: usize,
    emitted: Vec<ClientEvent>,
    requests: Vec<ClientEvent>,
    history: HashMap<Option<u64>, (Vec<Message>, bool)>,
    failing_emits: HashSet<&'static str>,
    hanging_emits: HashSet<&'static str>,
    hang_joins: bool,
    history_delay: Option<Duration>,
    hang_history: bool,
    fail_pings: bool,
}

/// In-memory transport. Connect results can be scripted; requests are
/// answered from canned history pages.
pub struct MockTransport {
    events: broadcast::Sender<ServerEvent>,
    state: Mutex<TransportState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self { events, state: Mutex::new(TransportState::default()) })
    }

    /// Results for the next connect calls, in order. Afterwards the fallback applies.
    pub fn script_connects(&self, results: Vec<Result<(), TransportError>>) {
        self.state.lock().unwrap().connect_script = results.into();
    }

    /// Every unscripted connect fails with `error` (or succeeds for `None`).
    pub fn connect_fallback(&self, error: Option<TransportError>) {
        self.state.lock().unwrap().connect_fallback = error;
    }

    pub fn set_history(&self, before: Option<u64>, messages: Vec<Message>, has_more: bool) {
        self.state.lock().unwrap().history.insert(before, (messages, has_more));
    }

    pub fn fail_emits(&self, name: &'static str) {
        self.state.lock().unwrap().failing_emits.insert(name);
    }

    /// Emits named `name` are recorded and then never complete.
    pub fn hang_emits(&self, name: &'static str) {
        self.state.lock().unwrap().hanging_emits.insert(name);
    }

    /// History replies arrive after `delay`.
    pub fn delay_history(&self, delay: Duration) {
        self.state.lock().unwrap().history_delay = Some(delay);
    }

    pub fn hang_joins(&self, hang: bool) {
        self.state.lock().unwrap().hang_joins = hang;
    }

    pub fn hang_history(&self, hang: bool) {
        self.state.lock().unwrap().hang_history = hang;
    }

    pub fn fail_pings(&self, fail: bool) {
        self.state.lock().unwrap().fail_pings = fail;
    }

    /// Deliver a server event to every subscriber.
    pub fn push(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Simulate the socket dropping.
    pub fn drop_connection(&self, reason: &str) {
        self.state.lock().unwrap().connected = false;
        self.push(ServerEvent::Disconnected { reason: reason.to_string() });
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().unwrap().connect_calls
    }

    pub fn emitted(&self) -> Vec<ClientEvent> {
        self.state.lock().unwrap().emitted.clone()
    }

    pub fn requests(&self) -> Vec<ClientEvent> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn emitted_named(&self, name: &str) -> usize {
        self.emitted().iter().filter(|e| e.name() == name).count()
    }

    pub fn requested_named(&self, name: &str) -> usize {
        self.requests().iter().filter(|e| e.name() == name).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _opts: &ConnectOptions) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap();
        st.connect_calls += 1;
        let result = match st.connect_script.pop_front() {
            Some(r) => r,
            None => match &st.connect_fallback {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            },
        };
        st.connected = result.is_ok();
        result
    }

    async fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        let hang = {
            let mut st = self.state.lock().unwrap();
            if !st.connected {
                return Err(TransportError::NotConnected);
            }
            if st.failing_emits.contains(event.name()) {
                return Err(TransportError::Io(format!("{} refused", event.name())));
            }
            let hang = st.hanging_emits.contains(event.name());
            st.emitted.push(event);
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn request(&self, event: ClientEvent) -> Result<ServerReply, TransportError> {
        let (hang, delay, reply) = {
            let mut st = self.state.lock().unwrap();
            if !st.connected {
                return Err(TransportError::NotConnected);
            }
            st.requests.push(event.clone());
            let delay = match &event {
                ClientEvent::FetchHistory { .. } => st.history_delay,
                _ => None,
            };
            let (hang, reply) = match &event {
                ClientEvent::JoinRoom { room_id } => {
                    (st.hang_joins, Ok(ServerReply::Joined { room_id: room_id.clone() }))
                }
                ClientEvent::FetchHistory { before, .. } => {
                    let (messages, has_more) = st.history.get(before).cloned().unwrap_or((Vec::new(), false));
                    (st.hang_history, Ok(ServerReply::History { messages, has_more }))
                }
                ClientEvent::Ping if st.fail_pings => (false, Err(TransportError::Io("ping lost".into()))),
                ClientEvent::Ping => (false, Ok(ServerReply::Pong)),
                _ => (false, Ok(ServerReply::Ack)),
            };
            (hang, delay, reply)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if hang {
            std::future::pending::<()>().await;
        }
        reply
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// MockAuth
// ---------------------------------------------------------------------------

pub struct MockAuth {
    session: Mutex<Option<Session>>,
    refresh_ok: Mutex<bool>,
    pub refreshes: AtomicUsize,
    pub logouts: AtomicUsize,
}

impl MockAuth {
    pub fn new(session: Option<Session>) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(session),
            refresh_ok: Mutex::new(true),
            refreshes: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
        })
    }

    pub fn refresh_fails(&self) {
        *self.refresh_ok.lock().unwrap() = false;
    }

    pub fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for MockAuth {
    async fn current_session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    async fn refresh_session(&self) -> roomsync::Result<Session> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if !*self.refresh_ok.lock().unwrap() {
            return Err(SyncError::Auth("refresh rejected".into()));
        }
        let mut fresh = valid_session();
        fresh.session_id = "s-refreshed".into();
        *self.session.lock().unwrap() = Some(fresh.clone());
        Ok(fresh)
    }

    async fn logout(&self) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        *self.session.lock().unwrap() = None;
    }
}

// ---------------------------------------------------------------------------
// MockRooms
// ---------------------------------------------------------------------------

pub struct MockRooms {
    rooms: Mutex<HashMap<String, Room>>,
    hanging: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl MockRooms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            hanging: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn insert(&self, room: Room) {
        self.rooms.lock().unwrap().insert(room.id.clone(), room);
    }

    /// Lookups for `room_id` never complete.
    pub fn hang(&self, room_id: &str) {
        self.hanging.lock().unwrap().insert(room_id.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoomDirectory for MockRooms {
    async fn fetch_room(&self, room_id: &str) -> roomsync::Result<Room> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hanging.lock().unwrap().contains(room_id) {
            std::future::pending::<()>().await;
        }
        self.rooms
            .lock()
            .unwrap()
            .get(room_id)
            .cloned()
            .ok_or_else(|| TransportError::Rejected(format!("no room {room_id}")).into())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn valid_session() -> Session {
    Session {
        user_id: LOCAL_USER.into(),
        auth_token: "token".into(),
        session_id: "s1".into(),
        last_activity_at: roomsync::model::now_ms(),
    }
}

pub fn credentials() -> Credentials {
    valid_session().credentials()
}

pub fn participant(id: &str) -> Participant {
    Participant { id: id.into(), name: id.to_uppercase(), is_ai: false }
}

pub fn room(id: &str, members: &[&str]) -> Room {
    Room {
        id: id.into(),
        participants: members.iter().map(|m| participant(m)).collect(),
        metadata: RoomMetadata { name: format!("room {id}"), ..RoomMetadata::default() },
    }
}

/// Message `id` in R1 from `sender` at `ts`.
pub fn msg(id: &str, sender: &str, ts: u64) -> Message {
    Message::text(id, "R1", sender, ts, format!("text of {id}"))
}

pub fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub auth: Arc<MockAuth>,
    pub rooms: Arc<MockRooms>,
    pub connection: ConnectionManager,
    pub session: RoomSession,
}

pub fn harness(config: SyncConfig) -> Harness {
    let transport = MockTransport::new();
    let auth = MockAuth::new(Some(valid_session()));
    let rooms = MockRooms::new();
    rooms.insert(room("R1", &["u2"]));
    rooms.insert(room("R2", &["u1", "u3"]));
    let connection = ConnectionManager::new(
        transport.clone(),
        auth.clone(),
        config.connection.clone(),
        config.auth.clone(),
    );
    let session = RoomSession::builder(connection.clone(), auth.clone(), rooms.clone())
        .local_user(participant(LOCAL_USER))
        .config(config)
        .build()
        .unwrap();
    Harness { transport, auth, rooms, connection, session }
}

/// Poll `cond` while letting virtual time pass. Returns whether it became true.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Everything currently buffered on a notice receiver.
pub fn drain(rx: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}
