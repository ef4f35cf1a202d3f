//! # Stage: Room Session Controller
//!
//! ## Responsibility
//! Enter, keep and leave one room on top of a [`ConnectionManager`]. Wires the
//! timeline, the streaming assembler and the reaction reconciler together and
//! exposes their state to the view as observables.
//!
//! ```text
//!  transport ──subscribe──► forwarder ─┐
//!  sweep ticker ───────────────────────┼─► mpsc queue ─► dispatcher ─► RoomState ─► watch / broadcast
//!                                      │
//!  ConnectionManager ──events──► watcher (resync / cleanup / notices)
//! ```
//!
//! ## Guarantees
//! - `setup_room` is idempotent: concurrent calls for one room share a single
//!   in-flight setup; a call for another room supersedes it
//! - Every awaited step runs under its own timeout and re-checks liveness and
//!   setup generation before touching state
//! - One dispatcher task per room mutates the timeline; timers only enqueue
//! - The state mutex is never held across an `.await`
//!
//! ## NOT Responsible For
//! - Connection lifecycle (see [`crate::connection`])
//! - Rendering, scrolling or picking files

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::error::{Result, SyncError, TransportError};
use crate::model::{
    now_ms, ConnectionState, FileDescriptor, Message, MessageId, Participant, ReadReceipt, Room,
    RoomId, StreamingMessage, ViewportMetrics,
};
use crate::reactions::{ReactionOp, ReactionReconciler};
use crate::streaming::{ChunkOutcome, StartOutcome, StreamAssembler};
use crate::timeline::{AppendOutcome, ScrollAnchor, TimelineStore};
use crate::transport::{AuthProvider, ClientEvent, ListenerSet, RoomDirectory, ServerEvent, ServerReply};

/// Capacity of the per-room event queue.
pub const ROOM_QUEUE_CAP: usize = 256;

/// Capacity of the notice broadcast channel.
pub const NOTICE_CHANNEL_CAP: usize = 128;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Transient, user-facing signals. The view decides how to show them.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A live append landed while the viewport was near the bottom.
    ScrollToBottom,
    ConnectionLost,
    Reconnecting { attempt: u32, delay: Duration },
    Reconnected,
    /// Unrecoverable; the view should navigate away.
    Fatal { error: SyncError },
    StreamingFailed { id: MessageId, message: String },
    DuplicateSession { device_info: String, ip_address: String, countdown: Duration },
    ForcedLogout { reason: String },
    SetupFailed { error: SyncError },
}

/// Why a room is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// User left the room: leave, clear everything, deselect.
    Manual,
    /// Connection dropped: keep the timeline, tell the user.
    Disconnect,
    /// About to resync after reconnecting: drop listeners only.
    Reconnect,
    /// The surrounding view is gone: stop tasks, leave if possible, touch nothing else.
    Unmount,
    /// A setup step failed: drop listeners, leave, record the error.
    Error,
}

/// Loading / error / pagination flags for the view.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomStatus {
    pub loading: bool,
    pub error: Option<SyncError>,
    pub has_more: bool,
}

impl Default for RoomStatus {
    fn default() -> Self {
        Self { loading: false, error: None, has_more: true }
    }
}

/// Result of [`RoomSession::load_older_messages`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub added: usize,
    pub has_more: bool,
    /// Captured before the merge; apply with [`ScrollAnchor::restore`] once
    /// the view knows its new scroll height.
    pub anchor: Option<ScrollAnchor>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

type SetupFuture = Shared<BoxFuture<'static, std::result::Result<(), SyncError>>>;
type PageFuture = Shared<BoxFuture<'static, std::result::Result<HistoryPage, SyncError>>>;

struct InFlightSetup {
    room_id: RoomId,
    generation: u64,
    abort: AbortHandle,
    future: SetupFuture,
}

/// An older-page load; a second request for the same cursor awaits it.
struct InFlightPage {
    token: u64,
    cursor: Option<u64>,
    future: PageFuture,
}

enum RoomInput {
    Server(ServerEvent),
    Sweep,
    /// The listener missed events; re-read the newest page.
    CatchUp,
}

#[derive(Default)]
struct SetupProgress {
    joined: bool,
}

struct RoomState {
    room_id: Option<RoomId>,
    room: Option<Room>,
    timeline: TimelineStore,
    streams: StreamAssembler,
    reactions: ReactionReconciler,
    viewport: Option<ViewportMetrics>,
    /// Room joined on the transport and the connection epoch it happened in.
    joined: Option<(RoomId, u64)>,
    /// Join request sent but not answered yet, with the setup generation that sent it.
    joining: Option<(RoomId, u64)>,
    listeners: Option<ListenerSet>,
    setup: Option<InFlightSetup>,
    paging: Option<InFlightPage>,
    next_page_token: u64,
    generation: u64,
    loading: bool,
    error: Option<SyncError>,
}

struct SessionInner {
    config: SyncConfig,
    local: Participant,
    connection: ConnectionManager,
    auth: Arc<dyn AuthProvider>,
    rooms: Arc<dyn RoomDirectory>,
    state: Mutex<RoomState>,
    alive: AtomicBool,
    cleaning: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
    clock_origin: Instant,
    wall_origin_ms: u64,
    messages_tx: watch::Sender<Vec<Message>>,
    streaming_tx: watch::Sender<BTreeMap<MessageId, StreamingMessage>>,
    room_tx: watch::Sender<Option<Room>>,
    status_tx: watch::Sender<RoomStatus>,
    notices_tx: broadcast::Sender<Notice>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Ok(mut w) = self.watcher.lock() {
            if let Some(h) = w.take() {
                h.abort();
            }
        }
    }
}

struct CleanupGuard<'a>(&'a AtomicBool);

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`RoomSession`].
///
/// # Example
/// ```rust,ignore
/// let session = RoomSession::builder(connection, auth, rooms)
///     .local_user(Participant { id: "u1".into(), name: "Ada".into(), is_ai: false })
///     .config(SyncConfig::default())
///     .build()?;
/// session.setup_room("R1").await?;
/// ```
pub struct RoomSessionBuilder {
    connection: ConnectionManager,
    auth: Arc<dyn AuthProvider>,
    rooms: Arc<dyn RoomDirectory>,
    local: Option<Participant>,
    config: SyncConfig,
}

impl RoomSessionBuilder {
    /// The signed-in user. Required.
    pub fn local_user(mut self, local: Participant) -> Self {
        self.local = Some(local);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Construct the session and start watching the connection.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<RoomSession> {
        self.config.validate()?;
        let local = self.local.ok_or_else(|| SyncError::Config("local user is required".into()))?;
        let (messages_tx, _) = watch::channel(Vec::new());
        let (streaming_tx, _) = watch::channel(BTreeMap::new());
        let (room_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(RoomStatus::default());
        let (notices_tx, _) = broadcast::channel(NOTICE_CHANNEL_CAP);

        let state = RoomState {
            room_id: None,
            room: None,
            timeline: TimelineStore::new(self.config.timeline.bottom_threshold_px),
            streams: StreamAssembler::new(),
            reactions: ReactionReconciler::new(local.id.clone()),
            viewport: None,
            joined: None,
            joining: None,
            listeners: None,
            setup: None,
            paging: None,
            next_page_token: 0,
            generation: 0,
            loading: false,
            error: None,
        };
        let inner = Arc::new(SessionInner {
            config: self.config,
            local,
            connection: self.connection,
            auth: self.auth,
            rooms: self.rooms,
            state: Mutex::new(state),
            alive: AtomicBool::new(true),
            cleaning: AtomicBool::new(false),
            watcher: Mutex::new(None),
            clock_origin: Instant::now(),
            wall_origin_ms: now_ms(),
            messages_tx,
            streaming_tx,
            room_tx,
            status_tx,
            notices_tx,
        });
        let watcher = spawn_watcher(&inner);
        if let Ok(mut w) = inner.watcher.lock() {
            *w = Some(watcher);
        }
        Ok(RoomSession { inner })
    }
}

// ---------------------------------------------------------------------------
// RoomSession
// ---------------------------------------------------------------------------

/// Handle to a room session. Clone freely; clones share state.
#[derive(Clone)]
pub struct RoomSession {
    inner: Arc<SessionInner>,
}

impl RoomSession {
    pub fn builder(
        connection: ConnectionManager,
        auth: Arc<dyn AuthProvider>,
        rooms: Arc<dyn RoomDirectory>,
    ) -> RoomSessionBuilder {
        RoomSessionBuilder { connection, auth, rooms, local: None, config: SyncConfig::default() }
    }

    // -----------------------------------------------------------------------
    // Observables
    // -----------------------------------------------------------------------

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    pub fn messages(&self) -> watch::Receiver<Vec<Message>> {
        self.inner.messages_tx.subscribe()
    }

    pub fn streaming_messages(&self) -> watch::Receiver<BTreeMap<MessageId, StreamingMessage>> {
        self.inner.streaming_tx.subscribe()
    }

    pub fn room(&self) -> watch::Receiver<Option<Room>> {
        self.inner.room_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<RoomStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices_tx.subscribe()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn local_user(&self) -> &Participant {
        &self.inner.local
    }

    /// Room currently selected, if any.
    pub fn current_room(&self) -> Option<RoomId> {
        self.lock().room_id.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// True while a listener set is registered and all its tasks run.
    pub fn has_listeners(&self) -> bool {
        self.lock().listeners.as_ref().map(|l| l.is_live()).unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Enter `room_id`: connect, fetch metadata, listen, join, load the newest page.
    pub async fn setup_room(&self, room_id: &str) -> Result<()> {
        if !self.is_alive() {
            return Err(SyncError::Cancelled);
        }
        let (future, abandoned) = {
            let mut st = self.lock();
            match &st.setup {
                Some(inflight) if inflight.room_id == room_id => {
                    debug!(target: "roomsync::session", room = %room_id, "joining in-flight setup");
                    (inflight.future.clone(), None)
                }
                _ => {
                    let mut abandoned = None;
                    if let Some(old) = st.setup.take() {
                        info!(
                            target: "roomsync::session",
                            old = %old.room_id,
                            new = %room_id,
                            "setup superseded"
                        );
                        old.abort.abort();
                        abandoned = st.joining.take().map(|(r, _)| r);
                    }
                    st.generation += 1;
                    st.paging = None;
                    let generation = st.generation;
                    if st.room_id.as_deref() != Some(room_id) {
                        st.timeline.reset();
                        st.streams.clear();
                        st.reactions.clear();
                        st.viewport = None;
                        st.room = None;
                        self.publish_all(&st);
                    }
                    st.room_id = Some(room_id.to_string());
                    st.loading = true;
                    st.error = None;

                    let this = self.clone();
                    let rid = room_id.to_string();
                    let handle = tokio::spawn(async move { this.run_setup(rid, generation).await });
                    let abort = handle.abort_handle();
                    let future: SetupFuture = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(_) => Err(SyncError::Cancelled),
                        }
                    }
                    .boxed()
                    .shared();
                    st.setup = Some(InFlightSetup {
                        room_id: room_id.to_string(),
                        generation,
                        abort,
                        future: future.clone(),
                    });
                    self.publish_status(&st);
                    (future, abandoned)
                }
            }
        };
        if let Some(r) = abandoned {
            // The superseded setup may have joined on the server already.
            self.leave_best_effort(r).await;
        }
        future.await
    }

    async fn run_setup(&self, room_id: RoomId, generation: u64) -> Result<()> {
        let mut progress = SetupProgress::default();
        let result = self.setup_steps(&room_id, generation, &mut progress).await;

        let leave = {
            let mut st = self.lock();
            if st.setup.as_ref().map(|s| s.generation) == Some(generation) {
                st.setup = None;
            }
            let current = st.generation == generation && self.is_alive();
            let mut leave = None;
            if current {
                st.loading = false;
                if let Err(e) = &result {
                    st.error = Some(e.clone());
                    // Roll back whatever this setup put in place.
                    st.listeners = None;
                    if progress.joined {
                        leave = st.joined.take().map(|(r, _)| r);
                    }
                }
                self.publish_status(&st);
            }
            leave
        };

        match &result {
            Ok(()) => info!(target: "roomsync::session", room = %room_id, "room ready"),
            Err(SyncError::Cancelled) => {
                debug!(target: "roomsync::session", room = %room_id, "setup discarded")
            }
            Err(e) => {
                warn!(target: "roomsync::session", room = %room_id, error = %e, "room setup failed");
                self.notify(Notice::SetupFailed { error: e.clone() });
            }
        }
        if let Some(r) = leave {
            self.leave_best_effort(r).await;
        }
        result
    }

    async fn setup_steps(&self, room_id: &str, generation: u64, progress: &mut SetupProgress) -> Result<()> {
        let cfg = self.inner.config.setup.clone();

        // 1. connection
        tokio::time::timeout(cfg.connection_timeout, self.ensure_connected())
            .await
            .map_err(|_| SyncError::ConnectionTimeout(cfg.connection_timeout))??;
        self.check_current(generation)?;

        // 2. metadata
        let mut room = tokio::time::timeout(cfg.metadata_timeout, self.inner.rooms.fetch_room(room_id))
            .await
            .map_err(|_| SyncError::MetadataTimeout(cfg.metadata_timeout))??;
        if room.ensure_participant(&self.inner.local) {
            debug!(target: "roomsync::session", room = %room_id, "local user added to participant list");
        }
        {
            let mut st = self.lock();
            self.check_current_locked(&st, generation)?;
            st.room = Some(room);
            self.publish_room(&st);
        }

        // 3. listeners
        self.install_listeners(room_id, generation)?;

        // 4. join
        let epoch = self.inner.connection.epoch();
        let (already_joined, previous) = {
            let st = self.lock();
            match &st.joined {
                Some((r, e)) if r == room_id && *e == epoch => (true, None),
                Some((r, e)) if r != room_id && *e == epoch => (false, Some(r.clone())),
                _ => (false, None),
            }
        };
        if let Some(prev) = previous {
            self.leave_best_effort(prev).await;
        }
        if already_joined {
            debug!(target: "roomsync::session", room = %room_id, epoch, "already joined in this epoch");
        } else {
            {
                let mut st = self.lock();
                self.check_current_locked(&st, generation)?;
                st.joining = Some((room_id.to_string(), generation));
            }
            let transport = self.inner.connection.transport();
            let reply = tokio::time::timeout(
                cfg.join_timeout,
                transport.request(ClientEvent::JoinRoom { room_id: room_id.to_string() }),
            )
            .await;
            {
                let mut st = self.lock();
                if st.joining.as_ref().map(|(_, g)| *g) == Some(generation) {
                    st.joining = None;
                }
            }
            reply.map_err(|_| SyncError::JoinTimeout(cfg.join_timeout))??;
            let recorded = {
                let mut st = self.lock();
                if self.check_current_locked(&st, generation).is_ok() {
                    st.joined = Some((room_id.to_string(), epoch));
                    true
                } else {
                    false
                }
            };
            if !recorded {
                self.leave_best_effort(room_id.to_string()).await;
                return Err(SyncError::Cancelled);
            }
            progress.joined = true;
        }

        // 5. newest history page
        let (messages, has_more) = self.fetch_page(room_id, None).await?;
        let mut st = self.lock();
        self.check_current_locked(&st, generation)?;
        let st = &mut *st;
        for m in &messages {
            st.streams.forget(&m.id);
        }
        let outcome = st.timeline.merge_history_page(messages, has_more, true);
        debug!(
            target: "roomsync::session",
            room = %room_id,
            added = outcome.added,
            has_more = outcome.has_more,
            "initial page merged"
        );
        self.publish_messages(st);
        self.publish_streaming(st);
        self.notify(Notice::ScrollToBottom);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<()> {
        let connection = &self.inner.connection;
        match connection.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Idle | ConnectionState::Disconnected => {
                let session = self
                    .inner
                    .auth
                    .current_session()
                    .await
                    .ok_or_else(|| SyncError::Auth("no active session".into()))?;
                match connection.connect(session.credentials()).await {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        debug!(target: "roomsync::session", error = %e, "connect failed, waiting for reconnection")
                    }
                }
            }
            _ => {}
        }
        connection.wait_connected().await
    }

    async fn fetch_page(&self, room_id: &str, before: Option<u64>) -> Result<(Vec<Message>, bool)> {
        let timeout = self.inner.config.setup.history_timeout;
        let transport = self.inner.connection.transport();
        let request = ClientEvent::FetchHistory {
            room_id: room_id.to_string(),
            before,
            limit: self.inner.config.timeline.page_size,
        };
        let reply = tokio::time::timeout(timeout, transport.request(request))
            .await
            .map_err(|_| SyncError::HistoryLoadTimeout(timeout))??;
        match reply {
            ServerReply::History { messages, has_more } => Ok((messages, has_more)),
            other => Err(TransportError::Rejected(format!("unexpected history reply: {other:?}")).into()),
        }
    }

    fn install_listeners(&self, room_id: &str, generation: u64) -> Result<()> {
        let (tx, rx) = mpsc::channel(ROOM_QUEUE_CAP);
        let mut set = ListenerSet::new(room_id);

        let mut events = self.inner.connection.transport().subscribe();
        let forward_tx = tx.clone();
        set.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ev) if ev.is_connection_level() => {}
                    Ok(ev) => {
                        if forward_tx.send(RoomInput::Server(ev)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "roomsync::session", skipped = n, "room listener lagged, catching up");
                        if forward_tx.send(RoomInput::CatchUp).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));

        let period = self.inner.config.reactions.sweep_interval;
        set.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx.send(RoomInput::Sweep).await.is_err() {
                    return;
                }
            }
        }));

        set.push(tokio::spawn(dispatch(Arc::downgrade(&self.inner), room_id.to_string(), rx)));

        let replaced = {
            let mut st = self.lock();
            self.check_current_locked(&st, generation)?;
            st.listeners.replace(set)
        };
        if replaced.is_some() {
            debug!(target: "roomsync::session", room = %room_id, "listener set replaced");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Tear the room down for `reason`. A call made while another cleanup
    /// runs is a no-op.
    pub async fn cleanup(&self, reason: CleanupReason) {
        if self.inner.cleaning.swap(true, Ordering::SeqCst) {
            debug!(target: "roomsync::session", ?reason, "cleanup already in progress");
            return;
        }
        let _guard = CleanupGuard(&self.inner.cleaning);
        debug!(target: "roomsync::session", ?reason, "cleanup");

        match reason {
            CleanupReason::Manual => {
                let (leave, listeners) = {
                    let mut st = self.lock();
                    st.generation += 1;
                    st.paging = None;
                    if let Some(s) = st.setup.take() {
                        s.abort.abort();
                    }
                    let leave = take_joined_rooms(&mut st);
                    let listeners = st.listeners.take();
                    st.timeline.reset();
                    st.streams.clear();
                    st.reactions.clear();
                    st.viewport = None;
                    st.loading = false;
                    st.error = None;
                    st.room_id = None;
                    st.room = None;
                    self.publish_all(&st);
                    (leave, listeners)
                };
                drop(listeners);
                for r in leave {
                    self.leave_best_effort(r).await;
                }
            }
            CleanupReason::Disconnect => {
                self.notify(Notice::ConnectionLost);
            }
            CleanupReason::Reconnect => {
                let listeners = {
                    let mut st = self.lock();
                    st.generation += 1;
                    st.paging = None;
                    if let Some(s) = st.setup.take() {
                        s.abort.abort();
                    }
                    st.joined = None;
                    st.joining = None;
                    st.listeners.take()
                };
                drop(listeners);
            }
            CleanupReason::Unmount => {
                self.inner.alive.store(false, Ordering::SeqCst);
                let watcher = self.inner.watcher.lock().ok().and_then(|mut w| w.take());
                if let Some(h) = watcher {
                    h.abort();
                }
                let (leave, listeners) = {
                    let mut st = self.lock();
                    let mut leave: Vec<RoomId> =
                        st.joined.iter().chain(st.joining.iter()).map(|(r, _)| r.clone()).collect();
                    leave.dedup();
                    (leave, st.listeners.take())
                };
                drop(listeners);
                if self.inner.connection.state() == ConnectionState::Connected {
                    for r in leave {
                        self.leave_best_effort(r).await;
                    }
                }
            }
            CleanupReason::Error => {
                let (leave, listeners) = {
                    let mut st = self.lock();
                    let leave = take_joined_rooms(&mut st);
                    let listeners = st.listeners.take();
                    st.loading = false;
                    if st.error.is_none() {
                        st.error = Some(SyncError::Cancelled);
                    }
                    self.publish_status(&st);
                    (leave, listeners)
                };
                drop(listeners);
                for r in leave {
                    self.leave_best_effort(r).await;
                }
            }
        }
    }

    async fn leave_best_effort(&self, room_id: RoomId) {
        let transport = self.inner.connection.transport();
        let timeout = self.inner.config.setup.join_timeout;
        let event = ClientEvent::LeaveRoom { room_id: room_id.clone() };
        match tokio::time::timeout(timeout, transport.emit(event)).await {
            Ok(Ok(())) => debug!(target: "roomsync::session", room = %room_id, "left room"),
            Ok(Err(e)) => debug!(target: "roomsync::session", room = %room_id, error = %e, "leave failed"),
            Err(_) => debug!(target: "roomsync::session", room = %room_id, "leave timed out"),
        }
    }

    // -----------------------------------------------------------------------
    // Imperative API
    // -----------------------------------------------------------------------

    /// Send a text message. Returns the client-side id sent with it.
    pub async fn send_message(&self, content: &str) -> Result<String> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let room_id = self.require_room()?;
        let client_id = Uuid::new_v4().to_string();
        self.inner
            .connection
            .transport()
            .emit(ClientEvent::SendMessage {
                room_id,
                client_id: client_id.clone(),
                content: content.to_string(),
            })
            .await?;
        Ok(client_id)
    }

    /// Send a message referencing an already-uploaded file.
    pub async fn send_file_message(&self, file: FileDescriptor) -> Result<String> {
        let room_id = self.require_room()?;
        let client_id = Uuid::new_v4().to_string();
        self.inner
            .connection
            .transport()
            .emit(ClientEvent::SendFileMessage { room_id, client_id: client_id.clone(), file })
            .await?;
        Ok(client_id)
    }

    /// Load the page before the oldest loaded message.
    ///
    /// Pass the viewport as it is right now; the returned anchor restores the
    /// visible content once the view has re-measured.
    pub async fn load_older_messages(&self, viewport: Option<ViewportMetrics>) -> Result<HistoryPage> {
        let future = {
            let mut st = self.lock();
            let room_id = st.room_id.clone().ok_or(SyncError::NoRoomSelected)?;
            let cursor = st.timeline.pagination_cursor();
            match &st.paging {
                Some(inflight) if inflight.cursor == cursor => {
                    debug!(target: "roomsync::session", room = %room_id, ?cursor, "joining in-flight history load");
                    inflight.future.clone()
                }
                _ => {
                    if !st.timeline.has_more() {
                        return Ok(HistoryPage { added: 0, has_more: false, anchor: None });
                    }
                    st.next_page_token += 1;
                    let token = st.next_page_token;
                    let generation = st.generation;
                    st.loading = true;
                    self.publish_status(&st);

                    let anchor = viewport.as_ref().map(ScrollAnchor::capture);
                    let this = self.clone();
                    let future: PageFuture =
                        async move { this.fetch_older(room_id, cursor, generation, token, anchor).await }
                            .boxed()
                            .shared();
                    st.paging = Some(InFlightPage { token, cursor, future: future.clone() });
                    future
                }
            }
        };
        future.await
    }

    async fn fetch_older(
        &self,
        room_id: RoomId,
        cursor: Option<u64>,
        generation: u64,
        token: u64,
        anchor: Option<ScrollAnchor>,
    ) -> Result<HistoryPage> {
        let fetched = self.fetch_page(&room_id, cursor).await;
        let mut st = self.lock();
        if st.paging.as_ref().map(|p| p.token) == Some(token) {
            st.paging = None;
        }
        if self.check_current_locked(&st, generation).is_err() {
            return Err(SyncError::Cancelled);
        }
        st.loading = false;
        let (messages, has_more) = match fetched {
            Ok(page) => page,
            Err(e) => {
                warn!(target: "roomsync::session", room = %room_id, error = %e, "history load failed");
                st.error = Some(e.clone());
                self.publish_status(&st);
                return Err(e);
            }
        };
        let st = &mut *st;
        for m in &messages {
            st.streams.forget(&m.id);
        }
        let outcome = st.timeline.merge_history_page(messages, has_more, cursor.is_none());
        self.publish_messages(st);
        self.publish_status(st);
        Ok(HistoryPage { added: outcome.added, has_more: outcome.has_more, anchor })
    }

    pub async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        self.change_reaction(message_id, emoji, ReactionOp::Add).await
    }

    pub async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        self.change_reaction(message_id, emoji, ReactionOp::Remove).await
    }

    async fn change_reaction(&self, message_id: &str, emoji: &str, op: ReactionOp) -> Result<()> {
        let now = self.clock_ms();
        let token = {
            let mut st = self.lock();
            let st = &mut *st;
            let token = st.reactions.apply_optimistic(&mut st.timeline, message_id, emoji, op, now)?;
            if token.is_some() {
                self.publish_messages(st);
            }
            token
        };
        let Some(token) = token else {
            return Ok(());
        };
        let event = match op {
            ReactionOp::Add => ClientEvent::AddReaction { message_id: message_id.to_string(), emoji: emoji.to_string() },
            ReactionOp::Remove => {
                ClientEvent::RemoveReaction { message_id: message_id.to_string(), emoji: emoji.to_string() }
            }
        };
        if let Err(e) = self.inner.connection.transport().emit(event).await {
            warn!(target: "roomsync::session", message_id, emoji, error = %e, "reaction emit failed, rolling back");
            let mut st = self.lock();
            let st = &mut *st;
            st.reactions.rollback(&mut st.timeline, token);
            self.publish_messages(st);
            return Err(e.into());
        }
        Ok(())
    }

    /// Latest viewport, used to decide whether live appends scroll to the bottom.
    pub fn report_viewport(&self, viewport: ViewportMetrics) {
        self.lock().viewport = Some(viewport);
    }

    /// Messages that became visible. Each is marked read after the dwell time.
    pub fn mark_visible(&self, ids: &[MessageId]) {
        let now = self.clock_ms();
        let mut st = self.lock();
        for id in ids {
            st.reactions.reads_mut().mark_visible(id, now);
        }
    }

    pub fn mark_hidden(&self, ids: &[MessageId]) {
        let mut st = self.lock();
        for id in ids {
            st.reactions.reads_mut().mark_hidden(id);
        }
    }

    /// Keep this session after a duplicate-login notice.
    pub async fn confirm_continue(&self) -> Result<bool> {
        self.inner.connection.confirm_continue().await
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    fn apply_server_event(&self, room_id: &str, event: ServerEvent) {
        if let Some(target) = event.room_id() {
            if target != room_id {
                return;
            }
        }
        let now = self.clock_ms();
        let mut st = self.lock();
        let st = &mut *st;
        match event {
            ServerEvent::Message { message } => {
                st.streams.forget(&message.id);
                let viewport = st.viewport;
                if let AppendOutcome::Inserted { scroll_to_bottom } = st.timeline.append_live(message, viewport.as_ref()) {
                    self.publish_messages(st);
                    if scroll_to_bottom {
                        self.notify(Notice::ScrollToBottom);
                    }
                }
            }
            ServerEvent::ParticipantsUpdated { participants, .. } => {
                if let Some(room) = st.room.as_mut() {
                    room.participants = participants;
                    room.ensure_participant(&self.inner.local);
                    self.publish_room(st);
                }
            }
            ServerEvent::AiMessageStart { id, room_id, metadata } => {
                if st.timeline.contains(&id) {
                    debug!(target: "roomsync::session", id = %id, "start for committed message ignored");
                    return;
                }
                if st.streams.start(id, room_id, metadata, now) == StartOutcome::Started {
                    self.publish_streaming(st);
                }
            }
            ServerEvent::AiMessageChunk { id, content } => {
                if st.streams.chunk(&id, content, now) == ChunkOutcome::Applied {
                    self.publish_streaming(st);
                }
            }
            ServerEvent::AiMessageComplete { id, message } => {
                let message = st.streams.complete(&id, message);
                let viewport = st.viewport;
                let outcome = st.timeline.append_live(message, viewport.as_ref());
                self.publish_streaming(st);
                if let AppendOutcome::Inserted { scroll_to_bottom } = outcome {
                    self.publish_messages(st);
                    if scroll_to_bottom {
                        self.notify(Notice::ScrollToBottom);
                    }
                }
            }
            ServerEvent::AiMessageError { id, error } => {
                let failure = st.streams.fail(&id, &error);
                self.publish_streaming(st);
                self.notify_streaming_failure(failure);
            }
            ServerEvent::ReactionUpdated { message_id, reactions } => {
                if st.reactions.on_server_update(&mut st.timeline, &message_id, reactions) {
                    self.publish_messages(st);
                }
            }
            ServerEvent::ReactionRejected { message_id, emoji, reason } => {
                if let Some(conflict) = st.reactions.on_rejection(&mut st.timeline, &message_id, &emoji) {
                    debug!(target: "roomsync::session", error = %conflict, reason = %reason, "reaction rolled back");
                    self.publish_messages(st);
                }
            }
            ServerEvent::MessagesRead { user_id, message_ids, read_at, .. } => {
                let mut changed = false;
                for id in &message_ids {
                    changed |= st.timeline.add_reader(id, ReadReceipt { user_id: user_id.clone(), read_at });
                }
                if user_id == self.inner.local.id {
                    st.reactions.reads_mut().acknowledge(&message_ids);
                }
                if changed {
                    self.publish_messages(st);
                }
            }
            _ => {}
        }
    }

    /// Periodic housekeeping: expire reactions and streams, emit due reads.
    async fn sweep(&self) {
        let now = self.clock_ms();
        let (due, room_id) = {
            let mut st = self.lock();
            let st = &mut *st;
            let rolled_back = st.reactions.expire(&mut st.timeline, now, self.inner.config.reactions.confirm_window);
            if !rolled_back.is_empty() {
                debug!(target: "roomsync::session", count = rolled_back.len(), "unconfirmed reactions rolled back");
                self.publish_messages(st);
            }
            let stale = st.streams.expire_stale(now, self.inner.config.streaming.stale_after);
            if !stale.is_empty() {
                self.publish_streaming(st);
                for failure in stale {
                    self.notify_streaming_failure(failure);
                }
            }
            let user_id = st.reactions.user_id().to_string();
            let due = st.reactions.reads_mut().take_due(&st.timeline, &user_id, now, self.inner.config.reactions.read_dwell);
            (due, st.room_id.clone())
        };
        if due.is_empty() {
            return;
        }
        let Some(room_id) = room_id else {
            self.lock().reactions.reads_mut().release(&due);
            return;
        };
        let event = ClientEvent::MarkAsRead { room_id, message_ids: due.clone() };
        if let Err(e) = self.inner.connection.transport().emit(event).await {
            warn!(target: "roomsync::session", count = due.len(), error = %e, "mark-as-read failed, will retry");
            self.lock().reactions.reads_mut().release(&due);
        }
    }

    /// Re-read the newest page after the room listener skipped events.
    async fn catch_up(&self, room_id: &str) {
        let generation = self.lock().generation;
        let messages = match self.fetch_page(room_id, None).await {
            Ok((messages, _)) => messages,
            Err(e) => {
                warn!(target: "roomsync::session", room = %room_id, error = %e, "catch-up load failed");
                return;
            }
        };
        let mut st = self.lock();
        if self.check_current_locked(&st, generation).is_err() {
            return;
        }
        let st = &mut *st;
        for m in &messages {
            st.streams.forget(&m.id);
        }
        // Older pages already loaded keep their own pagination state.
        let has_more = st.timeline.has_more();
        let outcome = st.timeline.merge_history_page(messages, has_more, true);
        info!(target: "roomsync::session", room = %room_id, recovered = outcome.added, "caught up after lag");
        if outcome.added == 0 {
            return;
        }
        self.publish_messages(st);
        self.publish_streaming(st);
        let threshold = self.inner.config.timeline.bottom_threshold_px;
        if st.viewport.map(|v| v.is_near_bottom(threshold)).unwrap_or(true) {
            self.notify(Notice::ScrollToBottom);
        }
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Reconnecting { attempt, delay } => {
                self.notify(Notice::Reconnecting { attempt, delay });
            }
            ConnectionEvent::Reconnected { epoch } => {
                info!(target: "roomsync::session", epoch, "connection restored, resyncing room");
                self.notify(Notice::Reconnected);
                let this = self.clone();
                tokio::spawn(async move { this.resync().await });
            }
            ConnectionEvent::DuplicateSession { device_info, ip_address, countdown } => {
                self.notify(Notice::DuplicateSession { device_info, ip_address, countdown });
            }
            ConnectionEvent::ForcedLogout { reason } => {
                self.cleanup(CleanupReason::Manual).await;
                self.notify(Notice::ForcedLogout { reason });
            }
            ConnectionEvent::Fatal { error } => {
                {
                    let mut st = self.lock();
                    st.loading = false;
                    st.error = Some(error.clone());
                    self.publish_status(&st);
                }
                self.notify(Notice::Fatal { error });
            }
        }
    }

    async fn resync(&self) {
        let room_id = {
            let st = self.lock();
            if st.setup.is_some() {
                // The in-flight setup is waiting on the connection and proceeds by itself.
                return;
            }
            st.room_id.clone()
        };
        let Some(room_id) = room_id else { return };
        self.cleanup(CleanupReason::Reconnect).await;
        if let Err(e) = self.setup_room(&room_id).await {
            warn!(target: "roomsync::session", room = %room_id, error = %e, "resync failed");
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wall-clock milliseconds that advance with the tokio clock.
    fn clock_ms(&self) -> u64 {
        self.inner.wall_origin_ms + self.inner.clock_origin.elapsed().as_millis() as u64
    }

    fn require_room(&self) -> Result<RoomId> {
        self.lock().room_id.clone().ok_or(SyncError::NoRoomSelected)
    }

    fn check_current(&self, generation: u64) -> Result<()> {
        let st = self.lock();
        self.check_current_locked(&st, generation)
    }

    fn check_current_locked(&self, st: &RoomState, generation: u64) -> Result<()> {
        if !self.is_alive() || st.generation != generation {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn notify(&self, notice: Notice) {
        let _ = self.inner.notices_tx.send(notice);
    }

    fn notify_streaming_failure(&self, failure: SyncError) {
        if let SyncError::Streaming { id, message } = failure {
            self.notify(Notice::StreamingFailed { id, message });
        }
    }

    fn publish_messages(&self, st: &RoomState) {
        self.inner.messages_tx.send_replace(st.timeline.snapshot());
        self.publish_status(st);
    }

    fn publish_streaming(&self, st: &RoomState) {
        self.inner.streaming_tx.send_replace(st.streams.snapshot());
    }

    fn publish_room(&self, st: &RoomState) {
        self.inner.room_tx.send_replace(st.room.clone());
    }

    fn publish_status(&self, st: &RoomState) {
        let status = RoomStatus { loading: st.loading, error: st.error.clone(), has_more: st.timeline.has_more() };
        self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn publish_all(&self, st: &RoomState) {
        self.publish_messages(st);
        self.publish_streaming(st);
        self.publish_room(st);
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn dispatch(weak: Weak<SessionInner>, room_id: RoomId, mut rx: mpsc::Receiver<RoomInput>) {
    while let Some(input) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        let session = RoomSession { inner };
        if !session.is_alive() {
            return;
        }
        match input {
            RoomInput::Server(event) => session.apply_server_event(&room_id, event),
            RoomInput::Sweep => session.sweep().await,
            RoomInput::CatchUp => session.catch_up(&room_id).await,
        }
    }
}

/// Rooms joined or being joined, cleared from `st`.
fn take_joined_rooms(st: &mut RoomState) -> Vec<RoomId> {
    let mut rooms: Vec<RoomId> = st.joined.take().into_iter().chain(st.joining.take()).map(|(r, _)| r).collect();
    rooms.dedup();
    rooms
}

fn spawn_watcher(inner: &Arc<SessionInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let mut events = inner.connection.subscribe();
    let mut state = inner.connection.watch_state();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let current = *state.borrow_and_update();
                    let Some(inner) = weak.upgrade() else { return };
                    if current == ConnectionState::Reconnecting {
                        RoomSession { inner }.cleanup(CleanupReason::Disconnect).await;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { return };
                        RoomSession { inner }.on_connection_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "roomsync::session", skipped = n, "connection watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
