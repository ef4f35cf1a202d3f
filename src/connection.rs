//! # Connection Manager
//!
//! Owns the lifecycle of the one persistent connection to the server and
//! exposes it as an observable [`ConnectionState`].
//!
//! ```text
//!  Idle ──connect──► Connecting ──ok──► Connected ◄───────────┐
//!                        │                  │ probe / drop     │ ok
//!                        └──fail──► Reconnecting ──backoff─────┘
//!                                       │ attempts > max
//!                                       ▼
//!                                     Fatal
//! ```
//!
//! ## What It Does
//!
//! 1. Handshake with a per-attempt timeout; malformed credentials fail fast.
//! 2. Heartbeat probes while connected; a failed or slow probe reconnects at once.
//! 3. Exponential backoff (`base * 2^(n-1)`, capped) bounded by an attempt count.
//! 4. Session-validity check (refresh once, else forced logout) before each retry.
//! 5. Duplicate-session countdown that forces logout unless the user confirms.
//!
//! The manager is the only writer of [`ConnectionState`]. It publishes
//! [`ConnectionEvent::Reconnected`] after every recovery but never touches room
//! state itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AuthConfig, ConnectionConfig};
use crate::error::{Result, SyncError, TransportError};
use crate::model::{now_ms, ConnectionState, Credentials};
use crate::transport::{AuthProvider, ClientEvent, ConnectOptions, ServerEvent, Transport};

/// Broadcast channel capacity for [`ConnectionEvent`]s.
pub const EVENT_CHANNEL_CAP: usize = 64;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Decision after one more consecutive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Exponential backoff counter. Pure; the manager does the sleeping.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    jitter_ratio: f64,
    failures: u32,
}

impl Backoff {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            base: config.base_delay,
            max: config.max_delay,
            max_attempts: config.max_attempts,
            jitter_ratio: config.jitter_ratio,
            failures: 0,
        }
    }

    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    /// Count one more consecutive failure and decide what to do next.
    pub fn record_failure(&mut self) -> BackoffStep {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_attempts {
            return BackoffStep::GiveUp { attempts: self.max_attempts };
        }
        let mut delay = self.delay_for(self.failures);
        if self.jitter_ratio > 0.0 {
            let extra = delay.as_secs_f64() * self.jitter_ratio * rand::thread_rng().gen_range(0.0..1.0);
            delay += Duration::from_secs_f64(extra);
        }
        BackoffStep::Retry { attempt: self.failures, delay }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Transitions and notices published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Reconnecting { attempt: u32, delay: Duration },
    /// Connected again after a `Reconnecting` phase; rooms should resync.
    Reconnected { epoch: u64 },
    /// Another login took over this identity; logout is forced after `countdown`.
    DuplicateSession { device_info: String, ip_address: String, countdown: Duration },
    ForcedLogout { reason: String },
    Fatal { error: SyncError },
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tasks {
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    duplicate: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

fn is_running(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
}

fn abort(handle: Option<JoinHandle<()>>) {
    if let Some(h) = handle {
        h.abort();
    }
}

struct ManagerInner {
    config: ConnectionConfig,
    auth_config: AuthConfig,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    epoch: AtomicU64,
    backoff: Mutex<Backoff>,
    credentials: Mutex<Option<Credentials>>,
    last_error: Mutex<Option<SyncError>>,
    tasks: Mutex<Tasks>,
}

/// Handle to the connection manager. Clone freely; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        config: ConnectionConfig,
        auth_config: AuthConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let backoff = Mutex::new(Backoff::new(&config));
        Self {
            inner: Arc::new(ManagerInner {
                config,
                auth_config,
                transport,
                auth,
                state_tx,
                events_tx,
                epoch: AtomicU64::new(0),
                backoff,
                credentials: Mutex::new(None),
                last_error: Mutex::new(None),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Current state, read through the watch channel.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Number of successful connections so far. A room join is only valid
    /// within the epoch it was made in.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.inner.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Resolve once `Connected`; fail fast on `Fatal`, `Disconnected` or `Idle`.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.watch_state();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Fatal => {
                    return Err(self
                        .last_error()
                        .unwrap_or(SyncError::ReconnectExhausted { attempts: self.inner.config.max_attempts }))
                }
                ConnectionState::Idle | ConnectionState::Disconnected => {
                    return Err(TransportError::NotConnected.into())
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
            rx.changed().await.map_err(|_| SyncError::Cancelled)?;
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open the connection.
    ///
    /// Malformed credentials fail with [`SyncError::Auth`] and must be refreshed
    /// before retrying. A transport failure starts the reconnection loop in the
    /// background and is returned to the caller.
    pub async fn connect(&self, credentials: Credentials) -> Result<()> {
        if !credentials.is_well_formed() {
            self.set_state(ConnectionState::Disconnected);
            return Err(SyncError::Auth("credentials are incomplete".into()));
        }
        if let Ok(mut c) = self.inner.credentials.lock() {
            *c = Some(credentials.clone());
        }
        self.stop_tasks(false);
        self.ensure_listener();
        self.reset_backoff();
        self.set_state(ConnectionState::Connecting);

        match self.attempt(credentials).await {
            Ok(()) => {
                self.on_connected();
                Ok(())
            }
            Err(e @ SyncError::Auth(_)) => {
                self.fail_fatal(e.clone()).await;
                Err(e)
            }
            Err(e) => {
                warn!(target: "roomsync::connection", error = %e, "initial connect failed, entering backoff");
                self.set_state(ConnectionState::Reconnecting);
                self.begin_reconnect("initial connect failed");
                Err(e)
            }
        }
    }

    /// Deliberate shutdown: no reconnection follows.
    pub async fn disconnect(&self) {
        self.stop_tasks(false);
        self.set_state(ConnectionState::Disconnected);
        self.inner.transport.disconnect().await;
        info!(target: "roomsync::connection", "disconnected");
    }

    /// Disconnect and stop every background task, including the event listener.
    pub async fn shutdown(&self) {
        self.stop_tasks(true);
        self.set_state(ConnectionState::Disconnected);
        self.inner.transport.disconnect().await;
    }

    /// Keep this session after a duplicate-login warning.
    ///
    /// Returns false when there was no countdown left to cancel (it already
    /// expired or the server ended the session first).
    pub async fn confirm_continue(&self) -> Result<bool> {
        let countdown = self.inner.tasks.lock().ok().and_then(|mut t| t.duplicate.take());
        let Some(handle) = countdown else {
            return Ok(false);
        };
        handle.abort();
        info!(target: "roomsync::connection", "duplicate session: user chose to continue");
        self.inner.transport.emit(ClientEvent::ContinueSession).await?;
        Ok(true)
    }

    /// Treat the connection as dropped: reconnect immediately if connected.
    pub fn handle_transport_failure(&self, reason: &str) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        warn!(target: "roomsync::connection", reason, "connection lost");
        self.set_state(ConnectionState::Reconnecting);
        self.begin_reconnect(reason);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn set_state(&self, next: ConnectionState) {
        let mut prev = next;
        let changed = self.inner.state_tx.send_if_modified(|s| {
            if *s == next {
                return false;
            }
            prev = *s;
            *s = next;
            true
        });
        if !changed {
            return;
        }
        debug!(target: "roomsync::connection", from = %prev, to = %next, "state transition");
        if next == ConnectionState::Connected {
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            if prev == ConnectionState::Reconnecting {
                info!(target: "roomsync::connection", epoch, "reconnected");
                let _ = self.inner.events_tx.send(ConnectionEvent::Reconnected { epoch });
            }
        }
    }

    fn publish(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events_tx.send(event);
    }

    fn reset_backoff(&self) {
        if let Ok(mut b) = self.inner.backoff.lock() {
            b.reset();
        }
    }

    async fn attempt(&self, credentials: Credentials) -> Result<()> {
        let opts = ConnectOptions { credentials };
        let timeout = self.inner.config.connect_timeout;
        match tokio::time::timeout(timeout, self.inner.transport.connect(&opts)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(TransportError::Unauthorized(msg))) => Err(SyncError::Auth(msg)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Io(format!("handshake timed out after {timeout:?}")).into()),
        }
    }

    fn on_connected(&self) {
        self.reset_backoff();
        if let Ok(mut e) = self.inner.last_error.lock() {
            *e = None;
        }
        self.set_state(ConnectionState::Connected);
        self.start_heartbeat();
    }

    /// Current session credentials, refreshing once if missing or expired.
    async fn valid_credentials(&self) -> Result<Credentials> {
        let window = self.inner.auth_config.inactivity_window;
        let session = match self.inner.auth.current_session().await {
            Some(s) if !s.is_expired(now_ms(), window) => s,
            _ => {
                info!(target: "roomsync::connection", "session missing or expired, refreshing");
                self.inner
                    .auth
                    .refresh_session()
                    .await
                    .map_err(|e| SyncError::Auth(format!("session refresh failed: {e}")))?
            }
        };
        let creds = session.credentials();
        if let Ok(mut c) = self.inner.credentials.lock() {
            *c = Some(creds.clone());
        }
        Ok(creds)
    }

    fn begin_reconnect(&self, reason: &str) {
        let Ok(mut tasks) = self.inner.tasks.lock() else { return };
        abort(tasks.heartbeat.take());
        if is_running(&tasks.reconnect) {
            return;
        }
        debug!(target: "roomsync::connection", reason, "starting reconnection loop");
        let this = self.clone();
        tasks.reconnect = Some(tokio::spawn(async move { this.reconnect_loop().await }));
    }

    async fn reconnect_loop(self) {
        loop {
            let step = match self.inner.backoff.lock() {
                Ok(mut b) => b.record_failure(),
                Err(_) => BackoffStep::GiveUp { attempts: 0 },
            };
            match step {
                BackoffStep::GiveUp { attempts } => {
                    error!(
                        target: "roomsync::connection",
                        attempts,
                        "reconnection attempts exhausted, manual reload required"
                    );
                    self.fail_fatal(SyncError::ReconnectExhausted { attempts }).await;
                    return;
                }
                BackoffStep::Retry { attempt, delay } => {
                    self.set_state(ConnectionState::Reconnecting);
                    self.publish(ConnectionEvent::Reconnecting { attempt, delay });
                    warn!(
                        target: "roomsync::connection",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting"
                    );
                    tokio::time::sleep(delay).await;

                    let creds = match self.valid_credentials().await {
                        Ok(c) => c,
                        Err(e) => {
                            // Detach this task so the logout below does not abort it.
                            if let Ok(mut tasks) = self.inner.tasks.lock() {
                                tasks.reconnect.take();
                            }
                            self.force_logout(&e.to_string()).await;
                            self.fail_fatal(e).await;
                            return;
                        }
                    };
                    match self.attempt(creds).await {
                        Ok(()) => {
                            self.on_connected();
                            return;
                        }
                        Err(e @ SyncError::Auth(_)) => {
                            self.fail_fatal(e).await;
                            return;
                        }
                        Err(e) => {
                            warn!(target: "roomsync::connection", attempt, error = %e, "reconnect attempt failed");
                        }
                    }
                }
            }
        }
    }

    async fn fail_fatal(&self, error: SyncError) {
        if let Ok(mut e) = self.inner.last_error.lock() {
            *e = Some(error.clone());
        }
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            abort(tasks.heartbeat.take());
        }
        self.set_state(ConnectionState::Fatal);
        self.publish(ConnectionEvent::Fatal { error });
        self.inner.transport.disconnect().await;
    }

    fn start_heartbeat(&self) {
        let this = self.clone();
        let interval = self.inner.config.heartbeat_interval;
        let probe_timeout = self.inner.config.heartbeat_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; the connection was just proven.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if this.state() != ConnectionState::Connected {
                    return;
                }
                match tokio::time::timeout(probe_timeout, this.inner.transport.ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        this.handle_transport_failure(&format!("heartbeat failed: {e}"));
                        return;
                    }
                    Err(_) => {
                        this.handle_transport_failure("heartbeat timed out");
                        return;
                    }
                }
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            abort(tasks.heartbeat.replace(handle));
        }
    }

    fn ensure_listener(&self) {
        let Ok(mut tasks) = self.inner.tasks.lock() else { return };
        if is_running(&tasks.listener) {
            return;
        }
        let mut rx = self.inner.transport.subscribe();
        let this = self.clone();
        tasks.listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => this.on_transport_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "roomsync::connection", skipped = n, "listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));
    }

    async fn on_transport_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Disconnected { reason } => self.handle_transport_failure(&reason),
            ServerEvent::ConnectError { message } => self.handle_transport_failure(&message),
            ServerEvent::DuplicateLogin { device_info, ip_address } => {
                self.on_duplicate_session(device_info, ip_address)
            }
            ServerEvent::SessionEnded { reason } => {
                let countdown = self.inner.tasks.lock().ok().and_then(|mut t| t.duplicate.take());
                abort(countdown);
                self.force_logout(&reason).await;
            }
            _ => {}
        }
    }

    fn on_duplicate_session(&self, device_info: String, ip_address: String) {
        let Ok(mut tasks) = self.inner.tasks.lock() else { return };
        if is_running(&tasks.duplicate) {
            debug!(target: "roomsync::connection", "duplicate session already counting down");
            return;
        }
        let countdown = self.inner.config.duplicate_session_countdown;
        warn!(
            target: "roomsync::connection",
            device = %device_info,
            ip = %ip_address,
            countdown_secs = countdown.as_secs(),
            "another session took over this identity"
        );
        self.publish(ConnectionEvent::DuplicateSession { device_info, ip_address, countdown });
        let this = self.clone();
        tasks.duplicate = Some(tokio::spawn(async move {
            tokio::time::sleep(countdown).await;
            let won = this.inner.tasks.lock().ok().and_then(|mut t| t.duplicate.take()).is_some();
            if won {
                this.force_logout("duplicate session was not confirmed").await;
            }
        }));
    }

    async fn force_logout(&self, reason: &str) {
        self.stop_tasks(false);
        self.set_state(ConnectionState::Disconnected);
        self.inner.transport.disconnect().await;
        self.inner.auth.logout().await;
        warn!(target: "roomsync::connection", reason, "forced logout");
        self.publish(ConnectionEvent::ForcedLogout { reason: reason.to_string() });
    }

    fn stop_tasks(&self, include_listener: bool) {
        let Ok(mut tasks) = self.inner.tasks.lock() else { return };
        abort(tasks.heartbeat.take());
        abort(tasks.reconnect.take());
        abort(tasks.duplicate.take());
        if include_listener {
            abort(tasks.listener.take());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn backoff(max_attempts: u32) -> Backoff {
        Backoff::new(&ConnectionConfig {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts,
            ..ConnectionConfig::default()
        })
    }

    #[rstest]
    #[case(1, 500)]
    #[case(2, 1_000)]
    #[case(3, 2_000)]
    #[case(4, 4_000)]
    #[case(5, 8_000)]
    #[case(6, 8_000)]
    #[case(40, 8_000)]
    fn test_delay_doubles_then_caps(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(backoff(100).delay_for(attempt), Duration::from_millis(expected_ms));
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(5)]
    fn test_failures_up_to_max_retry(#[case] max: u32) {
        let mut b = backoff(max);
        for n in 1..=max {
            assert!(matches!(b.record_failure(), BackoffStep::Retry { attempt, .. } if attempt == n));
        }
        assert_eq!(b.record_failure(), BackoffStep::GiveUp { attempts: max });
    }

    #[test]
    fn test_zero_attempts_gives_up_immediately() {
        let mut b = backoff(0);
        assert_eq!(b.record_failure(), BackoffStep::GiveUp { attempts: 0 });
    }

    #[test]
    fn test_reset_restarts_from_base_delay() {
        let mut b = backoff(5);
        b.record_failure();
        b.record_failure();
        b.reset();
        assert_eq!(b.failures(), 0);
        assert_eq!(
            b.record_failure(),
            BackoffStep::Retry { attempt: 1, delay: Duration::from_millis(500) }
        );
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let mut b = Backoff::new(&ConnectionConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            jitter_ratio: 0.5,
            ..ConnectionConfig::default()
        });
        for _ in 0..3 {
            if let BackoffStep::Retry { delay, .. } = b.record_failure() {
                assert!(delay >= Duration::from_secs(1));
                assert!(delay <= Duration::from_millis(1_500));
            }
        }
    }
}
