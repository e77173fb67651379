use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use log::{debug, info, warn};
use magicfx_contracts::effects::EndpointRef;
use magicfx_contracts::events::{EventSink, EventWriter};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::transport::{Argument, RemoteConnection, RemoteTransport};

pub const CONNECTING_MESSAGE: &str = "Initializing Hub Connection...";
pub const FAILED_MESSAGE: &str = "Connection failed. This tool might be temporarily offline.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Ready,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A progress message shown once a connection attempt has been pending for `after`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusStage {
    pub after: Duration,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSchedule {
    pub stages: Vec<StatusStage>,
}

impl Default for StatusSchedule {
    fn default() -> Self {
        Self::new(&[
            (
                Duration::from_secs(5),
                "Waking up the AI model... (stage 1/3)",
            ),
            (
                Duration::from_secs(45),
                "Still waking up... loading AI weights (stage 2/3)",
            ),
            (
                Duration::from_secs(120),
                "Almost ready! Finalizing server setup (stage 3/3)",
            ),
        ])
    }
}

impl StatusSchedule {
    pub fn new(stages: &[(Duration, &str)]) -> Self {
        let mut stages: Vec<StatusStage> = stages
            .iter()
            .map(|(after, message)| StatusStage {
                after: *after,
                message: (*message).to_string(),
            })
            .collect();
        stages.sort_by_key(|stage| stage.after);
        Self { stages }
    }

    pub fn silent() -> Self {
        Self { stages: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub target: Option<String>,
    pub state: SessionState,
    pub message: Option<String>,
    pub error: Option<String>,
    pub revision: u64,
}

impl SessionSnapshot {
    fn idle() -> Self {
        Self {
            target: None,
            state: SessionState::Idle,
            message: None,
            error: None,
            revision: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Client not ready (session is {state})")]
    NotReady { state: SessionState },
    #[error("{0:#}")]
    Transport(anyhow::Error),
}

/// Something that can forward a positional call to a remote endpoint.
pub trait Invoke {
    fn invoke(&self, endpoint: &EndpointRef, args: &[Argument]) -> Result<Value, SessionError>;
}

struct SessionInner {
    state: SessionState,
    message: Option<String>,
    error: Option<String>,
    connection: Option<Arc<dyn RemoteConnection>>,
    cancel_timers: Option<mpsc::Sender<()>>,
    closed: bool,
    revision: u64,
}

struct SessionShared {
    target: String,
    inner: Mutex<SessionInner>,
    changed: Condvar,
    events: EventSink,
}

impl SessionShared {
    fn new(target: &str, cancel_timers: mpsc::Sender<()>, events: &EventSink) -> Self {
        let instance = Uuid::new_v4().to_string();
        Self {
            events: events.with_fields(json!({ "target": target, "instance": instance })),
            target: target.to_string(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                message: Some(CONNECTING_MESSAGE.to_string()),
                error: None,
                connection: None,
                cancel_timers: Some(cancel_timers),
                closed: false,
                revision: 1,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_locked(&self, inner: &SessionInner) -> SessionSnapshot {
        SessionSnapshot {
            target: Some(self.target.clone()),
            state: inner.state,
            message: inner.message.clone(),
            error: inner.error.clone(),
            revision: inner.revision,
        }
    }

    /// Session events are written while the lock is held, so the log order
    /// matches the order of state changes.
    fn resolve(&self, result: anyhow::Result<Arc<dyn RemoteConnection>>) {
        let mut inner = self.lock();
        if inner.closed {
            debug!("ignoring late connection result for {}", self.target);
            return;
        }
        inner.cancel_timers = None;
        match result {
            Ok(connection) => {
                inner.state = SessionState::Ready;
                inner.message = None;
                inner.connection = Some(connection);
                info!("session ready: {}", self.target);
                self.events.emit("session_ready", json!({}));
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!("session failed: {} ({error})", self.target);
                self.events.emit("session_failed", json!({ "error": error }));
                inner.state = SessionState::Failed;
                inner.error = Some(error);
                inner.message = Some(FAILED_MESSAGE.to_string());
            }
        }
        inner.revision += 1;
        self.changed.notify_all();
    }

    /// Applies a delayed progress message unless the attempt already resolved or closed.
    fn advance(&self, stage: &StatusStage) {
        let mut inner = self.lock();
        if inner.closed || inner.state != SessionState::Connecting {
            return;
        }
        inner.message = Some(stage.message.clone());
        inner.revision += 1;
        info!("[{}] {}", self.target, stage.message);
        self.events
            .emit("session_status", json!({ "message": stage.message }));
        self.changed.notify_all();
    }

    fn shutdown(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.cancel_timers = None;
        inner.connection = None;
        inner.revision += 1;
        self.changed.notify_all();
    }

    fn wait_until(
        &self,
        timeout: Duration,
        done: impl Fn(&SessionInner) -> bool,
    ) -> SessionSnapshot {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while !done(&inner) && !inner.closed {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inner = match self.changed.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        self.snapshot_locked(&inner)
    }
}

fn run_status_timers(shared: Arc<SessionShared>, stages: Vec<StatusStage>, rx: mpsc::Receiver<()>) {
    let started = Instant::now();
    for stage in stages {
        let wait = stage.after.saturating_sub(started.elapsed());
        match rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => shared.advance(&stage),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

struct SessionHandle {
    shared: Arc<SessionShared>,
    timer: Option<thread::JoinHandle<()>>,
}

/// Owns at most one connection attempt to a remote target.
///
/// `open` starts a fresh attempt and abandons the previous one: its pending
/// status timers are cancelled before `open` returns, and a connection that
/// completes after that is dropped. The network call itself is never
/// interrupted.
pub struct SessionManager {
    transport: Arc<dyn RemoteTransport>,
    schedule: StatusSchedule,
    events: EventSink,
    current: Option<SessionHandle>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn RemoteTransport>, schedule: StatusSchedule) -> Self {
        Self {
            transport,
            schedule,
            events: EventSink::disabled(),
            current: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.set_events(events.into());
        self
    }

    /// Applies to sessions opened after this call.
    pub fn set_events(&mut self, events: EventSink) {
        self.events = events;
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Starts connecting to `target`. A blank target does nothing.
    pub fn open(&mut self, target: &str) {
        let target = target.trim();
        if target.is_empty() {
            debug!("ignoring session open with an empty target");
            return;
        }
        self.close();

        let (cancel_tx, cancel_rx) = mpsc::channel();
        let shared = Arc::new(SessionShared::new(target, cancel_tx, &self.events));
        info!("connecting to {target} via {}", self.transport.name());
        shared.events.emit(
            "session_opened",
            json!({ "transport": self.transport.name() }),
        );

        let timer_shared = Arc::clone(&shared);
        let stages = self.schedule.stages.clone();
        let timer = match thread::Builder::new()
            .name("magicfx-session-status".to_string())
            .spawn(move || run_status_timers(timer_shared, stages, cancel_rx))
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("status timer thread spawn failed: {err}");
                None
            }
        };

        let connect_shared = Arc::clone(&shared);
        let transport = Arc::clone(&self.transport);
        let connect_target = target.to_string();
        let spawned = thread::Builder::new()
            .name("magicfx-session-connect".to_string())
            .spawn(move || {
                let result = transport.connect(&connect_target);
                connect_shared.resolve(result);
            });
        if let Err(err) = spawned {
            shared.resolve(Err(anyhow!("connection thread spawn failed: {err}")));
        }

        self.current = Some(SessionHandle { shared, timer });
    }

    /// Abandons the current attempt, if any. Idempotent.
    pub fn close(&mut self) {
        let Some(handle) = self.current.take() else {
            return;
        };
        handle.shared.shutdown();
        if let Some(timer) = handle.timer {
            let _ = timer.join();
        }
        debug!("session closed: {}", handle.shared.target);
        handle.shared.events.emit("session_closed", json!({}));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        match self.current.as_ref() {
            Some(handle) => {
                let inner = handle.shared.lock();
                handle.shared.snapshot_locked(&inner)
            }
            None => SessionSnapshot::idle(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Blocks until the attempt resolves or `timeout` passes.
    pub fn wait_resolved(&self, timeout: Duration) -> SessionSnapshot {
        match self.current.as_ref() {
            Some(handle) => handle
                .shared
                .wait_until(timeout, |inner| inner.state.is_resolved()),
            None => SessionSnapshot::idle(),
        }
    }

    /// Blocks until the snapshot revision moves past `revision` or `timeout` passes.
    pub fn wait_for_change(&self, revision: u64, timeout: Duration) -> SessionSnapshot {
        match self.current.as_ref() {
            Some(handle) => handle
                .shared
                .wait_until(timeout, |inner| inner.revision != revision),
            None => SessionSnapshot::idle(),
        }
    }

    pub fn describe(&self) -> Result<Value, SessionError> {
        Ok(self.live_connection()?.describe())
    }

    pub fn invoke(&self, endpoint: &EndpointRef, args: &[Argument]) -> Result<Value, SessionError> {
        let connection = self.live_connection()?;
        connection.predict(endpoint, args).map_err(|err| {
            warn!("prediction on {endpoint} failed: {err:#}");
            SessionError::Transport(err)
        })
    }

    fn live_connection(&self) -> Result<Arc<dyn RemoteConnection>, SessionError> {
        let Some(handle) = self.current.as_ref() else {
            return Err(SessionError::NotReady {
                state: SessionState::Idle,
            });
        };
        let inner = handle.shared.lock();
        match (&inner.connection, inner.state) {
            (Some(connection), SessionState::Ready) if !inner.closed => Ok(Arc::clone(connection)),
            _ => Err(SessionError::NotReady { state: inner.state }),
        }
    }
}

impl Invoke for SessionManager {
    fn invoke(&self, endpoint: &EndpointRef, args: &[Argument]) -> Result<Value, SessionError> {
        SessionManager::invoke(self, endpoint, args)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close();
    }
}
