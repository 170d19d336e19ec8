//! Connection manager: owns the one bridge connection and its status.
//!
//! ```text
//! disconnected --connect-->   connecting   --opened--> connected
//! disconnected --reconnect--> reconnecting --opened--> connected
//! connecting / reconnecting --error | closed | timeout--> disconnected
//! connected --error | closed | disconnect--> disconnected
//! connected --reconnect--> reconnecting   (live connection replaced)
//! ```
//!
//! Every attempt gets a fresh [`BridgeConnection`] tagged with a generation
//! number.  Events from an older generation are ignored, so a late `Closed`
//! from a replaced connection can never knock a newer one offline.
//!
//! Status listeners run synchronously on whichever task performs the
//! transition, in registration order, and only when the status actually
//! changes.  Every transition is queued and delivered in order, so a
//! `connected -> disconnected -> connected` swap that races an in-progress
//! delivery is still seen step by step.  No internal lock is held while
//! listeners run, so a listener may call back into the manager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use lucy_types::{BridgeError, ConnectionStatus};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::connection::{BridgeConnection, ConnectionEvent};
use crate::lock;
use crate::transport::{BridgeTransport, ConnectionEvents};

/// Callback invoked on every status transition.
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

type Outcome = Option<Result<(), BridgeError>>;

/// What [`ConnectionManager::open`] decided under the lock.
enum OpenPlan {
    AlreadyConnected,
    Join(watch::Receiver<Outcome>),
    Start {
        generation: u64,
        outcome: watch::Receiver<Outcome>,
        previous: Option<BridgeConnection>,
    },
}

struct ManagerState {
    status: ConnectionStatus,
    /// Last status queued for listeners.
    announced: ConnectionStatus,
    /// Transitions not yet handed to listeners, oldest first.
    queued: VecDeque<ConnectionStatus>,
    /// Set while some task is draining status notifications.
    dispatching: bool,
    url: String,
    generation: u64,
    connection: Option<BridgeConnection>,
    timeout: Option<AbortHandle>,
    attempt: Option<watch::Sender<Outcome>>,
    listeners: Vec<(u64, StatusCallback)>,
}

impl ManagerState {
    /// Set the status, queueing it for listeners when it changed.
    fn transition(&mut self, status: ConnectionStatus) {
        self.status = status;
        if self.announced != status {
            self.announced = status;
            self.queued.push_back(status);
        }
    }
}

struct ManagerInner {
    transport: Arc<dyn BridgeTransport>,
    connect_timeout: Duration,
    next_listener: AtomicU64,
    state: Mutex<ManagerState>,
}

/// Shared handle to the process-wide connection. Clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

/// Non-owning reference to a [`ConnectionManager`], for callbacks the
/// manager itself stores.
#[derive(Clone)]
pub struct WeakConnectionManager {
    inner: Weak<ManagerInner>,
}

impl WeakConnectionManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

/// Registration returned by [`ConnectionManager::on_status_change`].
/// Dropping it unregisters the listener.
#[must_use = "dropping the handle unregisters the listener"]
pub struct StatusListener {
    manager: Weak<ManagerInner>,
    id: u64,
}

impl StatusListener {
    /// Unregister now.
    pub fn remove(self) {}
}

impl Drop for StatusListener {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            lock(&inner.state).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn BridgeTransport>, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                connect_timeout,
                next_listener: AtomicU64::new(1),
                state: Mutex::new(ManagerState {
                    status: ConnectionStatus::Disconnected,
                    announced: ConnectionStatus::Disconnected,
                    queued: VecDeque::new(),
                    dispatching: false,
                    url: String::new(),
                    generation: 0,
                    connection: None,
                    timeout: None,
                    attempt: None,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    pub fn from_config(config: &BridgeConfig, transport: Arc<dyn BridgeTransport>) -> Self {
        Self::new(transport, config.connect_timeout())
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).status
    }

    /// The live connection, or `None` unless the status is `Connected`.
    ///
    /// Never cache the result across a status change; every reconnect
    /// produces a new handle and closes the old one.
    pub fn connection(&self) -> Option<BridgeConnection> {
        let state = lock(&self.inner.state);
        match state.status {
            ConnectionStatus::Connected => state.connection.clone(),
            _ => None,
        }
    }

    /// URL of the most recent attempt.
    pub fn url(&self) -> String {
        lock(&self.inner.state).url.clone()
    }

    /// Register a listener for status transitions.
    pub fn on_status_change<F>(&self, listener: F) -> StatusListener
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.state)
            .listeners
            .push((id, Arc::new(listener)));
        StatusListener {
            manager: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Connect to `url`.
    ///
    /// Resolves immediately when already connected.  While an attempt is in
    /// flight the call joins it and returns its outcome; no second
    /// connection is opened.
    pub async fn connect(&self, url: &str) -> Result<(), BridgeError> {
        info!(%url, "Attempting to connect to ROS Bridge");
        self.open(url, ConnectionStatus::Connecting).await
    }

    /// Like [`connect`][Self::connect] but reported as `Reconnecting`, and a
    /// live connection is replaced rather than kept.
    ///
    /// Whatever rejects the attempt (error, close, timeout, disconnect) has
    /// already left the status `Disconnected` for that generation; nothing
    /// is done here after the fact, since a newer attempt may own the state
    /// by the time this call resumes.
    pub async fn reconnect(&self, url: &str) -> Result<(), BridgeError> {
        info!(%url, "Reconnecting to ROS Bridge");
        self.open(url, ConnectionStatus::Reconnecting).await
    }

    /// Close the live connection and cancel any pending attempt. Never fails.
    pub fn disconnect(&self) {
        let (connection, attempt) = {
            let mut state = lock(&self.inner.state);
            if let Some(timeout) = state.timeout.take() {
                timeout.abort();
            }
            state.transition(ConnectionStatus::Disconnected);
            (state.connection.take(), state.attempt.take())
        };
        if let Some(connection) = connection {
            connection.close();
        }
        info!("Disconnected from ROS Bridge");
        self.notify();
        if let Some(attempt) = attempt {
            attempt.send_replace(Some(Err(BridgeError::Cancelled)));
        }
    }

    async fn open(&self, url: &str, attempt_status: ConnectionStatus) -> Result<(), BridgeError> {
        let (generation, outcome, previous) = match self.plan_open(url, attempt_status) {
            OpenPlan::AlreadyConnected => return Ok(()),
            OpenPlan::Join(outcome) => return await_outcome(outcome).await,
            OpenPlan::Start {
                generation,
                outcome,
                previous,
            } => (generation, outcome, previous),
        };
        if let Some(previous) = previous {
            previous.close();
        }
        self.notify();

        let (connection, events) = self.inner.transport.open(generation, url);
        let superseded = {
            let mut state = lock(&self.inner.state);
            if state.generation == generation && state.status.is_pending() {
                state.connection = Some(connection.clone());
                state.timeout = Some(self.start_connection_timeout(generation));
                false
            } else {
                true
            }
        };
        if superseded {
            connection.close();
        } else {
            tokio::spawn(watch_events(self.downgrade(), generation, events));
        }

        await_outcome(outcome).await
    }

    fn plan_open(&self, url: &str, attempt_status: ConnectionStatus) -> OpenPlan {
        let mut state = lock(&self.inner.state);
        if state.status == ConnectionStatus::Connected
            && attempt_status == ConnectionStatus::Connecting
        {
            debug!(%url, "already connected");
            return OpenPlan::AlreadyConnected;
        }
        if let Some(attempt) = &state.attempt
            && state.status.is_pending()
        {
            debug!(%url, in_flight = %state.url, "joining in-flight attempt");
            return OpenPlan::Join(attempt.subscribe());
        }

        state.generation += 1;
        state.url = url.to_string();
        if let Some(timeout) = state.timeout.take() {
            timeout.abort();
        }
        state.transition(attempt_status);
        let (tx, rx) = watch::channel(None);
        state.attempt = Some(tx);
        OpenPlan::Start {
            generation: state.generation,
            outcome: rx,
            previous: state.connection.take(),
        }
    }

    fn start_connection_timeout(&self, generation: u64) -> AbortHandle {
        let manager = self.downgrade();
        let timeout = self.inner.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.on_timeout(generation);
            }
        })
        .abort_handle()
    }

    fn on_timeout(&self, generation: u64) {
        let (connection, attempt) = {
            let mut state = lock(&self.inner.state);
            if state.generation != generation || !state.status.is_pending() {
                return;
            }
            state.timeout = None;
            state.transition(ConnectionStatus::Disconnected);
            (state.connection.take(), state.attempt.take())
        };
        warn!(
            timeout_ms = self.inner.connect_timeout.as_millis() as u64,
            "Connection timeout reached"
        );
        if let Some(connection) = connection {
            connection.close();
        }
        self.notify();
        if let Some(attempt) = attempt {
            attempt.send_replace(Some(Err(BridgeError::ConnectTimeout {
                timeout_ms: self.inner.connect_timeout.as_millis() as u64,
            })));
        }
    }

    fn on_opened(&self, generation: u64) {
        let attempt = {
            let mut state = lock(&self.inner.state);
            if state.generation != generation || !state.status.is_pending() {
                debug!(generation, "ignoring open event from stale connection");
                return;
            }
            if let Some(timeout) = state.timeout.take() {
                timeout.abort();
            }
            state.transition(ConnectionStatus::Connected);
            state.attempt.take()
        };
        info!(generation, "Connected to ROS websocket server");
        self.notify();
        if let Some(attempt) = attempt {
            attempt.send_replace(Some(Ok(())));
        }
    }

    fn on_failure(&self, generation: u64, reason: String) {
        let (connection, attempt, was_connected) = {
            let mut state = lock(&self.inner.state);
            if state.generation != generation || state.status == ConnectionStatus::Disconnected {
                return;
            }
            if let Some(timeout) = state.timeout.take() {
                timeout.abort();
            }
            let was_connected = state.status == ConnectionStatus::Connected;
            state.transition(ConnectionStatus::Disconnected);
            (state.connection.take(), state.attempt.take(), was_connected)
        };
        if was_connected {
            warn!(generation, %reason, "Connection to ROS websocket server lost");
        } else {
            warn!(generation, %reason, "Error connecting to ROS websocket server");
        }
        if let Some(connection) = connection {
            connection.close();
        }
        self.notify();
        if let Some(attempt) = attempt {
            attempt.send_replace(Some(Err(BridgeError::ConnectFailed(reason))));
        }
    }

    /// Deliver queued transitions to listeners, oldest first.
    ///
    /// Only one task drains the queue at a time; a transition made while
    /// another task is draining (including from inside a listener) is picked
    /// up by that task's loop, which keeps delivery ordered.
    fn notify(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }
        loop {
            let (status, listeners) = {
                let mut state = lock(&self.inner.state);
                let Some(status) = state.queued.pop_front() else {
                    state.dispatching = false;
                    return;
                };
                let listeners: Vec<StatusCallback> =
                    state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
                (status, listeners)
            };
            info!(%status, "ROS Bridge Status");
            for listener in listeners {
                listener(status);
            }
        }
    }
}

async fn await_outcome(mut outcome: watch::Receiver<Outcome>) -> Result<(), BridgeError> {
    match outcome.wait_for(Option::is_some).await {
        Ok(value) => (*value).clone().unwrap_or(Err(BridgeError::Cancelled)),
        Err(_) => Err(BridgeError::Cancelled),
    }
}

async fn watch_events(manager: WeakConnectionManager, generation: u64, mut events: ConnectionEvents) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match event {
            ConnectionEvent::Opened => manager.on_opened(generation),
            ConnectionEvent::Error(reason) => manager.on_failure(generation, reason),
            ConnectionEvent::Closed => {
                manager.on_failure(generation, "connection closed".to_string())
            }
        }
    }
    if let Some(manager) = manager.upgrade() {
        manager.on_failure(generation, "transport ended".to_string());
    }
}
