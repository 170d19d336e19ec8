//! Connected-clients monitor.
//!
//! Reports how many dashboards the robot's bridge is serving.  On every
//! connect it asks the count service once and then follows the count topic;
//! whenever the connection goes away it reports `0`.
//!
//! The topic path only forwards strictly positive counts.  The robot
//! publishes `0` transiently while clients churn, and this process is itself
//! a client, so a live connection never legitimately has zero.  The one-shot
//! query is authoritative and forwarded as-is.

use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::channel::{ChannelHandler, watch_status};
use crate::connection::{BridgeConnection, MessageCallback, Subscription};
use crate::lock;
use crate::manager::{ConnectionManager, StatusListener};
use crate::protocol::Endpoint;
use crate::service::ClientCountService;

pub type ClientCountCallback = Arc<dyn Fn(i64) + Send + Sync>;

#[derive(Default)]
struct MonitorState {
    live_connection: Option<u64>,
    topic: Option<Subscription>,
}

struct MonitorInner {
    topic: Endpoint,
    service: Arc<ClientCountService>,
    callback: ClientCountCallback,
    this: Weak<MonitorInner>,
    state: Mutex<MonitorState>,
}

impl MonitorInner {
    /// Forget the live connection and drop the subscription.
    fn teardown(&self) {
        let subscription = {
            let mut state = lock(&self.state);
            state.live_connection = None;
            state.topic.take()
        };
        drop(subscription);
    }

    fn spawn_fetch(&self, connection_id: u64) {
        let Ok(runtime) = Handle::try_current() else {
            debug!("no runtime; skipping initial client count query");
            return;
        };
        let this = self.this.clone();
        runtime.spawn(async move {
            let Some(monitor) = this.upgrade() else {
                return;
            };
            match monitor.service.fetch().await {
                Ok(Some(count)) => {
                    let live = lock(&monitor.state).live_connection == Some(connection_id);
                    if live {
                        (monitor.callback)(count);
                    } else {
                        debug!(connection_id, count, "discarding client count from stale connection");
                    }
                }
                Ok(None) => debug!("client count response without value"),
                Err(e) => warn!(error = %e, "client count query failed"),
            }
        });
    }
}

impl ChannelHandler for MonitorInner {
    fn name(&self) -> &'static str {
        "connected_clients"
    }

    fn attach(&self, connection: &BridgeConnection) {
        let callback = Arc::clone(&self.callback);
        let on_count: MessageCallback = Arc::new(move |msg: &Value| {
            match msg.get("data").and_then(Value::as_i64) {
                Some(count) if count > 0 => callback(count),
                _ => {}
            }
        });
        let subscription = match connection.subscribe(&self.topic, on_count) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!(topic = %self.topic.name, error = %e, "client count subscribe failed");
                None
            }
        };
        let previous = {
            let mut state = lock(&self.state);
            state.live_connection = Some(connection.id());
            std::mem::replace(&mut state.topic, subscription)
        };
        drop(previous);
        self.spawn_fetch(connection.id());
    }

    fn detach(&self) {
        self.teardown();
        (self.callback)(0);
    }
}

/// Handle to a running monitor. Dropping it stops the monitor.
pub struct ConnectedClientsMonitor {
    inner: Arc<MonitorInner>,
    _listener: StatusListener,
}

impl ConnectedClientsMonitor {
    pub fn start<F>(
        manager: &ConnectionManager,
        topic: Endpoint,
        service: Arc<ClientCountService>,
        callback: F,
    ) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        let callback: ClientCountCallback = Arc::new(callback);
        let inner = Arc::new_cyclic(|this| MonitorInner {
            topic,
            service,
            callback,
            this: this.clone(),
            state: Mutex::new(MonitorState::default()),
        });
        let listener = watch_status(manager, &inner);
        Self {
            inner,
            _listener: listener,
        }
    }

    /// `true` while following the count topic on a live connection.
    pub fn is_active(&self) -> bool {
        lock(&self.inner.state).topic.is_some()
    }

    /// Stop listening. No further counts are reported.
    pub fn stop(self) {}
}

impl Drop for ConnectedClientsMonitor {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
