//! `lucy-bridge` – rosbridge client for the Lucy humanoid dashboard
//!
//! Keeps one WebSocket connection to a `rosbridge` server alive across
//! drops and operator-initiated reconnects, and rebinds every topic and
//! service handle to the current connection whenever it changes.
//!
//! # Modules
//!
//! - [`manager`] – Status state machine and sole owner of the live
//!   connection.
//! - [`channel`] – Attach/detach pattern that rebinds handlers on every
//!   status transition.
//! - [`joint_state`] – Outbound joint positions.
//! - [`camera`] – Compressed image stream with frame delay and FPS.
//! - [`service`] – Request/response wrappers for robot services.
//! - [`clients`] – Connected-clients count monitor.
//! - [`context`] – Process-wide owner of the manager and handlers.
//! - [`transport`] / [`connection`] / [`protocol`] – Wire plumbing.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod camera;
pub mod channel;
pub mod clients;
pub mod config;
pub mod connection;
pub mod context;
pub mod joint_state;
pub mod manager;
pub mod protocol;
pub mod service;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use camera::{CameraFrame, CameraSubscriber, ConsumerId};
pub use channel::{ChannelHandler, LiveBinding};
pub use clients::ConnectedClientsMonitor;
pub use config::BridgeConfig;
pub use connection::{BridgeConnection, Subscription, TopicPublisher};
pub use context::BridgeContext;
pub use joint_state::{JointStatePublisher, PublishLoop};
pub use manager::{ConnectionManager, StatusListener, WeakConnectionManager};
pub use protocol::{BridgeOp, Endpoint};
pub use service::{ClientCountService, EnableCameraService, ServiceClient};
pub use transport::{BridgeTransport, WsTransport};

pub use lucy_types::{BridgeError, ConnectionStatus, FrameMetrics, JointControlState};

/// Lock a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
