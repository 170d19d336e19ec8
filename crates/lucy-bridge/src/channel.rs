//! Rebinding handlers to whatever connection is live.
//!
//! Every handler that talks over the bridge (publisher, camera, services,
//! client monitor) follows the same rule: hold nothing across a status
//! change.  On `Connected` it is handed the fresh [`BridgeConnection`]; on
//! anything else it drops every binding it had.  [`watch_status`] wires a
//! [`ChannelHandler`] into the manager to enforce that.

use std::sync::{Arc, Weak};

use lucy_types::ConnectionStatus;
use tracing::debug;

use crate::connection::BridgeConnection;
use crate::manager::{ConnectionManager, StatusListener};

pub trait ChannelHandler: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// A new connection is live.
    fn attach(&self, connection: &BridgeConnection);

    /// The connection is gone or about to be replaced. Drop every binding.
    fn detach(&self);
}

/// Keep `handler` bound to the manager's live connection.
///
/// The listener holds only weak references, so it never keeps the handler
/// or the manager alive.  If the manager is already connected the handler is
/// attached immediately.
pub fn watch_status<H: ChannelHandler>(manager: &ConnectionManager, handler: &Arc<H>) -> StatusListener {
    let weak_handler: Weak<H> = Arc::downgrade(handler);
    let weak_manager = manager.downgrade();
    let listener = manager.on_status_change(move |status| {
        let Some(handler) = weak_handler.upgrade() else {
            return;
        };
        match status {
            ConnectionStatus::Connected => {
                let connection = weak_manager.upgrade().and_then(|m| m.connection());
                if let Some(connection) = connection {
                    debug!(handler = handler.name(), connection = connection.id(), "attach");
                    handler.attach(&connection);
                }
            }
            _ => {
                debug!(handler = handler.name(), %status, "detach");
                handler.detach();
            }
        }
    });
    if let Some(connection) = manager.connection() {
        handler.attach(&connection);
    }
    listener
}

/// A value created on one particular connection.
///
/// Tagged with the connection id so a binding made on a connection that has
/// since been replaced is never handed out.
#[derive(Debug)]
pub struct LiveBinding<T> {
    slot: Option<(u64, T)>,
}

impl<T> Default for LiveBinding<T> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<T> LiveBinding<T> {
    pub fn is_bound(&self) -> bool {
        self.slot.is_some()
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.slot.as_ref().map(|(id, _)| *id)
    }

    pub fn is_bound_to(&self, connection: &BridgeConnection) -> bool {
        self.connection_id() == Some(connection.id())
    }

    /// Replace the binding, returning the previous value.
    pub fn bind(&mut self, connection: &BridgeConnection, value: T) -> Option<T> {
        self.slot
            .replace((connection.id(), value))
            .map(|(_, old)| old)
    }

    pub fn clear(&mut self) -> Option<T> {
        self.slot.take().map(|(_, value)| value)
    }

    /// Return the binding for `connection`, creating it with `create` when
    /// absent or bound to a different connection.
    pub fn get_or_try_bind<E>(
        &mut self,
        connection: &BridgeConnection,
        create: impl FnOnce(&BridgeConnection) -> Result<T, E>,
    ) -> Result<&T, E> {
        let value = match self.slot.take() {
            Some((id, value)) if id == connection.id() => value,
            stale => {
                drop(stale);
                create(connection)?
            }
        };
        Ok(&self.slot.insert((connection.id(), value)).1)
    }
}
