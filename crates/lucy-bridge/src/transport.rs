//! Transport seam between the connection manager and the socket.
//!
//! The manager never touches a socket directly.  It asks a
//! [`BridgeTransport`] to open a connection and then listens to the
//! returned [`ConnectionEvents`] for `Opened` / `Error` / `Closed`.
//! [`WsTransport`] is the production implementation on top of
//! `tokio-tungstenite`.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::connection::{BridgeConnection, ConnectionEvent, Outbound, OutboundQueue};
use crate::protocol::BridgeOp;

/// Lifecycle event stream for one connection.
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Opens bridge connections.
///
/// `open` must return immediately; the handshake result is reported
/// asynchronously on the event stream.  A transport must emit at most one
/// `Opened` and must end every connection with `Error` or `Closed` (or by
/// dropping the event sender).
pub trait BridgeTransport: Send + Sync + 'static {
    fn open(&self, id: u64, url: &str) -> (BridgeConnection, ConnectionEvents);
}

/// `rosbridge` over WebSocket (`ws://` and `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl BridgeTransport for WsTransport {
    fn open(&self, id: u64, url: &str) -> (BridgeConnection, ConnectionEvents) {
        let (connection, outbound) = BridgeConnection::new(id, url);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(connection.clone(), outbound, events_tx));
        (connection, events_rx)
    }
}

async fn pump(
    connection: BridgeConnection,
    mut outbound: OutboundQueue,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let url = connection.url().to_string();
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, response)) => {
            info!(connection = connection.id(), %url, status = %response.status(), "ws handshake complete");
            ws_stream
        }
        Err(e) => {
            warn!(connection = connection.id(), %url, error = %e, "ws connect failed");
            connection.close();
            let _ = events.send(ConnectionEvent::Error(e.to_string()));
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Closed while the handshake was in flight (timeout or disconnect).
    if connection.is_closed() {
        let _ = ws_tx.send(Message::Close(None)).await;
        let _ = events.send(ConnectionEvent::Closed);
        return;
    }
    let _ = events.send(ConnectionEvent::Opened);

    loop {
        tokio::select! {
            out = outbound.recv() => {
                match out {
                    Some(Outbound::Op(op)) => {
                        let json = match op.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                error!(connection = connection.id(), error = %e, "failed to serialise op");
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                            warn!(connection = connection.id(), error = %e, "ws send failed");
                            let _ = events.send(ConnectionEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match BridgeOp::from_json(text.as_str()) {
                        Ok(op) => connection.dispatch(op),
                        Err(e) => warn!(connection = connection.id(), error = %e, "unparseable bridge frame"),
                    },
                    Some(Ok(Message::Binary(bytes))) => {
                        debug!(connection = connection.id(), len = bytes.len(), "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(connection = connection.id(), error = %e, "ws receive error");
                        let _ = events.send(ConnectionEvent::Error(e.to_string()));
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    connection.close();
    let _ = events.send(ConnectionEvent::Closed);
}
