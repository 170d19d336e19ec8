//! In-memory transport for unit tests.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::connection::{BridgeConnection, ConnectionEvent, Outbound, OutboundQueue};
use crate::manager::ConnectionManager;
use crate::protocol::BridgeOp;
use crate::transport::{BridgeTransport, ConnectionEvents};

/// One connection opened through [`MockTransport`].
#[derive(Clone)]
pub struct MockLink {
    pub connection: BridgeConnection,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: Arc<Mutex<OutboundQueue>>,
}

impl MockLink {
    /// Complete the handshake.
    pub fn accept(&self) {
        let _ = self.events.send(ConnectionEvent::Opened);
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(ConnectionEvent::Error(reason.to_string()));
    }

    /// Simulate the server going away.
    pub fn drop_remote(&self) {
        self.connection.close();
        let _ = self.events.send(ConnectionEvent::Closed);
    }

    /// Drain every operation queued since the last call.
    pub fn sent(&self) -> Vec<BridgeOp> {
        let mut queue = self.outbound.lock().unwrap();
        let mut ops = Vec::new();
        while let Ok(item) = queue.try_recv() {
            if let Outbound::Op(op) = item {
                ops.push(op);
            }
        }
        ops
    }

    /// Feed one inbound operation to the connection.
    pub fn deliver(&self, op: BridgeOp) {
        self.connection.dispatch(op);
    }

    /// Feed a topic message.
    pub fn publish(&self, topic: &str, msg: Value) {
        self.deliver(BridgeOp::Publish {
            id: None,
            topic: topic.to_string(),
            msg,
        });
    }

    /// Answer the most recent queued call to `service`, returning the args
    /// it was called with.
    pub fn respond(&self, service: &str, values: Value, result: bool) -> Value {
        let (id, args) = self
            .sent()
            .into_iter()
            .rev()
            .find_map(|op| match op {
                BridgeOp::CallService {
                    id, service: s, args, ..
                } if s == service => Some((id, args)),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no call to {service}"));
        self.deliver(BridgeOp::ServiceResponse {
            id,
            service: service.to_string(),
            values,
            result,
        });
        args
    }
}

#[derive(Default)]
pub struct MockTransport {
    links: Mutex<Vec<MockLink>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn last(&self) -> MockLink {
        self.links
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection opened")
    }
}

impl BridgeTransport for MockTransport {
    fn open(&self, id: u64, url: &str) -> (BridgeConnection, ConnectionEvents) {
        let (connection, outbound) = BridgeConnection::new(id, url);
        let (events, events_rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(MockLink {
            connection: connection.clone(),
            events,
            outbound: Arc::new(Mutex::new(outbound)),
        });
        (connection, events_rx)
    }
}

/// Let spawned tasks run to quiescence.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Drive `manager` to `Connected` on a fresh mock connection.
pub async fn connect(manager: &ConnectionManager, mock: &Arc<MockTransport>) -> MockLink {
    let before = mock.opened();
    let task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("ws://robot:9090").await }
    });
    settle().await;
    assert_eq!(mock.opened(), before + 1, "connect did not open a connection");
    let link = mock.last();
    link.accept();
    task.await.unwrap().unwrap();
    link
}

/// A `sensor_msgs/CompressedImage` payload.
pub fn image(data: &str, sec: i64, nanosec: u32) -> Value {
    json!({
        "header": { "stamp": { "sec": sec, "nanosec": nanosec }, "frame_id": "mobius" },
        "format": "jpeg",
        "data": data,
    })
}
