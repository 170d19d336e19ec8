//! A single bridge connection and its inbound routing table.
//!
//! [`BridgeConnection`] is a cheap-clone handle.  Outbound operations are
//! pushed onto an unbounded queue drained by the transport's pump task, so
//! publishing and subscribing never block the caller.  Inbound frames are
//! handed to [`BridgeConnection::dispatch`], which routes topic messages to
//! subscription callbacks and service responses to the pending caller.
//!
//! A handle is never reused across reconnects: once [`close`][BridgeConnection::close]
//! has run, every operation fails with [`BridgeError::ConnectionClosed`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lucy_types::BridgeError;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::lock;
use crate::protocol::{BridgeOp, Endpoint};

/// Callback invoked with the `msg` payload of every message on a topic.
pub type MessageCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Op(BridgeOp),
    /// Close the socket and stop the pump.
    Close,
}

/// Receiving end of the outbound queue, owned by the transport.
pub type OutboundQueue = mpsc::UnboundedReceiver<Outbound>;

/// Lifecycle events a transport reports for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    Error(String),
    Closed,
}

type PendingCall = oneshot::Sender<Result<Value, BridgeError>>;

#[derive(Default)]
struct Router {
    /// topic -> (subscription id, callback)
    topics: HashMap<String, Vec<(String, MessageCallback)>>,
    /// call id -> waiting caller
    pending: HashMap<String, (String, PendingCall)>,
}

struct Inner {
    id: u64,
    url: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    router: Mutex<Router>,
}

/// Handle to one transport instance.
#[derive(Clone)]
pub struct BridgeConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for BridgeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConnection")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BridgeConnection {
    /// Create a handle and the outbound queue its transport must drain.
    pub fn new(id: u64, url: impl Into<String>) -> (Self, OutboundQueue) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(Inner {
                id,
                url: url.into(),
                outbound,
                closed: AtomicBool::new(false),
                router: Mutex::new(Router::default()),
            }),
        };
        (connection, queue)
    }

    /// Generation number assigned by the connection manager.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Queue a raw operation for the transport.
    pub fn send(&self, op: BridgeOp) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }
        trace!(connection = self.inner.id, ?op, "queue outbound op");
        self.inner
            .outbound
            .send(Outbound::Op(op))
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    /// Advertise `endpoint` and return a publisher bound to this connection.
    pub fn advertise(&self, endpoint: &Endpoint) -> Result<TopicPublisher, BridgeError> {
        self.send(BridgeOp::Advertise {
            id: Some(format!("advertise:{}:{}", endpoint.name, Uuid::new_v4())),
            topic: endpoint.name.clone(),
            msg_type: endpoint.kind.clone(),
        })?;
        Ok(TopicPublisher {
            connection: self.clone(),
            endpoint: endpoint.clone(),
        })
    }

    /// Subscribe to `endpoint`. The subscription lasts until the returned
    /// [`Subscription`] is dropped or the connection closes.
    pub fn subscribe(
        &self,
        endpoint: &Endpoint,
        callback: MessageCallback,
    ) -> Result<Subscription, BridgeError> {
        let id = format!("subscribe:{}:{}", endpoint.name, Uuid::new_v4());
        self.send(BridgeOp::Subscribe {
            id: Some(id.clone()),
            topic: endpoint.name.clone(),
            msg_type: Some(endpoint.kind.clone()),
        })?;
        lock(&self.inner.router)
            .topics
            .entry(endpoint.name.clone())
            .or_default()
            .push((id.clone(), callback));
        debug!(connection = self.inner.id, topic = %endpoint.name, "subscribed");
        Ok(Subscription {
            connection: self.clone(),
            topic: endpoint.name.clone(),
            id,
        })
    }

    /// Issue one service call and wait for its response `values`.
    ///
    /// Dropping the returned future before the response arrives forgets the
    /// call; a late response is then logged as unmatched.
    pub async fn call_service(
        &self,
        endpoint: &Endpoint,
        args: Value,
    ) -> Result<Value, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }
        let id = format!("call_service:{}:{}", endpoint.name, Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.router)
            .pending
            .insert(id.clone(), (endpoint.name.clone(), tx));
        let _waiter = PendingGuard {
            connection: self,
            id: id.clone(),
        };

        self.send(BridgeOp::CallService {
            id: Some(id),
            service: endpoint.name.clone(),
            service_type: Some(endpoint.kind.clone()),
            args,
        })?;

        rx.await.unwrap_or(Err(BridgeError::ConnectionClosed))
    }

    /// Route one inbound operation.
    ///
    /// Topic callbacks run on a snapshot of the subscriber list taken before
    /// any of them is invoked, so a callback may unsubscribe itself (or
    /// others) without disturbing delivery of the current message.
    pub fn dispatch(&self, op: BridgeOp) {
        match op {
            BridgeOp::Publish { topic, msg, .. } => {
                let callbacks: Vec<MessageCallback> = lock(&self.inner.router)
                    .topics
                    .get(&topic)
                    .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                    .unwrap_or_default();
                if callbacks.is_empty() {
                    trace!(connection = self.inner.id, %topic, "message on topic without subscribers");
                }
                for callback in callbacks {
                    callback(&msg);
                }
            }
            BridgeOp::ServiceResponse {
                id,
                service,
                values,
                result,
            } => {
                let waiter = id.and_then(|id| lock(&self.inner.router).pending.remove(&id));
                let Some((_, tx)) = waiter else {
                    debug!(connection = self.inner.id, %service, "unmatched service response");
                    return;
                };
                let outcome = if result {
                    Ok(values)
                } else {
                    Err(BridgeError::ServiceFailed {
                        reason: failure_reason(&values),
                        service,
                    })
                };
                let _ = tx.send(outcome);
            }
            BridgeOp::Status { level, msg, .. } => {
                if level == "error" || level == "warning" {
                    warn!(connection = self.inner.id, %level, %msg, "bridge status");
                } else {
                    debug!(connection = self.inner.id, %level, %msg, "bridge status");
                }
            }
            other => {
                debug!(connection = self.inner.id, op = ?other, "ignoring inbound op");
            }
        }
    }

    /// Close the connection. Pending service calls fail with
    /// [`BridgeError::ConnectionClosed`] and all topic routes are dropped.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<PendingCall> = {
            let mut router = lock(&self.inner.router);
            router.topics.clear();
            router.pending.drain().map(|(_, (_, tx))| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(BridgeError::ConnectionClosed));
        }
        let _ = self.inner.outbound.send(Outbound::Close);
        debug!(connection = self.inner.id, url = %self.inner.url, "connection closed");
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.inner.router)
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn remove_subscription(&self, topic: &str, id: &str) {
        {
            let mut router = lock(&self.inner.router);
            if let Some(subs) = router.topics.get_mut(topic) {
                subs.retain(|(sub_id, _)| sub_id != id);
                if subs.is_empty() {
                    router.topics.remove(topic);
                }
            }
        }
        if !self.is_closed() {
            let _ = self.send(BridgeOp::Unsubscribe {
                id: Some(id.to_string()),
                topic: topic.to_string(),
            });
        }
    }
}

/// Removes a call's entry from the pending table when the caller goes away.
struct PendingGuard<'a> {
    connection: &'a BridgeConnection,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.connection.inner.router).pending.remove(&self.id);
    }
}

fn failure_reason(values: &Value) -> String {
    match values {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("Service call failed")
            .to_string(),
        _ => "Service call failed".to_string(),
    }
}

/// An advertised outbound topic on one connection.
pub struct TopicPublisher {
    connection: BridgeConnection,
    endpoint: Endpoint,
}

impl TopicPublisher {
    pub fn publish(&self, msg: Value) -> Result<(), BridgeError> {
        self.connection.send(BridgeOp::Publish {
            id: None,
            topic: self.endpoint.name.clone(),
            msg,
        })
    }

}

impl Drop for TopicPublisher {
    fn drop(&mut self) {
        if !self.connection.is_closed() {
            let _ = self.connection.send(BridgeOp::Unadvertise {
                id: None,
                topic: self.endpoint.name.clone(),
            });
        }
    }
}

/// A live topic subscription. Dropping it unsubscribes.
pub struct Subscription {
    connection: BridgeConnection,
    topic: String,
    id: String,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Explicit form of dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.connection.remove_subscription(&self.topic, &self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn drain(queue: &mut OutboundQueue) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = queue.try_recv() {
            out.push(item);
        }
        out
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> MessageCallback {
        let counter = Arc::clone(counter);
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn publish(topic: &str) -> BridgeOp {
        BridgeOp::Publish {
            id: None,
            topic: topic.to_string(),
            msg: json!({ "data": 1 }),
        }
    }

    #[test]
    fn subscribe_sends_op_and_routes_messages() {
        let (conn, mut queue) = BridgeConnection::new(1, "ws://localhost:9090");
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = Endpoint::new("/client_count", "std_msgs/msg/Int32");

        let sub = conn.subscribe(&endpoint, counting_callback(&hits)).unwrap();
        conn.dispatch(publish("/client_count"));
        conn.dispatch(publish("/other"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let sent = drain(&mut queue);
        assert!(matches!(
            &sent[0],
            Outbound::Op(BridgeOp::Subscribe { topic, .. }) if topic == "/client_count"
        ));

        drop(sub);
        assert_eq!(conn.subscriber_count("/client_count"), 0);
        let sent = drain(&mut queue);
        assert!(matches!(&sent[0], Outbound::Op(BridgeOp::Unsubscribe { .. })));

        conn.dispatch(publish("/client_count"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_drop_its_own_subscription() {
        let (conn, _queue) = BridgeConnection::new(1, "ws://localhost:9090");
        let endpoint = Endpoint::new("/camera", "sensor_msgs/msg/CompressedImage");
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let self_dropping = {
            let slot = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            Arc::new(move |_: &Value| {
                hits.fetch_add(1, Ordering::SeqCst);
                slot.lock().unwrap().take();
            })
        };
        *slot.lock().unwrap() = Some(conn.subscribe(&endpoint, self_dropping).unwrap());
        let _other = conn.subscribe(&endpoint, counting_callback(&hits)).unwrap();

        conn.dispatch(publish("/camera"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(conn.subscriber_count("/camera"), 1);
    }

    #[tokio::test]
    async fn service_call_resolves_on_matching_response() {
        let (conn, mut queue) = BridgeConnection::new(1, "ws://localhost:9090");
        let endpoint = Endpoint::new("/get_client_count", "camera_ros/srv/GetInt");

        let caller = {
            let conn = conn.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move { conn.call_service(&endpoint, json!({})).await })
        };
        tokio::task::yield_now().await;

        let id = match queue.recv().await {
            Some(Outbound::Op(BridgeOp::CallService { id, service, .. })) => {
                assert_eq!(service, "/get_client_count");
                id
            }
            other => panic!("expected call_service, got {other:?}"),
        };
        conn.dispatch(BridgeOp::ServiceResponse {
            id,
            service: "/get_client_count".to_string(),
            values: json!({ "value": 4 }),
            result: true,
        });

        let values = caller.await.unwrap().unwrap();
        assert_eq!(values["value"], 4);
    }

    #[tokio::test]
    async fn failed_service_response_is_an_error() {
        let (conn, mut queue) = BridgeConnection::new(1, "ws://localhost:9090");
        let endpoint = Endpoint::new("/camera/mobius/enable", "std_srvs/srv/SetBool");

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call_service(&endpoint, json!({ "data": true })).await })
        };
        tokio::task::yield_now().await;

        let Some(Outbound::Op(BridgeOp::CallService { id, .. })) = queue.recv().await else {
            panic!("expected call_service");
        };
        conn.dispatch(BridgeOp::ServiceResponse {
            id,
            service: "/camera/mobius/enable".to_string(),
            values: json!({}),
            result: false,
        });

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::ServiceFailed { .. }));
    }

    #[tokio::test]
    async fn close_fails_pending_calls_and_rejects_new_ops() {
        let (conn, _queue) = BridgeConnection::new(1, "ws://localhost:9090");
        let endpoint = Endpoint::new("/get_client_count", "camera_ros/srv/GetInt");

        let caller = {
            let conn = conn.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move { conn.call_service(&endpoint, json!({})).await })
        };
        tokio::task::yield_now().await;

        conn.close();
        assert_eq!(
            caller.await.unwrap().unwrap_err(),
            BridgeError::ConnectionClosed
        );
        assert!(conn.advertise(&endpoint).is_err());
        assert_eq!(
            conn.call_service(&endpoint, json!({})).await.unwrap_err(),
            BridgeError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn abandoned_service_call_forgets_its_waiter() {
        use futures_util::FutureExt;

        let (conn, mut queue) = BridgeConnection::new(1, "ws://localhost:9090");
        let endpoint = Endpoint::new("/camera/mobius/enable", "std_srvs/srv/SetBool");

        let mut call = Box::pin(conn.call_service(&endpoint, json!({ "data": true })));
        assert!((&mut call).now_or_never().is_none());
        assert_eq!(lock(&conn.inner.router).pending.len(), 1);

        drop(call);
        assert!(lock(&conn.inner.router).pending.is_empty());

        // The late answer has nobody left to wake.
        let Some(Outbound::Op(BridgeOp::CallService { id, .. })) = queue.recv().await else {
            panic!("expected call_service");
        };
        conn.dispatch(BridgeOp::ServiceResponse {
            id,
            service: "/camera/mobius/enable".to_string(),
            values: json!({ "success": true }),
            result: true,
        });
        assert!(lock(&conn.inner.router).pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_service_call_forgets_its_waiter() {
        let (conn, _queue) = BridgeConnection::new(1, "ws://localhost:9090");
        let endpoint = Endpoint::new("/get_client_count", "camera_ros/srv/GetInt");

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            conn.call_service(&endpoint, json!({})),
        )
        .await;

        assert!(outcome.is_err());
        assert!(lock(&conn.inner.router).pending.is_empty());
    }

    #[test]
    fn publisher_unadvertises_on_drop() {
        let (conn, mut queue) = BridgeConnection::new(1, "ws://localhost:9090");
        let publisher = conn
            .advertise(&Endpoint::new("/joint_states", "sensor_msgs/msg/JointState"))
            .unwrap();
        publisher.publish(json!({ "position": [0.0] })).unwrap();
        drop(publisher);

        let ops: Vec<_> = drain(&mut queue)
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Op(op) => Some(op),
                Outbound::Close => None,
            })
            .collect();
        assert!(matches!(ops[0], BridgeOp::Advertise { .. }));
        assert!(matches!(ops[1], BridgeOp::Publish { .. }));
        assert!(matches!(ops[2], BridgeOp::Unadvertise { .. }));
    }
}
