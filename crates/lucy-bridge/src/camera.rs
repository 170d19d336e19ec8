//! Compressed camera stream.
//!
//! [`CameraSubscriber`] multiplexes any number of frame consumers onto a
//! single `sensor_msgs/msg/CompressedImage` subscription.  The subscription
//! exists only while there is at least one consumer and a live connection.
//!
//! Per message the subscriber:
//!
//! 1. derives the frame delay from the sender's capture stamps,
//! 2. updates a one-second FPS window on the local clock,
//! 3. base64-decodes `data`,
//! 4. hands a [`CameraFrame`] to every consumer.
//!
//! A frame whose payload is missing or undecodable is logged and dropped;
//! the stream itself keeps going.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use lucy_types::{BridgeError, FrameMetrics};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::channel::{ChannelHandler, LiveBinding};
use crate::connection::{BridgeConnection, MessageCallback, Subscription};
use crate::lock;
use crate::manager::ConnectionManager;
use crate::protocol::Endpoint;

/// Handle identifying one registered frame consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    /// Raw compressed image bytes (JPEG for the Mobius camera).
    pub data: Vec<u8>,
    pub format: Option<String>,
    pub metrics: FrameMetrics,
}

pub type FrameCallback = Arc<dyn Fn(&CameraFrame) + Send + Sync>;

/// ROS time: seconds plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub sec: i64,
    pub nanosec: u32,
}

impl Stamp {
    pub fn as_nanos(self) -> i128 {
        i128::from(self.sec) * 1_000_000_000 + i128::from(self.nanosec)
    }
}

// ROS 2 names the stamp fields `sec`/`nanosec`, ROS 1 `secs`/`nsecs`.
#[derive(Deserialize)]
struct WireStamp {
    #[serde(default, alias = "secs")]
    sec: Option<i64>,
    #[serde(default, alias = "nsecs")]
    nanosec: Option<u32>,
}

#[derive(Deserialize)]
struct WireHeader {
    #[serde(default)]
    stamp: Option<WireStamp>,
}

#[derive(Deserialize)]
struct CompressedImage<'a> {
    #[serde(default)]
    header: Option<WireHeader>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default, borrow)]
    data: Option<&'a str>,
}

impl CompressedImage<'_> {
    fn stamp(&self) -> Option<Stamp> {
        let stamp = self.header.as_ref()?.stamp.as_ref()?;
        Some(Stamp {
            sec: stamp.sec?,
            nanosec: stamp.nanosec.unwrap_or(0),
        })
    }
}

fn decode_payload(data: Option<&str>) -> Result<Vec<u8>, BridgeError> {
    let data = data.ok_or_else(|| BridgeError::Decode("frame without data".to_string()))?;
    STANDARD
        .decode(data)
        .map_err(|e| BridgeError::Decode(e.to_string()))
}

/// Frame delay and FPS bookkeeping.
///
/// Delay is the gap between consecutive capture stamps, so it measures the
/// sender's cadence rather than network latency.  FPS counts frames received
/// since the window opened and is recomputed once at least a second of local
/// time has passed.
#[derive(Debug, Default)]
pub struct FrameMetricsTracker {
    last_stamp_ns: Option<i128>,
    window_start: Option<Instant>,
    frames_in_window: u32,
    current: FrameMetrics,
}

impl FrameMetricsTracker {
    pub fn record(&mut self, stamp: Option<Stamp>, now: Instant) -> FrameMetrics {
        // A frame without a stamp reports no delay and leaves the previous
        // stamp in place for the next one.
        self.current.frame_delay_ms = match stamp {
            Some(stamp) => {
                let ns = stamp.as_nanos();
                let delay = self
                    .last_stamp_ns
                    .map_or(0.0, |prev| (ns - prev) as f64 / 1_000_000.0);
                self.last_stamp_ns = Some(ns);
                delay
            }
            None => 0.0,
        };

        match self.window_start {
            None => self.window_start = Some(now),
            Some(start) => {
                self.frames_in_window += 1;
                let elapsed = now.saturating_duration_since(start);
                if elapsed >= Duration::from_secs(1) {
                    let fps = f64::from(self.frames_in_window) * 1000.0 / elapsed.as_millis() as f64;
                    self.current.fps = fps.round() as u32;
                    self.frames_in_window = 0;
                    self.window_start = Some(now);
                }
            }
        }
        self.current
    }

    pub fn current(&self) -> FrameMetrics {
        self.current
    }
}

struct CameraState {
    next_consumer: u64,
    consumers: Vec<(ConsumerId, FrameCallback)>,
    subscription: LiveBinding<Subscription>,
    metrics: FrameMetricsTracker,
}

pub struct CameraSubscriber {
    manager: ConnectionManager,
    endpoint: Endpoint,
    throttle: Option<DefaultDirectRateLimiter>,
    this: Weak<CameraSubscriber>,
    state: Mutex<CameraState>,
}

impl CameraSubscriber {
    /// `min_frame_interval` drops frames arriving sooner than that after the
    /// last accepted one; `None` accepts everything.
    pub fn new(
        manager: ConnectionManager,
        endpoint: Endpoint,
        min_frame_interval: Option<Duration>,
    ) -> Arc<Self> {
        let throttle = min_frame_interval
            .and_then(Quota::with_period)
            .map(RateLimiter::direct);
        Arc::new_cyclic(|this| Self {
            manager,
            endpoint,
            throttle,
            this: this.clone(),
            state: Mutex::new(CameraState {
                next_consumer: 1,
                consumers: Vec::new(),
                subscription: LiveBinding::default(),
                metrics: FrameMetricsTracker::default(),
            }),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Register a consumer. The topic subscription is created with the first
    /// consumer if the bridge is connected, otherwise on the next connect.
    pub fn subscribe_to_camera<F>(&self, callback: F) -> ConsumerId
    where
        F: Fn(&CameraFrame) + Send + Sync + 'static,
    {
        let connection = self.manager.connection();
        let mut state = lock(&self.state);
        let id = ConsumerId(state.next_consumer);
        state.next_consumer += 1;
        state.consumers.push((id, Arc::new(callback)));
        if let Some(connection) = connection {
            self.ensure_subscribed(&mut state, &connection);
        }
        debug!(consumer = id.0, consumers = state.consumers.len(), "camera consumer added");
        id
    }

    /// Remove a consumer. The last one to leave tears the subscription down.
    /// Returns `false` if `id` was not registered.
    pub fn unsubscribe_from_camera(&self, id: ConsumerId) -> bool {
        let released = {
            let mut state = lock(&self.state);
            let before = state.consumers.len();
            state.consumers.retain(|(c, _)| *c != id);
            if state.consumers.len() == before {
                return false;
            }
            if state.consumers.is_empty() {
                state.subscription.clear()
            } else {
                None
            }
        };
        if let Some(subscription) = released {
            debug!(topic = subscription.topic(), "last camera consumer left; unsubscribing");
        }
        true
    }

    pub fn metrics(&self) -> FrameMetrics {
        lock(&self.state).metrics.current()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.state).subscription.is_bound()
    }

    pub fn consumer_count(&self) -> usize {
        lock(&self.state).consumers.len()
    }

    fn ensure_subscribed(&self, state: &mut CameraState, connection: &BridgeConnection) {
        let this = self.this.clone();
        let callback: MessageCallback = Arc::new(move |msg: &Value| {
            if let Some(camera) = this.upgrade() {
                camera.handle_message(msg);
            }
        });
        if let Err(e) = state
            .subscription
            .get_or_try_bind(connection, |c| c.subscribe(&self.endpoint, callback))
        {
            warn!(topic = %self.endpoint.name, error = %e, "camera subscribe failed");
        }
    }

    fn handle_message(&self, msg: &Value) {
        if self.throttle.as_ref().is_some_and(|t| t.check().is_err()) {
            trace!("camera frame throttled");
            return;
        }

        let image = match CompressedImage::deserialize(msg) {
            Ok(image) => image,
            Err(e) => {
                let e = BridgeError::Decode(e.to_string());
                error!(topic = %self.endpoint.name, error = %e, "Error processing camera frame");
                return;
            }
        };

        let (metrics, consumers) = {
            let mut state = lock(&self.state);
            let metrics = state.metrics.record(image.stamp(), Instant::now());
            let consumers: Vec<FrameCallback> =
                state.consumers.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (metrics, consumers)
        };

        let data = match decode_payload(image.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(topic = %self.endpoint.name, error = %e, "Error processing camera frame");
                return;
            }
        };

        let frame = CameraFrame {
            data,
            format: image.format,
            metrics,
        };
        for consumer in consumers {
            consumer(&frame);
        }
    }
}

impl ChannelHandler for CameraSubscriber {
    fn name(&self) -> &'static str {
        "camera"
    }

    fn attach(&self, connection: &BridgeConnection) {
        let mut state = lock(&self.state);
        if !state.consumers.is_empty() {
            self.ensure_subscribed(&mut state, connection);
        }
    }

    /// Drops the subscription and starts metrics afresh for the next stream.
    fn detach(&self) {
        let mut state = lock(&self.state);
        state.subscription.clear();
        state.metrics = FrameMetricsTracker::default();
    }
}
