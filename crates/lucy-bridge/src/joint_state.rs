//! Outbound joint positions.
//!
//! [`JointStatePublisher`] turns the operator's joint vector into a
//! `sensor_msgs/msg/JointState`-shaped message on the configured topic:
//!
//! ```json
//! { "position": [90.0, 45.0, 0.0] }
//! ```
//!
//! Positions are degrees, in the order the joints were given.  The topic is
//! advertised lazily on the first publish after every (re)connect.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lucy_types::{JointControlState, radians_to_degrees};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::channel::{ChannelHandler, LiveBinding};
use crate::connection::{BridgeConnection, TopicPublisher};
use crate::lock;
use crate::manager::ConnectionManager;
use crate::protocol::Endpoint;

/// Build the outbound message for `joints`.
pub fn joint_state_message(joints: &[JointControlState]) -> Value {
    let position: Vec<f64> = joints
        .iter()
        .map(|j| radians_to_degrees(j.current_value))
        .collect();
    json!({ "position": position })
}

pub struct JointStatePublisher {
    manager: ConnectionManager,
    endpoint: Endpoint,
    topic: Mutex<LiveBinding<TopicPublisher>>,
}

impl JointStatePublisher {
    pub fn new(manager: ConnectionManager, endpoint: Endpoint) -> Self {
        Self {
            manager,
            endpoint,
            topic: Mutex::new(LiveBinding::default()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// `true` while an advertised topic is held for the live connection.
    pub fn is_advertised(&self) -> bool {
        lock(&self.topic).is_bound()
    }

    /// Publish the current value of every joint.
    ///
    /// Offline this is a logged no-op, never an error: the operator keeps
    /// moving sliders while the robot is away and nothing queues up.
    pub fn publish_joint_states(&self, joints: &[JointControlState]) {
        let Some(connection) = self.manager.connection() else {
            warn!("Cannot publish joint states: ROS connection not available");
            return;
        };
        let msg = joint_state_message(joints);
        let mut topic = lock(&self.topic);
        let publisher = match topic.get_or_try_bind(&connection, |c| c.advertise(&self.endpoint)) {
            Ok(publisher) => publisher,
            Err(e) => {
                warn!(topic = %self.endpoint.name, error = %e, "Cannot publish joint states");
                return;
            }
        };
        match publisher.publish(msg) {
            Ok(()) => debug!(topic = %self.endpoint.name, joints = joints.len(), "published joint states"),
            Err(e) => {
                warn!(topic = %self.endpoint.name, error = %e, "Cannot publish joint states");
                topic.clear();
            }
        }
    }
}

impl ChannelHandler for JointStatePublisher {
    fn name(&self) -> &'static str {
        "joint_state"
    }

    fn attach(&self, _connection: &BridgeConnection) {
        // Advertised on first publish.
    }

    fn detach(&self) {
        lock(&self.topic).clear();
    }
}

/// Periodically publishes the latest joint vector.
///
/// Runs regardless of connection state; while offline each tick is the
/// publisher's logged no-op.  Stops when [`stop`][Self::stop] is called,
/// when the loop is dropped, or when the joint sender goes away.
pub struct PublishLoop {
    handle: JoinHandle<()>,
}

impl PublishLoop {
    pub fn spawn(
        publisher: Arc<JointStatePublisher>,
        mut joints: watch::Receiver<Vec<JointControlState>>,
        period: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if joints.has_changed().is_err() {
                    debug!("joint source dropped; stopping publish loop");
                    return;
                }
                let snapshot = joints.borrow_and_update().clone();
                publisher.publish_joint_states(&snapshot);
            }
        });
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(self) {}
}

impl Drop for PublishLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
