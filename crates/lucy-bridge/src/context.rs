//! Process-wide bridge context.
//!
//! One [`BridgeContext`] per process owns the [`ConnectionManager`] and the
//! long-lived handlers, each already wired to follow the connection.  Pass it
//! (or an `Arc` of it) to whatever needs the bridge.

use std::sync::Arc;

use tracing::info;

use crate::camera::CameraSubscriber;
use crate::channel::watch_status;
use crate::clients::ConnectedClientsMonitor;
use crate::config::BridgeConfig;
use crate::joint_state::JointStatePublisher;
use crate::manager::{ConnectionManager, StatusListener};
use crate::service::{ClientCountService, EnableCameraService};
use crate::transport::{BridgeTransport, WsTransport};

pub struct BridgeContext {
    config: BridgeConfig,
    manager: ConnectionManager,
    joint_states: Arc<JointStatePublisher>,
    camera: Arc<CameraSubscriber>,
    enable_camera: Arc<EnableCameraService>,
    client_count: Arc<ClientCountService>,
    _listeners: Vec<StatusListener>,
}

impl BridgeContext {
    pub fn new(config: BridgeConfig, transport: Arc<dyn BridgeTransport>) -> Self {
        let manager = ConnectionManager::from_config(&config, transport);

        let joint_states = Arc::new(JointStatePublisher::new(
            manager.clone(),
            config.joint_state_topic.clone(),
        ));
        let camera = CameraSubscriber::new(
            manager.clone(),
            config.camera_topic.clone(),
            config.camera_min_frame_interval(),
        );
        let enable_camera = Arc::new(EnableCameraService::new(
            manager.clone(),
            config.enable_camera_service.clone(),
        ));
        let client_count = Arc::new(ClientCountService::new(
            manager.clone(),
            config.client_count_service.clone(),
        ));

        let listeners = vec![
            watch_status(&manager, &joint_states),
            watch_status(&manager, &camera),
            watch_status(&manager, &enable_camera),
            watch_status(&manager, &client_count),
        ];
        info!(
            connect_timeout_ms = config.connect_timeout_ms,
            camera_topic = %config.camera_topic.name,
            "bridge context ready"
        );

        Self {
            config,
            manager,
            joint_states,
            camera,
            enable_camera,
            client_count,
            _listeners: listeners,
        }
    }

    /// Context on the production WebSocket transport.
    pub fn with_websocket(config: BridgeConfig) -> Self {
        Self::new(config, Arc::new(WsTransport))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn joint_states(&self) -> &Arc<JointStatePublisher> {
        &self.joint_states
    }

    pub fn camera(&self) -> &Arc<CameraSubscriber> {
        &self.camera
    }

    pub fn enable_camera(&self) -> &Arc<EnableCameraService> {
        &self.enable_camera
    }

    pub fn client_count(&self) -> &Arc<ClientCountService> {
        &self.client_count
    }

    /// Start a connected-clients monitor. It runs until the returned handle
    /// is stopped or dropped.
    pub fn monitor_connected_clients<F>(&self, callback: F) -> ConnectedClientsMonitor
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        ConnectedClientsMonitor::start(
            &self.manager,
            self.config.client_count_topic.clone(),
            Arc::clone(&self.client_count),
            callback,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, connect, image, settle};
    use crate::protocol::BridgeOp;
    use lucy_types::{ConnectionStatus, JointControlState};
    use std::sync::Mutex;

    #[tokio::test]
    async fn handlers_follow_connection_end_to_end() {
        let mock = MockTransport::new();
        let ctx = BridgeContext::new(BridgeConfig::default(), mock.clone());
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let _status = {
            let statuses = Arc::clone(&statuses);
            ctx.manager()
                .on_status_change(move |s| statuses.lock().unwrap().push(s))
        };
        let frames = Arc::new(Mutex::new(0usize));
        {
            let frames = Arc::clone(&frames);
            ctx.camera().subscribe_to_camera(move |_| *frames.lock().unwrap() += 1);
        }

        let link = connect(ctx.manager(), &mock).await;
        assert!(ctx.camera().is_subscribed());

        let mut joint = JointControlState::revolute("j1", "Right Arm", 0.0, 2.617994);
        joint.set_value(1.5708);
        ctx.joint_states().publish_joint_states(&[joint.clone()]);
        let publish = link
            .sent()
            .into_iter()
            .find_map(|op| match op {
                BridgeOp::Publish { topic, msg, .. } if topic == "/joint_states" => Some(msg),
                _ => None,
            })
            .unwrap();
        assert!((publish["position"][0].as_f64().unwrap() - 90.0).abs() < 0.01);

        link.publish("/camera/mobius/jpg", image("AAEC", 1, 0));
        assert_eq!(*frames.lock().unwrap(), 1);

        ctx.manager().disconnect();
        settle().await;
        assert!(!ctx.camera().is_subscribed());
        assert!(!ctx.joint_states().is_advertised());
        ctx.joint_states().publish_joint_states(&[joint]);
        assert!(link.sent().is_empty());

        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn monitor_uses_configured_topic() {
        let mock = MockTransport::new();
        let ctx = BridgeContext::new(BridgeConfig::default(), mock.clone());
        let counts = Arc::new(Mutex::new(Vec::new()));
        let _monitor = {
            let counts = Arc::clone(&counts);
            ctx.monitor_connected_clients(move |n| counts.lock().unwrap().push(n))
        };

        let link = connect(ctx.manager(), &mock).await;
        settle().await;
        link.publish("/client_count", serde_json::json!({ "data": 3 }));

        assert_eq!(counts.lock().unwrap().last(), Some(&3));
    }
}
