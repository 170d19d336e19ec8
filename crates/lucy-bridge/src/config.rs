//! Bridge endpoint names and timing knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Endpoint;

/// Default time allowed for a connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub connect_timeout_ms: u64,
    pub joint_state_topic: Endpoint,
    pub camera_topic: Endpoint,
    /// Drop camera frames arriving sooner than this after the last accepted
    /// one. Unset means every frame is accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_min_frame_interval_ms: Option<u64>,
    pub enable_camera_service: Endpoint,
    pub client_count_service: Endpoint,
    pub client_count_topic: Endpoint,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            joint_state_topic: Endpoint::new("/joint_states", "sensor_msgs/msg/JointState"),
            camera_topic: Endpoint::new("/camera/mobius/jpg", "sensor_msgs/msg/CompressedImage"),
            camera_min_frame_interval_ms: None,
            enable_camera_service: Endpoint::new("/camera/mobius/enable", "std_srvs/srv/SetBool"),
            client_count_service: Endpoint::new("/get_client_count", "camera_ros/srv/GetInt"),
            client_count_topic: Endpoint::new("/client_count", "std_msgs/msg/Int32"),
        }
    }
}

impl BridgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn camera_min_frame_interval(&self) -> Option<Duration> {
        self.camera_min_frame_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_robot_endpoints() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.camera_topic.name, "/camera/mobius/jpg");
        assert_eq!(cfg.enable_camera_service.kind, "std_srvs/srv/SetBool");
        assert!(cfg.camera_min_frame_interval().is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: BridgeConfig =
            serde_json::from_str(r#"{"connect_timeout_ms":2500,"camera_min_frame_interval_ms":0}"#)
                .unwrap();
        assert_eq!(cfg.connect_timeout(), Duration::from_millis(2500));
        assert!(cfg.camera_min_frame_interval().is_none());
        assert_eq!(cfg.client_count_topic.name, "/client_count");
    }
}
