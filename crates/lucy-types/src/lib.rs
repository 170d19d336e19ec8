use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of the process-wide bridge connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    /// First attempt towards a bridge URL is in flight.
    Connecting,
    Connected,
    /// A retry is in flight. Mechanically identical to `Connecting`; kept
    /// apart so operators can tell a first attempt from a retry.
    Reconnecting,
}

impl ConnectionStatus {
    /// `true` while an open attempt is pending.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Joint type as declared in the robot description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JointKind {
    Fixed,
    #[default]
    Revolute,
    Continuous,
    Prismatic,
    Floating,
    Planar,
}

/// Operator-side control state of one joint. All angles are radians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointControlState {
    pub name: String,
    pub current_value: f64,
    pub target_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub kind: JointKind,
    /// Display group, e.g. "Right Arm".
    pub category: String,
}

impl JointControlState {
    /// A revolute joint resting at `min_value`.
    pub fn revolute(
        name: impl Into<String>,
        category: impl Into<String>,
        min_value: f64,
        max_value: f64,
    ) -> Self {
        Self {
            name: name.into(),
            current_value: min_value,
            target_value: min_value,
            min_value,
            max_value,
            kind: JointKind::Revolute,
            category: category.into(),
        }
    }

    /// Set both current and target value, clamped to the joint limits.
    pub fn set_value(&mut self, radians: f64) {
        let v = radians.clamp(self.min_value, self.max_value);
        self.current_value = v;
        self.target_value = v;
    }

    /// Move the joint to the midpoint of its limits.
    pub fn reset(&mut self) {
        self.set_value((self.min_value + self.max_value) / 2.0);
    }
}

/// A named snapshot of joint values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPose {
    pub id: Uuid,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// joint name -> radians
    pub joints: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_order: Option<Vec<String>>,
}

impl SavedPose {
    /// Capture the current value of every joint.
    pub fn capture(
        name: &str,
        joints: &[JointControlState],
        category_order: Option<Vec<String>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            timestamp: Utc::now(),
            joints: joints
                .iter()
                .map(|j| (j.name.clone(), j.current_value))
                .collect(),
            category_order,
        }
    }

    /// Apply the pose to `joints`. Joints the pose does not mention keep
    /// their current value.
    pub fn apply_to(&self, joints: &mut [JointControlState]) {
        for joint in joints.iter_mut() {
            if let Some(&v) = self.joints.get(&joint.name) {
                joint.current_value = v;
                joint.target_value = v;
            }
        }
    }
}

/// Camera stream telemetry derived from live traffic.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameMetrics {
    /// Gap between the capture stamps of the last two frames.
    pub frame_delay_ms: f64,
    pub fps: u32,
}

pub fn radians_to_degrees(radians: f64) -> f64 {
    radians * 180.0 / std::f64::consts::PI
}

pub fn degrees_to_radians(degrees: f64) -> f64 {
    degrees * std::f64::consts::PI / 180.0
}

/// Errors surfaced by the bridge client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("ROS connection not available")]
    NotConnected,

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Connection timed out after {timeout_ms} ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Service call to {service} failed: {reason}")]
    ServiceFailed { service: String, reason: String },

    /// A malformed inbound payload. Logged by the stream that hit it, never
    /// surfaced to callers.
    #[error("Decode error: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_joints() -> Vec<JointControlState> {
        vec![
            JointControlState::revolute("right_elbow_joint", "Right Arm", 0.0, 2.0),
            JointControlState::revolute("right_wrist_joint", "Right Hand", 0.0, 1.0),
        ]
    }

    #[test]
    fn connection_status_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionStatus::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
        assert!(ConnectionStatus::Reconnecting.is_pending());
        assert!(!ConnectionStatus::Connected.is_pending());
    }

    #[test]
    fn set_value_clamps_to_limits() {
        let mut joint = JointControlState::revolute("j1", "Head", -1.0, 1.0);
        joint.set_value(3.0);
        assert_eq!(joint.current_value, 1.0);
        assert_eq!(joint.target_value, 1.0);
        joint.set_value(-3.0);
        assert_eq!(joint.current_value, -1.0);
    }

    #[test]
    fn reset_moves_to_midpoint() {
        let mut joint = JointControlState::revolute("j1", "Head", 0.0, 2.0);
        joint.reset();
        assert!((joint.current_value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn pose_apply_keeps_unknown_joints() {
        let mut joints = fixture_joints();
        joints[0].set_value(1.5);
        let pose = SavedPose::capture("  wave ", &joints[..1], None);
        assert_eq!(pose.name, "wave");

        joints[0].set_value(0.0);
        joints[1].set_value(0.25);
        pose.apply_to(&mut joints);

        assert_eq!(joints[0].current_value, 1.5);
        assert_eq!(joints[1].current_value, 0.25);
    }

    #[test]
    fn saved_pose_omits_missing_category_order() {
        let pose = SavedPose::capture("rest", &fixture_joints(), None);
        let json = serde_json::to_string(&pose).unwrap();
        assert!(!json.contains("category_order"));
    }

    #[test]
    fn angle_conversion() {
        assert!((radians_to_degrees(std::f64::consts::FRAC_PI_2) - 90.0).abs() < 1e-9);
        assert!((degrees_to_radians(180.0) - std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn bridge_error_display() {
        assert_eq!(
            BridgeError::NotConnected.to_string(),
            "ROS connection not available"
        );
        let err = BridgeError::ServiceFailed {
            service: "/camera/mobius/enable".to_string(),
            reason: "Service call failed".to_string(),
        };
        assert!(err.to_string().contains("/camera/mobius/enable"));
    }
}
