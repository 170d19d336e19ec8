//! `rosbridge` v2 JSON operations.
//!
//! Every frame on the socket is a JSON object whose `"op"` field selects the
//! operation.  Only the subset the client needs is modelled; anything else
//! deserialises to [`BridgeOp::Unknown`] and is dropped by the router.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A topic or service endpoint: name plus ROS message/service type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// One rosbridge operation frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeOp {
    Advertise {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        topic: String,
        #[serde(rename = "type")]
        msg_type: String,
    },
    Unadvertise {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        topic: String,
    },
    Publish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        topic: String,
        msg: Value,
    },
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        topic: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        msg_type: Option<String>,
    },
    Unsubscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        topic: String,
    },
    CallService {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        service: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        service_type: Option<String>,
        #[serde(default)]
        args: Value,
    },
    ServiceResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        service: String,
        #[serde(default)]
        values: Value,
        /// Older bridges omit this field; absence means success.
        #[serde(default = "default_result")]
        result: bool,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        level: String,
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Unknown,
}

fn default_result() -> bool {
    true
}

impl BridgeOp {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_serializes_with_op_tag() {
        let op = BridgeOp::Publish {
            id: None,
            topic: "/joint_states".to_string(),
            msg: json!({ "position": [90.0] }),
        };
        let value: Value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({ "op": "publish", "topic": "/joint_states", "msg": { "position": [90.0] } })
        );
    }

    #[test]
    fn subscribe_renames_type_field() {
        let op = BridgeOp::Subscribe {
            id: Some("subscribe:/camera:1".to_string()),
            topic: "/camera".to_string(),
            msg_type: Some("sensor_msgs/msg/CompressedImage".to_string()),
        };
        let json = op.to_json().unwrap();
        assert!(json.contains(r#""op":"subscribe""#));
        assert!(json.contains(r#""type":"sensor_msgs/msg/CompressedImage""#));
    }

    #[test]
    fn service_response_without_result_defaults_to_success() {
        let op = BridgeOp::from_json(
            r#"{"op":"service_response","id":"c1","service":"/get_client_count","values":{"value":3}}"#,
        )
        .unwrap();
        match op {
            BridgeOp::ServiceResponse { result, values, .. } => {
                assert!(result);
                assert_eq!(values["value"], 3);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn unknown_op_is_tolerated() {
        let op = BridgeOp::from_json(r#"{"op":"fragment","data":"abc"}"#).unwrap();
        assert_eq!(op, BridgeOp::Unknown);
    }

    #[test]
    fn missing_op_is_an_error() {
        assert!(BridgeOp::from_json(r#"{"topic":"/x"}"#).is_err());
    }
}
