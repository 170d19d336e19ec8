//! Request/response services on the robot.

use std::sync::Mutex;

use lucy_types::BridgeError;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::channel::{ChannelHandler, LiveBinding};
use crate::connection::BridgeConnection;
use crate::lock;
use crate::manager::ConnectionManager;
use crate::protocol::Endpoint;

/// A service endpoint bound to one connection.
#[derive(Debug, Clone)]
pub struct ServiceBinding {
    connection: BridgeConnection,
    endpoint: Endpoint,
}

impl ServiceBinding {
    pub async fn call(&self, args: Value) -> Result<Value, BridgeError> {
        self.connection.call_service(&self.endpoint, args).await
    }
}

/// Caller for one service, rebound lazily to whatever connection is live.
pub struct ServiceClient {
    manager: ConnectionManager,
    endpoint: Endpoint,
    binding: Mutex<LiveBinding<ServiceBinding>>,
}

impl ServiceClient {
    pub fn new(manager: ConnectionManager, endpoint: Endpoint) -> Self {
        Self {
            manager,
            endpoint,
            binding: Mutex::new(LiveBinding::default()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.binding).is_bound()
    }

    /// Issue one call. Fails with [`BridgeError::NotConnected`] without
    /// sending anything when the bridge is offline.
    pub async fn call(&self, args: Value) -> Result<Value, BridgeError> {
        let Some(connection) = self.manager.connection() else {
            return Err(BridgeError::NotConnected);
        };
        let binding = {
            let mut binding = lock(&self.binding);
            binding
                .get_or_try_bind(&connection, |c| {
                    Ok::<_, BridgeError>(ServiceBinding {
                        connection: c.clone(),
                        endpoint: self.endpoint.clone(),
                    })
                })?
                .clone()
        };
        debug!(service = %self.endpoint.name, connection = connection.id(), "call_service");
        binding.call(args).await
    }
}

impl ChannelHandler for ServiceClient {
    fn name(&self) -> &'static str {
        "service"
    }

    fn attach(&self, _connection: &BridgeConnection) {
        lock(&self.binding).clear();
    }

    fn detach(&self) {
        lock(&self.binding).clear();
    }
}

/// `std_srvs/srv/SetBool` switch for the robot camera.
pub struct EnableCameraService {
    client: ServiceClient,
}

impl EnableCameraService {
    pub fn new(manager: ConnectionManager, endpoint: Endpoint) -> Self {
        Self {
            client: ServiceClient::new(manager, endpoint),
        }
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    /// Turn the camera on or off. Returns the service's `success` flag,
    /// which is always `true` on `Ok`.
    pub async fn enable_camera(&self, enabled: bool) -> Result<bool, BridgeError> {
        let values = self.client.call(json!({ "data": enabled })).await?;
        if values.get("success").and_then(Value::as_bool) == Some(true) {
            info!(enabled, "camera toggled");
            return Ok(true);
        }
        let reason = values
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("Service call failed")
            .to_string();
        Err(BridgeError::ServiceFailed {
            service: self.client.endpoint().name.clone(),
            reason,
        })
    }
}

impl ChannelHandler for EnableCameraService {
    fn name(&self) -> &'static str {
        "enable_camera"
    }

    fn attach(&self, connection: &BridgeConnection) {
        self.client.attach(connection);
    }

    fn detach(&self) {
        self.client.detach();
    }
}

/// `GetInt` query for how many clients the robot's bridge is serving.
pub struct ClientCountService {
    client: ServiceClient,
}

impl ClientCountService {
    pub fn new(manager: ConnectionManager, endpoint: Endpoint) -> Self {
        Self {
            client: ServiceClient::new(manager, endpoint),
        }
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    /// `None` when the response carries no integer `value`.
    pub async fn fetch(&self) -> Result<Option<i64>, BridgeError> {
        let values = self.client.call(json!({})).await?;
        Ok(values.get("value").and_then(Value::as_i64))
    }
}

impl ChannelHandler for ClientCountService {
    fn name(&self) -> &'static str {
        "client_count"
    }

    fn attach(&self, connection: &BridgeConnection) {
        self.client.attach(connection);
    }

    fn detach(&self) {
        self.client.detach();
    }
}
