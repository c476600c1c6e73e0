use async_trait::async_trait;
use tokio::sync::broadcast;

/// QoS 1: broker acknowledges every state publish.
pub const QOS_AT_LEAST_ONCE: u8 = 1;

pub fn state_topic(device_uuid: &str) -> String {
    format!("iot/device/{device_uuid}/state")
}

/// Seam to the shared MQTT connection manager. The sync engine only ever
/// checks connectivity, publishes without queueing, and listens for
/// reconnects; connection management itself lives elsewhere.
///
/// `publish_no_queue` implementations are expected to enforce their own
/// QoS-1 ack deadline (on the order of 10s) and surface it as an error.
#[async_trait]
pub trait MqttManager: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish_no_queue(&self, topic: &str, payload: &[u8], qos: u8) -> anyhow::Result<()>;

    /// Fires once per re-established connection.
    fn subscribe_reconnect(&self) -> broadcast::Receiver<()>;
}
