pub mod client;

/// A semantic climate state field from a device, ready to publish to MQTT.
pub struct StateUpdate {
    pub topic_name: String,
    pub field: String,
    pub value: String,
}
