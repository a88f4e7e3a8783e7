//! # MQTT Transport
//!
//! The dispatch engine talks to the broker only through the [`Transport`] trait:
//! it subscribes to topics and publishes text payloads. Inbound traffic flows the
//! other way as [`DeviceEvent`](crate::device::DeviceEvent)s pushed by a poller task.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection options with deployment overrides and defaults
//! ├── message_manager.rs  - Inbound message records and payload helpers
//! └── mqtt_handler.rs     - rumqttc client, event loop poller and TLS setup
//! ```
//!
//! Session establishment, keep-alive and the wire protocol are left to `rumqttc`.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

use thiserror::Error;

use crate::config::PublishOptions;

pub use config::ConnectOptions;
pub use mqtt_handler::MqttTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Unsupported broker URL '{0}'")]
    UnsupportedUrl(String),

    #[error("No broker URL configured")]
    MissingUrl,
}

/// Minimal publish/subscribe surface consumed by the dispatch engine
pub trait Transport: Send {
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn publish(
        &mut self,
        topic: &str,
        payload: String,
        options: &PublishOptions,
    ) -> Result<(), TransportError>;
}
