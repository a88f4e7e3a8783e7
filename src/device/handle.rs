//! Public interface to a running device.
//!
//! Everything that reaches the device task is a [`DeviceEvent`]: broker traffic
//! from the poller, commands from handles and queued requests from the codec.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::confirm::Publisher;
use crate::dispatch::Consumer;
use crate::error::{LinkError, LinkResult};
use crate::mqtt::message_manager::MQTTMessage;
use crate::topic::TopicSpec;

pub enum DeviceEvent {
    /// Inbound publish from the broker
    Message(MQTTMessage),
    /// Connection acknowledged by the broker
    Connected { session_present: bool },
    TransportError(String),
    /// Value for a publisher handed out earlier
    Publish { publisher: Publisher, value: Value },
    /// Codec publish: straight to the wire, no scripts or codec encode
    RawPublish { topic: String, value: Value },
    /// Codec notification for the raw consumers of a property
    Notify { property: String, message: Value },
    Subscribe {
        spec: TopicSpec,
        property: String,
        consumer: Consumer,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    CreatePublisher {
        set_topic: Option<TopicSpec>,
        get_topic: Option<TopicSpec>,
        property: String,
        make_confirmed: bool,
        reply: oneshot::Sender<LinkResult<Publisher>>,
    },
    Shutdown,
}

/// Cloneable handle for talking to a device task
#[derive(Clone)]
pub struct DeviceHandle {
    events: mpsc::UnboundedSender<DeviceEvent>,
    liveness: watch::Receiver<bool>,
}

impl DeviceHandle {
    pub(crate) fn new(events: mpsc::UnboundedSender<DeviceEvent>, liveness: watch::Receiver<bool>) -> Self {
        Self { events, liveness }
    }

    pub(crate) fn send(&self, event: DeviceEvent) -> LinkResult<()> {
        self.events
            .send(event)
            .map_err(|_| LinkError::Channel("Device task is not running".to_string()))
    }

    pub fn publish(&self, publisher: &Publisher, value: Value) -> LinkResult<()> {
        self.send(DeviceEvent::Publish {
            publisher: publisher.clone(),
            value,
        })
    }

    pub async fn subscribe<F>(&self, spec: TopicSpec, property: impl Into<String>, consumer: F) -> LinkResult<()>
    where
        F: FnMut(&str, Value) + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.send(DeviceEvent::Subscribe {
            spec,
            property: property.into(),
            consumer: Box::new(consumer),
            reply,
        })?;
        response
            .await
            .map_err(|_| LinkError::Channel("Device task dropped the subscription".to_string()))?
    }

    pub async fn publisher(
        &self,
        set_topic: Option<TopicSpec>,
        get_topic: Option<TopicSpec>,
        property: impl Into<String>,
        make_confirmed: bool,
    ) -> LinkResult<Publisher> {
        let (reply, response) = oneshot::channel();
        self.send(DeviceEvent::CreatePublisher {
            set_topic,
            get_topic,
            property: property.into(),
            make_confirmed,
            reply,
        })?;
        response
            .await
            .map_err(|_| LinkError::Channel("Device task dropped the publisher request".to_string()))?
    }

    /// `false` while the device is considered offline
    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness.clone()
    }

    pub fn is_online(&self) -> bool {
        *self.liveness.borrow()
    }

    pub fn shutdown(&self) -> LinkResult<()> {
        debug!("Requesting device shutdown");
        self.send(DeviceEvent::Shutdown)
    }
}
