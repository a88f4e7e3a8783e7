//! Device lifecycle with a statum state machine.
//!
//! ```text
//! Wiring ──► Running ──► Stopped
//! ```
//!
//! While wiring, handlers and publishers are registered directly on the context.
//! Once running, the device task owns the context and everything else goes
//! through a [`DeviceHandle`].

use statum::{machine, state};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::{Context, TrafficStatus};
use super::handle::{DeviceEvent, DeviceHandle};
use super::timers::TimerKind;
use crate::codec::{self, CodecLink, CodecRegistry};
use crate::confirm::Publisher;
use crate::config::DeviceConfig;
use crate::dispatch::Sink;
use crate::error::LinkResult;
use crate::mqtt::{ConnectOptions, MqttTransport, Transport};
use crate::topic::TopicSpec;

#[state]
#[derive(Debug, Clone)]
pub enum DeviceState {
    Wiring,  // Registering handlers and publishers
    Running, // Event loop owns the context
    Stopped, // Event loop finished, transport released
}

#[machine]
pub struct Device<S: DeviceState> {
    name: String,
    context: Context,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
    events_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

enum Next {
    Event(Option<DeviceEvent>),
    Timer(TimerKind),
}

impl<S: DeviceState> Device<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> &TrafficStatus {
        self.context.status()
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.events_tx.clone(), self.context.liveness())
    }
}

impl Device<Wiring> {
    /// Connects to the broker described by `config` and loads its codec.
    pub fn init(config: DeviceConfig, codecs: &CodecRegistry) -> LinkResult<Self> {
        let options = ConnectOptions::resolve(&config)?;
        if config.log_mqtt {
            info!("MQTT URL: {}", options.broker.url);
            info!("MQTT options: {:?}", options);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (transport, poller) = MqttTransport::connect(&options, events_tx.clone(), cancel.clone())?;

        Ok(Self::assemble(
            config,
            Box::new(transport),
            codecs,
            events_tx,
            events_rx,
            cancel,
            Some(poller),
        ))
    }

    /// Device on top of an already connected transport. Broker traffic has to be
    /// fed in through the handle.
    pub fn with_transport(config: DeviceConfig, transport: Box<dyn Transport>, codecs: &CodecRegistry) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self::assemble(
            config,
            transport,
            codecs,
            events_tx,
            events_rx,
            CancellationToken::new(),
            None,
        )
    }

    fn assemble(
        config: DeviceConfig,
        transport: Box<dyn Transport>,
        codecs: &CodecRegistry,
        events_tx: mpsc::UnboundedSender<DeviceEvent>,
        events_rx: mpsc::UnboundedReceiver<DeviceEvent>,
        cancel: CancellationToken,
        poller: Option<JoinHandle<()>>,
    ) -> Self {
        info!("Wiring device: {}", config.name);
        let config = Arc::new(config);
        let codec = codec::load(&config, codecs, CodecLink::new(events_tx.clone()));
        let name = config.name.clone();

        Self::new(
            name,
            Context::new(config, transport, codec),
            events_tx,
            events_rx,
            cancel,
            poller,
        )
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn subscribe<F>(&mut self, spec: &TopicSpec, property: &str, consumer: F) -> LinkResult<()>
    where
        F: FnMut(&str, serde_json::Value) + Send + 'static,
    {
        self.context
            .subscribe(spec, property, Sink::Consumer(Box::new(consumer)))
            .map(|_| ())
    }

    pub fn publisher(
        &mut self,
        set_topic: Option<TopicSpec>,
        get_topic: Option<TopicSpec>,
        property: &str,
        make_confirmed: bool,
    ) -> LinkResult<Publisher> {
        self.context
            .confirmed_publisher(set_topic, get_topic, property, make_confirmed)
    }

    pub fn start(self) -> Device<Running> {
        info!("Starting device: {}", self.name);
        self.transition()
    }
}

impl Device<Running> {
    /// Processes events and timers until a shutdown is requested.
    pub async fn run(mut self) -> Device<Stopped> {
        loop {
            let next = tokio::select! {
                event = self.events_rx.recv() => Next::Event(event),
                Some(kind) = self.context.next_timer(), if self.context.has_timers() => Next::Timer(kind),
            };

            match next {
                Next::Timer(kind) => self.context.on_timer(kind),
                Next::Event(None) | Next::Event(Some(DeviceEvent::Shutdown)) => break,
                Next::Event(Some(event)) => self.handle_event(event),
            }
        }

        info!("Stopping device: {}", self.name);
        self.cancel.cancel();
        if let Some(poller) = self.poller.take() {
            if let Err(e) = poller.await {
                warn!("MQTT poller ended abnormally: {}", e);
            }
        }
        self.transition()
    }

    fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Message(message) => self.context.dispatch(&message),
            DeviceEvent::Connected { session_present } => self.context.on_connected(session_present),
            DeviceEvent::TransportError(error) => self.context.on_transport_error(error),
            DeviceEvent::Publish { publisher, value } => self.context.publish_with(&publisher, value),
            DeviceEvent::RawPublish { topic, value } => self.context.publish_raw(&topic, &value),
            DeviceEvent::Notify { property, message } => self.context.notify(&property, message),
            DeviceEvent::Subscribe {
                spec,
                property,
                consumer,
                reply,
            } => {
                let result = self
                    .context
                    .subscribe(&spec, &property, Sink::Consumer(consumer))
                    .map(|_| ());
                if reply.send(result).is_err() {
                    debug!("Subscriber for {} went away", spec);
                }
            }
            DeviceEvent::CreatePublisher {
                set_topic,
                get_topic,
                property,
                make_confirmed,
                reply,
            } => {
                let result = self
                    .context
                    .confirmed_publisher(set_topic, get_topic, &property, make_confirmed);
                if reply.send(result).is_err() {
                    debug!("Publisher request for {} went away", property);
                }
            }
            DeviceEvent::Shutdown => {}
        }
    }
}

impl Device<Stopped> {
    pub fn into_status(self) -> TrafficStatus {
        self.context.status().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, CodecError, CodecInit};
    use crate::mqtt::message_manager::MQTTMessage;
    use crate::mqtt::testing::RecordingTransport;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    fn message(topic: &str, payload: &str) -> DeviceEvent {
        DeviceEvent::Message(MQTTMessage::from_topic(topic.to_string(), payload.as_bytes()))
    }

    #[tokio::test]
    async fn runs_until_shutdown() {
        let transport = RecordingTransport::default();
        let mut device = Device::with_transport(
            DeviceConfig {
                name: "lamp".to_string(),
                ..DeviceConfig::default()
            },
            Box::new(transport.clone()),
            &CodecRegistry::with_builtins(),
        );

        let received: Arc<Mutex<Vec<Value>>> = Arc::default();
        let sink = Arc::clone(&received);
        device
            .subscribe(&TopicSpec::plain("lamp/state"), "on", move |_: &str, value: Value| {
                sink.lock().unwrap().push(value)
            })
            .unwrap();
        let publisher = device
            .publisher(Some(TopicSpec::plain("lamp/set")), None, "on", true)
            .unwrap();

        let handle = device.handle();
        let task = tokio::spawn(device.start().run());

        handle.send(message("lamp/state", "ON")).unwrap();
        handle.publish(&publisher, json!("OFF")).unwrap();
        handle.shutdown().unwrap();

        let stopped = task.await.unwrap();
        assert_eq!(stopped.name(), "lamp");
        let status = stopped.into_status();
        assert_eq!(status.messages_received, 1);
        assert_eq!(status.messages_sent, 1);
        assert_eq!(received.lock().unwrap().as_slice(), &[json!("ON")]);
        assert_eq!(transport.payloads(), vec![("lamp/set".to_string(), "OFF".to_string())]);
        assert!(handle.publish(&publisher, json!("ON")).is_err());
    }

    #[tokio::test]
    async fn handles_register_while_running() {
        let transport = RecordingTransport::default();
        let device = Device::with_transport(
            DeviceConfig::default(),
            Box::new(transport.clone()),
            &CodecRegistry::default(),
        );
        let handle = device.handle();
        let task = tokio::spawn(device.start().run());

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle
            .subscribe(TopicSpec::plain("sensor/temp"), "temperature", move |topic: &str, value: Value| {
                let _ = tx.send((topic.to_string(), value));
            })
            .await
            .unwrap();
        assert!(handle
            .subscribe(TopicSpec::plain("sensor/data$.x["), "x", |_: &str, _: Value| {})
            .await
            .is_err());
        let publisher = handle
            .publisher(Some(TopicSpec::plain("sensor/set")), None, "temperature", false)
            .await
            .unwrap();

        handle.send(message("sensor/temp", "19")).unwrap();
        assert_eq!(rx.recv().await, Some(("sensor/temp".to_string(), json!("19"))));
        handle.publish(&publisher, json!(20)).unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap();

        assert_eq!(transport.subscriptions(), vec!["sensor/temp".to_string()]);
        assert_eq!(transport.payloads(), vec![("sensor/set".to_string(), "20".to_string())]);
    }

    #[tokio::test]
    async fn codec_link_requests_run_after_the_current_message() {
        let mut codecs = CodecRegistry::default();
        codecs.register("relay", |init: CodecInit| -> Result<Codec, CodecError> {
            let link = init.link;
            Ok(Codec::new().with_decode(move |value, info, _| {
                link.publish("relay/ack", json!(format!("got {}", info.property)));
                link.notify("power", value.clone());
                Some(value)
            }))
        });
        let transport = RecordingTransport::default();
        let mut device = Device::with_transport(
            DeviceConfig {
                codec: Some("relay".to_string()),
                ..DeviceConfig::default()
            },
            Box::new(transport.clone()),
            &codecs,
        );

        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::default();
        for property in ["on", "power"] {
            let seen = Arc::clone(&seen);
            device
                .subscribe(
                    &TopicSpec::plain(format!("relay/{}", property)),
                    property,
                    move |topic: &str, value: Value| seen.lock().unwrap().push((topic.to_string(), value)),
                )
                .unwrap();
        }

        let handle = device.handle();
        let task = tokio::spawn(device.start().run());
        handle.send(message("relay/on", "1")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.shutdown().unwrap();
        task.await.unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                ("relay/on".to_string(), json!("1")),
                ("_prop-power".to_string(), json!("1")),
            ]
        );
        assert_eq!(transport.payloads(), vec![("relay/ack".to_string(), "got on".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_follows_confirmations() {
        let transport = RecordingTransport::default();
        let mut device = Device::with_transport(
            DeviceConfig {
                confirmation_period_ms: Some(500),
                retry_limit: Some(0),
                ..DeviceConfig::default()
            },
            Box::new(transport.clone()),
            &CodecRegistry::default(),
        );
        let publisher = device
            .publisher(
                Some(TopicSpec::plain("lamp/set")),
                Some(TopicSpec::plain("lamp/state")),
                "on",
                true,
            )
            .unwrap();
        let handle = device.handle();
        let mut liveness = handle.liveness();
        let task = tokio::spawn(device.start().run());

        handle.publish(&publisher, json!("ON")).unwrap();
        liveness.changed().await.unwrap();
        assert!(!handle.is_online());

        handle.send(message("lamp/state", "ON")).unwrap();
        liveness.changed().await.unwrap();
        assert!(handle.is_online());

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert_eq!(transport.published().len(), 1);
    }
}
