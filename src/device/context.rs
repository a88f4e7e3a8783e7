//! Per-device state and the operations that run on it.
//!
//! The context is owned by the device task. Every operation runs to completion
//! before the next event is looked at, so handlers, caches and script state are
//! never touched concurrently.

use chrono::{DateTime, Local};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::timers::{TimerKind, Timers};
use crate::codec::{Codec, CodecInfo, Direction};
use crate::confirm::{ConfirmedPublisher, Publisher, PublisherId};
use crate::config::DeviceConfig;
use crate::dispatch::chain::{self, ChainEnv, ChainTarget};
use crate::dispatch::{notification_topic, Debounce, Handler, HandlerId, JsonQuery, Registry, Sink, Stage};
use crate::error::LinkResult;
use crate::mqtt::message_manager::{stringify, MQTTMessage};
use crate::mqtt::Transport;
use crate::script::ApplyStateStore;
use crate::topic::TopicSpec;

/// Traffic counters of one device
#[derive(Debug, Clone, Default)]
pub struct TrafficStatus {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub connections: u32,
    pub last_activity: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

impl TrafficStatus {
    fn touch(&mut self) {
        self.last_activity = Some(Local::now());
    }
}

pub struct Context {
    config: Arc<DeviceConfig>,
    transport: Box<dyn Transport>,
    registry: Registry,
    codec: Option<Codec>,
    /// Last payload per topic, only with `optimizePublishing`
    last_published: Option<HashMap<String, String>>,
    apply_state: ApplyStateStore,
    timers: Timers,
    publishers: Vec<ConfirmedPublisher>,
    liveness: watch::Sender<bool>,
    status: TrafficStatus,
}

impl Context {
    pub fn new(config: Arc<DeviceConfig>, transport: Box<dyn Transport>, codec: Option<Codec>) -> Self {
        let last_published = config.optimize_publishing.then(HashMap::new);
        let (liveness, _) = watch::channel(true);
        Self {
            config,
            transport,
            registry: Registry::default(),
            codec,
            last_published,
            apply_state: ApplyStateStore::default(),
            timers: Timers::default(),
            publishers: Vec::new(),
            liveness,
            status: TrafficStatus::default(),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn status(&self) -> &TrafficStatus {
        &self.status
    }

    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness.subscribe()
    }

    pub fn apply_state(&self) -> &ApplyStateStore {
        &self.apply_state
    }

    /// Registers a handler for `spec` and subscribes to its topic on first use.
    ///
    /// A structured query in the topic is validated here and fails the
    /// registration if it cannot be parsed.
    pub fn subscribe(&mut self, spec: &TopicSpec, property: &str, sink: Sink) -> LinkResult<HandlerId> {
        let resolved = spec.resolve();
        let mut stages = Vec::new();
        if let Some(query) = resolved.query {
            stages.push(Stage::Extract(JsonQuery::compile(query)?));
        }
        if self
            .codec
            .as_ref()
            .is_some_and(|codec| codec.has_function(property, Direction::Decode))
        {
            stages.push(Stage::Decode);
        }
        if let Some(script) = spec.apply() {
            stages.push(Stage::Apply(script.clone()));
        }

        let topic = resolved.topic.to_string();
        let handler = Handler {
            property: property.to_string(),
            topic: topic.clone(),
            spec: spec.clone(),
            stages,
            debounce: self.config.debounce().map(Debounce::new),
            sink,
        };
        let registered = self.registry.register(handler, self.codec.is_some());

        if registered.new_property && self.config.log_mqtt {
            info!("Available codec notification property: {}", property);
        }
        if registered.new_topic {
            debug!("Subscribing to {}", topic);
            if let Err(e) = self.transport.subscribe(&topic) {
                error!("{}", e);
            }
        }
        Ok(registered.id)
    }

    /// Publishes `value` for `property`. Nothing happens without a topic or for `null`.
    pub fn publish(&mut self, spec: Option<&TopicSpec>, property: &str, value: Value) {
        let Some(spec) = spec else {
            return;
        };
        if value.is_null() {
            return;
        }

        let value = match spec.apply() {
            Some(script) => {
                let message = stringify(&value);
                match script.run(value, self.apply_state.state_for(property)) {
                    Ok(Some(encoded)) if !encoded.is_null() => encoded,
                    Ok(_) => {
                        debug!("apply() function suppressed publish to {}", spec.topic());
                        return;
                    }
                    Err(e) => {
                        error!(
                            "Encode function apply(message) {{ {} }} failed for topic {} with message {} - {}",
                            script.source(),
                            spec.topic(),
                            message,
                            e
                        );
                        return;
                    }
                }
            }
            None => value,
        };

        let topic = spec.topic();
        let encode = self
            .codec
            .as_mut()
            .and_then(|codec| codec.function(property, Direction::Encode));
        let Some(encode) = encode else {
            self.publish_raw(topic, &value);
            return;
        };

        let info = CodecInfo {
            topic,
            property,
            extended_topic: spec.is_extended().then_some(spec),
        };
        let mut outgoing = Vec::new();
        let encoded = encode(value, &info, &mut |direct: Value| outgoing.push(direct));
        outgoing.extend(encoded.filter(|v| !v.is_null()));
        for value in outgoing {
            self.publish_raw(topic, &value);
        }
    }

    /// Final publish step: stringify, skip repeats when optimising, send.
    pub fn publish_raw(&mut self, topic: &str, value: &Value) {
        let payload = stringify(value);
        if let Some(cache) = self.last_published.as_mut() {
            if cache.get(topic) == Some(&payload) {
                debug!("Skipping unchanged publish to {}", topic);
                return;
            }
            cache.insert(topic.to_string(), payload.clone());
        }

        if self.config.log_mqtt {
            info!("Publishing MQTT: {} = {}", topic, payload);
        }
        match self
            .transport
            .publish(topic, payload, &self.config.mqtt_pub_options)
        {
            Ok(()) => {
                self.status.messages_sent += 1;
                self.status.touch();
            }
            Err(e) => error!("{}", e),
        }
    }

    /// Creates a publisher for `property`, confirmed when the device configuration
    /// and the caller both ask for it and a get topic exists.
    pub fn confirmed_publisher(
        &mut self,
        set_topic: Option<TopicSpec>,
        get_topic: Option<TopicSpec>,
        property: &str,
        make_confirmed: bool,
    ) -> LinkResult<Publisher> {
        let (Some(period), Some(get_topic), true) =
            (self.config.confirmation_period(), get_topic, make_confirmed)
        else {
            return Ok(Publisher::Direct {
                set_topic,
                property: property.to_string(),
            });
        };

        let id = self.publishers.len();
        self.publishers.push(ConfirmedPublisher::new(
            set_topic,
            get_topic.clone(),
            property,
            self.config.retry_limit(),
            period,
            self.config.indicates_offline_on_timeout(),
        ));
        if let Err(e) = self.subscribe(&get_topic, property, Sink::Confirmation(id)) {
            self.publishers.pop();
            return Err(e);
        }
        Ok(Publisher::Confirmed(id))
    }

    pub fn publish_with(&mut self, publisher: &Publisher, value: Value) {
        match publisher {
            Publisher::Direct { set_topic, property } => {
                self.publish(set_topic.as_ref(), property, value)
            }
            Publisher::Confirmed(id) => {
                if value.is_null() {
                    return;
                }
                let Some(confirmed) = self.publishers.get_mut(*id) else {
                    warn!("Unknown publisher {}", id);
                    return;
                };
                let value = confirmed.start(*id, value, &mut self.timers);
                let set_topic = confirmed.set_topic.clone();
                let property = confirmed.property.clone();
                self.publish(set_topic.as_ref(), &property, value);
            }
        }
    }

    /// Routes an inbound message to every handler of its topic.
    pub fn dispatch(&mut self, message: &MQTTMessage) {
        self.status.messages_received += 1;
        self.status.touch();
        if self.config.log_mqtt {
            info!("Received MQTT: {}", message);
        }

        let Some(handlers) = self.registry.handlers_for(&message.topic) else {
            warn!("No MQTT dispatch handler for topic [{}]", message.topic);
            return;
        };
        for id in handlers {
            self.run_handler(id, message.value());
        }
    }

    fn run_handler(&mut self, id: HandlerId, input: Value) {
        let Context {
            registry,
            codec,
            apply_state,
            config,
            ..
        } = self;
        let Some(handler) = registry.handler(id) else {
            return;
        };
        let target = ChainTarget {
            topic: &handler.topic,
            property: &handler.property,
            spec: &handler.spec,
        };
        let mut env = ChainEnv {
            codec: codec.as_mut(),
            apply_state,
            log_mqtt: config.log_mqtt,
        };
        let outputs = chain::run(&handler.stages, input, &target, &mut env);
        let topic = handler.topic.clone();

        for value in outputs {
            self.accept(id, topic.clone(), value);
        }
    }

    /// End of the chain: hold the value for debouncing or hand it to the sink.
    fn accept(&mut self, id: HandlerId, topic: String, value: Value) {
        let Context { registry, timers, .. } = self;
        if let Some(debounce) = registry
            .handler_mut(id)
            .and_then(|handler| handler.debounce.as_mut())
        {
            debounce.hold(id, topic, value, timers);
            return;
        }
        self.deliver(id, &topic, value);
    }

    fn deliver(&mut self, id: HandlerId, topic: &str, value: Value) {
        let publisher = match self.registry.handler_mut(id).map(|handler| &mut handler.sink) {
            Some(Sink::Consumer(consumer)) => {
                consumer(topic, value);
                return;
            }
            Some(Sink::Confirmation(publisher)) => *publisher,
            None => return,
        };
        self.confirmation_received(publisher, &value);
    }

    fn confirmation_received(&mut self, id: PublisherId, message: &Value) {
        let Some(publisher) = self.publishers.get_mut(id) else {
            return;
        };
        if let Some(online) = publisher.on_message(message, &mut self.timers) {
            self.liveness.send_replace(online);
        }
    }

    /// Delivers `message` to every raw consumer of `property`, bypassing decode
    /// chains and debouncing.
    pub fn notify(&mut self, property: &str, message: Value) {
        let topic = notification_topic(property);
        for id in self.registry.raw_handlers(property) {
            self.deliver(id, &topic, message.clone());
        }
    }

    pub fn on_connected(&mut self, session_present: bool) {
        self.status.connections += 1;
        self.status.last_error = None;
        if self.status.connections == 1 || session_present {
            return;
        }

        let topics: Vec<String> = self.registry.topics().map(str::to_string).collect();
        info!("Reconnected, restoring {} subscriptions", topics.len());
        for topic in topics {
            if let Err(e) = self.transport.subscribe(&topic) {
                error!("{}", e);
            }
        }
    }

    pub fn on_transport_error(&mut self, error: String) {
        debug!("Transport error recorded: {}", error);
        self.status.last_error = Some(error);
    }

    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    pub async fn next_timer(&mut self) -> Option<TimerKind> {
        self.timers.next_expired().await
    }

    pub fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Debounce(id) => {
                let released = self
                    .registry
                    .handler_mut(id)
                    .and_then(|handler| handler.debounce.as_mut())
                    .and_then(Debounce::release);
                if let Some((topic, value)) = released {
                    self.deliver(id, &topic, value);
                }
            }
            TimerKind::Confirmation(id) => {
                let Some(publisher) = self.publishers.get_mut(id) else {
                    return;
                };
                let outcome = publisher.on_timeout(id, &mut self.timers);
                let set_topic = publisher.set_topic.clone();
                let property = publisher.property.clone();

                if outcome.offline {
                    self.liveness.send_replace(false);
                }
                if let Some(value) = outcome.retry {
                    self.publish(set_topic.as_ref(), &property, value);
                }
            }
        }
    }

    /// Runs every pending timer to completion. Used when time is paused in tests.
    #[cfg(test)]
    pub(crate) async fn drain_timers(&mut self) {
        while let Some(kind) = self.next_timer().await {
            self.on_timer(kind);
        }
    }
}
