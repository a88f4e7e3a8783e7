use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::time::delay_queue::Key;

use super::chain::Stage;
use crate::confirm::PublisherId;
use crate::device::timers::{TimerKind, Timers};
use crate::topic::TopicSpec;

pub type HandlerId = usize;

/// Terminal consumer of a subscription, called with `(topic, value)`
pub type Consumer = Box<dyn FnMut(&str, Value) + Send>;

pub enum Sink {
    Consumer(Consumer),
    /// Get topic of a confirmed publisher
    Confirmation(PublisherId),
}

/// Trailing-edge debounce of one handler.
///
/// Every held message restarts the window; only the last one is released.
pub struct Debounce {
    window: Duration,
    pending: Option<(String, Value)>,
    timer: Option<Key>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            timer: None,
        }
    }

    pub fn hold(&mut self, id: HandlerId, topic: String, value: Value, timers: &mut Timers) {
        self.pending = Some((topic, value));
        timers.arm(&mut self.timer, TimerKind::Debounce(id), self.window);
    }

    /// Called when the window elapsed.
    pub fn release(&mut self) -> Option<(String, Value)> {
        self.timer = None;
        self.pending.take()
    }
}

pub struct Handler {
    pub property: String,
    /// Subscribed topic, without any structured query
    pub topic: String,
    pub spec: TopicSpec,
    pub stages: Vec<Stage>,
    pub debounce: Option<Debounce>,
    pub sink: Sink,
}

/// Handlers indexed by exact topic and, with a codec loaded, by property
#[derive(Default)]
pub struct Registry {
    handlers: Vec<Handler>,
    topics: HashMap<String, Vec<HandlerId>>,
    properties: HashMap<String, Vec<HandlerId>>,
}

/// Outcome of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    pub id: HandlerId,
    /// First handler of its topic; the topic still needs a transport subscription
    pub new_topic: bool,
    /// First raw handler of its property
    pub new_property: bool,
}

impl Registry {
    pub fn register(&mut self, handler: Handler, index_property: bool) -> Registered {
        let id = self.handlers.len();

        let topic_handlers = self.topics.entry(handler.topic.clone()).or_default();
        let new_topic = topic_handlers.is_empty();
        topic_handlers.push(id);

        let mut new_property = false;
        if index_property {
            let raw = self.properties.entry(handler.property.clone()).or_default();
            new_property = raw.is_empty();
            raw.push(id);
        }

        self.handlers.push(handler);
        Registered {
            id,
            new_topic,
            new_property,
        }
    }

    /// Handlers of `topic` in registration order
    pub fn handlers_for(&self, topic: &str) -> Option<Vec<HandlerId>> {
        self.topics.get(topic).cloned()
    }

    /// Raw handlers of `property` in registration order
    pub fn raw_handlers(&self, property: &str) -> Vec<HandlerId> {
        self.properties.get(property).cloned().unwrap_or_default()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn handler(&self, id: HandlerId) -> Option<&Handler> {
        self.handlers.get(id)
    }

    pub fn handler_mut(&mut self, id: HandlerId) -> Option<&mut Handler> {
        self.handlers.get_mut(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(topic: &str, property: &str) -> Handler {
        Handler {
            property: property.to_string(),
            topic: topic.to_string(),
            spec: TopicSpec::plain(topic),
            stages: Vec::new(),
            debounce: None,
            sink: Sink::Consumer(Box::new(|_: &str, _: Value| {})),
        }
    }

    #[test]
    fn topics_are_indexed_once() {
        let mut registry = Registry::default();
        let first = registry.register(handler("lamp/state", "on"), false);
        let second = registry.register(handler("lamp/state", "brightness"), false);
        let third = registry.register(handler("lamp/hue", "hue"), false);

        assert!(first.new_topic);
        assert!(!second.new_topic);
        assert!(third.new_topic);
        assert_eq!(registry.handlers_for("lamp/state"), Some(vec![0, 1]));
        assert_eq!(registry.handlers_for("lamp/other"), None);
        assert_eq!(registry.topics().count(), 2);
        assert!(registry.raw_handlers("on").is_empty());
    }

    #[test]
    fn properties_are_indexed_only_when_requested() {
        let mut registry = Registry::default();
        let first = registry.register(handler("a", "on"), true);
        let second = registry.register(handler("b", "on"), true);
        let third = registry.register(handler("c", "hue"), false);

        assert!(first.new_property);
        assert!(!second.new_property);
        assert_eq!(registry.raw_handlers("on"), vec![0, 1]);
        assert!(registry.raw_handlers("hue").is_empty());
        assert_eq!(third.id, 2);
        assert_eq!(registry.handler(2).map(|h| h.property.as_str()), Some("hue"));
    }
}
