//! Topic specifications as they appear in device configuration.
//!
//! A topic is either a plain string or a table carrying an `apply` transform:
//!
//! ```toml
//! getOn = "living/lamp/state"
//! setOn = { topic = "living/lamp/set", apply = "return message ? 'ON' : 'OFF';" }
//! ```
//!
//! A plain topic may embed a structured query after a `$` marker
//! (`sensors/data$.temperature.value`); the part before the marker is the topic
//! that is actually subscribed.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LinkError, LinkResult};
use crate::script::TransformScript;

/// Marker that starts a structured query inside a topic string
pub const QUERY_MARKER: char = '$';

/// Topic string with an optional transform script
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTopicSpec", into = "RawTopicSpec")]
pub enum TopicSpec {
    Plain(String),
    Extended { topic: String, apply: TransformScript },
}

impl TopicSpec {
    pub fn plain(topic: impl Into<String>) -> Self {
        TopicSpec::Plain(topic.into())
    }

    /// Topic with a transform compiled from `source`
    pub fn with_apply(topic: impl Into<String>, source: &str) -> LinkResult<Self> {
        Ok(TopicSpec::Extended {
            topic: topic.into(),
            apply: TransformScript::compile(source)?,
        })
    }

    /// Full topic string, including any structured query
    pub fn topic(&self) -> &str {
        match self {
            TopicSpec::Plain(topic) => topic,
            TopicSpec::Extended { topic, .. } => topic,
        }
    }

    pub fn apply(&self) -> Option<&TransformScript> {
        match self {
            TopicSpec::Plain(_) => None,
            TopicSpec::Extended { apply, .. } => Some(apply),
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, TopicSpec::Extended { .. })
    }

    /// Splits the topic into its subscription part and structured query.
    pub fn resolve(&self) -> ResolvedTopic<'_> {
        split_structured_query(self.topic())
    }
}

impl fmt::Display for TopicSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

impl From<&str> for TopicSpec {
    fn from(topic: &str) -> Self {
        TopicSpec::Plain(topic.to_string())
    }
}

impl From<String> for TopicSpec {
    fn from(topic: String) -> Self {
        TopicSpec::Plain(topic)
    }
}

/// Topic split at the structured query marker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedTopic<'a> {
    pub topic: &'a str,
    pub query: Option<&'a str>,
}

/// A marker at position 0 is part of the topic itself, not a query.
pub fn split_structured_query(topic: &str) -> ResolvedTopic<'_> {
    match topic.find(QUERY_MARKER) {
        Some(index) if index > 0 => ResolvedTopic {
            topic: &topic[..index],
            query: Some(&topic[index..]),
        },
        _ => ResolvedTopic { topic, query: None },
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawTopicSpec {
    Plain(String),
    Extended {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        apply: Option<String>,
    },
}

impl TryFrom<RawTopicSpec> for TopicSpec {
    type Error = LinkError;

    fn try_from(raw: RawTopicSpec) -> Result<Self, Self::Error> {
        match raw {
            RawTopicSpec::Plain(topic) => Ok(TopicSpec::Plain(topic)),
            RawTopicSpec::Extended { topic, apply: None } => Ok(TopicSpec::Plain(topic)),
            RawTopicSpec::Extended {
                topic,
                apply: Some(source),
            } => TopicSpec::with_apply(topic, &source),
        }
    }
}

impl From<TopicSpec> for RawTopicSpec {
    fn from(spec: TopicSpec) -> Self {
        match spec {
            TopicSpec::Plain(topic) => RawTopicSpec::Plain(topic),
            TopicSpec::Extended { topic, apply } => RawTopicSpec::Extended {
                topic,
                apply: Some(apply.source().to_string()),
            },
        }
    }
}
