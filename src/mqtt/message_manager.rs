//! Inbound message records and helpers for the dynamic values that travel
//! through handler chains.
//!
//! Payloads enter a chain as [`Value::String`] and may be turned into any JSON
//! value by scripts or codecs. Before they reach the wire they are flattened
//! back to text with [`stringify`].

use chrono::NaiveDateTime;
use serde_json::Value;
use std::fmt;

/// Raw message as received from the broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MQTTMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} = {}", self.topic, self.content)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: String, payload: &[u8]) -> Self {
        MQTTMessage {
            topic,
            content: String::from_utf8_lossy(payload).into_owned(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Value handed to the first stage of every handler chain
    pub fn value(&self) -> Value {
        Value::String(self.content.clone())
    }
}

/// Text form of a value as it is published on the wire.
///
/// Strings are sent verbatim, every other value as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Equality used when matching confirmations: typed equality first, then the
/// string forms of both sides.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    a == b || stringify(a) == stringify(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stringify_keeps_strings_verbatim() {
        assert_eq!(stringify(&json!("on")), "on");
        assert_eq!(stringify(&json!(21.5)), "21.5");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn loose_equality_compares_string_forms() {
        assert!(loosely_equal(&json!(1), &json!("1")));
        assert!(loosely_equal(&json!(true), &json!("true")));
        assert!(loosely_equal(&json!("ON"), &json!("ON")));
        assert!(!loosely_equal(&json!(1), &json!("1.0")));
    }

    #[test]
    fn message_payload_is_lossy_utf8() {
        let msg = MQTTMessage::from_topic("a/b".into(), &[0x68, 0x69, 0xff]);
        assert_eq!(msg.content, "hi\u{fffd}");
        assert_eq!(msg.value(), json!("hi\u{fffd}"));
    }
}
