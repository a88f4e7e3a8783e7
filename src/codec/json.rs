//! Built-in `json` codec: each topic carries one JSON object and every property
//! is one of its fields.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::{Codec, CodecError, CodecInfo, CodecInit};

fn field<'a>(fields: &'a HashMap<String, String>, property: &'a str) -> &'a str {
    fields.get(property).map(String::as_str).unwrap_or(property)
}

fn decode(fields: &HashMap<String, String>, message: Value, info: &CodecInfo<'_>) -> Option<Value> {
    let body = match message {
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(body) => body,
            Err(e) => {
                warn!("json codec: message on {} is not JSON: {}", info.topic, e);
                return None;
            }
        },
        other => other,
    };
    match body {
        Value::Object(mut object) => object
            .remove(field(fields, info.property))
            .filter(|value| !value.is_null()),
        _ => {
            warn!("json codec: message on {} is not a JSON object", info.topic);
            None
        }
    }
}

fn encode(fields: &HashMap<String, String>, message: Value, info: &CodecInfo<'_>) -> Value {
    let mut object = Map::new();
    object.insert(field(fields, info.property).to_string(), message);
    Value::Object(object)
}

pub fn init(init: CodecInit) -> Result<Codec, CodecError> {
    let _entered = init.span.enter();
    let fields = Arc::new(init.config.json_codec.fields.clone());
    let decode_fields = Arc::clone(&fields);

    Ok(Codec::new()
        .with_decode(move |message, info, _| decode(&decode_fields, message, info))
        .with_encode(move |message, info, _| Some(encode(&fields, message, info))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecLink, Direction};
    use crate::config::{DeviceConfig, JsonCodecConfig};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn codec(fields: &[(&str, &str)]) -> Codec {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = DeviceConfig {
            json_codec: JsonCodecConfig {
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            ..DeviceConfig::default()
        };
        init(CodecInit {
            span: tracing::Span::none(),
            config: Arc::new(config),
            link: CodecLink::new(tx),
        })
        .unwrap()
    }

    fn run(codec: &mut Codec, direction: Direction, property: &str, message: Value) -> Option<Value> {
        let info = CodecInfo {
            topic: "lamp/state",
            property,
            extended_topic: None,
        };
        codec.function(property, direction).unwrap()(message, &info, &mut |_: Value| {})
    }

    #[test]
    fn decodes_field_named_after_property() {
        let mut codec = codec(&[]);
        let body = json!(r#"{"on":true,"brightness":40}"#);
        assert_eq!(run(&mut codec, Direction::Decode, "on", body.clone()), Some(json!(true)));
        assert_eq!(run(&mut codec, Direction::Decode, "brightness", body.clone()), Some(json!(40)));
        assert_eq!(run(&mut codec, Direction::Decode, "hue", body), None);
    }

    #[test]
    fn remapped_fields_and_invalid_bodies() {
        let mut codec = codec(&[("on", "POWER")]);
        assert_eq!(
            run(&mut codec, Direction::Decode, "on", json!(r#"{"POWER":"ON"}"#)),
            Some(json!("ON"))
        );
        assert_eq!(run(&mut codec, Direction::Decode, "on", json!("ON")), None);
        assert_eq!(run(&mut codec, Direction::Decode, "on", json!("[1,2]")), None);
        assert_eq!(
            run(&mut codec, Direction::Encode, "on", json!("OFF")),
            Some(json!({"POWER": "OFF"}))
        );
    }
}
