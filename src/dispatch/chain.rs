//! Decode chain of one handler.
//!
//! Stages run in order: structured query extraction, codec decode, `apply`
//! script. Each stage turns one value into zero or more values; a chain whose
//! stage produced nothing stops there.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecInfo, Direction};
use crate::error::{LinkError, LinkResult};
use crate::mqtt::message_manager::stringify;
use crate::script::{ApplyStateStore, TransformScript};
use crate::topic::TopicSpec;

/// JSONPath query validated at registration
#[derive(Debug, Clone)]
pub struct JsonQuery {
    query: String,
}

impl JsonQuery {
    pub fn compile(query: &str) -> LinkResult<Self> {
        jsonpath_lib::select(&Value::Null, query).map_err(|e| LinkError::Query {
            query: query.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            query: query.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.query
    }

    /// First match of the query in `body`.
    pub fn first_match(&self, body: &Value) -> LinkResult<Option<Value>> {
        let matches = jsonpath_lib::select(body, &self.query).map_err(|e| LinkError::Query {
            query: self.query.clone(),
            reason: e.to_string(),
        })?;
        Ok(matches.first().map(|value| (*value).clone()))
    }
}

#[derive(Debug, Clone)]
pub enum Stage {
    Extract(JsonQuery),
    Decode,
    Apply(TransformScript),
}

/// Shared device state a chain may touch
pub struct ChainEnv<'a> {
    pub codec: Option<&'a mut Codec>,
    pub apply_state: &'a mut ApplyStateStore,
    pub log_mqtt: bool,
}

/// Identity of the handler running the chain
pub struct ChainTarget<'a> {
    pub topic: &'a str,
    pub property: &'a str,
    pub spec: &'a TopicSpec,
}

impl Stage {
    fn run(&self, value: Value, target: &ChainTarget<'_>, env: &mut ChainEnv<'_>, out: &mut Vec<Value>) {
        match self {
            Stage::Extract(query) => extract(query, value, target, env.log_mqtt, out),
            Stage::Decode => decode(value, target, env, out),
            Stage::Apply(script) => apply(script, value, target, env, out),
        }
    }
}

fn extract(query: &JsonQuery, value: Value, target: &ChainTarget<'_>, log_mqtt: bool, out: &mut Vec<Value>) {
    let body = match value {
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    "Message on {} is not JSON, cannot apply {}: {}",
                    target.topic,
                    query.as_str(),
                    e
                );
                return;
            }
        },
        other => other,
    };

    match query.first_match(&body) {
        Ok(Some(found)) => {
            if log_mqtt {
                info!("jsonpath {} decoded message to [{}]", query.as_str(), stringify(&found));
            }
            out.push(found);
        }
        Ok(None) => debug!("jsonpath {} matched nothing on {}", query.as_str(), target.topic),
        Err(e) => warn!("{}", e),
    }
}

fn decode(value: Value, target: &ChainTarget<'_>, env: &mut ChainEnv<'_>, out: &mut Vec<Value>) {
    let Some(decode) = env
        .codec
        .as_deref_mut()
        .and_then(|codec| codec.function(target.property, Direction::Decode))
    else {
        out.push(value);
        return;
    };

    let info = CodecInfo {
        topic: target.topic,
        property: target.property,
        extended_topic: target.spec.is_extended().then_some(target.spec),
    };
    let decoded = decode(value, &info, &mut |emitted: Value| out.push(emitted));
    if env.log_mqtt {
        info!(
            "codec decoded message to [{}]",
            decoded.as_ref().map(stringify).unwrap_or_default()
        );
    }
    if let Some(decoded) = decoded {
        out.push(decoded);
    }
}

fn apply(script: &TransformScript, value: Value, target: &ChainTarget<'_>, env: &mut ChainEnv<'_>, out: &mut Vec<Value>) {
    let message = stringify(&value);
    match script.run(value, env.apply_state.state_for(target.property)) {
        Ok(Some(decoded)) if !decoded.is_null() => {
            if env.log_mqtt {
                info!("apply() function decoded message to [{}]", stringify(&decoded));
            }
            out.push(decoded);
        }
        Ok(_) => debug!("apply() function suppressed message on {}", target.topic),
        Err(e) => warn!(
            "Decode function apply(message) {{ {} }} failed for topic {} with message {} - {}",
            script.source(),
            target.topic,
            message,
            e
        ),
    }
}

/// Runs `input` through `stages`, returning the values that reach the consumer.
pub fn run(stages: &[Stage], input: Value, target: &ChainTarget<'_>, env: &mut ChainEnv<'_>) -> Vec<Value> {
    let mut values = vec![input];
    for stage in stages {
        let mut next = Vec::with_capacity(values.len());
        for value in values {
            stage.run(value, target, env, &mut next);
        }
        if next.is_empty() {
            return next;
        }
        values = next;
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(spec: &TopicSpec) -> ChainTarget<'_> {
        ChainTarget {
            topic: "sensors/data",
            property: "temperature",
            spec,
        }
    }

    #[test]
    fn rejects_invalid_queries_at_registration() {
        assert!(JsonQuery::compile("$.temperature.value").is_ok());
        assert!(matches!(
            JsonQuery::compile("$.temperature["),
            Err(LinkError::Query { .. })
        ));
    }

    #[test]
    fn extracts_first_match_and_drops_misses() {
        let spec = TopicSpec::plain("sensors/data$.temperature.value");
        let stages = [Stage::Extract(JsonQuery::compile("$.temperature.value").unwrap())];
        let mut state = ApplyStateStore::default();
        let mut env = ChainEnv {
            codec: None,
            apply_state: &mut state,
            log_mqtt: false,
        };

        let hit = run(&stages, json!(r#"{"temperature":{"value":21.5}}"#), &target(&spec), &mut env);
        assert_eq!(hit, vec![json!(21.5)]);

        let miss = run(&stages, json!(r#"{"humidity":40}"#), &target(&spec), &mut env);
        assert!(miss.is_empty());

        let not_json = run(&stages, json!("21.5 C"), &target(&spec), &mut env);
        assert!(not_json.is_empty());
    }

    #[test]
    fn codec_emits_extra_values_before_its_result() {
        let spec = TopicSpec::plain("sensors/data");
        let mut codec = Codec::new().with_decode(|value, _, emit| {
            emit(json!("first"));
            Some(value)
        });
        let mut state = ApplyStateStore::default();
        let mut env = ChainEnv {
            codec: Some(&mut codec),
            apply_state: &mut state,
            log_mqtt: true,
        };
        let out = run(&[Stage::Decode], json!("second"), &target(&spec), &mut env);
        assert_eq!(out, vec![json!("first"), json!("second")]);
    }

    #[test]
    fn apply_runs_after_decode_and_can_suppress() {
        let spec = TopicSpec::with_apply("sensors/data", "if (message < 0) { return; } return message * 2;").unwrap();
        let script = spec.apply().unwrap().clone();
        let mut codec = Codec::new().with_decode(|value, _, _| value.as_str().and_then(|s| s.parse::<f64>().ok()).map(|n| json!(n)));
        let mut state = ApplyStateStore::default();
        let mut env = ChainEnv {
            codec: Some(&mut codec),
            apply_state: &mut state,
            log_mqtt: false,
        };
        let stages = [Stage::Decode, Stage::Apply(script)];

        assert_eq!(run(&stages, json!("4"), &target(&spec), &mut env), vec![json!(8)]);
        assert!(run(&stages, json!("-1"), &target(&spec), &mut env).is_empty());
        assert!(run(&stages, json!("n/a"), &target(&spec), &mut env).is_empty());
    }
}
