//! External codecs written as transform scripts.
//!
//! ```toml
//! decode = "return JSON.parse(message).POWER == 'ON';"
//! encode = "return message ? 'ON' : 'OFF';"
//!
//! [properties.brightness]
//! decode = "return JSON.parse(message).Dimmer;"
//! encode = "return 'Dimmer ' + message;"
//! ```
//!
//! Codec scripts get their own per-property `state`, separate from the state of
//! topic `apply` scripts. `emit(value)` hands a value to the codec output: a
//! decode script delivers it downstream as an extra message, an encode script
//! publishes it on the property's set topic.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::{Codec, CodecError, CodecFn, CodecInfo, CodecInit, Direction, PropertyCodec};
use crate::script::{ApplyStateStore, TransformScript};

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct ScriptPair {
    encode: Option<String>,
    decode: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct CodecFile {
    encode: Option<String>,
    decode: Option<String>,
    #[serde(default)]
    properties: HashMap<String, ScriptPair>,
}

impl CodecFile {
    fn is_empty(&self) -> bool {
        self.encode.is_none()
            && self.decode.is_none()
            && self
                .properties
                .values()
                .all(|p| p.encode.is_none() && p.decode.is_none())
    }
}

type SharedState = Arc<Mutex<ApplyStateStore>>;

fn compile(
    path: &Path,
    name: &str,
    direction: Direction,
    source: Option<&String>,
    state: &SharedState,
) -> Result<Option<CodecFn>, CodecError> {
    let Some(source) = source else {
        return Ok(None);
    };
    let script = TransformScript::compile(source).map_err(|e| CodecError::Invalid {
        path: path.to_path_buf(),
        reason: format!("{} {}(): {}", name, direction, e),
    })?;
    let state = Arc::clone(state);

    Ok(Some(Box::new(move |message: Value, info: &CodecInfo<'_>, output: &mut dyn FnMut(Value)| {
        let mut store = state.lock().unwrap_or_else(|poisoned| {
            warn!("Codec state lock was poisoned, recovering");
            poisoned.into_inner()
        });
        match script.run_with_output(message, store.state_for(info.property), output) {
            Ok(result) => result.filter(|value| !value.is_null()),
            Err(e) => {
                warn!(
                    "Codec {}() failed for {} on topic {}: {}",
                    direction, info.property, info.topic, e
                );
                None
            }
        }
    })))
}

pub fn load(path: &Path, init: CodecInit) -> Result<Codec, CodecError> {
    let _entered = init.span.enter();
    if !path.exists() {
        return Err(CodecError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|e| CodecError::Invalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let file: CodecFile = toml::from_str(&content).map_err(|e| CodecError::Invalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if file.is_empty() {
        return Err(CodecError::NoFunctions(path.to_path_buf()));
    }

    let state: SharedState = Arc::default();
    let mut codec = Codec::new();
    codec.encode = compile(path, "codec", Direction::Encode, file.encode.as_ref(), &state)?;
    codec.decode = compile(path, "codec", Direction::Decode, file.decode.as_ref(), &state)?;

    for (property, pair) in &file.properties {
        debug!("Codec overrides functions of property {}", property);
        codec.properties.insert(
            property.clone(),
            PropertyCodec {
                encode: compile(path, property, Direction::Encode, pair.encode.as_ref(), &state)?,
                decode: compile(path, property, Direction::Decode, pair.decode.as_ref(), &state)?,
            },
        );
    }

    Ok(codec)
}
