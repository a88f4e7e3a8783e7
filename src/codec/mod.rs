//! # Codecs
//!
//! A codec sits between the transform scripts and the wire. On the way in it
//! decodes what a topic delivered into property values, on the way out it encodes
//! a property value into what the device expects.
//!
//! ```text
//! codec/
//! ├── mod.rs       - Codec contract, registry and loading
//! ├── json.rs      - Built-in `json` codec (one JSON object per topic)
//! └── scripted.rs  - External codecs defined by a TOML file of transform scripts
//! ```
//!
//! Codecs can also talk back to the device through their [`CodecLink`]: publish
//! raw values to any topic, or notify every raw consumer of a property. Both are
//! queued and handled once the current message has been processed.

pub mod json;
pub mod scripted;

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn};

use crate::config::DeviceConfig;
use crate::device::DeviceEvent;
use crate::topic::TopicSpec;

const EXTERNAL_CODEC_EXTENSION: &str = ".toml";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown internal codec '{0}'")]
    UnknownCodec(String),

    #[error("Codec file [{}] does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("No codec functions defined in {}", .0.display())]
    NoFunctions(PathBuf),

    #[error("Invalid codec {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// Codec function: `(message, info, output) -> Option<message>`.
///
/// `output` hands additional values on: downstream consumers for `decode`, the
/// publish step for `encode`. A returned value is handed on as well.
pub type CodecFn = Box<dyn FnMut(Value, &CodecInfo<'_>, &mut dyn FnMut(Value)) -> Option<Value> + Send>;

/// Where a codec function is being applied
#[derive(Debug, Clone, Copy)]
pub struct CodecInfo<'a> {
    pub topic: &'a str,
    pub property: &'a str,
    /// The extended topic specification, if the topic was configured with one
    pub extended_topic: Option<&'a TopicSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encode,
    Decode,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Encode => write!(f, "encode"),
            Direction::Decode => write!(f, "decode"),
        }
    }
}

#[derive(Default)]
pub struct PropertyCodec {
    pub encode: Option<CodecFn>,
    pub decode: Option<CodecFn>,
}

impl PropertyCodec {
    fn get(&self, direction: Direction) -> Option<&CodecFn> {
        match direction {
            Direction::Encode => self.encode.as_ref(),
            Direction::Decode => self.decode.as_ref(),
        }
    }

    fn get_mut(&mut self, direction: Direction) -> Option<&mut CodecFn> {
        match direction {
            Direction::Encode => self.encode.as_mut(),
            Direction::Decode => self.decode.as_mut(),
        }
    }
}

/// An initialised codec: optional global functions plus per-property overrides
#[derive(Default)]
pub struct Codec {
    pub encode: Option<CodecFn>,
    pub decode: Option<CodecFn>,
    pub properties: HashMap<String, PropertyCodec>,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encode<F>(mut self, encode: F) -> Self
    where
        F: FnMut(Value, &CodecInfo<'_>, &mut dyn FnMut(Value)) -> Option<Value> + Send + 'static,
    {
        self.encode = Some(Box::new(encode));
        self
    }

    pub fn with_decode<F>(mut self, decode: F) -> Self
    where
        F: FnMut(Value, &CodecInfo<'_>, &mut dyn FnMut(Value)) -> Option<Value> + Send + 'static,
    {
        self.decode = Some(Box::new(decode));
        self
    }

    pub fn with_property(mut self, property: impl Into<String>, codec: PropertyCodec) -> Self {
        self.properties.insert(property.into(), codec);
        self
    }

    fn global_mut(&mut self, direction: Direction) -> Option<&mut CodecFn> {
        match direction {
            Direction::Encode => self.encode.as_mut(),
            Direction::Decode => self.decode.as_mut(),
        }
    }

    /// Property override if one is defined for `direction`, else the global function.
    pub fn function(&mut self, property: &str, direction: Direction) -> Option<&mut CodecFn> {
        let overridden = self
            .properties
            .get(property)
            .is_some_and(|p| p.get(direction).is_some());
        if overridden {
            self.properties
                .get_mut(property)
                .and_then(|p| p.get_mut(direction))
        } else {
            self.global_mut(direction)
        }
    }

    pub fn has_function(&self, property: &str, direction: Direction) -> bool {
        let global = match direction {
            Direction::Encode => self.encode.is_some(),
            Direction::Decode => self.decode.is_some(),
        };
        global
            || self
                .properties
                .get(property)
                .is_some_and(|p| p.get(direction).is_some())
    }
}

/// Handle through which a codec publishes and notifies outside a chain
#[derive(Clone)]
pub struct CodecLink {
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl CodecLink {
    pub(crate) fn new(events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self { events }
    }

    /// Publishes `value` on `topic`, bypassing scripts and codec encode.
    pub fn publish(&self, topic: impl Into<String>, value: Value) {
        let topic = topic.into();
        if self
            .events
            .send(DeviceEvent::RawPublish { topic, value })
            .is_err()
        {
            warn!("Codec publish dropped, device is stopped");
        }
    }

    /// Delivers `message` to every raw consumer registered for `property`.
    pub fn notify(&self, property: impl Into<String>, message: Value) {
        let property = property.into();
        if self
            .events
            .send(DeviceEvent::Notify { property, message })
            .is_err()
        {
            warn!("Codec notification dropped, device is stopped");
        }
    }
}

/// Everything a codec receives when it is initialised
pub struct CodecInit {
    pub span: tracing::Span,
    pub config: Arc<DeviceConfig>,
    pub link: CodecLink,
}

pub trait CodecFactory: Send + Sync {
    fn init(&self, init: CodecInit) -> Result<Codec, CodecError>;
}

impl<F> CodecFactory for F
where
    F: Fn(CodecInit) -> Result<Codec, CodecError> + Send + Sync,
{
    fn init(&self, init: CodecInit) -> Result<Codec, CodecError> {
        self(init)
    }
}

/// Internal codecs by name
#[derive(Clone, Default)]
pub struct CodecRegistry {
    factories: HashMap<String, Arc<dyn CodecFactory>>,
}

impl CodecRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register("json", json::init);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: impl CodecFactory + 'static) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CodecFactory>> {
        self.factories.get(name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecSource {
    Internal(String),
    External(PathBuf),
}

impl CodecSource {
    /// Absolute paths are external codec files; relative `.toml` paths are
    /// resolved against the data directory; anything else names an internal codec.
    pub fn resolve(codec: &str, data_dir: &Path) -> Self {
        let path = Path::new(codec);
        if path.is_absolute() {
            CodecSource::External(path.to_path_buf())
        } else if codec.ends_with(EXTERNAL_CODEC_EXTENSION) {
            CodecSource::External(data_dir.join(path))
        } else {
            CodecSource::Internal(codec.to_string())
        }
    }
}

impl fmt::Display for CodecSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecSource::Internal(name) => write!(f, "internal codec '{}'", name),
            CodecSource::External(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Loads the configured codec. Failures are logged and leave the device without one.
pub fn load(
    config: &Arc<DeviceConfig>,
    registry: &CodecRegistry,
    link: CodecLink,
) -> Option<Codec> {
    let name = config.codec.as_deref()?;
    let source = CodecSource::resolve(name, &config.data_dir());
    info!("Loading codec from {}", source);

    let init = CodecInit {
        span: info_span!("codec", name = %name),
        config: Arc::clone(config),
        link,
    };
    let loaded = match &source {
        CodecSource::Internal(internal) => registry
            .get(internal)
            .ok_or_else(|| CodecError::UnknownCodec(internal.clone()))
            .and_then(|factory| factory.init(init)),
        CodecSource::External(path) => scripted::load(path, init),
    };

    match loaded {
        Ok(codec) => {
            if codec.encode.is_none() {
                warn!("No codec encode() function");
            }
            if codec.decode.is_none() {
                warn!("No codec decode() function");
            }
            Some(codec)
        }
        Err(e) => {
            error!("ERROR: {}", e);
            None
        }
    }
}
