//! # thinglink
//!
//! Binds the properties of a smart-home device to MQTT topics.
//!
//! Inbound messages are routed by topic through per-handler decode chains
//! (structured query, codec, transform script, debounce) to property consumers.
//! Outbound values go through the transform script and codec before they are
//! published, optionally skipping repeats and waiting for the device to confirm
//! the new state.
//!
//! ```text
//! src/
//! ├── codec/     - Codec contract, built-in and script-defined codecs
//! ├── device/    - Device context, lifecycle and event loop
//! ├── dispatch/  - Handler registry and decode chains
//! ├── mqtt/      - Transport trait, rumqttc client and connection options
//! ├── script/    - Transform script language
//! ├── config.rs  - Device configuration
//! ├── confirm.rs - Confirmed publishing
//! ├── error.rs   - Error types
//! └── topic.rs   - Topic specifications
//! ```

pub mod codec;
pub mod config;
pub mod confirm;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod mqtt;
pub mod script;
pub mod topic;

pub use codec::{Codec, CodecRegistry};
pub use config::DeviceConfig;
pub use confirm::Publisher;
pub use device::{Device, DeviceHandle};
pub use error::{LinkError, LinkResult};
pub use topic::TopicSpec;
