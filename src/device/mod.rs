//! # Device Runtime
//!
//! One device owns one broker connection, its dispatch registry, codec, caches,
//! script state, timers and confirmed publishers. All of it lives in a
//! [`Context`] that only the device task touches.
//!
//! ```text
//! device/
//! ├── context.rs  - Per-device state: subscribe, publish, notify, dispatch
//! ├── engine.rs   - Lifecycle state machine and event loop
//! ├── handle.rs   - Events and the cloneable handle used by other tasks
//! └── timers.rs   - Debounce and confirmation timers
//! ```
//!
//! ## Event flow
//!
//! ```text
//! MQTT poller ──► DeviceEvent ──┐
//! DeviceHandle ─► DeviceEvent ──┼──► device task ──► Context ──► Transport
//! CodecLink ────► DeviceEvent ──┘        ▲
//!                                    Timers
//! ```

mod context;
mod engine;
mod handle;
pub mod timers;

pub use context::{Context, TrafficStatus};
pub use engine::{Device, DeviceState, Running, Stopped, Wiring};
pub use handle::{DeviceEvent, DeviceHandle};
