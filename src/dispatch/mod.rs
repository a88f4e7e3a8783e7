//! # Dispatch
//!
//! Inbound messages are routed by exact topic to the handlers registered for it.
//! Each handler owns a decode chain and ends in a consumer:
//!
//! ```text
//! message ──► [jsonpath] ──► [codec decode] ──► [apply] ──► [debounce] ──► consumer
//!                                                                   ▲
//!              notify(property) ─────────────────────────────────────┘ (raw, no chain)
//! ```
//!
//! ```text
//! dispatch/
//! ├── chain.rs     - Decode stages and the structured query
//! └── registry.rs  - Handler storage, topic and property indexes, debounce
//! ```
//!
//! Registration never subscribes twice to the same topic: the first handler
//! of a topic triggers the transport subscription, later ones only fan out.

pub mod chain;
pub mod registry;

pub use chain::{JsonQuery, Stage};
pub use registry::{Consumer, Debounce, Handler, HandlerId, Registered, Registry, Sink};

/// Topic on which `notify` delivers to the raw consumers of `property`
pub fn notification_topic(property: &str) -> String {
    format!("_prop-{}", property)
}
