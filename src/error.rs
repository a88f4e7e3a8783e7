//! Error definitions shared across the crate

use thiserror::Error;

use crate::codec::CodecError;
use crate::mqtt::TransportError;
use crate::script::ScriptError;

/// Top-level error type for device setup and wiring
#[derive(Debug, Error)]
pub enum LinkError {
    /// Invalid or incomplete device configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Codec could not be resolved or initialised
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transform script failed to compile
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// Transport rejected a request
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// Structured query embedded in a topic is invalid
    #[error("Invalid structured query '{query}': {reason}")]
    Query { query: String, reason: String },

    /// Device runtime is no longer reachable
    #[error("Channel error: {0}")]
    Channel(String),
}

pub type LinkResult<T> = Result<T, LinkError>;
