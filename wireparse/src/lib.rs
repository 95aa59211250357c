//! Table-driven binary protocol parser.
//!
//! A protocol is described as an ordered list of field definitions (offset,
//! length, kind, endianness); the engine applies a definition to a byte
//! buffer and produces typed field values with validation outcomes, timing
//! and per-protocol statistics. Ships with definitions for the common
//! L2-L4 protocols plus DNS and HTTP head fields.

pub mod builtins;
pub mod engine;
pub mod field;
pub mod registry;
pub mod result;

pub use engine::{ParserConfig, ParserStats, ProtocolParser};
pub use field::{
    Endianness, FieldConstraint, FieldData, FieldDefinition, FieldKind, FieldValue,
    ProtocolDefinition,
};
pub use registry::ProtocolRegistry;
pub use result::{ParseResult, ParseStatus, ValidationOutcome};

/// Errors raised by the registry and format round-trips.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol {0} is already registered")]
    DuplicateProtocol(String),

    #[error("protocol {0} is not registered")]
    UnknownProtocol(String),

    #[error("malformed {format} document: {reason}")]
    Format { format: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
