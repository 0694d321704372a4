//! Error types for mup1-coreconf

use thiserror::Error;

/// Result type alias for mup1-coreconf operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mup1-coreconf operations
#[derive(Error, Debug)]
pub enum Error {
    /// CoAP frame could not be parsed or serialized
    #[error("CoAP error: {0}")]
    Coap(String),

    /// MUP1 frame could not be built
    #[error("MUP1 framing error: {0}")]
    Mup1(String),

    /// Carrier URI is malformed or the endpoint cannot be opened
    #[error("Carrier error: {0}")]
    Carrier(String),

    /// Request terminated without a success response
    #[error("Request failed: {0}")]
    Request(String),

    /// Failed to load or parse a SID file
    #[error("SID file error: {0}")]
    SidFile(String),

    /// Invalid or unresolvable YANG schema input
    #[error("Schema error: {0}")]
    Schema(String),

    /// Conversion error between JSON and CBOR forms
    #[error("Codec error: {0}")]
    Codec(String),

    /// Malformed instance-identifier string or CBOR form
    #[error("Instance-identifier error: {0}")]
    InstanceId(String),

    /// Unknown YANG identity
    #[error("Unknown YANG identity: {0}")]
    UnknownIdentity(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
