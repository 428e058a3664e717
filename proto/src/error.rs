// Copyright (c) 2022-2023 The MobileCoin Foundation

/// Protocol error type, covering schema, codec and framing failures
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// Message name is not defined in the loaded schemas
    #[error("Unknown message '{0}'")]
    SchemaNotFound(String),

    /// Received buffer does not match the schema or header layout
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Field value could not be encoded per its schema
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// Continuation frame received before a header frame
    #[error("Continuation frame for '{0}' without a preceding header")]
    UnexpectedContinuation(String),

    /// Outbound buffer or frame size cannot be framed
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Schema bundle could not be parsed or resolved
    #[error("Invalid schema bundle: {0}")]
    InvalidSchema(String),
}

impl Error {
    /// Helper to build [Error::InvalidField] errors
    pub(crate) fn field(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::MalformedMessage(e.to_string())
    }
}
