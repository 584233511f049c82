use std::sync::Arc;

use thiserror::Error;

use super::TryFromPrimitiveError;
use crate::value::SerializeValuesError;

/// An error which occurred when parsing or producing a whole frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is compressed, but no compression negotiated for connection")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame of unsupported version {0}")]
    VersionNotSupported(u8),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed")]
    FrameDecompression,
    #[error("Frame compression failed")]
    FrameCompression,
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error(transparent)]
    UnknownResponseOpcode(#[from] TryFromPrimitiveError<u8>),
}

/// An error which occurred when parsing a frame body or serializing
/// a request body.
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("Could not parse received data: {0}")]
    BadIncomingData(String),
    #[error("Could not serialize data to be sent: {0}")]
    BadDataToSerialize(String),
    #[error(transparent)]
    LowLevelDeserializationError(#[from] LowLevelDeserializationError),
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    SerializeValuesError(#[from] SerializeValuesError),
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        ParseError::IoError(Arc::new(err))
    }
}

impl From<std::num::TryFromIntError> for ParseError {
    fn from(err: std::num::TryFromIntError) -> Self {
        ParseError::BadDataToSerialize(format!("Integer conversion out of range: {}", err))
    }
}

impl From<std::str::Utf8Error> for ParseError {
    fn from(err: std::str::Utf8Error) -> Self {
        ParseError::LowLevelDeserializationError(err.into())
    }
}

/// A low level deserialization error - reading a primitive wire type
/// out of a buffer failed.
#[derive(Error, Debug, Clone)]
pub enum LowLevelDeserializationError {
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("UTF-8 deserialization failed: {0}")]
    UtfError(#[from] std::str::Utf8Error),
    #[error("Integer conversion out of range: {0}")]
    OutOfRangeIntegerConversion(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet length: {0}")]
    InvalidInetLength(u8),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(Arc::new(err))
    }
}
