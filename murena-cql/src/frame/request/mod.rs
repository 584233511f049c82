//! CQL requests sent by the client.

pub mod batch;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod startup;

pub use batch::Batch;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use startup::Startup;

use bytes::Bytes;

use super::frame_errors::ParseError;
use super::TryFromPrimitiveError;

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Batch = 0x0D,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0D => Ok(Self::Batch),
            _ => Err(TryFromPrimitiveError::new("RequestOpcode", value)),
        }
    }
}

/// A request which knows how to serialize its own body.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError>;

    fn to_bytes(&self) -> Result<Bytes, ParseError> {
        let mut v = Vec::new();
        self.serialize(&mut v)?;
        Ok(v.into())
    }
}

/// Inverse of [SerializableRequest]. Used by test doubles which play
/// the server side of the protocol.
pub trait DeserializableRequest: Sized {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError>;
}
