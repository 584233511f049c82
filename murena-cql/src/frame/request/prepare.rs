//! CQL protocol-level representation of a `PREPARE` request.

use crate::frame::frame_errors::ParseError;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

/// Prepares a single statement for later execution through EXECUTE.
pub struct Prepare<'a> {
    /// CQL statement string to prepare.
    pub query: &'a str,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(self.query, buf)?;
        Ok(())
    }
}

/// Owned counterpart of [Prepare], produced when replaying requests
/// on the server side in tests.
pub struct PrepareOwned {
    pub query: String,
}

impl DeserializableRequest for PrepareOwned {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let query = types::read_long_string(buf)?.to_owned();
        Ok(Self { query })
    }
}
