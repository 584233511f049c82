//! CQL protocol-level representation of an `EXECUTE` request.

use bytes::Bytes;

use crate::frame::frame_errors::ParseError;
use crate::frame::request::{
    query::QueryParameters, DeserializableRequest, RequestOpcode, SerializableRequest,
};
use crate::frame::types;

/// Executes a single prepared statement.
#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct Execute<'a> {
    /// ID of the prepared statement to execute.
    pub id: Bytes,

    /// Various parameters controlling the execution of the statement.
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_short_bytes(&self.id[..], buf)?;
        self.parameters.serialize(buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let id = types::read_short_bytes(buf)?.to_vec().into();
        let parameters = QueryParameters::deserialize(buf)?;

        Ok(Self { id, parameters })
    }
}
