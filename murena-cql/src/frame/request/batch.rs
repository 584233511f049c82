//! CQL protocol-level representation of a `BATCH` request.

use std::borrow::Cow;
use std::convert::TryInto;

use bytes::{Buf, BufMut};

use crate::frame::frame_errors::ParseError;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;
use crate::value::SerializedValues;

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;
const ALL_FLAGS: u8 = FLAG_WITH_SERIAL_CONSISTENCY | FLAG_WITH_DEFAULT_TIMESTAMP;

/// Executes a list of statements as a single round-trip.
#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct Batch<'b> {
    pub batch_type: BatchType,
    pub statements: Vec<BatchStatement<'b>>,
    /// One value list per statement.
    pub values: Vec<SerializedValues>,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    pub timestamp: Option<i64>,
}

/// The type of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchType {
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

impl TryFrom<u8> for BatchType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::Logged),
            1 => Ok(Self::Unlogged),
            2 => Ok(Self::Counter),
            _ => Err(ParseError::BadIncomingData(format!(
                "Bad BatchType value: {}",
                value
            ))),
        }
    }
}

/// One entry of a batch: raw CQL text or a prepared statement id.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum BatchStatement<'a> {
    Query { text: Cow<'a, str> },
    Prepared { id: Cow<'a, [u8]> },
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        if self.statements.len() != self.values.len() {
            return Err(ParseError::BadDataToSerialize(format!(
                "Length of provided values must be equal to number of batch statements \
                    (got {} values, {} statements)",
                self.values.len(),
                self.statements.len()
            )));
        }

        buf.put_u8(self.batch_type as u8);

        types::write_short(self.statements.len().try_into()?, buf);
        for (statement, values) in self.statements.iter().zip(self.values.iter()) {
            statement.serialize(buf)?;
            values.write_to_request(buf);
        }

        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

impl BatchStatement<'_> {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        match self {
            Self::Query { text } => {
                buf.put_u8(0);
                types::write_long_string(text, buf)?;
            }
            Self::Prepared { id } => {
                buf.put_u8(1);
                types::write_short_bytes(id, buf)?;
            }
        }

        Ok(())
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        match buf.get_u8() {
            0 => {
                let text = Cow::Owned(types::read_long_string(buf)?.to_owned());
                Ok(Self::Query { text })
            }
            1 => {
                let id = types::read_short_bytes(buf)?.to_vec().into();
                Ok(Self::Prepared { id })
            }
            kind => Err(ParseError::BadIncomingData(format!(
                "Unexpected batch statement kind: {}",
                kind
            ))),
        }
    }
}

impl DeserializableRequest for Batch<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let batch_type = buf.get_u8().try_into()?;

        let statements_count = types::read_short(buf)?.into();
        let mut statements = Vec::with_capacity(statements_count);
        let mut values = Vec::with_capacity(statements_count);
        for _ in 0..statements_count {
            statements.push(BatchStatement::deserialize(buf)?);
            values.push(SerializedValues::new_from_frame(buf, false)?);
        }

        let consistency = types::read_consistency(buf)?;

        let flags = buf.get_u8();
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(ParseError::BadIncomingData(format!(
                "Specified flags are not recognised: {:02x}",
                unknown_flags
            )));
        }
        let serial_consistency = ((flags & FLAG_WITH_SERIAL_CONSISTENCY) != 0)
            .then(|| {
                let raw = types::read_short(buf)? as i16;
                types::SerialConsistency::try_from(raw).map_err(|_| {
                    ParseError::BadIncomingData(format!(
                        "Expected SerialConsistency, got: {}",
                        raw
                    ))
                })
            })
            .transpose()?;
        let timestamp = ((flags & FLAG_WITH_DEFAULT_TIMESTAMP) != 0)
            .then(|| types::read_long(buf))
            .transpose()?;

        Ok(Self {
            batch_type,
            statements,
            values,
            consistency,
            serial_consistency,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::{Batch, BatchStatement, BatchType};
    use crate::frame::request::{DeserializableRequest, SerializableRequest};
    use crate::frame::types::Consistency;
    use crate::value::{CqlValue, SerializedValues};

    #[test]
    fn batch_roundtrip() {
        let mut first_values = SerializedValues::new();
        first_values
            .add_value(Some(&CqlValue::Text("a".to_owned())))
            .unwrap();

        let batch = Batch {
            batch_type: BatchType::Logged,
            statements: vec![
                BatchStatement::Query {
                    text: Cow::Borrowed("INSERT INTO t (a) VALUES (?)"),
                },
                BatchStatement::Prepared {
                    id: Cow::Borrowed(&[0xca, 0xfe]),
                },
            ],
            values: vec![first_values, SerializedValues::new()],
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: Some(42),
        };

        let mut buf = Vec::new();
        batch.serialize(&mut buf).unwrap();
        let deserialized = Batch::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(deserialized, batch);
    }

    #[test]
    fn value_count_mismatch_is_rejected() {
        let batch = Batch {
            batch_type: BatchType::Unlogged,
            statements: vec![BatchStatement::Query {
                text: Cow::Borrowed("INSERT INTO t (a) VALUES (1)"),
            }],
            values: vec![],
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: None,
        };

        let mut buf = Vec::new();
        assert!(batch.serialize(&mut buf).is_err());
    }
}
