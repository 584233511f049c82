//! The `CqlValue` cell model and serialization of bound values.

use std::net::IpAddr;

use bytes::BufMut;
use thiserror::Error;
use uuid::Uuid;

use crate::frame::frame_errors::ParseError;
use crate::frame::types::{self, RawValue};

/// A single, owned CQL cell value.
///
/// NULL cells are represented as `Option::None` at the cell position,
/// never as any default value of this enum.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(i64),
    /// Days since -5877641-06-23, shifted so that the epoch is 2^31.
    Date(u32),
    Decimal {
        int_val: Vec<u8>,
        scale: i32,
    },
    Double(f64),
    Duration {
        months: i32,
        days: i32,
        nanoseconds: i64,
    },
    /// A value of length 0, allowed by the protocol for any fixed-size type.
    Empty,
    Float(f32),
    Int(i32),
    BigInt(i64),
    Text(String),
    /// Milliseconds since the UNIX epoch.
    Timestamp(i64),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        /// Order of fields vector must match the order of fields as defined in the UDT.
        fields: Vec<(String, Option<CqlValue>)>,
    },
    SmallInt(i16),
    TinyInt(i8),
    /// Nanoseconds since midnight.
    Time(i64),
    Timeuuid(Uuid),
    Tuple(Vec<Option<CqlValue>>),
    Uuid(Uuid),
    Varint(Vec<u8>),
}

impl CqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Vec<u8>> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) | Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[CqlValue]> {
        match self {
            Self::List(l) | Self::Set(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(CqlValue, CqlValue)]> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Serializes this value in the `[bytes]` form: length-prefixed contents.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializeValuesError> {
        let len_pos = buf.len();
        types::write_int(0, buf);
        self.serialize_contents(buf)?;

        let written = buf.len() - len_pos - 4;
        let written: i32 = written
            .try_into()
            .map_err(|_| SerializeValuesError::ValueTooBig(written))?;
        buf[len_pos..len_pos + 4].copy_from_slice(&written.to_be_bytes());
        Ok(())
    }

    fn serialize_contents(&self, buf: &mut Vec<u8>) -> Result<(), SerializeValuesError> {
        match self {
            Self::Ascii(s) | Self::Text(s) => buf.put_slice(s.as_bytes()),
            Self::Boolean(b) => buf.put_u8(*b as u8),
            Self::Blob(b) => buf.put_slice(b),
            Self::Counter(c) => buf.put_i64(*c),
            Self::Date(d) => buf.put_u32(*d),
            Self::Decimal { int_val, scale } => {
                buf.put_i32(*scale);
                buf.put_slice(int_val);
            }
            Self::Double(d) => buf.put_f64(*d),
            Self::Duration {
                months,
                days,
                nanoseconds,
            } => {
                types::vint_encode(*months as i64, buf);
                types::vint_encode(*days as i64, buf);
                types::vint_encode(*nanoseconds, buf);
            }
            Self::Empty => {}
            Self::Float(f) => buf.put_f32(*f),
            Self::Int(i) => buf.put_i32(*i),
            Self::BigInt(i) => buf.put_i64(*i),
            Self::Timestamp(t) => buf.put_i64(*t),
            Self::Inet(IpAddr::V4(v4)) => buf.put_slice(&v4.octets()),
            Self::Inet(IpAddr::V6(v6)) => buf.put_slice(&v6.octets()),
            Self::List(elems) | Self::Set(elems) => {
                write_collection_length(elems.len(), buf)?;
                for elem in elems {
                    elem.serialize(buf)?;
                }
            }
            Self::Map(entries) => {
                write_collection_length(entries.len(), buf)?;
                for (key, value) in entries {
                    key.serialize(buf)?;
                    value.serialize(buf)?;
                }
            }
            Self::UserDefinedType { fields, .. } => {
                for (_, field_value) in fields {
                    serialize_opt(field_value.as_ref(), buf)?;
                }
            }
            Self::SmallInt(i) => buf.put_i16(*i),
            Self::TinyInt(i) => buf.put_i8(*i),
            Self::Time(t) => buf.put_i64(*t),
            Self::Timeuuid(u) | Self::Uuid(u) => buf.put_slice(u.as_bytes()),
            Self::Tuple(elems) => {
                for elem in elems {
                    serialize_opt(elem.as_ref(), buf)?;
                }
            }
            Self::Varint(v) => buf.put_slice(v),
        }
        Ok(())
    }
}

fn serialize_opt(
    value: Option<&CqlValue>,
    buf: &mut Vec<u8>,
) -> Result<(), SerializeValuesError> {
    match value {
        Some(value) => value.serialize(buf),
        None => {
            types::write_int(-1, buf);
            Ok(())
        }
    }
}

fn write_collection_length(len: usize, buf: &mut Vec<u8>) -> Result<(), SerializeValuesError> {
    let len: i32 = len
        .try_into()
        .map_err(|_| SerializeValuesError::ValueTooBig(len))?;
    types::write_int(len, buf);
    Ok(())
}

/// An error which occurred when building a value list for a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializeValuesError {
    #[error("Too many values to add, max 65535 values can be sent in a request")]
    TooManyValues,
    #[error("Mixing named and not named values is not allowed")]
    MixingNamedAndNotNamedValues,
    #[error("Value is too big to be sent in a request: {0} bytes")]
    ValueTooBig(usize),
}

/// Bound values of a request, in wire form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    values_num: u16,
    contains_names: bool,
}

impl SerializedValues {
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    pub const fn new() -> Self {
        SerializedValues {
            serialized_values: Vec::new(),
            values_num: 0,
            contains_names: false,
        }
    }

    pub fn add_value(&mut self, val: Option<&CqlValue>) -> Result<(), SerializeValuesError> {
        if self.contains_names {
            return Err(SerializeValuesError::MixingNamedAndNotNamedValues);
        }
        if self.values_num == u16::MAX {
            return Err(SerializeValuesError::TooManyValues);
        }

        serialize_opt(val, &mut self.serialized_values)?;
        self.values_num += 1;
        Ok(())
    }

    pub fn add_named_value(
        &mut self,
        name: &str,
        val: Option<&CqlValue>,
    ) -> Result<(), SerializeValuesError> {
        if self.values_num > 0 && !self.contains_names {
            return Err(SerializeValuesError::MixingNamedAndNotNamedValues);
        }
        if self.values_num == u16::MAX {
            return Err(SerializeValuesError::TooManyValues);
        }
        self.contains_names = true;

        types::write_string(name, &mut self.serialized_values)
            .map_err(|_| SerializeValuesError::ValueTooBig(name.len()))?;
        serialize_opt(val, &mut self.serialized_values)?;
        self.values_num += 1;
        Ok(())
    }

    pub fn has_names(&self) -> bool {
        self.contains_names
    }

    pub fn len(&self) -> u16 {
        self.values_num
    }

    pub fn is_empty(&self) -> bool {
        self.values_num == 0
    }

    /// Writes the value list in request format: a short count followed
    /// by the values.
    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        types::write_short(self.values_num, buf);
        buf.put_slice(&self.serialized_values);
    }

    /// Iterates over positional values. Must not be called on a named list.
    pub fn iter(&self) -> impl Iterator<Item = RawValue<'_>> {
        SerializedValuesIterator {
            serialized_values: &self.serialized_values,
            contains_names: self.contains_names,
        }
        .map(|(_, value)| value)
    }

    /// Iterates over (name, value) pairs; names are present only for
    /// named lists.
    pub fn iter_name_value_pairs(
        &self,
    ) -> impl Iterator<Item = (Option<&str>, RawValue<'_>)> {
        SerializedValuesIterator {
            serialized_values: &self.serialized_values,
            contains_names: self.contains_names,
        }
    }

    /// Reads a value list back from a request body.
    pub fn new_from_frame(buf: &mut &[u8], contains_names: bool) -> Result<Self, ParseError> {
        let values_num = types::read_short(buf)?;
        let values_beg = *buf;
        for _ in 0..values_num {
            if contains_names {
                let _name = types::read_string(buf)?;
            }
            let _serialized = types::read_value(buf)?;
        }

        let values_len_in_buf = values_beg.len() - buf.len();
        let values_in_frame = &values_beg[0..values_len_in_buf];
        Ok(SerializedValues {
            serialized_values: values_in_frame.to_vec(),
            values_num,
            contains_names,
        })
    }
}

struct SerializedValuesIterator<'a> {
    serialized_values: &'a [u8],
    contains_names: bool,
}

impl<'a> Iterator for SerializedValuesIterator<'a> {
    type Item = (Option<&'a str>, RawValue<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.serialized_values.is_empty() {
            return None;
        }

        let name = if self.contains_names {
            Some(types::read_string(&mut self.serialized_values).ok()?)
        } else {
            None
        };
        let value = types::read_value(&mut self.serialized_values).ok()?;

        Some((name, value))
    }
}

/// Values supplied by the caller for a single statement, before they are
/// turned into wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValues {
    Positional(Vec<Option<CqlValue>>),
    Named(Vec<(String, Option<CqlValue>)>),
}

impl QueryValues {
    pub fn empty() -> Self {
        QueryValues::Positional(Vec::new())
    }

    pub fn len(&self) -> usize {
        match self {
            QueryValues::Positional(v) => v.len(),
            QueryValues::Named(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_serialized(&self) -> Result<SerializedValues, SerializeValuesError> {
        let mut serialized = SerializedValues::new();
        match self {
            QueryValues::Positional(values) => {
                for value in values {
                    serialized.add_value(value.as_ref())?;
                }
            }
            QueryValues::Named(values) => {
                for (name, value) in values {
                    serialized.add_named_value(name, value.as_ref())?;
                }
            }
        }
        Ok(serialized)
    }
}

impl From<()> for QueryValues {
    fn from(_: ()) -> Self {
        QueryValues::empty()
    }
}

impl From<Vec<CqlValue>> for QueryValues {
    fn from(values: Vec<CqlValue>) -> Self {
        QueryValues::Positional(values.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<CqlValue>>> for QueryValues {
    fn from(values: Vec<Option<CqlValue>>) -> Self {
        QueryValues::Positional(values)
    }
}

impl From<Vec<(String, Option<CqlValue>)>> for QueryValues {
    fn from(values: Vec<(String, Option<CqlValue>)>) -> Self {
        QueryValues::Named(values)
    }
}

/// A single row of cells, aligned with the result's column specs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::response::result::{deser_cql_value, ColumnType};

    // Serializes the value, then reads it back through the result-side
    // deserializer.
    fn roundtrip(value: &CqlValue, typ: &ColumnType) -> CqlValue {
        let mut buf = Vec::new();
        value.serialize(&mut buf).unwrap();
        let mut slice = &buf[..];
        let raw = types::read_bytes_opt(&mut slice).unwrap().unwrap();
        deser_cql_value(typ, &mut &raw[..]).unwrap()
    }

    #[test]
    fn cell_roundtrips() {
        let cases: &[(CqlValue, ColumnType)] = &[
            (CqlValue::Text("hello".to_owned()), ColumnType::Text),
            (CqlValue::Boolean(true), ColumnType::Boolean),
            (CqlValue::Blob(vec![1, 2, 3]), ColumnType::Blob),
            (CqlValue::Timestamp(1_700_000_000_000), ColumnType::Timestamp),
            (
                CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2)]),
                ColumnType::List(Box::new(ColumnType::Int)),
            ),
            (
                CqlValue::Set(vec![CqlValue::Text("a".to_owned())]),
                ColumnType::Set(Box::new(ColumnType::Text)),
            ),
            (
                CqlValue::Map(vec![(
                    CqlValue::Text("k".to_owned()),
                    CqlValue::BigInt(-5),
                )]),
                ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::BigInt)),
            ),
            (
                CqlValue::Duration {
                    months: 1,
                    days: -2,
                    nanoseconds: 3,
                },
                ColumnType::Duration,
            ),
            (
                CqlValue::Inet("127.0.0.1".parse().unwrap()),
                ColumnType::Inet,
            ),
        ];

        for (value, typ) in cases {
            assert_eq!(&roundtrip(value, typ), value);
        }
    }

    #[test]
    fn null_value_is_serialized_as_negative_length() {
        let mut values = SerializedValues::new();
        values.add_value(None).unwrap();
        values.add_value(Some(&CqlValue::Int(3))).unwrap();

        let collected: Vec<_> = values.iter().collect();
        assert_eq!(
            collected,
            vec![RawValue::Null, RawValue::Value(&3_i32.to_be_bytes())]
        );
    }

    #[test]
    fn mixing_named_and_positional_is_rejected() {
        let mut values = SerializedValues::new();
        values.add_value(Some(&CqlValue::Int(3))).unwrap();
        assert_eq!(
            values.add_named_value("a", Some(&CqlValue::Int(4))),
            Err(SerializeValuesError::MixingNamedAndNotNamedValues)
        );

        let mut named = SerializedValues::new();
        named.add_named_value("a", Some(&CqlValue::Int(4))).unwrap();
        assert_eq!(
            named.add_value(Some(&CqlValue::Int(3))),
            Err(SerializeValuesError::MixingNamedAndNotNamedValues)
        );
    }

    #[test]
    fn named_values_iterate_with_names() {
        let mut values = SerializedValues::new();
        values
            .add_named_value("a", Some(&CqlValue::Int(1)))
            .unwrap();
        values.add_named_value("b", None).unwrap();

        let collected: Vec<_> = values.iter_name_value_pairs().collect();
        assert_eq!(
            collected,
            vec![
                (Some("a"), RawValue::Value(&1_i32.to_be_bytes())),
                (Some("b"), RawValue::Null),
            ]
        );
    }

    #[test]
    fn serialized_values_frame_roundtrip() {
        let mut values = SerializedValues::new();
        values.add_value(Some(&CqlValue::Int(1))).unwrap();
        values.add_value(None).unwrap();

        let mut buf = Vec::new();
        values.write_to_request(&mut buf);
        let read_back = SerializedValues::new_from_frame(&mut &buf[..], false).unwrap();
        assert_eq!(read_back, values);
    }
}
