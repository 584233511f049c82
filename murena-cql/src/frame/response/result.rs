//! Deserialization of RESULT responses: result kinds, column types,
//! rows/prepared metadata and row contents.

use bytes::{Buf, Bytes};

use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use crate::value::{CqlValue, Row};

use std::result::Result as StdResult;

/// Keyspace and table a result's columns come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

/// CQL type of a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        type_name: String,
        keyspace: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

/// Specification of a single result or bind-marker column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

/// Metadata attached to a Rows result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub col_specs: Vec<ColumnSpec>,
}

/// Metadata of the bind markers of a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub col_count: usize,
    /// Indexes of the bind markers forming the partition key,
    /// in partition-key order.
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

/// A page of rows, together with its metadata.
#[derive(Debug)]
pub struct Rows {
    pub metadata: ResultMetadata,
    /// Token to resume from, present when the server has more pages.
    pub paging_state: Option<Bytes>,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug)]
pub struct SchemaChange {
    pub change_type: String,
    pub target: String,
    pub keyspace: String,
    pub name: Option<String>,
    pub arguments: Option<Vec<String>>,
}

/// A deserialized RESULT response.
#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => Custom(types::read_string(buf)?.to_owned()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace = types::read_string(buf)?.to_owned();
            let type_name = types::read_string(buf)?.to_owned();
            let fields_size: usize = types::read_short(buf)?.into();

            let mut field_types = Vec::with_capacity(fields_size);
            for _ in 0..fields_size {
                let field_name = types::read_string(buf)?.to_owned();
                let field_type = deser_type(buf)?;
                field_types.push((field_name, field_type));
            }

            UserDefinedType {
                type_name,
                keyspace,
                field_types,
            }
        }
        0x0031 => {
            let len: usize = types::read_short(buf)?.into();
            let mut types_v = Vec::with_capacity(len);
            for _ in 0..len {
                types_v.push(deser_type(buf)?);
            }
            Tuple(types_v)
        }
        id => {
            return Err(ParseError::BadIncomingData(format!(
                "Could not deserialize ColumnType - id {} is not implemented",
                id
            )));
        }
    })
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();

    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(
    buf: &mut &[u8],
) -> StdResult<(ResultMetadata, Option<Bytes>), ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;
    let has_more_pages = flags & 0x0002 != 0;
    let no_metadata = flags & 0x0004 != 0;

    let col_count = types::read_int_length(buf)?;

    let paging_state = has_more_pages
        .then(|| types::read_bytes(buf).map(Bytes::copy_from_slice))
        .transpose()?;

    let col_specs = if no_metadata {
        vec![]
    } else {
        let global_table_spec = global_tables_spec
            .then(|| deser_table_spec(buf))
            .transpose()?;

        deser_col_specs(buf, &global_table_spec, col_count)?
    };

    let metadata = ResultMetadata {
        col_count,
        col_specs,
    };
    Ok((metadata, paging_state))
}

fn deser_prepared_metadata(buf: &mut &[u8]) -> StdResult<PreparedMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;

    let col_count = types::read_int_length(buf)?;

    let pk_count = types::read_int_length(buf)?;

    let mut pk_indexes = Vec::with_capacity(pk_count);
    for _ in 0..pk_count {
        pk_indexes.push(types::read_short(buf)?);
    }

    let global_table_spec = global_tables_spec
        .then(|| deser_table_spec(buf))
        .transpose()?;

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn ensure_exact_length(
    typ: &'static str,
    expected: usize,
    buf: &[u8],
) -> StdResult<(), ParseError> {
    if buf.len() != expected {
        return Err(ParseError::BadIncomingData(format!(
            "Buffer length should be {} for {}, got {}",
            expected,
            typ,
            buf.len()
        )));
    }
    Ok(())
}

/// Deserializes a single cell of the given type.
///
/// `buf` must contain exactly the cell contents.
pub fn deser_cql_value(typ: &ColumnType, buf: &mut &[u8]) -> StdResult<CqlValue, ParseError> {
    use ColumnType::*;

    if buf.is_empty() {
        match typ {
            Ascii | Blob | Text => {
                // can't be empty
            }
            _ => return Ok(CqlValue::Empty),
        }
    }

    Ok(match typ {
        Custom(type_str) => {
            return Err(ParseError::BadIncomingData(format!(
                "Support for custom types is not yet implemented: {}",
                type_str
            )));
        }
        Ascii => {
            let s = std::str::from_utf8(buf)?;
            if !s.is_ascii() {
                return Err(ParseError::BadIncomingData(
                    "Got a non-ASCII string for an ASCII column".to_owned(),
                ));
            }
            CqlValue::Ascii(s.to_owned())
        }
        Boolean => {
            ensure_exact_length("boolean", 1, buf)?;
            CqlValue::Boolean(buf[0] != 0)
        }
        Blob => CqlValue::Blob(buf.to_vec()),
        Date => {
            ensure_exact_length("date", 4, buf)?;
            CqlValue::Date(buf.get_u32())
        }
        Counter => {
            ensure_exact_length("counter", 8, buf)?;
            CqlValue::Counter(buf.get_i64())
        }
        Decimal => {
            let scale = types::read_int(buf)?;
            CqlValue::Decimal {
                scale,
                int_val: buf.to_vec(),
            }
        }
        Double => {
            ensure_exact_length("double", 8, buf)?;
            CqlValue::Double(buf.get_f64())
        }
        Float => {
            ensure_exact_length("float", 4, buf)?;
            CqlValue::Float(buf.get_f32())
        }
        Int => {
            ensure_exact_length("int", 4, buf)?;
            CqlValue::Int(buf.get_i32())
        }
        SmallInt => {
            ensure_exact_length("smallint", 2, buf)?;
            CqlValue::SmallInt(buf.get_i16())
        }
        TinyInt => {
            ensure_exact_length("tinyint", 1, buf)?;
            CqlValue::TinyInt(buf.get_i8())
        }
        BigInt => {
            ensure_exact_length("bigint", 8, buf)?;
            CqlValue::BigInt(buf.get_i64())
        }
        Text => CqlValue::Text(std::str::from_utf8(buf)?.to_owned()),
        Timestamp => {
            ensure_exact_length("timestamp", 8, buf)?;
            CqlValue::Timestamp(buf.get_i64())
        }
        Time => {
            ensure_exact_length("time", 8, buf)?;
            CqlValue::Time(buf.get_i64())
        }
        Timeuuid => {
            ensure_exact_length("timeuuid", 16, buf)?;
            CqlValue::Timeuuid(types::read_uuid(buf)?)
        }
        Uuid => {
            ensure_exact_length("uuid", 16, buf)?;
            CqlValue::Uuid(types::read_uuid(buf)?)
        }
        Duration => {
            let months = types::vint_decode(buf)?.try_into()?;
            let days = types::vint_decode(buf)?.try_into()?;
            let nanoseconds = types::vint_decode(buf)?;
            CqlValue::Duration {
                months,
                days,
                nanoseconds,
            }
        }
        Inet => CqlValue::Inet(match buf.len() {
            4 => {
                let addr: [u8; 4] = (&**buf).try_into().unwrap();
                std::net::IpAddr::from(addr)
            }
            16 => {
                let addr: [u8; 16] = (&**buf).try_into().unwrap();
                std::net::IpAddr::from(addr)
            }
            len => {
                return Err(ParseError::BadIncomingData(format!(
                    "Invalid inet cell length: {}",
                    len
                )));
            }
        }),
        Varint => CqlValue::Varint(buf.to_vec()),
        List(elem_type) => CqlValue::List(deser_collection(elem_type, buf)?),
        Set(elem_type) => CqlValue::Set(deser_collection(elem_type, buf)?),
        Map(key_type, value_type) => {
            let count = types::read_int_length(buf)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = deser_collection_element(key_type, buf)?;
                let value = deser_collection_element(value_type, buf)?;
                entries.push((key, value));
            }
            CqlValue::Map(entries)
        }
        Tuple(elem_types) => {
            let mut elems = Vec::with_capacity(elem_types.len());
            for elem_type in elem_types {
                let raw = types::read_bytes_opt(buf)?;
                let elem = raw
                    .map(|mut raw| deser_cql_value(elem_type, &mut raw))
                    .transpose()?;
                elems.push(elem);
            }
            CqlValue::Tuple(elems)
        }
        UserDefinedType {
            type_name,
            keyspace,
            field_types,
        } => {
            let mut fields = Vec::with_capacity(field_types.len());
            for (field_name, field_type) in field_types {
                // A UDT value may have fewer fields than its type;
                // missing trailing fields read as nulls.
                if buf.is_empty() {
                    fields.push((field_name.clone(), None));
                    continue;
                }
                let raw = types::read_bytes_opt(buf)?;
                let field_value = raw
                    .map(|mut raw| deser_cql_value(field_type, &mut raw))
                    .transpose()?;
                fields.push((field_name.clone(), field_value));
            }
            CqlValue::UserDefinedType {
                keyspace: keyspace.clone(),
                type_name: type_name.clone(),
                fields,
            }
        }
    })
}

fn deser_collection(
    elem_type: &ColumnType,
    buf: &mut &[u8],
) -> StdResult<Vec<CqlValue>, ParseError> {
    let count = types::read_int_length(buf)?;
    let mut elems = Vec::with_capacity(count);
    for _ in 0..count {
        elems.push(deser_collection_element(elem_type, buf)?);
    }
    Ok(elems)
}

fn deser_collection_element(
    elem_type: &ColumnType,
    buf: &mut &[u8],
) -> StdResult<CqlValue, ParseError> {
    let mut raw = types::read_bytes_opt(buf)?.ok_or_else(|| {
        ParseError::BadIncomingData("Null element inside a collection".to_owned())
    })?;
    deser_cql_value(elem_type, &mut raw)
}

fn deser_rows(buf: &mut &[u8]) -> StdResult<Rows, ParseError> {
    let (metadata, paging_state) = deser_result_metadata(buf)?;

    if metadata.col_count != metadata.col_specs.len() {
        return Err(ParseError::BadIncomingData(format!(
            "The server claimed {} columns, but the metadata describes {}",
            metadata.col_count,
            metadata.col_specs.len()
        )));
    }

    let rows_count = types::read_int_length(buf)?;

    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for spec in &metadata.col_specs {
            let raw = types::read_bytes_opt(buf)?;
            let value = raw
                .map(|mut raw| deser_cql_value(&spec.typ, &mut raw))
                .transpose()?;
            columns.push(value);
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata,
        paging_state,
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(buf: &mut &[u8]) -> StdResult<Prepared, ParseError> {
    let id = Bytes::from(types::read_short_bytes(buf)?.to_owned());
    let prepared_metadata = deser_prepared_metadata(buf)?;
    let (result_metadata, paging_state) = deser_result_metadata(buf)?;

    if paging_state.is_some() {
        return Err(ParseError::BadIncomingData(
            "A Prepared result unexpectedly carries a paging state".to_owned(),
        ));
    }

    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> StdResult<SchemaChange, ParseError> {
    let change_type = types::read_string(buf)?.to_owned();
    let target = types::read_string(buf)?.to_owned();
    let keyspace = types::read_string(buf)?.to_owned();

    let name = match target.as_str() {
        "KEYSPACE" => None,
        _ => Some(types::read_string(buf)?.to_owned()),
    };
    let arguments = match target.as_str() {
        "FUNCTION" | "AGGREGATE" => Some(types::read_string_list(buf)?),
        _ => None,
    };

    Ok(SchemaChange {
        change_type,
        target,
        keyspace,
        name,
        arguments,
    })
}

/// Deserializes a RESULT response body.
pub fn deserialize(buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf)?),
        0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Prepared(deser_prepared(buf)?),
        0x0005 => SchemaChange(deser_schema_change(buf)?),
        id => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown query result id: {}",
                id
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types;
    use uuid::Uuid;

    #[test]
    fn deserialize_text_types() {
        let buf: Vec<u8> = vec![0x41];
        let int_slice = &mut &buf[..];
        let ascii_serialized = deser_cql_value(&ColumnType::Ascii, int_slice).unwrap();
        let text_serialized = deser_cql_value(&ColumnType::Text, int_slice).unwrap();
        assert_eq!(ascii_serialized, CqlValue::Ascii("A".to_string()));
        assert_eq!(text_serialized, CqlValue::Text("A".to_string()));
    }

    #[test]
    fn deserialize_uuid() {
        let my_uuid = Uuid::parse_str("f3b4958c-52a1-11e7-802a-010203040506").unwrap();
        let buf: Vec<u8> = my_uuid.as_bytes().to_vec();
        let uuid_serialized = deser_cql_value(&ColumnType::Uuid, &mut &buf[..]).unwrap();
        assert_eq!(uuid_serialized, CqlValue::Uuid(my_uuid));
    }

    #[test]
    fn deserialize_list_of_ints() {
        // [1, 2]
        let mut buf: Vec<u8> = Vec::new();
        types::write_int(2, &mut buf);
        types::write_bytes(&2_i32.to_be_bytes(), &mut buf).unwrap();
        types::write_bytes(&4_i32.to_be_bytes(), &mut buf).unwrap();

        let list = deser_cql_value(&ColumnType::List(Box::new(ColumnType::Int)), &mut &buf[..])
            .unwrap();
        assert_eq!(
            list,
            CqlValue::List(vec![CqlValue::Int(2), CqlValue::Int(4)])
        );
    }

    #[test]
    fn deserialize_map_of_text_to_bigint() {
        let mut buf: Vec<u8> = Vec::new();
        types::write_int(1, &mut buf);
        types::write_bytes(b"key", &mut buf).unwrap();
        types::write_bytes(&10_i64.to_be_bytes(), &mut buf).unwrap();

        let map = deser_cql_value(
            &ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::BigInt)),
            &mut &buf[..],
        )
        .unwrap();
        assert_eq!(
            map,
            CqlValue::Map(vec![(
                CqlValue::Text("key".to_owned()),
                CqlValue::BigInt(10)
            )])
        );
    }

    #[test]
    fn empty_cell_of_nontext_type_is_empty_value() {
        let empty: &[u8] = &[];
        assert_eq!(
            deser_cql_value(&ColumnType::Int, &mut &*empty).unwrap(),
            CqlValue::Empty
        );
        assert_eq!(
            deser_cql_value(&ColumnType::Text, &mut &*empty).unwrap(),
            CqlValue::Text(String::new())
        );
    }

    #[test]
    fn deserialize_rows_with_global_table_spec() {
        let mut body: Vec<u8> = Vec::new();
        // kind: Rows
        types::write_int(0x0002, &mut body);
        // metadata: flags = global_tables_spec
        types::write_int(0x0001, &mut body);
        // col_count = 2
        types::write_int(2, &mut body);
        // global table spec
        types::write_string("ks", &mut body).unwrap();
        types::write_string("t", &mut body).unwrap();
        // col specs: a int, b text
        types::write_string("a", &mut body).unwrap();
        types::write_short(0x0009, &mut body);
        types::write_string("b", &mut body).unwrap();
        types::write_short(0x000D, &mut body);
        // rows_count = 2
        types::write_int(2, &mut body);
        // row 1: (7, "abc"), row 2: (NULL, "d")
        types::write_bytes(&7_i32.to_be_bytes(), &mut body).unwrap();
        types::write_bytes(b"abc", &mut body).unwrap();
        types::write_int(-1, &mut body);
        types::write_bytes(b"d", &mut body).unwrap();

        let result = deserialize(&mut &body[..]).unwrap();
        let rows = match result {
            Result::Rows(rows) => rows,
            other => panic!("Expected Rows, got {:?}", other),
        };

        assert_eq!(rows.rows_count, 2);
        assert!(rows.paging_state.is_none());
        assert_eq!(rows.metadata.col_specs.len(), 2);
        assert_eq!(rows.metadata.col_specs[0].name, "a");
        assert_eq!(rows.metadata.col_specs[0].typ, ColumnType::Int);
        assert_eq!(rows.metadata.col_specs[0].table_spec.ks_name, "ks");
        assert_eq!(
            rows.rows[0].columns,
            vec![
                Some(CqlValue::Int(7)),
                Some(CqlValue::Text("abc".to_owned()))
            ]
        );
        assert_eq!(
            rows.rows[1].columns,
            vec![None, Some(CqlValue::Text("d".to_owned()))]
        );
    }

    #[test]
    fn deserialize_prepared_with_pk_indexes() {
        let mut body: Vec<u8> = Vec::new();
        // kind: Prepared
        types::write_int(0x0004, &mut body);
        types::write_short_bytes(b"\x01\x02", &mut body).unwrap();
        // prepared metadata: flags = global_tables_spec, 2 columns, 1 pk index
        types::write_int(0x0001, &mut body);
        types::write_int(2, &mut body);
        types::write_int(1, &mut body);
        types::write_short(1, &mut body);
        types::write_string("ks", &mut body).unwrap();
        types::write_string("t", &mut body).unwrap();
        types::write_string("v", &mut body).unwrap();
        types::write_short(0x000D, &mut body);
        types::write_string("pk", &mut body).unwrap();
        types::write_short(0x0009, &mut body);
        // result metadata: no columns
        types::write_int(0, &mut body);
        types::write_int(0, &mut body);

        let result = deserialize(&mut &body[..]).unwrap();
        let prepared = match result {
            Result::Prepared(p) => p,
            other => panic!("Expected Prepared, got {:?}", other),
        };

        assert_eq!(prepared.id.as_ref(), b"\x01\x02");
        assert_eq!(prepared.prepared_metadata.pk_indexes, vec![1]);
        assert_eq!(prepared.prepared_metadata.col_specs[1].name, "pk");
    }
}
