//! Row record encoding
//!
//! A record area is laid out as
//!
//! ```text
//! [reserved:i32]
//! [cellType:i32][cellOffset:i32]   one entry per column
//! [payload][payload]...            concatenated cell payloads
//! ```
//!
//! Cell type 1 is an inline value: `[isNull:u8]` followed by the column
//! type's codec. Cell type 2 is a large-object reference:
//! `[refKind:i32][reserved:i32][objectId:i64]` with refKind 0 = present,
//! 1 = null. Offsets are relative to the start of the payload section.

use crate::error::{MonoError, MonoResult};
use crate::storage::{BlobId, BlobStore};
use crate::table::info::{DataType, TableInfo};
use crate::table::value::Value;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Datelike, NaiveDate};
use smallvec::SmallVec;

pub const CELL_INLINE: i32 = 1;
pub const CELL_LARGE_OBJECT: i32 = 2;

const REF_PRESENT: i32 = 0;
const REF_NULL: i32 = 1;

const RECORD_RESERVED_SIZE: usize = 4;
const CELL_ENTRY_SIZE: usize = 8;
const LARGE_OBJECT_PAYLOAD_SIZE: usize = 16;

/// Size of the fixed part of a record for a table with `columns` columns
pub fn header_size(columns: usize) -> usize {
    RECORD_RESERVED_SIZE + columns * CELL_ENTRY_SIZE
}

/// A cell as stored, before any large object is resolved
#[derive(Debug, Clone, PartialEq)]
pub enum StoredCell {
    Inline(Value),
    LargeObject(Option<BlobId>),
}

/// Encoded record plus the large objects it created
pub struct EncodedRecord {
    pub bytes: Vec<u8>,
    pub blobs: Vec<BlobId>,
}

/// Encode a row. Text and binary payloads larger than `threshold` are moved
/// to the blob store; on error any object already created is released.
pub fn encode_record(
    info: &TableInfo,
    row: &[Value],
    blobs: &BlobStore,
    threshold: usize,
) -> MonoResult<EncodedRecord> {
    if row.len() != info.column_count() {
        return Err(MonoError::InvalidInput(format!(
            "Row has {} values but table '{}' has {} columns",
            row.len(),
            info.name,
            info.column_count()
        )));
    }

    let mut created = Vec::new();
    match encode_cells(info, row, blobs, threshold, &mut created) {
        Ok(bytes) => Ok(EncodedRecord {
            bytes,
            blobs: created,
        }),
        Err(e) => {
            for id in created {
                if let Err(release_err) = blobs.release_object(id) {
                    tracing::warn!("Failed to release large object {}: {}", id.0, release_err);
                }
            }
            Err(e)
        }
    }
}

fn encode_cells(
    info: &TableInfo,
    row: &[Value],
    blobs: &BlobStore,
    threshold: usize,
    created: &mut Vec<BlobId>,
) -> MonoResult<Vec<u8>> {
    let mut entries: SmallVec<[(i32, i32); 16]> = SmallVec::new();
    let mut payload = BytesMut::new();

    for (column, value) in info.columns.iter().zip(row) {
        let offset = payload.len() as i32;
        let mut inline = BytesMut::new();
        write_inline(&mut inline, &column.data_type, value)?;

        if column.data_type.is_large_object_capable() && !value.is_null() && inline.len() > threshold
        {
            let raw = match value {
                Value::Text(s) => s.as_bytes(),
                Value::Binary(b) => b.as_slice(),
                _ => {
                    return Err(MonoError::InvalidInput(format!(
                        "Column '{}' cannot hold a large object",
                        column.name
                    )));
                }
            };
            let id = blobs.create_object(raw)?;
            created.push(id);
            payload.put_i32_le(REF_PRESENT);
            payload.put_i32_le(0);
            payload.put_i64_le(id.0);
            entries.push((CELL_LARGE_OBJECT, offset));
        } else {
            payload.extend_from_slice(&inline);
            entries.push((CELL_INLINE, offset));
        }
    }

    let mut record = BytesMut::with_capacity(header_size(entries.len()) + payload.len());
    record.put_i32_le(0);
    for (cell_type, offset) in &entries {
        record.put_i32_le(*cell_type);
        record.put_i32_le(*offset);
    }
    record.extend_from_slice(&payload);
    Ok(record.to_vec())
}

/// Cell table of a record: `(cellType, offset)` per column
pub fn decode_cell_table(header: &[u8], columns: usize) -> MonoResult<SmallVec<[(i32, usize); 16]>> {
    if header.len() < header_size(columns) {
        return Err(MonoError::Consistency(
            "Record is shorter than its cell table".into(),
        ));
    }
    let mut buf = &header[RECORD_RESERVED_SIZE..header_size(columns)];
    let mut entries = SmallVec::new();
    for _ in 0..columns {
        let cell_type = buf.get_i32_le();
        let offset = buf.get_i32_le();
        if offset < 0 {
            return Err(MonoError::Consistency("Negative cell offset".into()));
        }
        entries.push((cell_type, offset as usize));
    }
    Ok(entries)
}

/// Byte range of one cell's payload, relative to the start of the record
pub fn cell_range(
    entries: &[(i32, usize)],
    column: usize,
    record_len: usize,
) -> MonoResult<(i32, usize, usize)> {
    let base = header_size(entries.len());
    let (cell_type, offset) = entries[column];
    let end = match entries.get(column + 1) {
        Some((_, next)) => base + *next,
        None => record_len,
    };
    let start = base + offset;
    if start > end || end > record_len {
        return Err(MonoError::Consistency(format!(
            "Cell {} lies outside its record",
            column
        )));
    }
    Ok((cell_type, start, end))
}

/// Decode one cell payload
pub fn decode_cell(cell_type: i32, data_type: &DataType, payload: &[u8]) -> MonoResult<StoredCell> {
    match cell_type {
        CELL_INLINE => Ok(StoredCell::Inline(read_inline(payload, data_type)?)),
        CELL_LARGE_OBJECT => {
            if payload.len() < LARGE_OBJECT_PAYLOAD_SIZE {
                return Err(MonoError::Consistency(
                    "Truncated large object reference".into(),
                ));
            }
            let mut buf = payload;
            let kind = buf.get_i32_le();
            let _reserved = buf.get_i32_le();
            let id = buf.get_i64_le();
            match kind {
                REF_PRESENT => Ok(StoredCell::LargeObject(Some(BlobId(id)))),
                REF_NULL => Ok(StoredCell::LargeObject(None)),
                other => Err(MonoError::Consistency(format!(
                    "Unknown large object reference kind {}",
                    other
                ))),
            }
        }
        other => Err(MonoError::Consistency(format!("Unknown cell type {}", other))),
    }
}

/// Rebuild a value of `data_type` from large-object bytes
pub fn value_from_object(data_type: &DataType, bytes: Vec<u8>) -> MonoResult<Value> {
    match data_type {
        DataType::Text | DataType::Varchar(_) => String::from_utf8(bytes)
            .map(Value::Text)
            .map_err(|e| MonoError::Consistency(format!("Invalid UTF-8 in large object: {}", e))),
        DataType::Blob | DataType::Varbinary(_) => Ok(Value::Binary(bytes)),
        other => Err(MonoError::Consistency(format!(
            "{:?} columns cannot reference large objects",
            other
        ))),
    }
}

/// Every large object referenced by a record
pub fn record_blob_refs(info: &TableInfo, record: &[u8]) -> MonoResult<Vec<BlobId>> {
    let entries = decode_cell_table(record, info.column_count())?;
    let mut refs = Vec::new();
    for (column, (cell_type, _)) in entries.iter().enumerate() {
        if *cell_type != CELL_LARGE_OBJECT {
            continue;
        }
        let (_, start, end) = cell_range(&entries, column, record.len())?;
        if let StoredCell::LargeObject(Some(id)) =
            decode_cell(*cell_type, &info.columns[column].data_type, &record[start..end])?
        {
            refs.push(id);
        }
    }
    Ok(refs)
}

fn write_inline(buf: &mut BytesMut, data_type: &DataType, value: &Value) -> MonoResult<()> {
    if value.is_null() {
        buf.put_u8(1);
        return Ok(());
    }
    buf.put_u8(0);

    match (data_type, value) {
        (DataType::Boolean, Value::Boolean(b)) => buf.put_u8(*b as u8),
        (DataType::SmallInt, Value::Integer(i)) => {
            buf.put_i16_le(i16::try_from(*i).map_err(|_| out_of_range(*i, data_type))?)
        }
        (DataType::Integer, Value::Integer(i)) => {
            buf.put_i32_le(i32::try_from(*i).map_err(|_| out_of_range(*i, data_type))?)
        }
        (DataType::BigInt, Value::Integer(i)) => buf.put_i64_le(*i),
        (DataType::Double, Value::Float(f)) => buf.put_f64_le(*f),
        (DataType::Varchar(_) | DataType::Text, Value::Text(s)) => {
            buf.put_u32_le(s.len() as u32);
            buf.extend_from_slice(s.as_bytes());
        }
        (DataType::Varbinary(_) | DataType::Blob, Value::Binary(b)) => {
            buf.put_u32_le(b.len() as u32);
            buf.extend_from_slice(b);
        }
        (DataType::Date, Value::Date(d)) => buf.put_i32_le(d.num_days_from_ce()),
        (DataType::Timestamp, Value::Timestamp(t)) => {
            buf.put_i64_le(t.and_utc().timestamp_micros())
        }
        (data_type, value) => {
            return Err(MonoError::InvalidInput(format!(
                "Value {} does not match column type {:?}",
                value, data_type
            )));
        }
    }
    Ok(())
}

fn out_of_range(value: i64, data_type: &DataType) -> MonoError {
    MonoError::InvalidInput(format!("Value {} is out of range for {:?}", value, data_type))
}

fn need(buf: &[u8], data_type: &DataType, n: usize) -> MonoResult<()> {
    if buf.len() < n {
        return Err(MonoError::Consistency(format!("Truncated {:?} cell", data_type)));
    }
    Ok(())
}

fn read_inline(payload: &[u8], data_type: &DataType) -> MonoResult<Value> {
    let mut buf = payload;
    need(buf, data_type, 1)?;
    if buf.get_u8() == 1 {
        return Ok(Value::Null);
    }

    let value = match data_type {
        DataType::Boolean => {
            need(buf, data_type, 1)?;
            Value::Boolean(buf.get_u8() != 0)
        }
        DataType::SmallInt => {
            need(buf, data_type, 2)?;
            Value::Integer(buf.get_i16_le() as i64)
        }
        DataType::Integer => {
            need(buf, data_type, 4)?;
            Value::Integer(buf.get_i32_le() as i64)
        }
        DataType::BigInt => {
            need(buf, data_type, 8)?;
            Value::Integer(buf.get_i64_le())
        }
        DataType::Double => {
            need(buf, data_type, 8)?;
            Value::Float(buf.get_f64_le())
        }
        DataType::Varchar(_) | DataType::Text => {
            need(buf, data_type, 4)?;
            let len = buf.get_u32_le() as usize;
            need(buf, data_type, len)?;
            let text = String::from_utf8(buf[..len].to_vec())
                .map_err(|e| MonoError::Consistency(format!("Invalid UTF-8 in cell: {}", e)))?;
            Value::Text(text)
        }
        DataType::Varbinary(_) | DataType::Blob => {
            need(buf, data_type, 4)?;
            let len = buf.get_u32_le() as usize;
            need(buf, data_type, len)?;
            Value::Binary(buf[..len].to_vec())
        }
        DataType::Date => {
            need(buf, data_type, 4)?;
            let days = buf.get_i32_le();
            NaiveDate::from_num_days_from_ce_opt(days)
                .map(Value::Date)
                .ok_or_else(|| MonoError::Consistency(format!("Invalid date {}", days)))?
        }
        DataType::Timestamp => {
            need(buf, data_type, 8)?;
            let micros = buf.get_i64_le();
            DateTime::from_timestamp_micros(micros)
                .map(|dt| Value::Timestamp(dt.naive_utc()))
                .ok_or_else(|| MonoError::Consistency(format!("Invalid timestamp {}", micros)))?
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AreaStore;
    use crate::table::info::ColumnInfo;
    use std::sync::Arc;

    fn sample_info() -> TableInfo {
        TableInfo::new(
            "people",
            vec![
                ColumnInfo::new("id", DataType::Integer),
                ColumnInfo::new("name", DataType::Text),
                ColumnInfo::new("born", DataType::Date),
            ],
        )
    }

    fn decode_all(info: &TableInfo, record: &[u8]) -> Vec<StoredCell> {
        let entries = decode_cell_table(record, info.column_count()).unwrap();
        (0..info.column_count())
            .map(|c| {
                let (cell_type, start, end) = cell_range(&entries, c, record.len()).unwrap();
                decode_cell(cell_type, &info.columns[c].data_type, &record[start..end]).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_out_of_range_integer_rejected() {
        let info = TableInfo::new(
            "counts",
            vec![
                ColumnInfo::new("small", DataType::SmallInt),
                ColumnInfo::new("medium", DataType::Integer),
            ],
        );
        let blobs = BlobStore::new(Arc::new(AreaStore::heap("blobs")));

        let fits = vec![Value::Integer(i16::MIN as i64), Value::Integer(i32::MAX as i64)];
        assert!(encode_record(&info, &fits, &blobs, 1024).is_ok());
        let too_small = vec![Value::Integer(40_000), Value::Integer(1)];
        assert!(matches!(
            encode_record(&info, &too_small, &blobs, 1024),
            Err(MonoError::InvalidInput(_))
        ));
        let too_big = vec![Value::Integer(1), Value::Integer(1 << 40)];
        assert!(matches!(
            encode_record(&info, &too_big, &blobs, 1024),
            Err(MonoError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_inline_cells() {
        let info = sample_info();
        let blobs = BlobStore::new(Arc::new(AreaStore::heap("blobs")));
        let born = NaiveDate::from_ymd_opt(1990, 4, 2).unwrap();
        let row = vec![Value::Integer(42), Value::Text("hello".into()), Value::Date(born)];

        let encoded = encode_record(&info, &row, &blobs, 1024).unwrap();
        assert!(encoded.blobs.is_empty());
        assert_eq!(&encoded.bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(
            decode_all(&info, &encoded.bytes),
            row.into_iter().map(StoredCell::Inline).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_large_object_cell() {
        let info = sample_info();
        let blobs = BlobStore::new(Arc::new(AreaStore::heap("blobs")));
        let long = "x".repeat(100);
        let row = vec![Value::Integer(1), Value::Text(long.clone()), Value::Null];

        let encoded = encode_record(&info, &row, &blobs, 16).unwrap();
        assert_eq!(encoded.blobs.len(), 1);

        let cells = decode_all(&info, &encoded.bytes);
        let id = match &cells[1] {
            StoredCell::LargeObject(Some(id)) => *id,
            other => panic!("expected large object, got {:?}", other),
        };
        assert_eq!(cells[2], StoredCell::Inline(Value::Null));
        assert_eq!(
            value_from_object(&DataType::Text, blobs.get_object(id).unwrap()).unwrap(),
            Value::Text(long)
        );
        assert_eq!(record_blob_refs(&info, &encoded.bytes).unwrap(), vec![id]);
    }

    #[test]
    fn test_arity_mismatch() {
        let info = sample_info();
        let blobs = BlobStore::new(Arc::new(AreaStore::heap("blobs")));
        assert!(encode_record(&info, &[Value::Integer(1)], &blobs, 64).is_err());
    }
}
