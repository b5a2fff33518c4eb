//! Redo-log record framing
//!
//! Each committed batch becomes one frame:
//!
//! ```text
//! +------------------+
//! | Record Length    | (u32 LE, total including this field)
//! +------------------+
//! | Op Count         | (u32 LE)
//! +------------------+
//! | Ops              | (variable)
//! +------------------+
//! | Checksum         | (u32 LE, CRC32 over length + body)
//! +------------------+
//! ```
//!
//! A frame whose declared length extends past the end of the file is a
//! torn tail (the crash interrupted the append) and is dropped. A
//! frame that is fully present but fails its checksum is corruption
//! and aborts the open.

use std::sync::Arc;

use super::checksum::{compute_checksum, verify_checksum};
use super::errors::{EngineError, EngineResult};
use super::schema::TableId;
use super::table::TableOp;
use super::value::{Row, Value};

const OP_INSERT: u8 = 0;
const OP_UPDATE: u8 = 1;
const OP_DELETE: u8 = 2;

/// Frame overhead: length, op count, checksum.
const MIN_FRAME_LEN: usize = 4 + 4 + 4;

/// One durable log record: the ops of a single committed batch.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub ops: Vec<TableOp>,
}

impl LogRecord {
    pub fn new(ops: Vec<TableOp>) -> LogRecord {
        LogRecord { ops }
    }

    /// Serializes the record into a framed, checksummed byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.ops.len() as u32).to_le_bytes());
        for op in &self.ops {
            encode_op(&mut body, op);
        }

        let record_length = (4 + body.len() + 4) as u32;
        let mut checksum_data = Vec::with_capacity(4 + body.len());
        checksum_data.extend_from_slice(&record_length.to_le_bytes());
        checksum_data.extend_from_slice(&body);
        let checksum = compute_checksum(&checksum_data);

        let mut frame = Vec::with_capacity(record_length as usize);
        frame.extend_from_slice(&record_length.to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame
    }

    /// Decodes one frame from the front of `data`.
    ///
    /// Returns `Ok(None)` when the bytes present cannot hold the
    /// declared frame (torn tail); corruption inside a fully present
    /// frame is an error.
    pub fn decode_frame(data: &[u8]) -> EngineResult<Option<(LogRecord, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let record_length =
            u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < record_length {
            return Ok(None);
        }
        if record_length < MIN_FRAME_LEN {
            return Err(EngineError::Corruption(format!(
                "invalid frame length {}",
                record_length
            )));
        }

        let checksum_offset = record_length - 4;
        let stored = u32::from_le_bytes([
            data[checksum_offset],
            data[checksum_offset + 1],
            data[checksum_offset + 2],
            data[checksum_offset + 3],
        ]);
        if !verify_checksum(&data[..checksum_offset], stored) {
            return Err(EngineError::Corruption("frame checksum mismatch".into()));
        }

        let body = &data[4..checksum_offset];
        let mut pos = 0;
        let op_count = decode_u32(body, &mut pos)? as usize;
        let mut ops = Vec::with_capacity(op_count);
        for _ in 0..op_count {
            ops.push(decode_op(body, &mut pos)?);
        }
        if pos != body.len() {
            return Err(EngineError::Corruption("trailing bytes in frame body".into()));
        }
        Ok(Some((LogRecord { ops }, record_length)))
    }
}

fn encode_op(buf: &mut Vec<u8>, op: &TableOp) {
    match op {
        TableOp::Insert { table, row_id, row } => {
            buf.push(OP_INSERT);
            buf.push(table.as_u8());
            buf.extend_from_slice(&row_id.to_le_bytes());
            encode_row(buf, row);
        }
        TableOp::Update { table, row_id, row } => {
            buf.push(OP_UPDATE);
            buf.push(table.as_u8());
            buf.extend_from_slice(&row_id.to_le_bytes());
            encode_row(buf, row);
        }
        TableOp::Delete { table, row_id } => {
            buf.push(OP_DELETE);
            buf.push(table.as_u8());
            buf.extend_from_slice(&row_id.to_le_bytes());
        }
    }
}

fn encode_row(buf: &mut Vec<u8>, row: &Row) {
    buf.extend_from_slice(&(row.len() as u16).to_le_bytes());
    for value in row {
        value.encode(buf);
    }
}

fn decode_op(data: &[u8], pos: &mut usize) -> EngineResult<TableOp> {
    let tag = decode_u8(data, pos)?;
    let table = TableId::from_u8(decode_u8(data, pos)?)
        .ok_or_else(|| EngineError::Corruption("unknown table id in op".into()))?;
    let row_id = decode_u64(data, pos)?;
    match tag {
        OP_INSERT => Ok(TableOp::Insert {
            table,
            row_id,
            row: Arc::new(decode_row(data, pos)?),
        }),
        OP_UPDATE => Ok(TableOp::Update {
            table,
            row_id,
            row: Arc::new(decode_row(data, pos)?),
        }),
        OP_DELETE => Ok(TableOp::Delete { table, row_id }),
        other => Err(EngineError::Corruption(format!("unknown op tag {}", other))),
    }
}

fn decode_row(data: &[u8], pos: &mut usize) -> EngineResult<Row> {
    let count = decode_u16(data, pos)? as usize;
    let mut row = Vec::with_capacity(count);
    for _ in 0..count {
        row.push(Value::decode(data, pos)?);
    }
    Ok(row)
}

fn decode_u8(data: &[u8], pos: &mut usize) -> EngineResult<u8> {
    let byte = data
        .get(*pos)
        .copied()
        .ok_or_else(|| EngineError::Corruption("op truncated".into()))?;
    *pos += 1;
    Ok(byte)
}

fn decode_u16(data: &[u8], pos: &mut usize) -> EngineResult<u16> {
    if *pos + 2 > data.len() {
        return Err(EngineError::Corruption("op truncated".into()));
    }
    let value = u16::from_le_bytes([data[*pos], data[*pos + 1]]);
    *pos += 2;
    Ok(value)
}

fn decode_u32(data: &[u8], pos: &mut usize) -> EngineResult<u32> {
    if *pos + 4 > data.len() {
        return Err(EngineError::Corruption("op truncated".into()));
    }
    let value = u32::from_le_bytes([data[*pos], data[*pos + 1], data[*pos + 2], data[*pos + 3]]);
    *pos += 4;
    Ok(value)
}

fn decode_u64(data: &[u8], pos: &mut usize) -> EngineResult<u64> {
    if *pos + 8 > data.len() {
        return Err(EngineError::Corruption("op truncated".into()));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[*pos..*pos + 8]);
    *pos += 8;
    Ok(u64::from_le_bytes(raw))
}
