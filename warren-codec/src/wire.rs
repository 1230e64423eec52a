//! Field level encoding rules.
//!
//! Every `get_*` function checks the remaining length before touching the buffer, so a short
//! buffer is a [`ProtocolDecodeError::Truncated`] and never a panic. Every `put_*` function has
//! a `*_size` pair which tells how many bytes it writes, without writing.
use bytes::{Buf, BufMut, BytesMut};

use crate::frame::{AMQPFieldValue, FieldTable};
use crate::{truncated, ProtocolDecodeError, Result};

/// Short strings are limited to 255 bytes. Longer ones are cut at a character boundary, callers
/// reject them up front with [`crate::method::oversized_short_string`].
pub const SHORT_STRING_MAX: usize = 255;

fn ensure(buf: &BytesMut, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return truncated!(needed, buf.remaining());
    }

    Ok(())
}

pub fn get_u8(buf: &mut BytesMut) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut BytesMut) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut BytesMut) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut BytesMut) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

/// Split `len` bytes from the front of the buffer.
pub fn get_bytes(buf: &mut BytesMut, len: usize) -> Result<BytesMut> {
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

/// Pack a run of consecutive booleans, LSB first, one octet per 1-8 bits.
pub fn put_bits(buf: &mut BytesMut, bits: &[bool]) {
    for chunk in bits.chunks(8) {
        let mut octet = 0u8;

        for (i, bit) in chunk.iter().enumerate() {
            if *bit {
                octet |= 1 << i;
            }
        }

        buf.put_u8(octet);
    }
}

pub fn bits_size(count: usize) -> usize {
    (count + 7) / 8
}

/// Unpack `N` consecutive booleans packed by [`put_bits`].
pub fn get_bits<const N: usize>(buf: &mut BytesMut) -> Result<[bool; N]> {
    let mut bits = [false; N];
    let mut octet = 0u8;

    for (i, bit) in bits.iter_mut().enumerate() {
        if i % 8 == 0 {
            octet = get_u8(buf)?;
        }

        *bit = octet & (1 << (i % 8)) != 0;
    }

    Ok(bits)
}

fn short_bytes(s: &str) -> &[u8] {
    let mut end = s.len().min(SHORT_STRING_MAX);

    while !s.is_char_boundary(end) {
        end -= 1;
    }

    &s.as_bytes()[..end]
}

pub fn put_short_string(buf: &mut BytesMut, s: &str) {
    let bytes = short_bytes(s);

    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
}

pub fn short_string_size(s: &str) -> usize {
    1 + short_bytes(s).len()
}

pub fn get_short_string(buf: &mut BytesMut) -> Result<String> {
    let len = get_u8(buf)? as usize;
    let bytes = get_bytes(buf, len)?;

    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolDecodeError::InvalidUtf8)
}

pub fn put_long_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn long_string_size(s: &str) -> usize {
    4 + s.len()
}

pub fn get_long_string(buf: &mut BytesMut) -> Result<String> {
    let len = get_u32(buf)? as usize;
    let bytes = get_bytes(buf, len)?;

    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolDecodeError::InvalidUtf8)
}

/// Encode a field table. `None` is encoded as an empty table.
pub fn put_field_table(buf: &mut BytesMut, table: Option<&FieldTable>) {
    match table {
        None => buf.put_u32(0),
        Some(t) => {
            buf.put_u32(table_content_size(t) as u32);

            for (name, value) in t {
                put_short_string(buf, name);
                put_field_value(buf, value);
            }
        }
    }
}

pub fn field_table_size(table: Option<&FieldTable>) -> usize {
    4 + table.map(table_content_size).unwrap_or_default()
}

fn table_content_size(table: &FieldTable) -> usize {
    table
        .iter()
        .map(|(name, value)| short_string_size(name) + 1 + field_value_size(value))
        .sum()
}

/// Decode a field table
///
/// The buffer points to the beginning of the field table which is a `u32` length
/// information. An empty table is decoded as `None`.
pub fn get_field_table(buf: &mut BytesMut) -> Result<Option<FieldTable>> {
    let len = get_u32(buf)? as usize;

    if len == 0 {
        return Ok(None);
    }

    let mut table_buf = get_bytes(buf, len)?;
    let mut table = FieldTable::new();

    while table_buf.has_remaining() {
        let name = get_short_string(&mut table_buf)?;
        let value = get_field_value(&mut table_buf)?;

        table.insert(name, value);
    }

    Ok(Some(table))
}

/// Size of the value without the type tag.
fn field_value_size(value: &AMQPFieldValue) -> usize {
    match value {
        AMQPFieldValue::Bool(_) | AMQPFieldValue::I8(_) | AMQPFieldValue::U8(_) => 1,
        AMQPFieldValue::I16(_) | AMQPFieldValue::U16(_) => 2,
        AMQPFieldValue::I32(_) | AMQPFieldValue::U32(_) | AMQPFieldValue::F32(_) => 4,
        AMQPFieldValue::I64(_) | AMQPFieldValue::F64(_) | AMQPFieldValue::Timestamp(_) => 8,
        AMQPFieldValue::Decimal(_, _) => 5,
        AMQPFieldValue::LongString(s) => long_string_size(s),
        AMQPFieldValue::ByteArray(b) => 4 + b.len(),
        AMQPFieldValue::FieldArray(values) => 4 + array_content_size(values),
        AMQPFieldValue::FieldTable(t) => 4 + table_content_size(t),
        AMQPFieldValue::Void => 0,
    }
}

fn array_content_size(values: &[AMQPFieldValue]) -> usize {
    values.iter().map(|v| 1 + field_value_size(v)).sum()
}

fn put_field_value(buf: &mut BytesMut, value: &AMQPFieldValue) {
    match value {
        AMQPFieldValue::Bool(v) => {
            buf.put_u8(b't');
            buf.put_u8(u8::from(*v));
        }
        AMQPFieldValue::I8(v) => {
            buf.put_u8(b'b');
            buf.put_i8(*v);
        }
        AMQPFieldValue::U8(v) => {
            buf.put_u8(b'B');
            buf.put_u8(*v);
        }
        AMQPFieldValue::I16(v) => {
            buf.put_u8(b's');
            buf.put_i16(*v);
        }
        AMQPFieldValue::U16(v) => {
            buf.put_u8(b'u');
            buf.put_u16(*v);
        }
        AMQPFieldValue::I32(v) => {
            buf.put_u8(b'I');
            buf.put_i32(*v);
        }
        AMQPFieldValue::U32(v) => {
            buf.put_u8(b'i');
            buf.put_u32(*v);
        }
        AMQPFieldValue::I64(v) => {
            buf.put_u8(b'l');
            buf.put_i64(*v);
        }
        AMQPFieldValue::F32(v) => {
            buf.put_u8(b'f');
            buf.put_f32(*v);
        }
        AMQPFieldValue::F64(v) => {
            buf.put_u8(b'd');
            buf.put_f64(*v);
        }
        AMQPFieldValue::Decimal(scale, v) => {
            buf.put_u8(b'D');
            buf.put_u8(*scale);
            buf.put_u32(*v);
        }
        AMQPFieldValue::LongString(v) => {
            buf.put_u8(b'S');
            put_long_string(buf, v);
        }
        AMQPFieldValue::ByteArray(v) => {
            buf.put_u8(b'x');
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        AMQPFieldValue::FieldArray(values) => {
            buf.put_u8(b'A');
            buf.put_u32(array_content_size(values) as u32);

            for v in values {
                put_field_value(buf, v);
            }
        }
        AMQPFieldValue::Timestamp(v) => {
            buf.put_u8(b'T');
            buf.put_u64(*v);
        }
        AMQPFieldValue::FieldTable(t) => {
            buf.put_u8(b'F');
            put_field_table(buf, Some(t));
        }
        AMQPFieldValue::Void => buf.put_u8(b'V'),
    }
}

fn get_field_value(buf: &mut BytesMut) -> Result<AMQPFieldValue> {
    let value = match get_u8(buf)? {
        b't' => AMQPFieldValue::Bool(get_u8(buf)? != 0),
        b'b' => AMQPFieldValue::I8(get_u8(buf)? as i8),
        b'B' => AMQPFieldValue::U8(get_u8(buf)?),
        b's' => AMQPFieldValue::I16(get_u16(buf)? as i16),
        b'u' => AMQPFieldValue::U16(get_u16(buf)?),
        b'I' => AMQPFieldValue::I32(get_u32(buf)? as i32),
        b'i' => AMQPFieldValue::U32(get_u32(buf)?),
        b'l' => AMQPFieldValue::I64(get_u64(buf)? as i64),
        b'f' => AMQPFieldValue::F32(f32::from_bits(get_u32(buf)?)),
        b'd' => AMQPFieldValue::F64(f64::from_bits(get_u64(buf)?)),
        b'D' => {
            let scale = get_u8(buf)?;

            AMQPFieldValue::Decimal(scale, get_u32(buf)?)
        }
        b'S' => AMQPFieldValue::LongString(get_long_string(buf)?),
        b'x' => {
            let len = get_u32(buf)? as usize;

            AMQPFieldValue::ByteArray(get_bytes(buf, len)?.to_vec())
        }
        b'A' => {
            let len = get_u32(buf)? as usize;
            let mut array_buf = get_bytes(buf, len)?;
            let mut values = vec![];

            while array_buf.has_remaining() {
                values.push(get_field_value(&mut array_buf)?);
            }

            AMQPFieldValue::FieldArray(values)
        }
        b'T' => AMQPFieldValue::Timestamp(get_u64(buf)?),
        b'F' => AMQPFieldValue::FieldTable(Box::new(get_field_table(buf)?.unwrap_or_default())),
        b'V' => AMQPFieldValue::Void,
        t => return Err(ProtocolDecodeError::UnknownFieldType(t)),
    };

    Ok(value)
}
