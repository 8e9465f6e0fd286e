//! Stateful changeset encode/decode, per spec.md §4.4 and the row/block
//! byte layout in §6.
//!
//! Block header (bit-packed): a 16-bit word packing the 4-bit operation
//! tag and the (max 512, so 9-bit) property count, followed by the class
//! id, then one `(property index, type tag)` pair per covered property,
//! then a row count, then the row payloads.

use byteorder::{ByteOrder, LittleEndian};

use crate::changeset::block::{Block, BlockProperty, FieldValue, OpType, Row};
use crate::error::{CResult, Error};
use crate::model::{ClassId, PropertyId, PropertyType};

fn type_tag(t: PropertyType) -> u8 {
    match t {
        PropertyType::Byte => 0,
        PropertyType::Short => 1,
        PropertyType::Int => 2,
        PropertyType::Long => 3,
        PropertyType::Float => 4,
        PropertyType::Double => 5,
        PropertyType::Bool => 6,
        PropertyType::DateTime => 7,
        PropertyType::String => 8,
        PropertyType::ByteArray => 9,
        PropertyType::ShortArray => 10,
        PropertyType::IntArray => 11,
        PropertyType::LongArray => 12,
        PropertyType::FloatArray => 13,
        PropertyType::DoubleArray => 14,
        PropertyType::BoolArray => 15,
        PropertyType::DateTimeArray => 16,
        PropertyType::StringArray => 17,
        PropertyType::Reference => 18,
        PropertyType::ReferenceArray => 19,
    }
}

fn type_from_tag(tag: u8) -> CResult<PropertyType> {
    Ok(match tag {
        0 => PropertyType::Byte,
        1 => PropertyType::Short,
        2 => PropertyType::Int,
        3 => PropertyType::Long,
        4 => PropertyType::Float,
        5 => PropertyType::Double,
        6 => PropertyType::Bool,
        7 => PropertyType::DateTime,
        8 => PropertyType::String,
        9 => PropertyType::ByteArray,
        10 => PropertyType::ShortArray,
        11 => PropertyType::IntArray,
        12 => PropertyType::LongArray,
        13 => PropertyType::FloatArray,
        14 => PropertyType::DoubleArray,
        15 => PropertyType::BoolArray,
        16 => PropertyType::DateTimeArray,
        17 => PropertyType::StringArray,
        18 => PropertyType::Reference,
        19 => PropertyType::ReferenceArray,
        other => return Err(Error::Corruption(format!("unknown property type tag {other}"))),
    })
}

/// Accumulates rows into blocks, sealing the current block whenever the
/// `(class, op, property-subset)` triple changes (spec.md §4.4 "Writers are
/// stateful").
#[derive(Default)]
pub struct ChangesetWriter {
    blocks: Vec<Block>,
    current: Option<(ClassId, OpType, Vec<BlockProperty>)>,
    rows: Vec<Row>,
}

impl ChangesetWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn same_triple(a: &(ClassId, OpType, Vec<BlockProperty>), class_id: ClassId, op: OpType, props: &[BlockProperty]) -> bool {
        a.0 == class_id
            && a.1 == op
            && a.2.len() == props.len()
            && a.2.iter().zip(props.iter()).all(|(x, y)| x.property_id == y.property_id && x.prop_type == y.prop_type)
    }

    pub fn write_row(&mut self, class_id: ClassId, op: OpType, properties: &[BlockProperty], row: Row) {
        let needs_seal = match &self.current {
            Some(triple) => !Self::same_triple(triple, class_id, op, properties),
            None => false,
        };
        if needs_seal {
            self.seal();
        }
        if self.current.is_none() {
            self.current = Some((class_id, op, properties.to_vec()));
        }
        self.rows.push(row);
    }

    fn seal(&mut self) {
        if let Some((class_id, op_type, properties)) = self.current.take() {
            let rows = std::mem::take(&mut self.rows);
            if !rows.is_empty() {
                self.blocks.push(Block {
                    class_id,
                    op_type,
                    properties,
                    rows,
                });
            }
        }
    }

    pub fn finish(mut self) -> Vec<Block> {
        self.seal();
        self.blocks
    }
}

/// Parses blocks one at a time out of a byte buffer (spec.md §4.4 "Readers
/// are stateful").
pub struct ChangesetReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ChangesetReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ChangesetReader { buf, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.buf.len()
    }

    pub fn next_block(&mut self) -> CResult<Option<Block>> {
        if self.is_empty() {
            return Ok(None);
        }
        let (block, consumed) = decode_block(&self.buf[self.offset..])?;
        self.offset += consumed;
        Ok(Some(block))
    }
}

pub fn encode_changeset(blocks: &[Block]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        encode_block(block, &mut out);
    }
    out
}

pub fn decode_changeset(buf: &[u8]) -> CResult<Vec<Block>> {
    let mut reader = ChangesetReader::new(buf);
    let mut blocks = Vec::new();
    while let Some(block) = reader.next_block()? {
        blocks.push(block);
    }
    Ok(blocks)
}

pub fn encode_block(block: &Block, out: &mut Vec<u8>) {
    let header_word: u16 = (block.op_type.tag() as u16) | ((block.properties.len() as u16) << 4);
    let mut word_buf = [0u8; 2];
    LittleEndian::write_u16(&mut word_buf, header_word);
    out.extend_from_slice(&word_buf);

    let mut class_buf = [0u8; 2];
    LittleEndian::write_i16(&mut class_buf, block.class_id);
    out.extend_from_slice(&class_buf);

    for prop in &block.properties {
        let mut pid_buf = [0u8; 2];
        LittleEndian::write_u16(&mut pid_buf, prop.property_id);
        out.extend_from_slice(&pid_buf);
        out.push(type_tag(prop.prop_type));
    }

    let mut count_buf = [0u8; 4];
    LittleEndian::write_u32(&mut count_buf, block.rows.len() as u32);
    out.extend_from_slice(&count_buf);

    for row in &block.rows {
        encode_row(row, block, out);
    }
}

fn encode_row(row: &Row, block: &Block, out: &mut Vec<u8>) {
    let mut id_buf = [0u8; 8];
    LittleEndian::write_u64(&mut id_buf, row.object_id);
    out.extend_from_slice(&id_buf);
    let mut version_buf = [0u8; 8];
    LittleEndian::write_u64(&mut version_buf, row.version);
    out.extend_from_slice(&version_buf);

    for (value, prop) in row.values.iter().zip(block.properties.iter()) {
        encode_field(value, prop.prop_type, out);
    }
}

fn encode_field(value: &FieldValue, expected: PropertyType, out: &mut Vec<u8>) {
    debug_assert_eq!(type_tag(expected), field_type_tag(value));
    match value {
        FieldValue::Byte(v) => out.push(*v),
        FieldValue::Short(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Long(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Bool(v) => out.push(*v as u8),
        FieldValue::DateTime(v) => out.extend_from_slice(&v.to_le_bytes()),
        FieldValue::String(s) => encode_optional_bytes(s.as_ref().map(|s| s.as_bytes()), out),
        FieldValue::ByteArray(a) => encode_optional_bytes(a.as_ref().map(|v| v.as_slice()), out),
        FieldValue::ShortArray(a) => encode_optional_array(a.as_deref(), out, |v, out| out.extend_from_slice(&v.to_le_bytes())),
        FieldValue::IntArray(a) => encode_optional_array(a.as_deref(), out, |v, out| out.extend_from_slice(&v.to_le_bytes())),
        FieldValue::LongArray(a) => encode_optional_array(a.as_deref(), out, |v, out| out.extend_from_slice(&v.to_le_bytes())),
        FieldValue::FloatArray(a) => encode_optional_array(a.as_deref(), out, |v, out| out.extend_from_slice(&v.to_le_bytes())),
        FieldValue::DoubleArray(a) => encode_optional_array(a.as_deref(), out, |v, out| out.extend_from_slice(&v.to_le_bytes())),
        FieldValue::BoolArray(a) => encode_optional_array(a.as_deref(), out, |v, out| out.push(*v as u8)),
        FieldValue::DateTimeArray(a) => encode_optional_array(a.as_deref(), out, |v, out| out.extend_from_slice(&v.to_le_bytes())),
        FieldValue::StringArray(a) => match a {
            None => out.push(0),
            Some(items) => {
                out.push(1);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for s in items {
                    encode_len_prefixed(s.as_bytes(), out);
                }
            }
        },
        FieldValue::Reference(r) => match r {
            None => out.push(0),
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_le_bytes());
            }
        },
        FieldValue::ReferenceArray(a) => encode_optional_array(a.as_deref(), out, |v, out| out.extend_from_slice(&v.to_le_bytes())),
    }
}

fn field_type_tag(value: &FieldValue) -> u8 {
    match value {
        FieldValue::Byte(_) => 0,
        FieldValue::Short(_) => 1,
        FieldValue::Int(_) => 2,
        FieldValue::Long(_) => 3,
        FieldValue::Float(_) => 4,
        FieldValue::Double(_) => 5,
        FieldValue::Bool(_) => 6,
        FieldValue::DateTime(_) => 7,
        FieldValue::String(_) => 8,
        FieldValue::ByteArray(_) => 9,
        FieldValue::ShortArray(_) => 10,
        FieldValue::IntArray(_) => 11,
        FieldValue::LongArray(_) => 12,
        FieldValue::FloatArray(_) => 13,
        FieldValue::DoubleArray(_) => 14,
        FieldValue::BoolArray(_) => 15,
        FieldValue::DateTimeArray(_) => 16,
        FieldValue::StringArray(_) => 17,
        FieldValue::Reference(_) => 18,
        FieldValue::ReferenceArray(_) => 19,
    }
}

fn encode_optional_bytes(bytes: Option<&[u8]>, out: &mut Vec<u8>) {
    match bytes {
        None => out.push(0),
        Some(b) => {
            out.push(1);
            encode_len_prefixed(b, out);
        }
    }
}

fn encode_len_prefixed(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn encode_optional_array<T>(array: Option<&[T]>, out: &mut Vec<u8>, mut write_one: impl FnMut(&T, &mut Vec<u8>)) {
    match array {
        None => out.push(0),
        Some(items) => {
            out.push(1);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                write_one(item, out);
            }
        }
    }
}

fn decode_block(buf: &[u8]) -> CResult<(Block, usize)> {
    let mut cursor = Cursor::new(buf);
    let header_word = cursor.read_u16()?;
    let op_tag = (header_word & 0x0F) as u8;
    let property_count = (header_word >> 4) as usize;
    let op_type = OpType::from_tag(op_tag)
        .ok_or_else(|| Error::Corruption(format!("unknown block op tag {op_tag}")))?;
    let class_id = cursor.read_i16()?;

    let mut properties = Vec::with_capacity(property_count);
    for _ in 0..property_count {
        let property_id = cursor.read_u16()?;
        let tag = cursor.read_u8()?;
        properties.push(BlockProperty {
            property_id,
            prop_type: type_from_tag(tag)?,
        });
    }

    let row_count = cursor.read_u32()?;
    let mut rows = Vec::with_capacity(row_count as usize);
    for _ in 0..row_count {
        rows.push(decode_row(&mut cursor, &properties)?);
    }

    Ok((
        Block {
            class_id,
            op_type,
            properties,
            rows,
        },
        cursor.offset,
    ))
}

fn decode_row(cursor: &mut Cursor, properties: &[BlockProperty]) -> CResult<Row> {
    let object_id = cursor.read_u64()?;
    let version = cursor.read_u64()?;
    let mut values = Vec::with_capacity(properties.len());
    for prop in properties {
        values.push(decode_field(cursor, prop.prop_type)?);
    }
    Ok(Row {
        object_id,
        version,
        values,
    })
}

fn decode_field(cursor: &mut Cursor, prop_type: PropertyType) -> CResult<FieldValue> {
    Ok(match prop_type {
        PropertyType::Byte => FieldValue::Byte(cursor.read_u8()?),
        PropertyType::Short => FieldValue::Short(cursor.read_i16()?),
        PropertyType::Int => FieldValue::Int(cursor.read_i32()?),
        PropertyType::Long => FieldValue::Long(cursor.read_i64()?),
        PropertyType::Float => FieldValue::Float(cursor.read_f32()?),
        PropertyType::Double => FieldValue::Double(cursor.read_f64()?),
        PropertyType::Bool => FieldValue::Bool(cursor.read_u8()? != 0),
        PropertyType::DateTime => FieldValue::DateTime(cursor.read_i64()?),
        PropertyType::String => FieldValue::String(decode_optional_string(cursor)?),
        PropertyType::ByteArray => FieldValue::ByteArray(decode_optional_bytes(cursor)?),
        PropertyType::ShortArray => FieldValue::ShortArray(decode_optional_array(cursor, Cursor::read_i16)?),
        PropertyType::IntArray => FieldValue::IntArray(decode_optional_array(cursor, Cursor::read_i32)?),
        PropertyType::LongArray => FieldValue::LongArray(decode_optional_array(cursor, Cursor::read_i64)?),
        PropertyType::FloatArray => FieldValue::FloatArray(decode_optional_array(cursor, Cursor::read_f32)?),
        PropertyType::DoubleArray => FieldValue::DoubleArray(decode_optional_array(cursor, Cursor::read_f64)?),
        PropertyType::BoolArray => FieldValue::BoolArray(decode_optional_array(cursor, |c| Ok(c.read_u8()? != 0))?),
        PropertyType::DateTimeArray => FieldValue::DateTimeArray(decode_optional_array(cursor, Cursor::read_i64)?),
        PropertyType::StringArray => {
            let present = cursor.read_u8()? != 0;
            if !present {
                FieldValue::StringArray(None)
            } else {
                let count = cursor.read_u32()?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(decode_string(cursor)?);
                }
                FieldValue::StringArray(Some(items))
            }
        }
        PropertyType::Reference => {
            let present = cursor.read_u8()? != 0;
            FieldValue::Reference(if present { Some(cursor.read_u64()?) } else { None })
        }
        PropertyType::ReferenceArray => FieldValue::ReferenceArray(decode_optional_array(cursor, Cursor::read_u64)?),
    })
}

fn decode_optional_string(cursor: &mut Cursor) -> CResult<Option<String>> {
    let present = cursor.read_u8()? != 0;
    if !present {
        return Ok(None);
    }
    Ok(Some(decode_string(cursor)?))
}

fn decode_string(cursor: &mut Cursor) -> CResult<String> {
    let len = cursor.read_u32()? as usize;
    let bytes = cursor.read_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::Corruption(format!("invalid UTF-8 in string field: {e}")))
}

fn decode_optional_bytes(cursor: &mut Cursor) -> CResult<Option<Vec<u8>>> {
    let present = cursor.read_u8()? != 0;
    if !present {
        return Ok(None);
    }
    let len = cursor.read_u32()? as usize;
    Ok(Some(cursor.read_bytes(len)?.to_vec()))
}

fn decode_optional_array<T>(cursor: &mut Cursor, mut read_one: impl FnMut(&mut Cursor) -> CResult<T>) -> CResult<Option<Vec<T>>> {
    let present = cursor.read_u8()? != 0;
    if !present {
        return Ok(None);
    }
    let count = cursor.read_u32()?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(read_one(cursor)?);
    }
    Ok(Some(items))
}

/// Minimal bounds-checked cursor over a byte slice, tracking how many bytes
/// have been consumed so the caller can advance past this block.
struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, offset: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> CResult<&'a [u8]> {
        if self.offset + len > self.buf.len() {
            return Err(Error::Corruption("changeset block truncated".into()));
        }
        let slice = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> CResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> CResult<u16> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    fn read_i16(&mut self) -> CResult<i16> {
        Ok(LittleEndian::read_i16(self.read_bytes(2)?))
    }

    fn read_u32(&mut self) -> CResult<u32> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    fn read_i32(&mut self) -> CResult<i32> {
        Ok(LittleEndian::read_i32(self.read_bytes(4)?))
    }

    fn read_u64(&mut self) -> CResult<u64> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    fn read_i64(&mut self) -> CResult<i64> {
        Ok(LittleEndian::read_i64(self.read_bytes(8)?))
    }

    fn read_f32(&mut self) -> CResult<f32> {
        Ok(LittleEndian::read_f32(self.read_bytes(4)?))
    }

    fn read_f64(&mut self) -> CResult<f64> {
        Ok(LittleEndian::read_f64(self.read_bytes(8)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block {
            class_id: 7,
            op_type: OpType::Insert,
            properties: vec![
                BlockProperty { property_id: 0, prop_type: PropertyType::Int },
                BlockProperty { property_id: 1, prop_type: PropertyType::String },
            ],
            rows: vec![
                Row {
                    object_id: 1,
                    version: 10,
                    values: vec![FieldValue::Int(42), FieldValue::String(Some("x".into()))],
                },
                Row {
                    object_id: 2,
                    version: 10,
                    values: vec![FieldValue::Int(7), FieldValue::String(None)],
                },
            ],
        }
    }

    #[test]
    fn round_trip_single_block() {
        let block = sample_block();
        let mut buf = Vec::new();
        encode_block(&block, &mut buf);
        let (decoded, consumed) = decode_block(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.class_id, block.class_id);
        assert_eq!(decoded.rows.len(), 2);
        assert_eq!(decoded.rows[0].values, block.rows[0].values);
        assert_eq!(decoded.rows[1].values, block.rows[1].values);
    }

    #[test]
    fn writer_seals_on_triple_change() {
        let props_a = vec![BlockProperty { property_id: 0, prop_type: PropertyType::Int }];
        let mut writer = ChangesetWriter::new();
        writer.write_row(1, OpType::Insert, &props_a, Row { object_id: 1, version: 1, values: vec![FieldValue::Int(1)] });
        writer.write_row(1, OpType::Insert, &props_a, Row { object_id: 2, version: 1, values: vec![FieldValue::Int(2)] });
        writer.write_row(2, OpType::Insert, &props_a, Row { object_id: 3, version: 1, values: vec![FieldValue::Int(3)] });
        let blocks = writer.finish();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].rows.len(), 2);
        assert_eq!(blocks[1].rows.len(), 1);
    }

    #[test]
    fn round_trip_multi_block_changeset() {
        let block = sample_block();
        let encoded = encode_changeset(&[block.clone(), block]);
        let decoded = decode_changeset(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn corrupt_op_tag_is_rejected() {
        let mut buf = Vec::new();
        // op tag 15 is out of range; property count 0.
        buf.extend_from_slice(&0x000Fu16.to_le_bytes());
        buf.extend_from_slice(&0i16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(decode_block(&buf), Err(Error::Corruption(_))));
    }
}
