//! Changeset block and row types, per spec.md §4.4.
//!
//! A changeset is a sequence of blocks; each block is a homogeneous run of
//! operations for one `(class, operation-type, property-subset)` triple.

use crate::model::{ClassId, PropertyId, PropertyType};
use crate::store::object::{CommitVersion, ObjectId};

/// The operation a block's rows perform, packed into 4 bits on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Insert = 0,
    Update = 1,
    Delete = 2,
    /// An isolated inverse-reference change, not accompanied by a full row
    /// rewrite.
    ReferenceUpdate = 3,
    /// Emitted during schema upgrade to backfill a new property's default.
    DefaultValue = 4,
    /// Alignment: rewind the log group to an older commit version.
    Rewind = 5,
    /// Alignment: drop the database entirely.
    DropDatabase = 6,
}

impl OpType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => OpType::Insert,
            1 => OpType::Update,
            2 => OpType::Delete,
            3 => OpType::ReferenceUpdate,
            4 => OpType::DefaultValue,
            5 => OpType::Rewind,
            6 => OpType::DropDatabase,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// One property covered by a block, in the class's declared order.
#[derive(Clone, Debug)]
pub struct BlockProperty {
    pub property_id: PropertyId,
    pub prop_type: PropertyType,
}

/// A single field value within a row. Unlike `store::object::Value`, string
/// and array payloads are inline (owned) rather than side-store handles:
/// the wire format never references in-process arena state.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    DateTime(i64),
    String(Option<String>),
    ByteArray(Option<Vec<u8>>),
    ShortArray(Option<Vec<i16>>),
    IntArray(Option<Vec<i32>>),
    LongArray(Option<Vec<i64>>),
    FloatArray(Option<Vec<f32>>),
    DoubleArray(Option<Vec<f64>>),
    BoolArray(Option<Vec<bool>>),
    DateTimeArray(Option<Vec<i64>>),
    StringArray(Option<Vec<String>>),
    Reference(Option<ObjectId>),
    ReferenceArray(Option<Vec<ObjectId>>),
}

/// One operation's row: the object it targets, the commit version that
/// produced it, and the values for the block's declared property subset.
#[derive(Clone, Debug)]
pub struct Row {
    pub object_id: ObjectId,
    pub version: CommitVersion,
    pub values: Vec<FieldValue>,
}

/// A block header plus its operation rows.
#[derive(Clone, Debug)]
pub struct Block {
    pub class_id: ClassId,
    pub op_type: OpType,
    pub properties: Vec<BlockProperty>,
    pub rows: Vec<Row>,
}

impl Block {
    /// A block is parallel-safe iff it is not a schema-upgrade
    /// `DefaultValue` block (spec.md §4.4 "Parallel applicability").
    pub fn is_parallel_safe(&self) -> bool {
        self.op_type != OpType::DefaultValue
    }

    pub fn is_alignment(&self) -> bool {
        matches!(self.op_type, OpType::Rewind | OpType::DropDatabase)
    }
}
