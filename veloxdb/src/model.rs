//! Minimal class/property descriptors.
//!
//! The schema/model descriptor subsystem (XML schema loading, source
//! generators, DTO automapping) is an external collaborator per spec.md §1.
//! This module only carries the shapes the core needs in order to lay out
//! objects, drive the changeset codec, and enforce reference semantics.

use serde::{Deserialize, Serialize};

/// Stable identifier for a class, assigned externally.
pub type ClassId = i16;

/// Stable identifier for a property within its declaring class.
pub type PropertyId = u16;

/// Maximum number of properties a class may declare (spec.md §8 boundary).
pub const MAX_PROPERTIES_PER_CLASS: usize = 512;

/// Maximum number of properties an index may cover (spec.md §3).
pub const MAX_INDEXED_PROPERTIES: usize = 4;

/// The closed set of primitive property types, plus array variants and
/// references (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Bool,
    DateTime,
    String,
    ByteArray,
    ShortArray,
    IntArray,
    LongArray,
    FloatArray,
    DoubleArray,
    BoolArray,
    DateTimeArray,
    StringArray,
    Reference,
    ReferenceArray,
}

impl PropertyType {
    /// True for the two reference-carrying variants.
    pub fn is_reference(&self) -> bool {
        matches!(self, PropertyType::Reference | PropertyType::ReferenceArray)
    }

    /// True for array (including reference array) variants.
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            PropertyType::ByteArray
                | PropertyType::ShortArray
                | PropertyType::IntArray
                | PropertyType::LongArray
                | PropertyType::FloatArray
                | PropertyType::DoubleArray
                | PropertyType::BoolArray
                | PropertyType::DateTimeArray
                | PropertyType::StringArray
                | PropertyType::ReferenceArray
        )
    }

    /// Byte width of the fixed-size scalar encoding, or `None` for
    /// variable-length (String, arrays).
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            PropertyType::Byte | PropertyType::Bool => Some(1),
            PropertyType::Short => Some(2),
            PropertyType::Int => Some(4),
            PropertyType::Float => Some(4),
            PropertyType::Long | PropertyType::DateTime | PropertyType::Reference => Some(8),
            PropertyType::Double => Some(8),
            _ => None,
        }
    }
}

/// What happens to a referencing object when its target is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteAction {
    PreventDelete,
    CascadeDelete,
    SetToNull,
}

/// A single property in a class's declared, fixed order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub id: PropertyId,
    pub name: String,
    pub prop_type: PropertyType,
    /// Only meaningful when `prop_type.is_reference()`.
    pub target_class: Option<ClassId>,
    pub delete_action: Option<DeleteAction>,
    /// Whether writes through this reference are tracked in the inverse-ref
    /// graph (spec.md §3 "Inverse-reference entity").
    pub inverse_tracked: bool,
}

/// A named persistence channel; a partition of classes across separate
/// on-disk log+snapshot files (spec.md §3 "Log group").
pub type LogGroupId = u8;

/// The master log group, which also records schema/global state.
pub const MASTER_LOG_GROUP: LogGroupId = 0;

/// Describes one class: an ordered property list and the log group it is
/// assigned to. Abstract classes are present in the schema but hold no
/// objects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub id: ClassId,
    pub name: String,
    pub abstract_class: bool,
    pub log_group: LogGroupId,
    pub properties: Vec<PropertyDescriptor>,
}

impl ClassDescriptor {
    pub fn property(&self, id: PropertyId) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.id == id)
    }

    /// Validates the §8 boundary: at most 512 properties per class.
    pub fn validate(&self) -> crate::error::CResult<()> {
        if self.properties.len() > MAX_PROPERTIES_PER_CLASS {
            return Err(crate::error::Error::SchemaMismatch(format!(
                "class {} declares {} properties, exceeding the maximum of {}",
                self.name,
                self.properties.len(),
                MAX_PROPERTIES_PER_CLASS
            )));
        }
        Ok(())
    }
}

/// Sort direction for a sorted index property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Case-sensitivity for culture-aware string comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}

/// One property within an index's key, in declared order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexKeyProperty {
    pub property: PropertyId,
    pub order: SortOrder,
}

/// A unified index descriptor covering both hash and sorted variants (see
/// spec.md §9 "pick the superset" redesign guidance): the source repository
/// interleaves hash-only and hash+sorted descriptor variants; this type
/// collapses them into one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub class_id: ClassId,
    pub unique: bool,
    pub kind: IndexKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IndexKind {
    Hash {
        properties: Vec<PropertyId>,
    },
    Sorted {
        properties: Vec<IndexKeyProperty>,
        /// `None` means ordinal comparison (no culture declared).
        culture: Option<String>,
        case_sensitivity: CaseSensitivity,
    },
}

impl IndexDescriptor {
    pub fn property_count(&self) -> usize {
        match &self.kind {
            IndexKind::Hash { properties } => properties.len(),
            IndexKind::Sorted { properties, .. } => properties.len(),
        }
    }

    /// Validates the §8 boundary: at most 4 indexed properties.
    pub fn validate(&self) -> crate::error::CResult<()> {
        if self.property_count() > MAX_INDEXED_PROPERTIES || self.property_count() == 0 {
            return Err(crate::error::Error::SchemaMismatch(format!(
                "index {} covers {} properties, must be in 1..={}",
                self.name,
                self.property_count(),
                MAX_INDEXED_PROPERTIES
            )));
        }
        Ok(())
    }
}
