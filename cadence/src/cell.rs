use std::fmt;

use cadence_bytecode::Section;

/// Generation-checked handle to a heap slot.
///
/// Handles are plain values: copying one never keeps the object alive. The
/// heap's reachability pass decides lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef {
    index: u32,
    generation: u32,
}

impl HeapRef {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Reference to an entry in a segment's descriptor tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub section: Section,
    pub segment: u32,
    pub address: u32,
}

impl Descriptor {
    pub const fn new(section: Section, segment: u32, address: u32) -> Self {
        Self {
            section,
            segment,
            address,
        }
    }
}

/// A runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DataCell {
    #[default]
    Invalid,
    Nil,
    Undef,
    Bool(bool),
    I64(i64),
    Dbl(f64),
    Chr(char),
    Descriptor(Descriptor),
    Ref(HeapRef),
}

impl DataCell {
    pub const fn is_valid(&self) -> bool {
        !matches!(self, DataCell::Invalid)
    }

    pub const fn type_name(&self) -> &'static str {
        match self {
            DataCell::Invalid => "invalid",
            DataCell::Nil => "nil",
            DataCell::Undef => "undef",
            DataCell::Bool(_) => "bool",
            DataCell::I64(_) => "i64",
            DataCell::Dbl(_) => "dbl",
            DataCell::Chr(_) => "chr",
            DataCell::Descriptor(_) => "descriptor",
            DataCell::Ref(_) => "ref",
        }
    }

    pub const fn as_ref(&self) -> Option<HeapRef> {
        match self {
            DataCell::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            DataCell::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            DataCell::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Descriptor reference, if it points into `section`.
    pub fn as_descriptor(&self, section: Section) -> Option<Descriptor> {
        match self {
            DataCell::Descriptor(d) if d.section == section => Some(*d),
            _ => None,
        }
    }

    /// Tag plus raw payload bits. Floats compare by bit pattern here, so a
    /// NaN key finds itself.
    pub fn raw_bits(&self) -> (u8, u64) {
        match *self {
            DataCell::Invalid => (0, 0),
            DataCell::Nil => (1, 0),
            DataCell::Undef => (2, 0),
            DataCell::Bool(v) => (3, v as u64),
            DataCell::I64(v) => (4, v as u64),
            DataCell::Dbl(v) => (5, v.to_bits()),
            DataCell::Chr(v) => (6, v as u64),
            DataCell::Descriptor(d) => (
                7,
                ((d.section as u64) << 56) | ((d.segment as u64) << 32) | d.address as u64,
            ),
            DataCell::Ref(r) => (8, ((r.generation as u64) << 32) | r.index as u64),
        }
    }

    pub fn bit_eq(&self, other: &DataCell) -> bool {
        self.raw_bits() == other.raw_bits()
    }
}

impl From<bool> for DataCell {
    fn from(v: bool) -> Self {
        DataCell::Bool(v)
    }
}

impl From<i64> for DataCell {
    fn from(v: i64) -> Self {
        DataCell::I64(v)
    }
}

impl From<f64> for DataCell {
    fn from(v: f64) -> Self {
        DataCell::Dbl(v)
    }
}

impl From<char> for DataCell {
    fn from(v: char) -> Self {
        DataCell::Chr(v)
    }
}

impl From<HeapRef> for DataCell {
    fn from(v: HeapRef) -> Self {
        DataCell::Ref(v)
    }
}

impl fmt::Display for DataCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataCell::Invalid => write!(f, "<invalid>"),
            DataCell::Nil => write!(f, "nil"),
            DataCell::Undef => write!(f, "undef"),
            DataCell::Bool(v) => write!(f, "{v}"),
            DataCell::I64(v) => write!(f, "{v}"),
            DataCell::Dbl(v) => write!(f, "{v:?}"),
            DataCell::Chr(v) => write!(f, "{v:?}"),
            DataCell::Descriptor(d) => {
                write!(f, "<{:?} {}:{}>", d.section, d.segment, d.address)
            }
            DataCell::Ref(r) => write!(f, "<ref {}.{}>", r.index, r.generation),
        }
    }
}
