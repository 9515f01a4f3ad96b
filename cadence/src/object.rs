use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::{DataCell, InterpreterError, InterpreterResult, VirtualTable, Visitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Object,
    Record,
    Category,
    Singleton,
    Status,
    Pair,
    Closure,
    Map,
    MapIterator,
    Seq,
    SeqIterator,
    String,
    Url,
    Bytes,
    Rest,
    Future,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Object => "Object",
            Self::Record => "Record",
            Self::Category => "Category",
            Self::Singleton => "Singleton",
            Self::Status => "Status",
            Self::Pair => "Pair",
            Self::Closure => "Closure",
            Self::Map => "Map",
            Self::MapIterator => "MapIterator",
            Self::Seq => "Seq",
            Self::SeqIterator => "SeqIterator",
            Self::String => "String",
            Self::Url => "Url",
            Self::Bytes => "Bytes",
            Self::Rest => "Rest",
            Self::Future => "Future",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability set every heap-resident value implements.
///
/// Reachability is explicit: an object reports exactly the cells it holds
/// through [`set_members_reachable`](HeapObject::set_members_reachable), and
/// the heap follows them. Nothing is traced behind an object's back.
pub trait HeapObject: fmt::Debug + 'static {
    fn kind(&self) -> ObjectKind;

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        None
    }

    /// Read the slot for a field address, resolved through the vtable layout.
    fn get_field(&self, field: u32) -> InterpreterResult<DataCell> {
        Err(no_fields(self.kind(), field))
    }

    /// Write a field slot and return the previous value.
    fn set_field(&mut self, field: u32, _value: DataCell) -> InterpreterResult<DataCell> {
        Err(no_fields(self.kind(), field))
    }

    /// Guest-visible string form.
    fn describe(&self) -> String {
        match self.vtable() {
            Some(vt) => format!("<{} {}>", self.kind(), vt.name()),
            None => format!("<{}>", self.kind()),
        }
    }

    /// Structural equality against an object of the same kind and vtable.
    /// Only consulted when [`hash_value`](HeapObject::hash_value) is `Some`.
    fn equals(&self, _other: &dyn HeapObject) -> bool {
        false
    }

    /// Hash consistent with [`equals`](HeapObject::equals). `None` means the
    /// object compares by identity.
    fn hash_value(&self) -> Option<u64> {
        None
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor);

    /// Visit the same edges as marking does, for the clearing phase.
    fn clear_members_reachable(&self, visitor: &mut dyn Visitor) {
        self.set_members_reachable(visitor)
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn HeapObject {
    pub fn downcast_ref<T: HeapObject>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: HeapObject>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}

fn no_fields(kind: ObjectKind, field: u32) -> InterpreterError {
    InterpreterError::receiver(format!("{kind} has no field #{field}"))
}

/// Implements the `Any` plumbing of [`HeapObject`].
macro_rules! impl_any {
    () => {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    };
}

pub(crate) use impl_any;
