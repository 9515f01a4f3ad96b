use std::rc::Rc;

use crate::object::impl_any;
use crate::{
    DataCell, HeapObject, InterpreterError, InterpreterResult, ObjectKind, VirtualTable, Visitor,
};

use super::stable_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    Mutable,
    /// A slot may be written only while it holds no value yet.
    SetOnce,
}

/// Plain object whose slots follow its vtable's field layout.
///
/// Object and Singleton fields are mutable; Record, Category and Status
/// fields are written once, normally by the constructor.
#[derive(Debug)]
pub struct FieldsObject {
    kind: ObjectKind,
    vtable: Rc<VirtualTable>,
    slots: Vec<DataCell>,
}

impl FieldsObject {
    pub fn new(kind: ObjectKind, vtable: Rc<VirtualTable>) -> Self {
        debug_assert!(matches!(
            kind,
            ObjectKind::Object
                | ObjectKind::Record
                | ObjectKind::Category
                | ObjectKind::Singleton
                | ObjectKind::Status
        ));
        Self {
            kind,
            slots: vec![DataCell::Invalid; vtable.num_fields()],
            vtable,
        }
    }

    pub fn policy(&self) -> FieldPolicy {
        match self.kind {
            ObjectKind::Object | ObjectKind::Singleton => FieldPolicy::Mutable,
            _ => FieldPolicy::SetOnce,
        }
    }

    pub fn slots(&self) -> &[DataCell] {
        &self.slots
    }

    fn slot_index(&self, field: u32) -> InterpreterResult<usize> {
        self.vtable.field_index(field).ok_or_else(|| {
            InterpreterError::missing(format!(
                "{} has no field #{field}",
                self.vtable.name()
            ))
        })
    }
}

impl HeapObject for FieldsObject {
    fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        Some(&self.vtable)
    }

    fn get_field(&self, field: u32) -> InterpreterResult<DataCell> {
        let index = self.slot_index(field)?;
        Ok(self.slots[index])
    }

    fn set_field(&mut self, field: u32, value: DataCell) -> InterpreterResult<DataCell> {
        let index = self.slot_index(field)?;
        let current = self.slots[index];
        if self.policy() == FieldPolicy::SetOnce
            && !matches!(current, DataCell::Invalid | DataCell::Undef)
        {
            return Err(InterpreterError::receiver(format!(
                "field #{field} of {} {} is already set",
                self.kind,
                self.vtable.name()
            )));
        }
        self.slots[index] = value;
        Ok(current)
    }

    fn describe(&self) -> String {
        let fields: Vec<String> = self.slots.iter().map(ToString::to_string).collect();
        format!("{}({})", self.vtable.name(), fields.join(", "))
    }

    fn equals(&self, other: &dyn HeapObject) -> bool {
        other.downcast_ref::<FieldsObject>().is_some_and(|o| {
            self.slots.len() == o.slots.len()
                && self.slots.iter().zip(&o.slots).all(|(a, b)| a.bit_eq(b))
        })
    }

    /// Records compare by content; every other kind by identity.
    fn hash_value(&self) -> Option<u64> {
        (self.kind == ObjectKind::Record)
            .then(|| stable_hash(self.slots.iter().map(DataCell::raw_bits).collect::<Vec<_>>()))
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor) {
        visitor.visit_all(&self.slots);
    }

    impl_any!();
}
