use std::rc::Rc;

use crate::object::impl_any;
use crate::{
    DataCell, HeapObject, InterpreterError, InterpreterResult, ObjectKind, VirtualTable, Visitor,
};

use super::stable_hash;

/// Exactly two slots, each written at most once.
#[derive(Debug)]
pub struct PairObject {
    vtable: Option<Rc<VirtualTable>>,
    slots: [DataCell; 2],
}

impl PairObject {
    pub fn new(vtable: Option<Rc<VirtualTable>>, first: DataCell, second: DataCell) -> Self {
        Self {
            vtable,
            slots: [first, second],
        }
    }

    pub fn first(&self) -> DataCell {
        self.slots[0]
    }

    pub fn second(&self) -> DataCell {
        self.slots[1]
    }

    pub fn set_slot(&mut self, index: usize, value: DataCell) -> InterpreterResult<()> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| InterpreterError::invariant(format!("pair has no slot {index}")))?;
        if slot.is_valid() {
            return Err(InterpreterError::receiver(format!("pair slot {index} is already set")));
        }
        *slot = value;
        Ok(())
    }

    fn field_slot(&self, field: u32) -> InterpreterResult<usize> {
        match &self.vtable {
            Some(vt) => vt
                .field_index(field)
                .filter(|i| *i < 2)
                .ok_or_else(|| InterpreterError::missing(format!("pair has no field #{field}"))),
            None => Err(InterpreterError::missing(format!("pair has no field #{field}"))),
        }
    }
}

impl HeapObject for PairObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Pair
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    fn get_field(&self, field: u32) -> InterpreterResult<DataCell> {
        Ok(self.slots[self.field_slot(field)?])
    }

    fn set_field(&mut self, field: u32, value: DataCell) -> InterpreterResult<DataCell> {
        let index = self.field_slot(field)?;
        self.set_slot(index, value)?;
        Ok(DataCell::Invalid)
    }

    fn describe(&self) -> String {
        format!("Pair({}, {})", self.slots[0], self.slots[1])
    }

    fn equals(&self, other: &dyn HeapObject) -> bool {
        other.downcast_ref::<PairObject>().is_some_and(|o| {
            self.slots[0].bit_eq(&o.slots[0]) && self.slots[1].bit_eq(&o.slots[1])
        })
    }

    fn hash_value(&self) -> Option<u64> {
        Some(stable_hash((self.slots[0].raw_bits(), self.slots[1].raw_bits())))
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor) {
        visitor.visit_all(&self.slots);
    }

    impl_any!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_set_once() {
        let mut pair = PairObject::new(None, DataCell::Invalid, DataCell::I64(2));
        pair.set_slot(0, DataCell::I64(1)).unwrap();
        assert!(pair.set_slot(0, DataCell::I64(9)).is_err());
        assert!(pair.set_slot(1, DataCell::I64(9)).is_err());
        assert_eq!(pair.first(), DataCell::I64(1));
        assert_eq!(pair.describe(), "Pair(1, 2)");
    }
}
