use std::rc::Rc;

use crate::object::impl_any;
use crate::rope::PersistentSeq;
use crate::{DataCell, HeapObject, HeapRef, ObjectKind, VirtualTable, Visitor};

/// Guest `Seq`: a heap handle on one persistent rope snapshot.
#[derive(Debug)]
pub struct SeqObject {
    vtable: Option<Rc<VirtualTable>>,
    seq: PersistentSeq,
}

impl SeqObject {
    pub fn new(vtable: Option<Rc<VirtualTable>>, seq: PersistentSeq) -> Self {
        Self { vtable, seq }
    }

    pub fn seq(&self) -> &PersistentSeq {
        &self.seq
    }

    pub fn set_seq(&mut self, seq: PersistentSeq) {
        self.seq = seq;
    }
}

impl HeapObject for SeqObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Seq
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    fn describe(&self) -> String {
        let items: Vec<String> = self.seq.to_vec().iter().map(ToString::to_string).collect();
        format!("Seq[{}]", items.join(", "))
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor) {
        self.seq.for_each_cell(&mut |cell| visitor.visit(cell));
    }

    impl_any!();
}

#[derive(Debug)]
pub struct SeqIterator {
    vtable: Option<Rc<VirtualTable>>,
    seq: HeapRef,
    snapshot: PersistentSeq,
    position: usize,
}

impl SeqIterator {
    pub fn new(vtable: Option<Rc<VirtualTable>>, seq: HeapRef, snapshot: PersistentSeq) -> Self {
        Self {
            vtable,
            seq,
            snapshot,
            position: 0,
        }
    }

    pub fn valid(&self) -> bool {
        self.position < self.snapshot.len()
    }

    pub fn next_value(&mut self) -> Option<DataCell> {
        let value = self.snapshot.get(self.position as i64)?;
        self.position += 1;
        Some(value)
    }
}

impl HeapObject for SeqIterator {
    fn kind(&self) -> ObjectKind {
        ObjectKind::SeqIterator
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor) {
        visitor.visit(&DataCell::Ref(self.seq));
    }

    impl_any!();
}
