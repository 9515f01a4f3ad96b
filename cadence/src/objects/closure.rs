use std::rc::Rc;

use crate::object::impl_any;
use crate::{DataCell, HeapObject, ObjectKind, VirtualTable, Visitor};

/// Entry point plus the lexical cells captured when the closure was built.
#[derive(Debug)]
pub struct ClosureObject {
    vtable: Option<Rc<VirtualTable>>,
    segment: u32,
    call: u32,
    lexicals: Vec<DataCell>,
}

impl ClosureObject {
    pub fn new(
        vtable: Option<Rc<VirtualTable>>,
        segment: u32,
        call: u32,
        lexicals: Vec<DataCell>,
    ) -> Self {
        Self {
            vtable,
            segment,
            call,
            lexicals,
        }
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    pub fn call(&self) -> u32 {
        self.call
    }

    pub fn lexicals(&self) -> &[DataCell] {
        &self.lexicals
    }
}

impl HeapObject for ClosureObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Closure
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    fn describe(&self) -> String {
        format!(
            "<Closure {}:{} with {} lexicals>",
            self.segment,
            self.call,
            self.lexicals.len()
        )
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor) {
        visitor.visit_all(&self.lexicals);
    }

    impl_any!();
}
