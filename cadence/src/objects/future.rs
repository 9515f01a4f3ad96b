use std::rc::Rc;

use crate::object::impl_any;
use crate::{HeapObject, ObjectKind, Promise, VirtualTable, Visitor};

/// Guest handle on a host promise.
#[derive(Debug)]
pub struct FutureObject {
    vtable: Option<Rc<VirtualTable>>,
    promise: Rc<Promise>,
}

impl FutureObject {
    pub fn new(vtable: Option<Rc<VirtualTable>>, promise: Rc<Promise>) -> Self {
        Self { vtable, promise }
    }

    pub fn promise(&self) -> &Rc<Promise> {
        &self.promise
    }
}

impl HeapObject for FutureObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Future
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    fn describe(&self) -> String {
        format!("<Future {:?}>", self.promise.state())
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor) {
        visitor.visit(&self.promise.result());
    }

    impl_any!();
}
