use std::rc::Rc;

use crate::object::impl_any;
use crate::trie::{PersistentMap, TrieCursor};
use crate::{DataCell, HeapObject, HeapRef, ObjectKind, VirtualTable, Visitor};

/// Guest `Map`: a heap handle on one persistent trie snapshot.
#[derive(Debug)]
pub struct MapObject {
    vtable: Option<Rc<VirtualTable>>,
    map: PersistentMap,
}

impl MapObject {
    pub fn new(vtable: Option<Rc<VirtualTable>>, map: PersistentMap) -> Self {
        Self { vtable, map }
    }

    pub fn map(&self) -> &PersistentMap {
        &self.map
    }

    /// Replace the snapshot; only constructors do this before the map is
    /// shared.
    pub fn set_map(&mut self, map: PersistentMap) {
        self.map = map;
    }
}

impl HeapObject for MapObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Map
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    fn describe(&self) -> String {
        format!("<Map size={}>", self.map.len())
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor) {
        self.map.for_each_cell(&mut |cell| visitor.visit(cell));
    }

    impl_any!();
}

/// Iterator over a map snapshot. Keeps the map itself reachable.
#[derive(Debug)]
pub struct MapIterator {
    vtable: Option<Rc<VirtualTable>>,
    map: HeapRef,
    cursor: TrieCursor,
}

impl MapIterator {
    pub fn new(vtable: Option<Rc<VirtualTable>>, map: HeapRef, snapshot: &PersistentMap) -> Self {
        Self {
            vtable,
            map,
            cursor: snapshot.iter(),
        }
    }

    pub fn valid(&self) -> bool {
        !self.cursor.is_done()
    }

    /// Next entry, or `None` once exhausted.
    pub fn next_entry(&mut self) -> Option<(DataCell, DataCell)> {
        self.cursor.next()
    }
}

impl HeapObject for MapIterator {
    fn kind(&self) -> ObjectKind {
        ObjectKind::MapIterator
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor) {
        visitor.visit(&DataCell::Ref(self.map));
    }

    impl_any!();
}
