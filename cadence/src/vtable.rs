use std::collections::HashMap;
use std::rc::Rc;

use cadence_bytecode::ClassDescriptor;

use crate::Descriptor;

type LookupTable<K, V> = HashMap<K, V, ahash::RandomState>;

/// Runtime view of a class-like descriptor.
///
/// Tables are flattened at build time: a child starts from a copy of its
/// parent's field layout, methods and concept actions and then appends or
/// overrides its own, so lookups never walk the chain. Only the allocator is
/// inherited lazily.
#[derive(Debug)]
pub struct VirtualTable {
    descriptor: Descriptor,
    name: String,
    parent: Option<Rc<VirtualTable>>,
    type_address: Option<u32>,
    allocator: Option<u32>,
    ctor: Option<u32>,
    fields: LookupTable<u32, usize>,
    methods: LookupTable<u32, u32>,
    actions: LookupTable<(u32, u32), u32>,
}

impl VirtualTable {
    pub fn build(
        descriptor: Descriptor,
        class: &ClassDescriptor,
        parent: Option<Rc<VirtualTable>>,
    ) -> Self {
        let (mut fields, mut methods, mut actions) = match &parent {
            Some(p) => (p.fields.clone(), p.methods.clone(), p.actions.clone()),
            None => Default::default(),
        };

        for field in &class.fields {
            let next = fields.len();
            fields.entry(*field).or_insert(next);
        }
        for binding in &class.methods {
            methods.insert(binding.call, binding.implementation);
        }
        for imp in &class.impls {
            for binding in &imp.actions {
                actions.insert((imp.concept, binding.action), binding.implementation);
            }
        }

        Self {
            descriptor,
            name: class.name.clone(),
            type_address: class
                .type_address
                .or_else(|| parent.as_ref().and_then(|p| p.type_address)),
            parent,
            allocator: class.allocator,
            ctor: class.ctor,
            fields,
            methods,
            actions,
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn segment(&self) -> u32 {
        self.descriptor.segment
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Rc<VirtualTable>> {
        self.parent.as_ref()
    }

    pub fn type_address(&self) -> Option<u32> {
        self.type_address
    }

    /// Allocator trap of the nearest table in the chain that declares one.
    pub fn allocator(&self) -> Option<u32> {
        let mut table = Some(self);
        while let Some(t) = table {
            if let Some(trap) = t.allocator {
                return Some(trap);
            }
            table = t.parent.as_deref();
        }
        None
    }

    pub fn ctor(&self) -> Option<u32> {
        self.ctor
    }

    /// Slot index of a field address in the flattened layout.
    pub fn field_index(&self, field: u32) -> Option<usize> {
        self.fields.get(&field).copied()
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Implementation of a virtual call address.
    pub fn method(&self, call: u32) -> Option<u32> {
        self.methods.get(&call).copied()
    }

    /// Implementation of a concept action.
    pub fn action(&self, concept: u32, action: u32) -> Option<u32> {
        self.actions.get(&(concept, action)).copied()
    }

    /// Whether `self` is `other` or one of its descendants.
    pub fn extends(&self, other: &VirtualTable) -> bool {
        let mut table = Some(self);
        while let Some(t) = table {
            if t.descriptor == other.descriptor {
                return true;
            }
            table = t.parent.as_deref();
        }
        false
    }
}

/// Identity comparison for optional tables. Two tables are the same when
/// they are the same allocation.
pub fn same_vtable(a: Option<&Rc<VirtualTable>>, b: Option<&Rc<VirtualTable>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use cadence_bytecode::{ActionBinding, ImplBinding, MethodBinding, Section};

    use super::*;

    fn base() -> ClassDescriptor {
        ClassDescriptor {
            name: "Base".into(),
            allocator: Some(3),
            fields: vec![10, 11],
            methods: vec![MethodBinding { call: 1, implementation: 2 }],
            impls: vec![ImplBinding {
                concept: 0,
                actions: vec![ActionBinding { action: 5, implementation: 6 }],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn child_extends_parent_layout() {
        let parent = Rc::new(VirtualTable::build(
            Descriptor::new(Section::Class, 0, 0),
            &base(),
            None,
        ));
        let child_desc = ClassDescriptor {
            name: "Child".into(),
            superclass: Some(0),
            fields: vec![12],
            methods: vec![MethodBinding { call: 1, implementation: 7 }],
            ..Default::default()
        };
        let child = VirtualTable::build(
            Descriptor::new(Section::Class, 0, 1),
            &child_desc,
            Some(parent.clone()),
        );

        assert_eq!(child.field_index(10), Some(0));
        assert_eq!(child.field_index(12), Some(2));
        assert_eq!(child.num_fields(), 3);
        assert_eq!(child.method(1), Some(7));
        assert_eq!(parent.method(1), Some(2));
        assert_eq!(child.action(0, 5), Some(6));
        assert_eq!(child.allocator(), Some(3));
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }
}
