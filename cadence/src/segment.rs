use std::collections::HashMap;
use std::rc::Rc;

use cadence_bytecode::{BytecodeObject, CallDescriptor, LiteralDescriptor, Section};

use crate::{DataCell, Descriptor, Heap, InterpreterError, InterpreterResult, VirtualTable, Visitor};

/// A loaded bytecode object plus its mutable per-load state.
#[derive(Debug)]
pub struct BytecodeSegment {
    index: u32,
    object: BytecodeObject,
    statics: Vec<DataCell>,
    instances: Vec<DataCell>,
    enums: Vec<DataCell>,
    vtables: HashMap<(Section, u32), Rc<VirtualTable>, ahash::RandomState>,
}

impl BytecodeSegment {
    fn new(index: u32, object: BytecodeObject) -> Self {
        Self {
            index,
            statics: vec![DataCell::Invalid; object.statics.len()],
            instances: vec![DataCell::Invalid; object.instances.len()],
            enums: vec![DataCell::Invalid; object.enums.len()],
            object,
            vtables: HashMap::default(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn object(&self) -> &BytecodeObject {
        &self.object
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.object.bytecode
    }
}

/// Slot tables addressed by load and store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTable {
    Static,
    Instance,
    Enum,
}

#[derive(Debug, Default)]
pub struct SegmentManager {
    segments: Vec<BytecodeSegment>,
}

impl SegmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, object: BytecodeObject) -> u32 {
        let index = self.segments.len() as u32;
        log::debug!("loaded segment {index} ({})", object.name);
        self.segments.push(BytecodeSegment::new(index, object));
        index
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: u32) -> InterpreterResult<&BytecodeSegment> {
        self.segments
            .get(index as usize)
            .ok_or_else(|| InterpreterError::invariant(format!("no segment {index}")))
    }

    fn segment_mut(&mut self, index: u32) -> InterpreterResult<&mut BytecodeSegment> {
        self.segments
            .get_mut(index as usize)
            .ok_or_else(|| InterpreterError::invariant(format!("no segment {index}")))
    }

    /// Check that `address` names an entry of `section` in `segment`.
    pub fn resolve_descriptor(
        &self,
        segment: u32,
        section: Section,
        address: u32,
    ) -> InterpreterResult<Descriptor> {
        if !self.segment(segment)?.object.has_descriptor(section, address) {
            return Err(InterpreterError::missing(format!(
                "no {section:?} descriptor #{address} in segment {segment}"
            )));
        }
        Ok(Descriptor::new(section, segment, address))
    }

    pub fn call(&self, segment: u32, address: u32) -> InterpreterResult<&CallDescriptor> {
        self.segment(segment)?
            .object
            .calls
            .get(address as usize)
            .ok_or_else(|| {
                InterpreterError::missing(format!("no call #{address} in segment {segment}"))
            })
    }

    pub fn literal(&self, segment: u32, address: u32) -> InterpreterResult<&LiteralDescriptor> {
        self.segment(segment)?
            .object
            .literals
            .get(address as usize)
            .ok_or_else(|| {
                InterpreterError::missing(format!("no literal #{address} in segment {segment}"))
            })
    }

    /// Virtual table of a class-like descriptor, built on first use.
    pub fn resolve_vtable(
        &mut self,
        descriptor: Descriptor,
    ) -> InterpreterResult<Rc<VirtualTable>> {
        let key = (descriptor.section, descriptor.address);
        if let Some(vt) = self.segment(descriptor.segment)?.vtables.get(&key) {
            return Ok(vt.clone());
        }

        let class = {
            let object = &self.segment(descriptor.segment)?.object;
            let table = object.class_table(descriptor.section).ok_or_else(|| {
                InterpreterError::new(
                    crate::InterpreterCondition::InvalidOperandTypeV1,
                    format!("{:?} is not a class-like section", descriptor.section),
                )
            })?;
            table.get(descriptor.address as usize).cloned().ok_or_else(|| {
                InterpreterError::missing(format!(
                    "no {:?} descriptor #{}",
                    descriptor.section, descriptor.address
                ))
            })?
        };

        let parent = match class.superclass {
            Some(address) if address == descriptor.address => {
                return Err(InterpreterError::invariant(format!(
                    "{} is its own superclass",
                    class.name
                )));
            }
            Some(address) => Some(self.resolve_vtable(Descriptor { address, ..descriptor })?),
            None => None,
        };

        let vtable = Rc::new(VirtualTable::build(descriptor, &class, parent));
        log::trace!("built vtable for {}", vtable.name());
        self.segment_mut(descriptor.segment)?
            .vtables
            .insert(key, vtable.clone());
        Ok(vtable)
    }

    fn slots(&self, segment: u32, table: SlotTable) -> InterpreterResult<&[DataCell]> {
        let s = self.segment(segment)?;
        Ok(match table {
            SlotTable::Static => &s.statics,
            SlotTable::Instance => &s.instances,
            SlotTable::Enum => &s.enums,
        })
    }

    /// Current value of a slot; `Invalid` means not yet initialised.
    pub fn load_slot(
        &self,
        segment: u32,
        table: SlotTable,
        address: u32,
    ) -> InterpreterResult<DataCell> {
        self.slots(segment, table)?
            .get(address as usize)
            .copied()
            .ok_or_else(|| {
                InterpreterError::missing(format!(
                    "no {table:?} slot #{address} in segment {segment}"
                ))
            })
    }

    pub fn store_slot(
        &mut self,
        segment: u32,
        table: SlotTable,
        address: u32,
        value: DataCell,
    ) -> InterpreterResult<()> {
        let s = self.segment_mut(segment)?;
        let slots = match table {
            SlotTable::Static => &mut s.statics,
            SlotTable::Instance => &mut s.instances,
            SlotTable::Enum => &mut s.enums,
        };
        let slot = slots.get_mut(address as usize).ok_or_else(|| {
            InterpreterError::missing(format!("no {table:?} slot #{address} in segment {segment}"))
        })?;
        *slot = value;
        Ok(())
    }

    /// Type descriptor of a value.
    pub fn type_of(
        &self,
        segment: u32,
        heap: &Heap,
        value: &DataCell,
    ) -> InterpreterResult<DataCell> {
        let intrinsics = &self.segment(segment)?.object.intrinsics;
        let (type_segment, address) = match value {
            DataCell::Nil => (segment, intrinsics.nil),
            DataCell::Undef => (segment, intrinsics.undef),
            DataCell::Bool(_) => (segment, intrinsics.bool),
            DataCell::I64(_) => (segment, intrinsics.i64),
            DataCell::Dbl(_) => (segment, intrinsics.dbl),
            DataCell::Chr(_) => (segment, intrinsics.chr),
            DataCell::Ref(r) => {
                let object = heap.get(*r)?;
                let vtable = object.vtable().ok_or_else(|| {
                    InterpreterError::invariant(format!("{} has no type", object.kind()))
                })?;
                (vtable.segment(), vtable.type_address())
            }
            DataCell::Descriptor(d) if d.section == Section::Type => {
                return Err(InterpreterError::invariant("type descriptor has no type"));
            }
            other => {
                return Err(InterpreterError::invariant(format!(
                    "{} value has no type",
                    other.type_name()
                )));
            }
        };
        let address = address.ok_or_else(|| {
            InterpreterError::missing(format!("no type for {} value", value.type_name()))
        })?;
        Ok(DataCell::Descriptor(self.resolve_descriptor(
            type_segment,
            Section::Type,
            address,
        )?))
    }

    /// 0 when equal, -1 when `lhs` extends `rhs`, 1 otherwise.
    pub fn compare_types(&self, lhs: Descriptor, rhs: Descriptor) -> InterpreterResult<i64> {
        if lhs == rhs {
            return Ok(0);
        }
        let types = &self.segment(lhs.segment)?.object.types;
        let mut current = types.get(lhs.address as usize).and_then(|t| t.supertype);
        let mut steps = 0;
        while let Some(address) = current {
            if lhs.segment == rhs.segment && address == rhs.address {
                return Ok(-1);
            }
            steps += 1;
            if steps > types.len() {
                return Err(InterpreterError::invariant("cyclic supertype chain"));
            }
            current = types.get(address as usize).and_then(|t| t.supertype);
        }
        Ok(1)
    }

    pub fn visit_roots(&self, visitor: &mut dyn Visitor) {
        for segment in &self.segments {
            visitor.visit_all(&segment.statics);
            visitor.visit_all(&segment.instances);
            visitor.visit_all(&segment.enums);
        }
    }
}

#[cfg(test)]
mod tests {
    use cadence_bytecode::{ClassDescriptor, ObjectBuilder};

    use super::*;

    fn segments() -> (SegmentManager, u32) {
        let mut ob = ObjectBuilder::new("types");
        let any = ob.add_type("Any", None);
        let num = ob.add_type("Num", Some(any));
        ob.add_type("Int", Some(num));
        ob.intrinsics_mut().i64 = Some(2);
        let base = ob.add_class(Section::Class, ClassDescriptor {
            name: "Base".into(),
            type_address: Some(any),
            fields: vec![0],
            ..Default::default()
        });
        ob.add_class(Section::Class, ClassDescriptor {
            name: "Derived".into(),
            superclass: Some(base),
            fields: vec![1],
            ..Default::default()
        });
        ob.add_static("counter", None);
        let mut manager = SegmentManager::new();
        let index = manager.load(ob.finish());
        (manager, index)
    }

    #[test]
    fn vtables_are_cached_and_chained() {
        let (mut m, seg) = segments();
        let derived = Descriptor::new(Section::Class, seg, 1);
        let a = m.resolve_vtable(derived).unwrap();
        let b = m.resolve_vtable(derived).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.parent().map(|p| p.name()), Some("Base"));
        assert_eq!(a.num_fields(), 2);
        assert_eq!(a.type_address(), Some(0));
        assert!(m.resolve_vtable(Descriptor::new(Section::Call, seg, 0)).is_err());
    }

    #[test]
    fn type_comparison_walks_supertypes() {
        let (m, seg) = segments();
        let t = |a| Descriptor::new(Section::Type, seg, a);
        assert_eq!(m.compare_types(t(2), t(2)), Ok(0));
        assert_eq!(m.compare_types(t(2), t(0)), Ok(-1));
        assert_eq!(m.compare_types(t(0), t(2)), Ok(1));
    }

    #[test]
    fn scalar_types_come_from_intrinsics() {
        let (m, seg) = segments();
        let heap = Heap::default();
        assert_eq!(
            m.type_of(seg, &heap, &DataCell::I64(1)),
            Ok(DataCell::Descriptor(Descriptor::new(Section::Type, seg, 2)))
        );
        let err = m.type_of(seg, &heap, &DataCell::Bool(true)).unwrap_err();
        assert_eq!(err.condition, crate::InterpreterCondition::MissingDescriptor);
    }

    #[test]
    fn slots_start_empty() {
        let (mut m, seg) = segments();
        assert_eq!(m.load_slot(seg, SlotTable::Static, 0), Ok(DataCell::Invalid));
        m.store_slot(seg, SlotTable::Static, 0, DataCell::I64(7)).unwrap();
        assert_eq!(m.load_slot(seg, SlotTable::Static, 0), Ok(DataCell::I64(7)));
        assert!(m.load_slot(seg, SlotTable::Enum, 0).is_err());
    }
}
