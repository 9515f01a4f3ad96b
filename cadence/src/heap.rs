use bitflags::bitflags;

use crate::{
    DataCell, HeapObject, HeapRef, InterpreterError, InterpreterResult, RootProvider, Visitor,
};

#[derive(Debug, Default, Clone)]
pub struct HeapCreateInfo {
    pub initial_capacity: Option<usize>,
    /// Allocations between automatic collections; 0 disables them.
    pub collect_threshold: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSettings {
    pub initial_capacity: usize,
    pub collect_threshold: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            collect_threshold: 100_000,
        }
    }
}

impl HeapSettings {
    pub fn from_create_info(info: &HeapCreateInfo) -> Self {
        let default = Self::default();
        Self {
            initial_capacity: info.initial_capacity.unwrap_or(default.initial_capacity),
            collect_threshold: info.collect_threshold.unwrap_or(default.collect_threshold),
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SlotFlags: u8 {
        const REACHABLE = 1 << 0;
    }
}

#[derive(Debug)]
struct HeapSlot {
    generation: u32,
    flags: SlotFlags,
    object: Option<Box<dyn HeapObject>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GarbageCollectionStats {
    pub live_before: usize,
    pub freed: usize,
    pub live_after: usize,
}

/// Arena of heap objects addressed by generation-checked [`HeapRef`]s.
///
/// A freed slot bumps its generation before it is reused, so a stale
/// reference is detected instead of aliasing the new occupant.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,
    live: usize,
    allocated_since_collect: usize,
    settings: HeapSettings,
}

/// Collects the references a visited object holds.
struct Worklist(Vec<HeapRef>);

impl Visitor for Worklist {
    fn visit(&mut self, cell: &DataCell) {
        if let DataCell::Ref(r) = cell {
            self.0.push(*r);
        }
    }
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        Self {
            slots: Vec::with_capacity(settings.initial_capacity),
            free: Vec::new(),
            live: 0,
            allocated_since_collect: 0,
            settings,
        }
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn allocate<T: HeapObject>(&mut self, object: T) -> HeapRef {
        self.allocate_boxed(Box::new(object))
    }

    pub fn allocate_boxed(&mut self, object: Box<dyn HeapObject>) -> HeapRef {
        self.live += 1;
        self.allocated_since_collect += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.flags = SlotFlags::empty();
            slot.object = Some(object);
            return HeapRef::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(HeapSlot {
            generation: 0,
            flags: SlotFlags::empty(),
            object: Some(object),
        });
        HeapRef::new(index, 0)
    }

    fn slot(&self, r: HeapRef) -> Option<&HeapSlot> {
        self.slots
            .get(r.index() as usize)
            .filter(|s| s.generation == r.generation() && s.object.is_some())
    }

    fn slot_mut(&mut self, r: HeapRef) -> Option<&mut HeapSlot> {
        self.slots
            .get_mut(r.index() as usize)
            .filter(|s| s.generation == r.generation() && s.object.is_some())
    }

    pub fn contains(&self, r: HeapRef) -> bool {
        self.slot(r).is_some()
    }

    pub fn get(&self, r: HeapRef) -> InterpreterResult<&dyn HeapObject> {
        self.slot(r)
            .and_then(|s| s.object.as_deref())
            .ok_or_else(|| stale(r))
    }

    pub fn get_mut(&mut self, r: HeapRef) -> InterpreterResult<&mut dyn HeapObject> {
        match self.slot_mut(r).and_then(|s| s.object.as_mut()) {
            Some(object) => Ok(object.as_mut()),
            None => Err(stale(r)),
        }
    }

    /// Typed access; a kind mismatch is an invalid receiver.
    pub fn get_as<T: HeapObject>(&self, r: HeapRef) -> InterpreterResult<&T> {
        let object = self.get(r)?;
        let kind = object.kind();
        object.downcast_ref::<T>().ok_or_else(|| {
            InterpreterError::receiver(format!(
                "expected {}, found {kind}",
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn get_as_mut<T: HeapObject>(&mut self, r: HeapRef) -> InterpreterResult<&mut T> {
        let object = self.get_mut(r)?;
        let kind = object.kind();
        object.downcast_mut::<T>().ok_or_else(|| {
            InterpreterError::receiver(format!(
                "expected {}, found {kind}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Whether enough allocation happened since the last collection.
    pub fn should_collect(&self) -> bool {
        self.settings.collect_threshold != 0
            && self.allocated_since_collect >= self.settings.collect_threshold
    }

    pub fn is_reachable(&self, r: HeapRef) -> bool {
        self.slot(r)
            .is_some_and(|s| s.flags.contains(SlotFlags::REACHABLE))
    }

    /// First phase: unmark every object.
    pub fn clear_reachable(&mut self) {
        let mut members = Worklist(Vec::new());
        for slot in &mut self.slots {
            if let Some(object) = &slot.object {
                slot.flags.remove(SlotFlags::REACHABLE);
                object.clear_members_reachable(&mut members);
            }
        }
        for r in members.0 {
            if let Some(slot) = self.slot_mut(r) {
                slot.flags.remove(SlotFlags::REACHABLE);
            }
        }
    }

    /// Second phase: mark `cell` and everything it reaches.
    pub fn set_reachable(&mut self, cell: &DataCell) {
        let mut worklist = Worklist(Vec::new());
        worklist.visit(cell);
        while let Some(r) = worklist.0.pop() {
            let Some(slot) = self.slot_mut(r) else {
                log::warn!("stale reference {}.{} during marking", r.index(), r.generation());
                continue;
            };
            if slot.flags.contains(SlotFlags::REACHABLE) {
                continue;
            }
            slot.flags.insert(SlotFlags::REACHABLE);
            if let Some(object) = &slot.object {
                object.set_members_reachable(&mut worklist);
            }
        }
    }

    /// Drop every unmarked object and recycle its slot.
    pub fn delete_unreachable(&mut self) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_some() && !slot.flags.contains(SlotFlags::REACHABLE) {
                slot.object = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                freed += 1;
            }
        }
        self.live -= freed;
        freed
    }

    /// Full reachability pass from `roots` followed by a sweep.
    pub fn collect(&mut self, roots: &dyn RootProvider) -> GarbageCollectionStats {
        let live_before = self.live;
        self.clear_reachable();
        roots.visit_roots(&mut |cell: &DataCell| self.set_reachable(cell));
        let freed = self.delete_unreachable();
        self.allocated_since_collect = 0;
        let stats = GarbageCollectionStats {
            live_before,
            freed,
            live_after: self.live,
        };
        log::debug!("garbage collection: {stats:?}");
        stats
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(HeapSettings::default())
    }
}

fn stale(r: HeapRef) -> InterpreterError {
    InterpreterError::invariant(format!(
        "stale heap reference {}.{}",
        r.index(),
        r.generation()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{
        ClosureObject, FutureObject, MapIterator, MapObject, PairObject, SeqIterator, SeqObject,
        StringObject,
    };
    use crate::rope::PersistentSeq;
    use crate::trie::PersistentMap;
    use crate::{Promise, PromiseState};

    struct Roots(Vec<DataCell>);

    impl RootProvider for Roots {
        fn visit_roots(&self, visitor: &mut dyn Visitor) {
            visitor.visit_all(&self.0);
        }
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::default();
        let kept = heap.allocate(StringObject::new("kept"));
        let dropped = heap.allocate(StringObject::new("dropped"));
        let pair = heap.allocate(PairObject::new(None, kept.into(), DataCell::Nil));

        let stats = heap.collect(&Roots(vec![pair.into()]));
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.live_after, 2);
        assert!(heap.contains(kept));
        assert!(!heap.contains(dropped));
    }

    #[test]
    fn stale_reference_is_an_invariant_error() {
        let mut heap = Heap::default();
        let r = heap.allocate(StringObject::new("x"));
        heap.collect(&Roots(Vec::new()));
        let reused = heap.allocate(StringObject::new("y"));

        assert_eq!(reused.index(), r.index());
        assert_ne!(reused.generation(), r.generation());
        let err = heap.get(r).unwrap_err();
        assert_eq!(err.condition, crate::InterpreterCondition::RuntimeInvariant);
    }

    #[test]
    fn cycles_are_marked_once() {
        let mut heap = Heap::default();
        let a = heap.allocate(PairObject::new(None, DataCell::Invalid, DataCell::Invalid));
        let b = heap.allocate(PairObject::new(None, a.into(), DataCell::Nil));
        heap.get_as_mut::<PairObject>(a)
            .unwrap()
            .set_slot(0, b.into())
            .unwrap();

        let stats = heap.collect(&Roots(vec![a.into()]));
        assert_eq!(stats.freed, 0);
        assert!(heap.is_reachable(b));
    }

    /// `hold` builds an object that reaches a fresh string only through its
    /// own members. The string lives exactly as long as the holder is rooted.
    fn assert_holder_keeps_string(hold: impl FnOnce(&mut Heap, DataCell) -> HeapRef) {
        let mut heap = Heap::default();
        let inner = heap.allocate(StringObject::new("inner"));
        let holder = hold(&mut heap, inner.into());

        let stats = heap.collect(&Roots(vec![holder.into()]));
        assert_eq!(stats.freed, 0);
        assert!(heap.contains(inner));

        heap.collect(&Roots(Vec::new()));
        assert!(!heap.contains(holder));
        assert!(!heap.contains(inner));
        assert_eq!(heap.len(), 0);
    }

    #[test]
    fn map_entries_are_reachable() {
        assert_holder_keeps_string(|heap, inner| {
            let map = PersistentMap::new().update(&*heap, DataCell::I64(1), inner);
            heap.allocate(MapObject::new(None, map))
        });
        assert_holder_keeps_string(|heap, inner| {
            let map = PersistentMap::new().update(&*heap, inner, DataCell::Nil);
            heap.allocate(MapObject::new(None, map))
        });
    }

    #[test]
    fn seq_elements_are_reachable() {
        assert_holder_keeps_string(|heap, inner| {
            let seq = PersistentSeq::from_values(vec![DataCell::I64(0)])
                .append(vec![inner, DataCell::Nil]);
            heap.allocate(SeqObject::new(None, seq))
        });
    }

    #[test]
    fn closure_lexicals_are_reachable() {
        assert_holder_keeps_string(|heap, inner| {
            heap.allocate(ClosureObject::new(None, 0, 0, vec![DataCell::I64(1), inner]))
        });
    }

    #[test]
    fn settled_future_result_is_reachable() {
        assert_holder_keeps_string(|heap, inner| {
            let promise = Promise::new();
            promise.settle(PromiseState::Completed, inner);
            heap.allocate(FutureObject::new(None, promise))
        });
    }

    #[test]
    fn iterators_keep_their_collection() {
        assert_holder_keeps_string(|heap, inner| {
            let snapshot = PersistentMap::new().update(&*heap, DataCell::I64(1), inner);
            let map = heap.allocate(MapObject::new(None, snapshot.clone()));
            heap.allocate(MapIterator::new(None, map, &snapshot))
        });
        assert_holder_keeps_string(|heap, inner| {
            let snapshot = PersistentSeq::from_values(vec![inner]);
            let seq = heap.allocate(SeqObject::new(None, snapshot.clone()));
            heap.allocate(SeqIterator::new(None, seq, snapshot))
        });
    }

    #[test]
    fn threshold_zero_never_collects() {
        let mut heap = Heap::new(HeapSettings {
            initial_capacity: 0,
            collect_threshold: 0,
        });
        for _ in 0..10 {
            heap.allocate(StringObject::new(""));
        }
        assert!(!heap.should_collect());
    }
}
