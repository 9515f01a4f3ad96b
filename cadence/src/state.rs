use cadence_bytecode::BytecodeObject;

use crate::heap::GarbageCollectionStats;
use crate::segment::SegmentManager;
use crate::subroutine::{Activation, push_activation};
use crate::{
    CallCell, DataCell, Heap, HeapObject, InterpreterError, InterpreterResult,
    InterpreterSettings, RootProvider, StackfulCoroutine, SystemScheduler, TaskId, Visitor,
};

/// Everything a running program owns: loaded segments, the heap and the
/// tasks.
///
/// Traps receive the state directly; the dispatch loop itself lives in
/// [`BytecodeInterpreter`](crate::BytecodeInterpreter).
#[derive(Debug)]
pub struct InterpreterState {
    pub(crate) segments: SegmentManager,
    pub(crate) heap: Heap,
    pub(crate) scheduler: SystemScheduler,
    settings: InterpreterSettings,
    /// Nesting of the dispatch loop; 1 while the outermost loop runs.
    pub(crate) depth: usize,
}

/// Roots of a collection: every task's stacks, the segment slots and values
/// held by event sources.
struct StateRoots<'a> {
    segments: &'a SegmentManager,
    scheduler: &'a SystemScheduler,
}

impl RootProvider for StateRoots<'_> {
    fn visit_roots(&self, visitor: &mut dyn Visitor) {
        self.segments.visit_roots(visitor);
        for task in self.scheduler.tasks() {
            task.coroutine().visit_roots(visitor);
        }
        for promise in self.scheduler.pending_promises() {
            visitor.visit(&promise.result());
        }
        for result in self.scheduler.finished_results() {
            visitor.visit(result);
        }
    }
}

impl InterpreterState {
    pub fn new(settings: InterpreterSettings) -> Self {
        Self {
            segments: SegmentManager::new(),
            heap: Heap::new(settings.heap),
            scheduler: SystemScheduler::new(),
            settings,
            depth: 0,
        }
    }

    pub fn settings(&self) -> &InterpreterSettings {
        &self.settings
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn scheduler(&self) -> &SystemScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut SystemScheduler {
        &mut self.scheduler
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Load a segment without running anything.
    pub fn load(&mut self, object: BytecodeObject) -> u32 {
        self.segments.load(object)
    }

    /// Load the main segment and make its entry call the bottom frame of
    /// the main task, which becomes ready.
    pub fn load_main(&mut self, object: BytecodeObject) -> InterpreterResult<u32> {
        let entry = object.entry.ok_or_else(|| {
            InterpreterError::missing(format!("{} has no entry call", object.name))
        })?;
        let segment = self.segments.load(object);
        let main = self.scheduler.main_task();
        let coro = self
            .scheduler
            .main_coroutine_mut()
            .ok_or_else(|| InterpreterError::invariant("main task is gone"))?;
        if coro.call_stack_size() > 0 {
            return Err(InterpreterError::invariant("main task is already loaded"));
        }
        push_activation(&self.segments, coro, Activation::new(segment, entry), Vec::new(), None)?;
        self.scheduler.resume_task(main)?;
        Ok(segment)
    }

    pub fn current_task(&self) -> InterpreterResult<TaskId> {
        self.scheduler
            .current_task()
            .ok_or_else(|| InterpreterError::invariant("no current task"))
    }

    pub fn current_coroutine(&self) -> InterpreterResult<&StackfulCoroutine> {
        self.scheduler
            .current_coroutine()
            .ok_or_else(|| InterpreterError::invariant("no current task"))
    }

    pub fn current_coroutine_mut(&mut self) -> InterpreterResult<&mut StackfulCoroutine> {
        self.scheduler
            .current_coroutine_mut()
            .ok_or_else(|| InterpreterError::invariant("no current task"))
    }

    pub fn current_frame(&self) -> InterpreterResult<&CallCell> {
        self.current_coroutine()?.peek_call()
    }

    /// Push onto the current task's data stack.
    pub fn push_data(&mut self, cell: DataCell) -> InterpreterResult<()> {
        self.current_coroutine_mut()?.push_data(cell);
        Ok(())
    }

    pub fn allocate<T: HeapObject>(&mut self, object: T) -> DataCell {
        DataCell::Ref(self.heap.allocate(object))
    }

    /// Guest-visible text of a value.
    pub fn describe(&self, cell: &DataCell) -> String {
        match cell {
            DataCell::Ref(r) => match self.heap.get(*r) {
                Ok(object) => object.describe(),
                Err(_) => format!("<stale {cell}>"),
            },
            DataCell::Descriptor(d) => self
                .segments
                .segment(d.segment)
                .ok()
                .and_then(|s| s.object().descriptor_name(d.section, d.address))
                .map(|name| format!("<{:?} {name}>", d.section))
                .unwrap_or_else(|| cell.to_string()),
            other => other.to_string(),
        }
    }

    /// Mark from every root and free what was not reached.
    pub fn collect_garbage(&mut self) -> GarbageCollectionStats {
        let roots = StateRoots {
            segments: &self.segments,
            scheduler: &self.scheduler,
        };
        self.heap.collect(&roots)
    }
}

#[cfg(test)]
mod tests {
    use cadence_bytecode::{Instruction, ObjectBuilder, ProcSignature, Section};

    use super::*;
    use crate::objects::{PairObject, StringObject};
    use crate::segment::SlotTable;

    fn program() -> BytecodeObject {
        let mut ob = ObjectBuilder::new("state");
        ob.add_static("kept", None);
        let main = ob.add_call("main", ProcSignature::new(0, 1), |b| b.emit(Instruction::Halt));
        ob.set_entry(main);
        ob.finish()
    }

    #[test]
    fn load_main_readies_the_main_task() {
        let mut state = InterpreterState::new(InterpreterSettings::default());
        let seg = state.load_main(program()).unwrap();
        assert_eq!(state.scheduler().num_ready(), 1);
        let main = state.scheduler().main_task();
        let coro = state.scheduler().task(main).unwrap().coroutine();
        assert_eq!(coro.call_stack_size(), 1);
        assert_eq!(coro.ip().map(|ip| ip.segment), Some(seg));
        assert!(state.load_main(program()).is_err());
    }

    #[test]
    fn collection_keeps_rooted_objects() {
        let mut state = InterpreterState::new(InterpreterSettings::default());
        let seg = state.load_main(program()).unwrap();

        let text = state.allocate(StringObject::new("static"));
        state
            .segments
            .store_slot(seg, SlotTable::Static, 0, text)
            .unwrap();
        let inner = state.allocate(StringObject::new("inner"));
        let pair = state.allocate(PairObject::new(None, inner, DataCell::Nil));
        state.scheduler.main_coroutine_mut().unwrap().push_data(pair);
        let garbage = state.allocate(StringObject::new("garbage"));

        let stats = state.collect_garbage();
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.live_after, 3);
        assert_eq!(state.describe(&text), "static");
        assert!(state.describe(&garbage).starts_with("<stale"));
    }

    #[test]
    fn descriptors_describe_by_name() {
        let mut state = InterpreterState::new(InterpreterSettings::default());
        let seg = state.load_main(program()).unwrap();
        let cell = DataCell::Descriptor(crate::Descriptor::new(Section::Static, seg, 0));
        assert_eq!(state.describe(&cell), "<Static kept>");
        assert_eq!(state.describe(&DataCell::I64(4)), "4");
    }
}
