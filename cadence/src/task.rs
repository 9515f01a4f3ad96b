use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::{DataCell, StackfulCoroutine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Its completion ends the program.
    Main,
    /// Reaped on completion; its result settles the task's promise.
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Waiting,
    Ready,
    Running,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Initial,
    Pending,
    Completed,
    Rejected,
}

/// A value that becomes available later, shared between the scheduler, the
/// `Future` heap object and awaiting tasks.
#[derive(Debug)]
pub struct Promise {
    state: Cell<PromiseState>,
    result: Cell<DataCell>,
    awaiters: RefCell<Vec<TaskId>>,
}

impl Promise {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(PromiseState::Initial),
            result: Cell::new(DataCell::Invalid),
            awaiters: RefCell::new(Vec::new()),
        })
    }

    pub fn state(&self) -> PromiseState {
        self.state.get()
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state(), PromiseState::Completed | PromiseState::Rejected)
    }

    pub fn result(&self) -> DataCell {
        self.result.get()
    }

    /// Mark the promise as attached to an event source.
    pub fn set_pending(&self) {
        if self.state() == PromiseState::Initial {
            self.state.set(PromiseState::Pending);
        }
    }

    /// Settle the promise and hand back the tasks waiting on it. Settling an
    /// already settled promise does nothing.
    pub(crate) fn settle(&self, state: PromiseState, result: DataCell) -> Vec<TaskId> {
        if self.is_settled() {
            log::warn!("promise settled twice; keeping the first result");
            return Vec::new();
        }
        self.state.set(state);
        self.result.set(result);
        std::mem::take(&mut *self.awaiters.borrow_mut())
    }

    pub(crate) fn add_awaiter(&self, task: TaskId) {
        self.awaiters.borrow_mut().push(task);
    }
}

/// A schedulable unit of execution.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    kind: TaskKind,
    state: TaskState,
    coroutine: StackfulCoroutine,
    /// Settled promises whose results are delivered the next time the task
    /// is selected.
    promises: Vec<Rc<Promise>>,
    /// Settled with the task's result when a worker finishes.
    completion: Option<Rc<Promise>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: TaskKind, coroutine: StackfulCoroutine) -> Self {
        Self {
            id,
            kind,
            state: TaskState::Waiting,
            coroutine,
            promises: Vec::new(),
            completion: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub fn coroutine(&self) -> &StackfulCoroutine {
        &self.coroutine
    }

    pub fn coroutine_mut(&mut self) -> &mut StackfulCoroutine {
        &mut self.coroutine
    }

    pub fn completion(&self) -> Option<&Rc<Promise>> {
        self.completion.as_ref()
    }

    pub(crate) fn set_completion(&mut self, promise: Rc<Promise>) {
        self.completion = Some(promise);
    }

    pub(crate) fn attach_promise(&mut self, promise: Rc<Promise>) {
        self.promises.push(promise);
    }

    pub fn has_pending_adapt(&self) -> bool {
        !self.promises.is_empty()
    }

    /// Deliver every attached promise result onto the data stack, in the
    /// order the promises settled.
    pub fn adapt_promises(&mut self) {
        for promise in self.promises.drain(..) {
            log::trace!("{} adapts promise result {}", self.id, promise.result());
            self.coroutine.push_data(promise.result());
        }
    }

    pub(crate) fn promises(&self) -> &[Rc<Promise>] {
        &self.promises
    }
}
