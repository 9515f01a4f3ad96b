//! Cooperative task scheduler and its event sources.
//!
//! Everything here runs on the interpreter's thread except [`AsyncHandle`],
//! which other threads use to settle a promise. Completions from those
//! threads are queued and only applied by [`SystemScheduler::poll`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{
    DataCell, InterpreterError, InterpreterResult, Promise, PromiseState, StackfulCoroutine, Task,
    TaskId, TaskKind, TaskState,
};

#[derive(Debug)]
struct AsyncCompletion {
    id: u64,
    state: PromiseState,
    value: DataCell,
}

#[derive(Debug, Default)]
struct AsyncQueue {
    completions: Mutex<Vec<AsyncCompletion>>,
    signal: Condvar,
}

/// Settles one registered promise from any thread.
///
/// Only scalar payloads are meaningful: heap references belong to the
/// interpreter's thread.
#[derive(Debug, Clone)]
pub struct AsyncHandle {
    id: u64,
    queue: Arc<AsyncQueue>,
}

impl AsyncHandle {
    pub fn complete(&self, value: DataCell) {
        self.send(PromiseState::Completed, value);
    }

    pub fn reject(&self, value: DataCell) {
        self.send(PromiseState::Rejected, value);
    }

    fn send(&self, state: PromiseState, value: DataCell) {
        self.queue.completions.lock().push(AsyncCompletion {
            id: self.id,
            state,
            value,
        });
        self.queue.signal.notify_one();
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: Instant,
    id: u64,
}

type WaiterTable = HashMap<u64, Rc<Promise>, ahash::RandomState>;

#[derive(Debug)]
pub struct SystemScheduler {
    tasks: Vec<Option<Task>>,
    /// Slots of reaped workers, reused by `create_task`.
    free_ids: Vec<TaskId>,
    main: TaskId,
    current: Option<TaskId>,
    ready: VecDeque<TaskId>,
    waiting: Vec<TaskId>,
    finished_workers: VecDeque<(TaskId, DataCell)>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_promises: WaiterTable,
    async_queue: Arc<AsyncQueue>,
    async_promises: WaiterTable,
    next_waiter: u64,
}

impl SystemScheduler {
    /// A scheduler holding only the main task, waiting to be resumed.
    pub fn new() -> Self {
        let main = TaskId(0);
        Self {
            tasks: vec![Some(Task::new(main, TaskKind::Main, StackfulCoroutine::new()))],
            free_ids: Vec::new(),
            main,
            current: None,
            ready: VecDeque::new(),
            waiting: vec![main],
            finished_workers: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_promises: WaiterTable::default(),
            async_queue: Arc::new(AsyncQueue::default()),
            async_promises: WaiterTable::default(),
            next_waiter: 0,
        }
    }

    pub fn main_task(&self) -> TaskId {
        self.main
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().flatten()
    }

    pub fn current_coroutine(&self) -> Option<&StackfulCoroutine> {
        self.current
            .and_then(|id| self.task(id))
            .map(Task::coroutine)
    }

    pub fn current_coroutine_mut(&mut self) -> Option<&mut StackfulCoroutine> {
        let id = self.current?;
        self.task_mut(id).map(Task::coroutine_mut)
    }

    pub fn main_coroutine_mut(&mut self) -> Option<&mut StackfulCoroutine> {
        let id = self.main;
        self.task_mut(id).map(Task::coroutine_mut)
    }

    pub fn num_ready(&self) -> usize {
        self.ready.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Promises still held by event sources; their results must survive
    /// collection until delivered.
    pub fn pending_promises(&self) -> impl Iterator<Item = &Rc<Promise>> {
        self.timer_promises
            .values()
            .chain(self.async_promises.values())
            .chain(self.tasks().filter_map(Task::completion))
            .chain(self.tasks().flat_map(|t| t.promises().iter()))
    }

    /// Results of finished workers not yet delivered.
    pub fn finished_results(&self) -> impl Iterator<Item = &DataCell> {
        self.finished_workers.iter().map(|(_, result)| result)
    }

    fn remove_from_queues(&mut self, id: TaskId) {
        self.ready.retain(|t| *t != id);
        self.waiting.retain(|t| *t != id);
        if self.current == Some(id) {
            self.current = None;
        }
    }

    /// New worker task with an empty coroutine, in the waiting state.
    pub fn create_task(&mut self) -> TaskId {
        let id = self.free_ids.pop().unwrap_or(TaskId(self.tasks.len() as u32));
        let task = Some(Task::new(id, TaskKind::Worker, StackfulCoroutine::new()));
        match self.tasks.get_mut(id.0 as usize) {
            Some(slot) => *slot = task,
            None => self.tasks.push(task),
        }
        self.waiting.push(id);
        log::debug!("created {id}");
        id
    }

    /// Move a task to the wait queue.
    pub fn suspend_task(&mut self, id: TaskId) -> InterpreterResult<()> {
        let task = self.task_mut(id).ok_or_else(|| unknown_task(id))?;
        match task.state() {
            TaskState::Waiting => return Ok(()),
            TaskState::Done => {
                return Err(InterpreterError::invariant(format!("{id} is already done")));
            }
            TaskState::Ready | TaskState::Running => task.set_state(TaskState::Waiting),
        }
        self.remove_from_queues(id);
        self.waiting.push(id);
        log::debug!("suspended {id}");
        Ok(())
    }

    /// Move a waiting task to the back of the ready queue.
    pub fn resume_task(&mut self, id: TaskId) -> InterpreterResult<()> {
        let task = self.task_mut(id).ok_or_else(|| unknown_task(id))?;
        if task.state() != TaskState::Waiting {
            return Ok(());
        }
        task.set_state(TaskState::Ready);
        self.waiting.retain(|t| *t != id);
        self.ready.push_back(id);
        log::debug!("resumed {id}");
        Ok(())
    }

    /// Put the running task at the back of the ready queue.
    pub fn yield_current(&mut self) {
        if let Some(id) = self.current.take() {
            if let Some(task) = self.task_mut(id) {
                task.set_state(TaskState::Ready);
            }
            self.ready.push_back(id);
        }
    }

    /// Finish a task. A worker's result is delivered to its promise on the
    /// next poll.
    pub fn terminate_task(&mut self, id: TaskId, result: DataCell) -> InterpreterResult<()> {
        let task = self.task_mut(id).ok_or_else(|| unknown_task(id))?;
        task.set_state(TaskState::Done);
        let kind = task.kind();
        self.remove_from_queues(id);
        log::debug!("terminated {id} with {result}");
        if kind == TaskKind::Worker {
            self.finished_workers.push_back((id, result));
            self.async_queue.signal.notify_one();
        }
        Ok(())
    }

    /// Choose the task to run next.
    ///
    /// With no current task the head of the ready queue is taken. A current
    /// task keeps running while nothing else is ready; otherwise it goes to
    /// the back of the queue and the head runs.
    pub fn select_next_ready(&mut self) -> Option<TaskId> {
        if let Some(current) = self.current {
            if self.ready.is_empty() {
                return Some(current);
            }
            if let Some(task) = self.task_mut(current) {
                task.set_state(TaskState::Ready);
            }
            self.ready.push_back(current);
        }
        let next = self.ready.pop_front();
        if let Some(id) = next {
            if let Some(task) = self.task_mut(id) {
                task.set_state(TaskState::Running);
            }
            log::trace!("selected {id}");
        }
        self.current = next;
        next
    }

    /// Settle `promise` and wake the tasks awaiting it.
    pub fn settle_promise(
        &mut self,
        promise: &Rc<Promise>,
        state: PromiseState,
        value: DataCell,
    ) -> InterpreterResult<()> {
        for id in promise.settle(state, value) {
            if let Some(task) = self.task_mut(id) {
                task.attach_promise(promise.clone());
            }
            self.resume_task(id)?;
        }
        Ok(())
    }

    /// Suspend `id` until `promise` settles. Returns `false` when the
    /// promise is already settled and the task keeps running.
    pub fn await_promise(&mut self, id: TaskId, promise: &Rc<Promise>) -> InterpreterResult<bool> {
        if promise.is_settled() {
            return Ok(false);
        }
        promise.add_awaiter(id);
        self.suspend_task(id)?;
        Ok(true)
    }

    /// Promise settled with the result of worker `id` once it finishes.
    pub fn register_worker(&mut self, id: TaskId) -> InterpreterResult<Rc<Promise>> {
        let promise = Promise::new();
        promise.set_pending();
        self.task_mut(id)
            .ok_or_else(|| unknown_task(id))?
            .set_completion(promise.clone());
        Ok(promise)
    }

    /// Complete `promise` with nil after `delay`.
    pub fn register_timer(&mut self, delay: Duration, promise: Rc<Promise>) {
        let id = self.next_waiter();
        promise.set_pending();
        self.timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + delay,
            id,
        }));
        self.timer_promises.insert(id, promise);
    }

    /// Handle through which another thread settles `promise`.
    pub fn register_async(&mut self, promise: Rc<Promise>) -> AsyncHandle {
        let id = self.next_waiter();
        promise.set_pending();
        self.async_promises.insert(id, promise);
        AsyncHandle {
            id,
            queue: self.async_queue.clone(),
        }
    }

    fn next_waiter(&mut self) -> u64 {
        self.next_waiter += 1;
        self.next_waiter
    }

    /// Process every event that is ready now. Returns the number of events
    /// processed.
    pub fn poll(&mut self) -> InterpreterResult<usize> {
        let mut processed = 0;

        while let Some((id, result)) = self.finished_workers.pop_front() {
            if let Some(task) = self.tasks.get_mut(id.0 as usize).and_then(Option::take) {
                self.free_ids.push(id);
                if let Some(promise) = task.completion() {
                    let promise = promise.clone();
                    self.settle_promise(&promise, PromiseState::Completed, result)?;
                }
            }
            processed += 1;
        }

        let now = Instant::now();
        while self.timers.peek().is_some_and(|t| t.0.deadline <= now) {
            let Some(Reverse(entry)) = self.timers.pop() else {
                break;
            };
            if let Some(promise) = self.timer_promises.remove(&entry.id) {
                self.settle_promise(&promise, PromiseState::Completed, DataCell::Nil)?;
            }
            processed += 1;
        }

        let completions = std::mem::take(&mut *self.async_queue.completions.lock());
        for completion in completions {
            if let Some(promise) = self.async_promises.remove(&completion.id) {
                self.settle_promise(&promise, completion.state, completion.value)?;
            }
            processed += 1;
        }

        Ok(processed)
    }

    /// Wait until at least one event has been processed. Returns `false`
    /// without waiting when a task is already ready.
    pub fn blocking_poll(&mut self) -> InterpreterResult<bool> {
        if !self.ready.is_empty() {
            return Ok(false);
        }
        if self.waiting.is_empty() {
            return Err(InterpreterError::invariant("no tasks are waiting"));
        }
        loop {
            if self.poll()? > 0 {
                return Ok(true);
            }
            let deadline = self.timers.peek().map(|t| t.0.deadline);
            if deadline.is_none() && self.async_promises.is_empty() {
                return Err(InterpreterError::invariant(
                    "waiting tasks have no event that can wake them",
                ));
            }
            let mut completions = self.async_queue.completions.lock();
            if completions.is_empty() {
                match deadline {
                    Some(deadline) => {
                        self.async_queue.signal.wait_until(&mut completions, deadline);
                    }
                    None => self.async_queue.signal.wait(&mut completions),
                }
            }
        }
    }
}

impl Default for SystemScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_task(id: TaskId) -> InterpreterError {
    InterpreterError::invariant(format!("unknown {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_task_keeps_running_when_alone() {
        let mut s = SystemScheduler::new();
        let main = s.main_task();
        assert_eq!(s.select_next_ready(), None);
        s.resume_task(main).unwrap();
        assert_eq!(s.select_next_ready(), Some(main));
        assert_eq!(s.select_next_ready(), Some(main));
        assert_eq!(s.task(main).unwrap().state(), TaskState::Running);
    }

    #[test]
    fn ready_tasks_rotate() {
        let mut s = SystemScheduler::new();
        let main = s.main_task();
        let worker = s.create_task();
        s.resume_task(main).unwrap();
        s.resume_task(worker).unwrap();
        assert_eq!(s.select_next_ready(), Some(main));
        assert_eq!(s.select_next_ready(), Some(worker));
        assert_eq!(s.task(main).unwrap().state(), TaskState::Ready);
        assert_eq!(s.select_next_ready(), Some(main));
    }

    #[test]
    fn finished_worker_wakes_its_awaiter() {
        let mut s = SystemScheduler::new();
        let main = s.main_task();
        let worker = s.create_task();
        let promise = s.register_worker(worker).unwrap();
        s.resume_task(worker).unwrap();
        assert!(s.await_promise(main, &promise).unwrap());

        assert_eq!(s.select_next_ready(), Some(worker));
        s.terminate_task(worker, DataCell::I64(42)).unwrap();
        assert_eq!(s.current_task(), None);
        assert!(s.task(main).is_some());

        assert!(s.blocking_poll().unwrap());
        assert_eq!(promise.result(), DataCell::I64(42));
        assert!(s.task(worker).is_none());
        assert_eq!(s.select_next_ready(), Some(main));
        let task = s.task_mut(main).unwrap();
        task.adapt_promises();
        assert_eq!(task.coroutine().data(), &[DataCell::I64(42)]);
    }

    #[test]
    fn reaped_worker_slots_are_reused() {
        let mut s = SystemScheduler::new();
        let first = s.create_task();
        let second = s.create_task();
        s.resume_task(first).unwrap();
        assert_eq!(s.select_next_ready(), Some(first));
        s.terminate_task(first, DataCell::Nil).unwrap();
        assert_eq!(s.poll(), Ok(1));
        assert!(s.task(first).is_none());

        let third = s.create_task();
        assert_eq!(third, first);
        assert_eq!(s.task(third).map(Task::state), Some(TaskState::Waiting));
        assert_eq!(s.tasks().count(), 3);
        let fourth = s.create_task();
        assert_ne!(fourth, second);
        assert_eq!(s.tasks().count(), 4);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut s = SystemScheduler::new();
        let main = s.main_task();
        let late = Promise::new();
        let early = Promise::new();
        s.register_timer(Duration::from_millis(20), late.clone());
        s.register_timer(Duration::from_millis(1), early.clone());
        s.await_promise(main, &early).unwrap();

        assert!(s.blocking_poll().unwrap());
        assert!(early.is_settled());
        assert!(!late.is_settled());
        assert_eq!(s.select_next_ready(), Some(main));
    }

    #[test]
    fn async_handle_settles_from_another_thread() {
        let mut s = SystemScheduler::new();
        let main = s.main_task();
        let promise = Promise::new();
        let handle = s.register_async(promise.clone());
        s.await_promise(main, &promise).unwrap();

        let sender = std::thread::spawn(move || handle.complete(DataCell::Dbl(1.5)));
        assert!(s.blocking_poll().unwrap());
        sender.join().unwrap();
        assert_eq!(promise.result(), DataCell::Dbl(1.5));
    }

    #[test]
    fn blocking_poll_without_waiters_fails() {
        let mut s = SystemScheduler::new();
        let main = s.main_task();
        s.resume_task(main).unwrap();
        assert_eq!(s.blocking_poll(), Ok(false));
        s.select_next_ready();
        s.terminate_task(main, DataCell::Nil).unwrap();
        assert!(s.blocking_poll().is_err());
    }

    #[test]
    fn waiting_without_events_is_an_error() {
        let mut s = SystemScheduler::new();
        assert!(s.blocking_poll().is_err());
    }
}
