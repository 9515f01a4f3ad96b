use crate::{CallCell, DataCell, InstructionPointer, InterpreterError, InterpreterResult, Visitor};

/// Execution state of one task: data stack, call stack and reentrancy guards,
/// plus the instruction pointer register.
#[derive(Debug, Default)]
pub struct StackfulCoroutine {
    data: Vec<DataCell>,
    calls: Vec<CallCell>,
    guards: Vec<usize>,
    ip: Option<InstructionPointer>,
}

impl StackfulCoroutine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ip(&self) -> Option<InstructionPointer> {
        self.ip
    }

    pub fn ip_mut(&mut self) -> Option<&mut InstructionPointer> {
        self.ip.as_mut()
    }

    pub fn transfer_control(&mut self, ip: Option<InstructionPointer>) {
        self.ip = ip;
    }

    // data stack

    pub fn push_data(&mut self, cell: DataCell) {
        self.data.push(cell);
    }

    pub fn pop_data(&mut self) -> InterpreterResult<DataCell> {
        self.data
            .pop()
            .ok_or_else(|| InterpreterError::lhs("data stack is empty"))
    }

    /// Pop `count` values, returned bottom-most first.
    pub fn pop_data_n(&mut self, count: usize) -> InterpreterResult<Vec<DataCell>> {
        if count > self.data.len() {
            return Err(InterpreterError::lhs(format!(
                "expected {count} values on the data stack, found {}",
                self.data.len()
            )));
        }
        let at = self.data.len() - count;
        Ok(self.data.split_off(at))
    }

    fn resolve_offset(&self, offset: isize) -> InterpreterResult<usize> {
        let len = self.data.len() as isize;
        let index = if offset < 0 { len + offset } else { offset };
        if index < 0 || index >= len {
            return Err(InterpreterError::lhs(format!(
                "data stack offset {offset} out of range (size {len})"
            )));
        }
        Ok(index as usize)
    }

    /// Value at `offset`: negative offsets count back from the top (-1 is
    /// the top), others index from the bottom.
    pub fn peek_data_at(&self, offset: isize) -> InterpreterResult<DataCell> {
        Ok(self.data[self.resolve_offset(offset)?])
    }

    pub fn peek_data(&self) -> InterpreterResult<DataCell> {
        self.peek_data_at(-1)
    }

    /// Remove the value at `offset`, addressed as in
    /// [`peek_data_at`](Self::peek_data_at).
    pub fn drop_data_at(&mut self, offset: isize) -> InterpreterResult<DataCell> {
        let index = self.resolve_offset(offset)?;
        Ok(self.data.remove(index))
    }

    pub fn data_stack_size(&self) -> usize {
        self.data.len()
    }

    pub fn resize_data_stack(&mut self, size: usize) {
        self.data.resize(size, DataCell::Invalid);
    }

    pub fn data(&self) -> &[DataCell] {
        &self.data
    }

    // call stack

    pub fn push_call(&mut self, frame: CallCell, ip: InstructionPointer) {
        log::trace!(
            "push call {} of segment {} (depth {})",
            frame.call_index(),
            frame.call_segment(),
            self.calls.len() + 1
        );
        self.calls.push(frame);
        self.ip = Some(ip);
    }

    pub fn pop_call(&mut self) -> InterpreterResult<CallCell> {
        let frame = self
            .calls
            .pop()
            .ok_or_else(|| InterpreterError::invariant("call stack is empty"))?;
        log::trace!("pop call {} (depth {})", frame.call_index(), self.calls.len());
        Ok(frame)
    }

    pub fn peek_call(&self) -> InterpreterResult<&CallCell> {
        self.calls
            .last()
            .ok_or_else(|| InterpreterError::invariant("call stack is empty"))
    }

    pub fn peek_call_mut(&mut self) -> InterpreterResult<&mut CallCell> {
        self.calls
            .last_mut()
            .ok_or_else(|| InterpreterError::invariant("call stack is empty"))
    }

    pub fn call_stack_size(&self) -> usize {
        self.calls.len()
    }

    /// Frames from the top of the call stack down.
    pub fn calls_from_top(&self) -> impl Iterator<Item = &CallCell> {
        self.calls.iter().rev()
    }

    // guard stack

    /// Record the current call depth as a reentrancy boundary.
    pub fn push_guard(&mut self) -> InterpreterResult<()> {
        let guard = self.calls.len();
        if guard == 0 {
            return Err(InterpreterError::invariant("cannot guard an empty call stack"));
        }
        if self.guards.last().is_some_and(|last| *last >= guard) {
            return Err(InterpreterError::invariant(format!(
                "guard {guard} does not exceed the enclosing guard"
            )));
        }
        self.guards.push(guard);
        Ok(())
    }

    pub fn pop_guard(&mut self) -> InterpreterResult<usize> {
        self.guards
            .pop()
            .ok_or_else(|| InterpreterError::invariant("guard stack is empty"))
    }

    pub fn peek_guard(&self) -> Option<usize> {
        self.guards.last().copied()
    }

    /// The innermost guard must not lie above the call stack.
    pub fn check_guard(&self) -> bool {
        self.guards.last().is_none_or(|g| *g <= self.calls.len())
    }

    pub fn guard_stack_size(&self) -> usize {
        self.guards.len()
    }

    pub fn visit_roots(&self, visitor: &mut dyn Visitor) {
        visitor.visit_all(&self.data);
        for frame in &self.calls {
            frame.visit_cells(visitor);
        }
    }

    /// Pop frames until `depth` remain, restoring the data stack and the
    /// instruction pointer each popped frame saved, and drop the guards
    /// above `depth`.
    pub fn unwind_to(&mut self, depth: usize) {
        while self.calls.len() > depth {
            let Some(frame) = self.calls.pop() else {
                break;
            };
            self.data.truncate(frame.stack_guard());
            self.ip = frame.return_ip();
        }
        while self.guards.last().is_some_and(|g| *g > depth) {
            self.guards.pop();
        }
    }

    /// Drop all stacks and the instruction pointer.
    pub fn reset(&mut self) {
        self.data.clear();
        self.calls.clear();
        self.guards.clear();
        self.ip = None;
    }
}
