use std::rc::Rc;

use crate::{DataCell, InterpreterError, InterpreterResult, VirtualTable, Visitor};

/// Position in a proc body of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionPointer {
    pub segment: u32,
    pub offset: usize,
    /// End of the proc body; reaching it is an implicit return.
    pub end: usize,
}

impl InstructionPointer {
    pub fn at_end(&self) -> bool {
        self.offset >= self.end
    }
}

/// One activation.
#[derive(Debug, Clone)]
pub struct CallCell {
    call_index: u32,
    call_segment: u32,
    proc_offset: u32,
    return_ip: Option<InstructionPointer>,
    returns_value: bool,
    /// Data stack height at activation; the callee's values live above it.
    stack_guard: usize,
    arguments: Vec<DataCell>,
    locals: Vec<DataCell>,
    lexicals: Vec<DataCell>,
    rest: Vec<DataCell>,
    receiver: DataCell,
    vtable: Option<Rc<VirtualTable>>,
}

fn slot_error(kind: &str, index: usize, len: usize) -> InterpreterError {
    InterpreterError::invariant(format!("{kind} #{index} out of range (frame has {len})"))
}

impl CallCell {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_index: u32,
        call_segment: u32,
        proc_offset: u32,
        return_ip: Option<InstructionPointer>,
        returns_value: bool,
        stack_guard: usize,
        arguments: Vec<DataCell>,
        num_locals: usize,
        rest: Vec<DataCell>,
    ) -> Self {
        Self {
            call_index,
            call_segment,
            proc_offset,
            return_ip,
            returns_value,
            stack_guard,
            arguments,
            locals: vec![DataCell::Invalid; num_locals],
            lexicals: Vec::new(),
            rest,
            receiver: DataCell::Invalid,
            vtable: None,
        }
    }

    pub fn with_receiver(mut self, receiver: DataCell) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn with_vtable(mut self, vtable: Option<Rc<VirtualTable>>) -> Self {
        self.vtable = vtable;
        self
    }

    pub fn with_lexicals(mut self, lexicals: Vec<DataCell>) -> Self {
        self.lexicals = lexicals;
        self
    }

    pub fn call_index(&self) -> u32 {
        self.call_index
    }

    pub fn call_segment(&self) -> u32 {
        self.call_segment
    }

    pub fn proc_offset(&self) -> u32 {
        self.proc_offset
    }

    pub fn return_ip(&self) -> Option<InstructionPointer> {
        self.return_ip
    }

    pub fn returns_value(&self) -> bool {
        self.returns_value
    }

    pub fn stack_guard(&self) -> usize {
        self.stack_guard
    }

    pub fn receiver(&self) -> DataCell {
        self.receiver
    }

    pub fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    pub fn num_arguments(&self) -> usize {
        self.arguments.len()
    }

    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    pub fn num_lexicals(&self) -> usize {
        self.lexicals.len()
    }

    pub fn num_rest(&self) -> usize {
        self.rest.len()
    }

    pub fn rest(&self) -> &[DataCell] {
        &self.rest
    }

    pub fn arguments(&self) -> &[DataCell] {
        &self.arguments
    }

    pub fn get_argument(&self, index: usize) -> InterpreterResult<DataCell> {
        self.arguments
            .get(index)
            .copied()
            .ok_or_else(|| slot_error("argument", index, self.arguments.len()))
    }

    pub fn set_argument(&mut self, index: usize, value: DataCell) -> InterpreterResult<()> {
        let len = self.arguments.len();
        let slot = self
            .arguments
            .get_mut(index)
            .ok_or_else(|| slot_error("argument", index, len))?;
        *slot = value;
        Ok(())
    }

    pub fn get_local(&self, index: usize) -> InterpreterResult<DataCell> {
        self.locals
            .get(index)
            .copied()
            .ok_or_else(|| slot_error("local", index, self.locals.len()))
    }

    pub fn set_local(&mut self, index: usize, value: DataCell) -> InterpreterResult<()> {
        let len = self.locals.len();
        let slot = self
            .locals
            .get_mut(index)
            .ok_or_else(|| slot_error("local", index, len))?;
        *slot = value;
        Ok(())
    }

    pub fn get_lexical(&self, index: usize) -> InterpreterResult<DataCell> {
        self.lexicals
            .get(index)
            .copied()
            .ok_or_else(|| slot_error("lexical", index, self.lexicals.len()))
    }

    pub fn set_lexical(&mut self, index: usize, value: DataCell) -> InterpreterResult<()> {
        let len = self.lexicals.len();
        let slot = self
            .lexicals
            .get_mut(index)
            .ok_or_else(|| slot_error("lexical", index, len))?;
        *slot = value;
        Ok(())
    }

    pub fn get_rest(&self, index: usize) -> InterpreterResult<DataCell> {
        self.rest
            .get(index)
            .copied()
            .ok_or_else(|| slot_error("rest argument", index, self.rest.len()))
    }

    pub fn visit_cells(&self, visitor: &mut dyn Visitor) {
        visitor.visit_all(&self.arguments);
        visitor.visit_all(&self.locals);
        visitor.visit_all(&self.lexicals);
        visitor.visit_all(&self.rest);
        visitor.visit(&self.receiver);
    }
}
