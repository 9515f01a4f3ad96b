use std::cmp::Ordering;
use std::rc::Rc;

use cadence_bytecode::{
    BytecodeDecoder, BytecodeObject, CallFlags, Condition, Instruction, LiteralDescriptor,
    LoadTarget, NewType, Section, StoreTarget, Synthetic, TrapFlags,
};

use crate::heap::{HeapCreateInfo, HeapSettings};
use crate::objects::{RestObject, StringObject, UrlObject};
use crate::segment::SlotTable;
use crate::subroutine::return_to_caller;
use crate::traps::{TrapTable, trap_arguments};
use crate::{
    DataCell, Inspector, InterpreterCondition, InterpreterError, InterpreterResult,
    InterpreterState, StackfulCoroutine, TaskId, TaskKind, VirtualTable,
};

#[derive(Debug, Default, Clone)]
pub struct InterpreterCreateInfo {
    /// Instructions between scheduling points.
    pub time_slice: Option<u32>,
    /// Non-blocking polls tried at each scheduling point.
    pub fast_poll_iterations: Option<u32>,
    pub max_recursion_depth: Option<usize>,
    pub heap: HeapCreateInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterSettings {
    pub time_slice: u32,
    pub fast_poll_iterations: u32,
    pub max_recursion_depth: usize,
    pub heap: HeapSettings,
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self {
            time_slice: 64,
            fast_poll_iterations: 4,
            max_recursion_depth: 128,
            heap: HeapSettings::default(),
        }
    }
}

impl InterpreterSettings {
    pub fn from_create_info(info: &InterpreterCreateInfo) -> Self {
        let default = Self::default();
        Self {
            time_slice: info.time_slice.unwrap_or(default.time_slice),
            fast_poll_iterations: info
                .fast_poll_iterations
                .unwrap_or(default.fast_poll_iterations),
            max_recursion_depth: info
                .max_recursion_depth
                .unwrap_or(default.max_recursion_depth),
            heap: HeapSettings::from_create_info(&info.heap),
        }
    }
}

/// How a dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Exit {
    /// The loop's bottom frame returned. A nested loop leaves the value on
    /// the caller's stack as well.
    Returned(DataCell),
    /// `HALT`; unwinds every enclosing loop.
    Halted(DataCell),
}

enum Step {
    Continue,
    Exit(Exit),
}

fn no_ip() -> InterpreterError {
    InterpreterError::invariant("no instruction pointer")
}

fn as_dbl(cell: &DataCell) -> Option<f64> {
    match cell {
        DataCell::Dbl(v) => Some(*v),
        _ => None,
    }
}

fn as_chr(cell: &DataCell) -> Option<char> {
    match cell {
        DataCell::Chr(v) => Some(*v),
        _ => None,
    }
}

fn as_type(cell: &DataCell) -> Option<crate::Descriptor> {
    cell.as_descriptor(Section::Type)
}

/// Pop `rhs` then `lhs`, reporting whichever has the wrong shape.
fn pop_operands<T>(
    coro: &mut StackfulCoroutine,
    expected: &str,
    get: impl Fn(&DataCell) -> Option<T>,
) -> InterpreterResult<(T, T)> {
    let rhs = coro.pop_data()?;
    let rhs = get(&rhs).ok_or_else(|| {
        InterpreterError::rhs(format!(
            "wrong type for rhs: expected {expected}, found {}",
            rhs.type_name()
        ))
    })?;
    let lhs = pop_operand(coro, expected, get)?;
    Ok((lhs, rhs))
}

fn pop_operand<T>(
    coro: &mut StackfulCoroutine,
    expected: &str,
    get: impl Fn(&DataCell) -> Option<T>,
) -> InterpreterResult<T> {
    let lhs = coro.pop_data()?;
    get(&lhs).ok_or_else(|| {
        InterpreterError::lhs(format!(
            "wrong type for lhs: expected {expected}, found {}",
            lhs.type_name()
        ))
    })
}

fn ordering(order: Option<Ordering>) -> DataCell {
    DataCell::I64(match order {
        Some(Ordering::Less) => -1,
        Some(Ordering::Greater) => 1,
        Some(Ordering::Equal) | None => 0,
    })
}

fn branch_taken(condition: Condition, value: DataCell) -> InterpreterResult<bool> {
    let boolean = || {
        value
            .as_bool()
            .ok_or_else(|| InterpreterError::lhs("value must be a boolean"))
    };
    let integer = || {
        value
            .as_i64()
            .ok_or_else(|| InterpreterError::lhs("value must be an integer"))
    };
    Ok(match condition {
        Condition::Nil => matches!(value, DataCell::Nil),
        Condition::NotNil => !matches!(value, DataCell::Nil),
        Condition::True => boolean()?,
        Condition::False => !boolean()?,
        Condition::Zero => integer()? == 0,
        Condition::NotZero => integer()? != 0,
        Condition::Gt => integer()? > 0,
        Condition::Ge => integer()? >= 0,
        Condition::Lt => integer()? < 0,
        Condition::Le => integer()? <= 0,
    })
}

/// Executes bytecode on the tasks of an [`InterpreterState`].
///
/// The outermost dispatch loop schedules: every `time_slice` instructions it
/// polls for events and may switch tasks. Nested loops (static
/// initialisers, instance constructors) run the current task to completion
/// of the frame they were entered for.
pub struct BytecodeInterpreter {
    state: InterpreterState,
    traps: TrapTable,
    inspector: Option<Box<dyn Inspector>>,
    slice: u32,
}

impl BytecodeInterpreter {
    pub fn new(info: &InterpreterCreateInfo, traps: TrapTable) -> Self {
        Self {
            state: InterpreterState::new(InterpreterSettings::from_create_info(info)),
            traps,
            inspector: None,
            slice: 0,
        }
    }

    pub fn with_inspector(mut self, inspector: Box<dyn Inspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn state(&self) -> &InterpreterState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut InterpreterState {
        &mut self.state
    }

    pub fn traps(&self) -> &TrapTable {
        &self.traps
    }

    pub fn load_main(&mut self, object: BytecodeObject) -> InterpreterResult<u32> {
        self.state.load_main(object)
    }

    /// Run until the main task finishes or the program halts, and return
    /// the result.
    pub fn run(&mut self) -> InterpreterResult<DataCell> {
        if self.state.depth > 0 {
            return Err(InterpreterError::invariant("interpreter is already running"));
        }
        self.slice = 0;
        if self.state.scheduler.current_task().is_none() {
            self.select_task()?;
        }
        let value = match self.run_subinterpreter()? {
            Exit::Returned(value) | Exit::Halted(value) => value,
        };
        log::debug!("halted with {}", self.state.describe(&value));
        if let Some(inspector) = self.inspector.as_mut() {
            inspector.on_halt(&self.state, &value);
        }
        Ok(value)
    }

    fn select_task(&mut self) -> InterpreterResult<TaskId> {
        let id = self
            .state
            .scheduler
            .select_next_ready()
            .ok_or_else(|| InterpreterError::invariant("no task is ready to run"))?;
        if let Some(task) = self.state.scheduler.task_mut(id) {
            if task.has_pending_adapt() {
                task.adapt_promises();
            }
        }
        Ok(id)
    }

    /// Scheduling point of the outermost loop.
    fn schedule(&mut self) -> InterpreterResult<()> {
        if self.state.scheduler.current_task().is_none() {
            self.slice = 0;
            self.collect_if_needed();
            self.state.scheduler.blocking_poll()?;
            self.select_task()?;
            return Ok(());
        }
        self.slice += 1;
        if self.slice < self.state.settings().time_slice {
            return Ok(());
        }
        self.slice = 0;
        self.collect_if_needed();
        for _ in 0..self.state.settings().fast_poll_iterations {
            if self.state.scheduler.poll()? > 0 {
                break;
            }
        }
        self.select_task()?;
        Ok(())
    }

    fn collect_if_needed(&mut self) {
        if self.state.heap.should_collect() {
            let stats = self.state.collect_garbage();
            log::debug!(
                "collected {} of {} objects",
                stats.freed,
                stats.live_before
            );
        }
    }

    /// Run a dispatch loop for the frame on top of the current task. A
    /// nested loop guards that frame and returns once it does.
    fn run_subinterpreter(&mut self) -> InterpreterResult<Exit> {
        let max = self.state.settings().max_recursion_depth;
        if self.state.depth >= max {
            let coro = self.state.current_coroutine_mut()?;
            let depth = coro.call_stack_size().saturating_sub(1);
            coro.unwind_to(depth);
            return Err(InterpreterError::new(
                InterpreterCondition::ExceededMaximumRecursion,
                format!("more than {max} nested evaluations"),
            ));
        }

        let task = self.state.current_task()?;
        let guard = if self.state.depth > 0 {
            let coro = self.state.current_coroutine_mut()?;
            coro.push_guard()?;
            Some(coro.call_stack_size())
        } else {
            None
        };

        self.state.depth += 1;
        let result = self.dispatch();
        self.state.depth -= 1;

        if let (Err(error), Some(guard)) = (&result, guard) {
            log::debug!("unwinding {task} to depth {} after: {error}", guard - 1);
            if let Some(task) = self.state.scheduler.task_mut(task) {
                task.coroutine_mut().unwind_to(guard - 1);
            }
        }
        result
    }

    fn dispatch(&mut self) -> InterpreterResult<Exit> {
        loop {
            if self.state.depth == 1 {
                self.schedule()?;
            }
            let instruction = self.fetch()?;
            if let Some(inspector) = self.inspector.as_mut() {
                inspector.before_op(&self.state, &instruction)?;
            }
            log::trace!("{instruction}");

            let step = match self.execute(instruction) {
                Ok(step) => step,
                Err(error) => match self.inspector.as_mut() {
                    Some(inspector) => {
                        inspector.on_error(&self.state, &instruction, error)?;
                        Step::Continue
                    }
                    None => return Err(error),
                },
            };

            if let Some(inspector) = self.inspector.as_mut() {
                inspector.after_op(&self.state, &instruction)?;
            }
            if let Step::Exit(exit) = step {
                return Ok(exit);
            }
        }
    }

    /// Decode the instruction at the current IP and step past it. The end
    /// of a proc body reads as `RETURN`.
    fn fetch(&mut self) -> InterpreterResult<Instruction> {
        let ip = self.state.current_coroutine()?.ip().ok_or_else(no_ip)?;
        if ip.at_end() {
            return Ok(Instruction::Return);
        }
        let bytecode = self.state.segments.segment(ip.segment)?.bytecode();
        let mut decoder = BytecodeDecoder::at(bytecode, ip.offset);
        let instruction = decoder
            .decode_next()?
            .ok_or_else(|| InterpreterError::invariant("ran past the end of the bytecode"))?;
        let next = decoder.offset();
        if next > ip.end {
            return Err(InterpreterError::new(
                InterpreterCondition::DecodeFailed,
                format!("instruction at {} crosses the end of its proc", ip.offset),
            ));
        }
        if let Some(ip) = self.state.current_coroutine_mut()?.ip_mut() {
            ip.offset = next;
        }
        Ok(instruction)
    }

    fn coro(&mut self) -> InterpreterResult<&mut StackfulCoroutine> {
        self.state.current_coroutine_mut()
    }

    fn execute(&mut self, instruction: Instruction) -> InterpreterResult<Step> {
        match instruction {
            Instruction::Noop => {}
            Instruction::Nil => self.state.push_data(DataCell::Nil)?,
            Instruction::Undef => self.state.push_data(DataCell::Undef)?,
            Instruction::True => self.state.push_data(DataCell::Bool(true))?,
            Instruction::False => self.state.push_data(DataCell::Bool(false))?,
            Instruction::I64 { value } => self.state.push_data(DataCell::I64(value))?,
            Instruction::Dbl { value } => self.state.push_data(DataCell::Dbl(value))?,
            Instruction::Chr { value } => self.state.push_data(DataCell::Chr(value))?,
            Instruction::Literal { address } => self.push_literal(address)?,
            Instruction::String { address } | Instruction::Url { address } => {
                let segment = self.state.current_segment()?;
                let LiteralDescriptor::Utf8(text) = self.state.segments.literal(segment, address)?
                else {
                    return Err(InterpreterError::new(
                        InterpreterCondition::InvalidOperandFlagsAddressV1,
                        format!("literal #{address} is not UTF-8 text"),
                    ));
                };
                let text = text.clone();
                let cell = if matches!(instruction, Instruction::Url { .. }) {
                    self.state.allocate(UrlObject::new(text))
                } else {
                    self.state.allocate(StringObject::new(text))
                };
                self.state.push_data(cell)?;
            }
            Instruction::Synthetic { kind } => {
                let frame = self.state.current_frame()?;
                let cell = match kind {
                    Synthetic::This => {
                        let receiver = frame.receiver();
                        if !receiver.is_valid() {
                            return Err(InterpreterError::receiver("frame has no receiver"));
                        }
                        receiver
                    }
                    Synthetic::Rest => {
                        let rest = frame.rest().to_vec();
                        self.state.allocate(RestObject::new(rest))
                    }
                };
                self.state.push_data(cell)?;
            }
            Instruction::Descriptor { section, address } => {
                let segment = self.state.current_segment()?;
                let descriptor = self.state.segments.resolve_descriptor(segment, section, address)?;
                self.state.push_data(DataCell::Descriptor(descriptor))?;
            }
            Instruction::Load { target, address } => return self.load(target, address),
            Instruction::Store { target, address } => self.store(target, address)?,

            Instruction::VaLoad => {
                let coro = self.coro()?;
                let index = pop_operand(coro, "i64", DataCell::as_i64)?;
                let index = usize::try_from(index)
                    .map_err(|_| InterpreterError::lhs(format!("rest index {index} is negative")))?;
                let value = coro.peek_call()?.get_rest(index)?;
                coro.push_data(value);
            }
            Instruction::VaSize => {
                let coro = self.coro()?;
                let size = coro.peek_call()?.num_rest() as i64;
                coro.push_data(DataCell::I64(size));
            }

            Instruction::Pop => {
                self.coro()?.pop_data()?;
            }
            Instruction::Dup => {
                let coro = self.coro()?;
                let top = coro.peek_data()?;
                coro.push_data(top);
            }
            // PICK and DROP address the data stack from its bottom.
            Instruction::Pick { offset } => {
                let coro = self.coro()?;
                let value = coro.peek_data_at(offset as isize)?;
                coro.push_data(value);
            }
            Instruction::Drop { offset } => {
                self.coro()?.drop_data_at(offset as isize)?;
            }
            Instruction::RPick { offset } => {
                let coro = self.coro()?;
                let value = coro.peek_data_at(-1 - offset as isize)?;
                coro.push_data(value);
            }
            Instruction::RDrop { offset } => {
                self.coro()?.drop_data_at(-1 - offset as isize)?;
            }

            Instruction::I64Add
            | Instruction::I64Sub
            | Instruction::I64Mul
            | Instruction::I64Div => {
                let coro = self.coro()?;
                let (lhs, rhs) = pop_operands(coro, "i64", DataCell::as_i64)?;
                let value = match instruction {
                    Instruction::I64Add => lhs.wrapping_add(rhs),
                    Instruction::I64Sub => lhs.wrapping_sub(rhs),
                    Instruction::I64Mul => lhs.wrapping_mul(rhs),
                    _ => {
                        if rhs == 0 {
                            return Err(InterpreterError::rhs("integer division by zero"));
                        }
                        lhs.wrapping_div(rhs)
                    }
                };
                coro.push_data(DataCell::I64(value));
            }
            Instruction::I64Neg => {
                let coro = self.coro()?;
                let value = pop_operand(coro, "i64", DataCell::as_i64)?;
                coro.push_data(DataCell::I64(value.wrapping_neg()));
            }
            Instruction::DblAdd
            | Instruction::DblSub
            | Instruction::DblMul
            | Instruction::DblDiv => {
                let coro = self.coro()?;
                let (lhs, rhs) = pop_operands(coro, "dbl", as_dbl)?;
                let value = match instruction {
                    Instruction::DblAdd => lhs + rhs,
                    Instruction::DblSub => lhs - rhs,
                    Instruction::DblMul => lhs * rhs,
                    _ => lhs / rhs,
                };
                coro.push_data(DataCell::Dbl(value));
            }
            Instruction::DblNeg => {
                let coro = self.coro()?;
                let value = pop_operand(coro, "dbl", as_dbl)?;
                coro.push_data(DataCell::Dbl(-value));
            }

            Instruction::BoolCmp => {
                let coro = self.coro()?;
                let (lhs, rhs) = pop_operands(coro, "bool", DataCell::as_bool)?;
                coro.push_data(ordering(Some(lhs.cmp(&rhs))));
            }
            Instruction::I64Cmp => {
                let coro = self.coro()?;
                let (lhs, rhs) = pop_operands(coro, "i64", DataCell::as_i64)?;
                coro.push_data(ordering(Some(lhs.cmp(&rhs))));
            }
            Instruction::DblCmp => {
                let coro = self.coro()?;
                let (lhs, rhs) = pop_operands(coro, "dbl", as_dbl)?;
                coro.push_data(ordering(lhs.partial_cmp(&rhs)));
            }
            Instruction::ChrCmp => {
                let coro = self.coro()?;
                let (lhs, rhs) = pop_operands(coro, "chr", as_chr)?;
                coro.push_data(ordering(Some(lhs.cmp(&rhs))));
            }
            Instruction::TypeCmp => {
                let (lhs, rhs) = pop_operands(self.coro()?, "type descriptor", as_type)?;
                let order = self.state.segments.compare_types(lhs, rhs)?;
                self.state.push_data(DataCell::I64(order))?;
            }

            Instruction::LogicalAnd | Instruction::LogicalOr => {
                let coro = self.coro()?;
                let (lhs, rhs) = pop_operands(coro, "bool", DataCell::as_bool)?;
                let value = if matches!(instruction, Instruction::LogicalAnd) {
                    lhs && rhs
                } else {
                    lhs || rhs
                };
                coro.push_data(DataCell::Bool(value));
            }
            Instruction::LogicalNot => {
                let coro = self.coro()?;
                let value = pop_operand(coro, "bool", DataCell::as_bool)?;
                coro.push_data(DataCell::Bool(!value));
            }

            Instruction::Branch { condition, delta } => {
                let value = self.coro()?.pop_data()?;
                if branch_taken(condition, value)? {
                    self.jump(delta)?;
                }
            }
            Instruction::Jump { delta } => self.jump(delta)?,

            Instruction::CallStatic { flags, address, placement } => {
                self.state.call_static(flags, address, placement)?;
            }
            Instruction::CallVirtual { flags, address, placement } => {
                self.state.call_virtual(flags, address, placement)?;
            }
            Instruction::CallConcept { flags, address, placement } => {
                self.state.call_concept(flags, address, placement)?;
            }
            Instruction::CallExistential { flags, address, placement } => {
                self.state.call_existential(flags, address, placement)?;
            }
            Instruction::Trap { flags, index } => {
                let index = if flags.contains(TrapFlags::INDEX_FOLLOWS) {
                    if index != 0 {
                        return Err(InterpreterError::new(
                            InterpreterCondition::InvalidOperandFlagsAddressV1,
                            "trap index operand must be 0 when the index follows",
                        ));
                    }
                    let index = pop_operand(self.coro()?, "i64", DataCell::as_i64)?;
                    u32::try_from(index)
                        .map_err(|_| InterpreterError::lhs(format!("invalid trap index {index}")))?
                } else {
                    index
                };
                self.invoke_trap(index)?;
            }
            Instruction::Return => return self.return_from_frame(),
            Instruction::New { new_type, flags, address, placement } => {
                let coro = self.coro()?;
                let mut args = coro.pop_data_n(placement as usize)?;
                if flags.contains(CallFlags::FORWARD_REST) {
                    args.extend_from_slice(coro.peek_call()?.rest());
                }
                let (vtable, value) = self.allocate_new(new_type, address)?;
                self.state.construct_new(vtable, value, args)?;
            }

            Instruction::TypeOf => {
                let value = self.coro()?.pop_data()?;
                let segment = self.state.current_segment()?;
                let ty = self.state.segments.type_of(segment, &self.state.heap, &value)?;
                self.state.push_data(ty)?;
            }
            Instruction::Interrupt => {
                let value = self.coro()?.peek_data().unwrap_or(DataCell::Nil);
                match self.inspector.as_mut() {
                    Some(inspector) => inspector.on_interrupt(&self.state, value)?,
                    None => {
                        return Err(InterpreterError::new(
                            InterpreterCondition::Interrupted,
                            format!("interrupted with {}", self.state.describe(&value)),
                        ));
                    }
                }
            }
            Instruction::Halt => {
                let value = self.coro()?.pop_data().unwrap_or(DataCell::Nil);
                return Ok(Step::Exit(Exit::Halted(value)));
            }
            Instruction::Abort => {
                return Err(InterpreterError::new(InterpreterCondition::Aborted, "aborted"));
            }
        }
        Ok(Step::Continue)
    }

    fn push_literal(&mut self, address: u32) -> InterpreterResult<()> {
        let segment = self.state.current_segment()?;
        let cell = match self.state.segments.literal(segment, address)? {
            LiteralDescriptor::Nil => DataCell::Nil,
            LiteralDescriptor::Undef => DataCell::Undef,
            LiteralDescriptor::Bool(v) => DataCell::Bool(*v),
            LiteralDescriptor::I64(v) => DataCell::I64(*v),
            LiteralDescriptor::Dbl(v) => DataCell::Dbl(*v),
            LiteralDescriptor::Chr(v) => DataCell::Chr(*v),
            LiteralDescriptor::Utf8(text) => {
                let text = text.clone();
                self.state.allocate(StringObject::new(text))
            }
        };
        self.state.push_data(cell)
    }

    /// Relative to the end of the jump instruction; landing on the end of
    /// the body is allowed and returns.
    fn jump(&mut self, delta: i16) -> InterpreterResult<()> {
        let ip = self.coro()?.ip_mut().ok_or_else(no_ip)?;
        let target = ip.offset as isize + delta as isize;
        if target < 0 || target as usize > ip.end {
            return Err(InterpreterError::new(
                InterpreterCondition::InvalidOperandJumpV1,
                format!("invalid jump offset {delta} at {}", ip.offset),
            ));
        }
        ip.offset = target as usize;
        Ok(())
    }

    fn load(&mut self, target: LoadTarget, address: u32) -> InterpreterResult<Step> {
        let index = address as usize;
        let value = match target {
            LoadTarget::Argument => self.state.current_frame()?.get_argument(index)?,
            LoadTarget::Local => self.state.current_frame()?.get_local(index)?,
            LoadTarget::Lexical => self.state.current_frame()?.get_lexical(index)?,
            LoadTarget::Field => {
                let segment = self.state.current_segment()?;
                self.state.segments.resolve_descriptor(segment, Section::Field, address)?;
                let receiver = self.state.current_coroutine()?.peek_data()?;
                let r = receiver
                    .as_ref()
                    .ok_or_else(|| InterpreterError::receiver("field load needs an object"))?;
                self.state.heap.get(r)?.get_field(address)?
            }
            LoadTarget::Static => return self.load_static(address),
            LoadTarget::Instance => return self.load_singleton(SlotTable::Instance, address),
            LoadTarget::Enum => return self.load_singleton(SlotTable::Enum, address),
        };
        self.state.push_data(value)?;
        Ok(Step::Continue)
    }

    fn store(&mut self, target: StoreTarget, address: u32) -> InterpreterResult<()> {
        let index = address as usize;
        let coro = self.coro()?;
        let value = coro.pop_data()?;
        match target {
            StoreTarget::Argument => coro.peek_call_mut()?.set_argument(index, value),
            StoreTarget::Local => coro.peek_call_mut()?.set_local(index, value),
            StoreTarget::Lexical => coro.peek_call_mut()?.set_lexical(index, value),
            StoreTarget::Field => {
                let receiver = coro.peek_data()?;
                let r = receiver
                    .as_ref()
                    .ok_or_else(|| InterpreterError::receiver("field store needs an object"))?;
                let segment = self.state.current_segment()?;
                self.state.segments.resolve_descriptor(segment, Section::Field, address)?;
                self.state.heap.get_mut(r)?.set_field(address, value)?;
                Ok(())
            }
            StoreTarget::Static => {
                let segment = self.state.current_segment()?;
                self.state
                    .segments
                    .store_slot(segment, SlotTable::Static, address, value)
            }
        }
    }

    /// Load a static, running its initialiser in a nested loop the first
    /// time.
    fn load_static(&mut self, address: u32) -> InterpreterResult<Step> {
        let segment = self.state.current_segment()?;
        let value = self.state.segments.load_slot(segment, SlotTable::Static, address)?;
        if value.is_valid() {
            self.state.push_data(value)?;
            return Ok(Step::Continue);
        }

        let height = self.state.current_coroutine()?.data_stack_size();
        if !self.state.init_static(address)? {
            return Err(InterpreterError::invariant(format!(
                "static #{address} is read before it is assigned"
            )));
        }
        if let Exit::Halted(value) = self.run_subinterpreter()? {
            return Ok(Step::Exit(Exit::Halted(value)));
        }
        let coro = self.state.current_coroutine()?;
        if coro.data_stack_size() != height + 1 {
            return Err(InterpreterError::invariant(format!(
                "initialiser of static #{address} left no value"
            )));
        }
        let value = coro.peek_data()?;
        self.state
            .segments
            .store_slot(segment, SlotTable::Static, address, value)?;
        Ok(Step::Continue)
    }

    /// Load an instance or enum singleton, allocating and constructing it
    /// in a nested loop the first time.
    fn load_singleton(&mut self, table: SlotTable, address: u32) -> InterpreterResult<Step> {
        let segment = self.state.current_segment()?;
        let value = self.state.segments.load_slot(segment, table, address)?;
        if value.is_valid() {
            self.state.push_data(value)?;
            return Ok(Step::Continue);
        }

        let new_type = match table {
            SlotTable::Enum => NewType::Enum,
            SlotTable::Instance | SlotTable::Static => NewType::Instance,
        };
        let (vtable, value) = self.allocate_new(new_type, address)?;
        if self.state.construct_new(vtable, value, Vec::new())? {
            if let Exit::Halted(value) = self.run_subinterpreter()? {
                return Ok(Step::Exit(Exit::Halted(value)));
            }
        }
        self.state.segments.store_slot(segment, table, address, value)?;
        Ok(Step::Continue)
    }

    /// Run the allocator trap of a class-like descriptor in its allocation
    /// frame. The new object is left on the caller's stack and returned.
    fn allocate_new(
        &mut self,
        new_type: NewType,
        address: u32,
    ) -> InterpreterResult<(Rc<VirtualTable>, DataCell)> {
        let (vtable, allocator) = self.state.prepare_new(new_type, address)?;
        self.invoke_trap(allocator)?;
        let coro = self.coro()?;
        return_to_caller(coro)?;
        let value = coro.peek_data()?;
        if value.as_ref().is_none() {
            return Err(InterpreterError::invariant(format!(
                "allocator trap #{allocator} produced {}",
                value.type_name()
            )));
        }
        Ok((vtable, value))
    }

    fn invoke_trap(&mut self, index: u32) -> InterpreterResult<()> {
        let desc = *self
            .traps
            .get(index)
            .ok_or_else(|| InterpreterError::missing(format!("no trap #{index}")))?;
        let (subject, args) = trap_arguments(self.state.current_frame()?);
        if args.len() < desc.arity as usize {
            return Err(InterpreterError::lhs(format!(
                "{} expects {} arguments, found {}",
                desc.name,
                desc.arity,
                args.len()
            )));
        }
        log::trace!("trap {}", desc.name);
        if let Some(result) = (desc.func)(&mut self.state, subject, &args)? {
            self.state.push_data(result)?;
        }
        Ok(())
    }

    /// `RETURN`, explicit or by running off the end of a body.
    fn return_from_frame(&mut self) -> InterpreterResult<Step> {
        let nested = self.state.depth > 1;
        let task = self.state.current_task()?;
        let coro = self.coro()?;
        let reached_guard = nested && coro.peek_guard() == Some(coro.call_stack_size());
        if reached_guard {
            coro.pop_guard()?;
        }
        let returned = return_to_caller(coro)?;

        if reached_guard {
            if !coro.check_guard() {
                return Err(InterpreterError::invariant("stack invariant violation"));
            }
            let value = if returned.returns_value {
                coro.peek_data()?
            } else {
                DataCell::Nil
            };
            return Ok(Step::Exit(Exit::Returned(value)));
        }
        if returned.has_caller {
            return Ok(Step::Continue);
        }
        if nested {
            return Err(InterpreterError::invariant(
                "returned past the bottom of a nested evaluation",
            ));
        }

        let value = if returned.returns_value {
            coro.pop_data()?
        } else {
            DataCell::Nil
        };
        let kind = self
            .state
            .scheduler
            .task(task)
            .map(|t| t.kind())
            .ok_or_else(|| InterpreterError::invariant(format!("unknown {task}")))?;
        self.state.scheduler.terminate_task(task, value)?;
        match kind {
            TaskKind::Main => Ok(Step::Exit(Exit::Returned(value))),
            TaskKind::Worker => Ok(Step::Continue),
        }
    }
}

#[cfg(test)]
mod tests {
    use cadence_bytecode::{
        ActionBinding, BytecodeBuilder, ClassDescriptor, ExistentialDescriptor, ImplBinding,
        LexicalTarget, MethodBinding, ObjectBuilder, ProcLexical, ProcSignature,
    };

    use super::*;

    fn interpreter(info: &InterpreterCreateInfo, object: BytecodeObject) -> BytecodeInterpreter {
        let mut interpreter = BytecodeInterpreter::new(info, TrapTable::default());
        interpreter.load_main(object).unwrap();
        interpreter
    }

    fn run(object: BytecodeObject) -> (BytecodeInterpreter, InterpreterResult<DataCell>) {
        let mut interpreter = interpreter(&InterpreterCreateInfo::default(), object);
        let result = interpreter.run();
        (interpreter, result)
    }

    fn trap(name: &str) -> u32 {
        TrapTable::default().index_of(name).unwrap()
    }

    /// Static proc whose body is a single trap.
    fn trap_proc(ob: &mut ObjectBuilder, name: &str, arguments: u16) -> u32 {
        let index = trap(name);
        ob.add_call(name, ProcSignature::new(arguments, 0), |b| b.trap(index))
    }

    fn load_local(b: &mut BytecodeBuilder, address: u32) {
        b.emit(Instruction::Load { target: LoadTarget::Local, address });
    }

    fn store_local(b: &mut BytecodeBuilder, address: u32) {
        b.emit(Instruction::Store { target: StoreTarget::Local, address });
    }

    fn main_data(interpreter: &BytecodeInterpreter) -> Vec<DataCell> {
        let main = interpreter.state().scheduler().main_task();
        interpreter
            .state()
            .scheduler()
            .task(main)
            .map(|t| t.coroutine().data().to_vec())
            .unwrap_or_default()
    }

    #[test]
    fn i64_add_rejects_a_double() {
        let mut ob = ObjectBuilder::new("arith");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(1);
            b.dbl(2.0);
            b.emit(Instruction::I64Add);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let (_, result) = run(ob.finish());
        assert_eq!(result.unwrap_err().condition, InterpreterCondition::InvalidDataStackV2);
    }

    #[test]
    fn halt_and_main_return_yield_the_top_value() {
        let mut ob = ObjectBuilder::new("halt");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(7);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        assert_eq!(run(ob.finish()).1, Ok(DataCell::I64(7)));

        let mut ob = ObjectBuilder::new("empty");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| b.emit(Instruction::Halt));
        ob.set_entry(main);
        assert_eq!(run(ob.finish()).1, Ok(DataCell::Nil));

        let mut ob = ObjectBuilder::new("falls-off");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| b.i64(3));
        ob.set_entry(main);
        let (interpreter, result) = run(ob.finish());
        assert_eq!(result, Ok(DataCell::I64(3)));
        let main = interpreter.state().scheduler().main_task();
        assert_eq!(
            interpreter.state().scheduler().task(main).map(|t| t.state()),
            Some(crate::TaskState::Done)
        );
    }

    #[test]
    fn loop_sums_with_branches_and_jumps() {
        let mut ob = ObjectBuilder::new("loop");
        let main = ob.add_call("main", ProcSignature::new(0, 2), |b| {
            b.i64(0);
            store_local(b, 0);
            b.i64(10);
            store_local(b, 1);
            let top = b.current_offset();
            load_local(b, 1);
            let exit = b.branch(Condition::Zero);
            load_local(b, 0);
            load_local(b, 1);
            b.emit(Instruction::I64Add);
            store_local(b, 0);
            load_local(b, 1);
            b.i64(1);
            b.emit(Instruction::I64Sub);
            store_local(b, 1);
            b.jump_back(top);
            b.bind(exit);
            load_local(b, 0);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        assert_eq!(run(ob.finish()).1, Ok(DataCell::I64(55)));
    }

    #[test]
    fn branch_on_a_non_boolean_fails() {
        let mut ob = ObjectBuilder::new("branch");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(1);
            let label = b.branch(Condition::True);
            b.bind(label);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let err = run(ob.finish()).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::InvalidDataStackV1);
        assert!(err.message.contains("boolean"));
    }

    #[test]
    fn recursive_static_initialiser_hits_the_limit() {
        let mut ob = ObjectBuilder::new("recursion");
        let init = ob.declare_call("init");
        let slot = ob.add_static("forever", Some(init));
        ob.define_call(init, ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::Load { target: LoadTarget::Static, address: slot });
            b.return_();
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::Load { target: LoadTarget::Static, address: slot });
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);

        let info = InterpreterCreateInfo {
            max_recursion_depth: Some(8),
            ..Default::default()
        };
        let mut interpreter = interpreter(&info, ob.finish());
        let err = interpreter.run().unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::ExceededMaximumRecursion);

        assert_eq!(interpreter.state().depth(), 0);
        let coro = interpreter.state().current_coroutine().unwrap();
        assert_eq!(coro.call_stack_size(), 1);
        assert_eq!(coro.guard_stack_size(), 0);
        assert_eq!(coro.data_stack_size(), 0);
    }

    #[test]
    fn static_initialiser_runs_once() {
        let mut ob = ObjectBuilder::new("statics");
        let init = ob.declare_call("init");
        let slot = ob.add_static("answer", Some(init));
        ob.define_call(init, ProcSignature::new(0, 0), |b| b.i64(42));
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::Load { target: LoadTarget::Static, address: slot });
            b.emit(Instruction::Load { target: LoadTarget::Static, address: slot });
            b.emit(Instruction::I64Add);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let (interpreter, result) = run(ob.finish());
        assert_eq!(result, Ok(DataCell::I64(84)));
        assert_eq!(
            interpreter.state().segments().load_slot(0, SlotTable::Static, slot),
            Ok(DataCell::I64(42))
        );
    }

    #[test]
    fn virtual_call_reads_a_constructed_field() {
        let mut ob = ObjectBuilder::new("point");
        let x = ob.add_field("x");
        let init = ob.add_call("Point.init", ProcSignature::new(1, 0).returns_nothing(), |b| {
            b.emit(Instruction::Synthetic { kind: Synthetic::This });
            b.emit(Instruction::Load { target: LoadTarget::Argument, address: 0 });
            b.emit(Instruction::Store { target: StoreTarget::Field, address: x });
            b.emit(Instruction::Pop);
        });
        let get_x = ob.add_call("Point.x", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::Synthetic { kind: Synthetic::This });
            b.emit(Instruction::Load { target: LoadTarget::Field, address: x });
        });
        let point = ob.add_class(Section::Class, ClassDescriptor {
            name: "Point".into(),
            allocator: Some(trap("alloc.object")),
            ctor: Some(init),
            fields: vec![x],
            methods: vec![MethodBinding { call: get_x, implementation: get_x }],
            ..Default::default()
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(5);
            b.emit(Instruction::New {
                new_type: NewType::Class,
                flags: CallFlags::empty(),
                address: point,
                placement: 1,
            });
            b.emit(Instruction::CallVirtual {
                flags: CallFlags::empty(),
                address: get_x,
                placement: 0,
            });
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let (interpreter, result) = run(ob.finish());
        assert_eq!(result, Ok(DataCell::I64(5)));
        assert!(main_data(&interpreter).is_empty());
    }

    #[test]
    fn map_scenario() {
        let mut ob = ObjectBuilder::new("maps");
        let ctor = trap_proc(&mut ob, "map.ctor", 0);
        let update = trap_proc(&mut ob, "map.update", 3);
        let remove = trap_proc(&mut ob, "map.remove", 2);
        let get = trap_proc(&mut ob, "map.get", 2);
        let size = trap_proc(&mut ob, "map.size", 1);
        let class = ob.add_class(Section::Class, ClassDescriptor {
            name: "Map".into(),
            allocator: Some(trap("alloc.map")),
            ctor: Some(ctor),
            ..Default::default()
        });
        let main = ob.add_call("main", ProcSignature::new(0, 4), |b| {
            b.emit(Instruction::New {
                new_type: NewType::Class,
                flags: CallFlags::empty(),
                address: class,
                placement: 0,
            });
            store_local(b, 0);
            b.i64(0);
            store_local(b, 1);
            let top = b.current_offset();
            load_local(b, 1);
            b.i64(20);
            b.emit(Instruction::I64Cmp);
            let exit = b.branch(Condition::Ge);
            load_local(b, 0);
            load_local(b, 1);
            load_local(b, 1);
            b.call_static(update, 3);
            store_local(b, 0);
            load_local(b, 1);
            b.i64(1);
            b.emit(Instruction::I64Add);
            store_local(b, 1);
            b.jump_back(top);
            b.bind(exit);

            load_local(b, 0);
            b.call_static(size, 1);
            store_local(b, 2);
            load_local(b, 0);
            b.i64(10);
            b.call_static(remove, 2);
            store_local(b, 3);
            load_local(b, 3);
            b.call_static(size, 1);
            load_local(b, 3);
            b.i64(10);
            b.call_static(get, 2);
            load_local(b, 0);
            b.i64(10);
            b.call_static(get, 2);
            load_local(b, 2);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let (interpreter, result) = run(ob.finish());
        assert_eq!(result, Ok(DataCell::I64(20)));
        assert_eq!(main_data(&interpreter), vec![
            DataCell::I64(19),
            DataCell::Invalid,
            DataCell::I64(10),
        ]);
    }

    #[test]
    fn seq_scenario() {
        let mut ob = ObjectBuilder::new("seqs");
        let ctor = trap_proc(&mut ob, "seq.ctor", 0);
        let append = trap_proc(&mut ob, "seq.append", 1);
        let slice = trap_proc(&mut ob, "seq.slice", 3);
        let get = trap_proc(&mut ob, "seq.get", 2);
        let size = trap_proc(&mut ob, "seq.size", 1);
        let class = ob.add_class(Section::Class, ClassDescriptor {
            name: "Seq".into(),
            allocator: Some(trap("alloc.seq")),
            ctor: Some(ctor),
            ..Default::default()
        });
        let main = ob.add_call("main", ProcSignature::new(0, 2), |b| {
            b.i64(1);
            b.i64(2);
            b.i64(3);
            b.emit(Instruction::New {
                new_type: NewType::Class,
                flags: CallFlags::empty(),
                address: class,
                placement: 3,
            });
            b.i64(4);
            b.call_static(append, 2);
            store_local(b, 0);
            load_local(b, 0);
            b.call_static(size, 1);
            load_local(b, 0);
            b.i64(3);
            b.call_static(get, 2);
            load_local(b, 0);
            b.i64(1);
            b.i64(2);
            b.call_static(slice, 3);
            store_local(b, 1);
            load_local(b, 1);
            b.call_static(size, 1);
            load_local(b, 1);
            b.i64(0);
            b.call_static(get, 2);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let (interpreter, result) = run(ob.finish());
        assert_eq!(result, Ok(DataCell::I64(2)));
        assert_eq!(main_data(&interpreter), vec![
            DataCell::I64(4),
            DataCell::I64(4),
            DataCell::I64(2),
        ]);
    }

    #[test]
    fn closures_capture_the_enclosing_argument() {
        let mut ob = ObjectBuilder::new("closures");
        let make = trap_proc(&mut ob, "closure.ctor", 1);
        let apply = trap_proc(&mut ob, "closure.apply", 1);
        let outer = ob.declare_call("outer");
        let inner = ob.add_call(
            "inner",
            ProcSignature::new(1, 0).with_lexicals(vec![ProcLexical {
                activation_call: outer,
                target_offset: 0,
                target: LexicalTarget::Argument,
            }]),
            |b| {
                b.emit(Instruction::Load { target: LoadTarget::Lexical, address: 0 });
                b.emit(Instruction::Load { target: LoadTarget::Argument, address: 0 });
                b.emit(Instruction::I64Add);
            },
        );
        ob.define_call(outer, ProcSignature::new(1, 0), |b| {
            b.emit(Instruction::Descriptor { section: Section::Call, address: inner });
            b.call_static(make, 1);
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(40);
            b.call_static(outer, 1);
            b.i64(2);
            b.call_static(apply, 2);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        assert_eq!(run(ob.finish()).1, Ok(DataCell::I64(42)));
    }

    #[test]
    fn applying_a_procedure_closure_yields_nil() {
        let mut ob = ObjectBuilder::new("procedure-closure");
        let make = trap_proc(&mut ob, "closure.ctor", 1);
        let apply = trap_proc(&mut ob, "closure.apply", 1);
        let hits = ob.add_static("hits", None);
        let bump = ob.add_call("bump", ProcSignature::new(0, 0).returns_nothing(), |b| {
            b.i64(1);
            b.emit(Instruction::Store { target: StoreTarget::Static, address: hits });
            b.i64(99);
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(0);
            b.emit(Instruction::Store { target: StoreTarget::Static, address: hits });
            b.emit(Instruction::Descriptor { section: Section::Call, address: bump });
            b.call_static(make, 1);
            b.call_static(apply, 1);
            b.emit(Instruction::Load { target: LoadTarget::Static, address: hits });
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let (interpreter, result) = run(ob.finish());
        assert_eq!(result, Ok(DataCell::I64(1)));
        assert_eq!(main_data(&interpreter), vec![DataCell::Nil]);
    }

    #[test]
    fn worker_completion_does_not_halt() {
        let mut ob = ObjectBuilder::new("tasks");
        let make = trap_proc(&mut ob, "closure.ctor", 1);
        let spawn = trap_proc(&mut ob, "task.spawn", 1);
        let await_ = trap_proc(&mut ob, "task.await", 1);
        let work = ob.add_call("work", ProcSignature::new(0, 0), |b| {
            b.i64(21);
            b.i64(21);
            b.emit(Instruction::I64Add);
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::Descriptor { section: Section::Call, address: work });
            b.call_static(make, 1);
            b.call_static(spawn, 1);
            b.call_static(await_, 1);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let (interpreter, result) = run(ob.finish());
        assert_eq!(result, Ok(DataCell::I64(42)));
        assert_eq!(interpreter.state().scheduler().num_waiting(), 0);
    }

    #[derive(Default)]
    struct Recover {
        errors: std::rc::Rc<std::cell::Cell<u32>>,
    }

    impl Inspector for Recover {
        fn on_error(
            &mut self,
            _state: &InterpreterState,
            _op: &Instruction,
            _error: InterpreterError,
        ) -> InterpreterResult<()> {
            self.errors.set(self.errors.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn inspector_can_resume_after_an_error() {
        let mut ob = ObjectBuilder::new("recover");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::Abort);
            b.i64(9);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let recover = Recover::default();
        let errors = recover.errors.clone();
        let mut interpreter =
            BytecodeInterpreter::new(&InterpreterCreateInfo::default(), TrapTable::default())
                .with_inspector(Box::new(recover));
        interpreter.load_main(ob.finish()).unwrap();
        assert_eq!(interpreter.run(), Ok(DataCell::I64(9)));
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn jump_past_the_body_is_rejected() {
        let mut ob = ObjectBuilder::new("jump");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::Jump { delta: 100 });
        });
        ob.set_entry(main);
        let err = run(ob.finish()).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::InvalidOperandJumpV1);
    }

    #[test]
    fn pick_reads_below_the_callee_frame() {
        let mut ob = ObjectBuilder::new("pick");
        let f = ob.add_call("f", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::Pick { offset: 0 });
            b.emit(Instruction::Halt);
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(10);
            b.i64(20);
            b.call_static(f, 0);
        });
        ob.set_entry(main);
        assert_eq!(run(ob.finish()).1, Ok(DataCell::I64(10)));
    }

    #[test]
    fn stack_ops_address_the_bottom_and_the_top() {
        let mut ob = ObjectBuilder::new("stack");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            for value in 1..=4 {
                b.i64(value);
            }
            b.emit(Instruction::Drop { offset: 1 });
            b.emit(Instruction::RPick { offset: 0 });
            b.emit(Instruction::RDrop { offset: 2 });
            b.emit(Instruction::RPick { offset: 2 });
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let (interpreter, result) = run(ob.finish());
        assert_eq!(result, Ok(DataCell::I64(1)));
        assert_eq!(main_data(&interpreter), vec![
            DataCell::I64(1),
            DataCell::I64(4),
            DataCell::I64(4),
        ]);

        let mut ob = ObjectBuilder::new("out-of-range");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(1);
            b.emit(Instruction::Pick { offset: 1 });
        });
        ob.set_entry(main);
        let err = run(ob.finish()).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::InvalidDataStackV1);

        let mut ob = ObjectBuilder::new("reverse-out-of-range");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(1);
            b.emit(Instruction::RDrop { offset: 1 });
        });
        ob.set_entry(main);
        let err = run(ob.finish()).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::InvalidDataStackV1);
    }

    /// `Shown` implements the `show` action of `Show` and `Plain` does not.
    /// Main calls the action on one of them.
    fn concept_program(implemented: bool) -> BytecodeObject {
        let mut ob = ObjectBuilder::new("concepts");
        let concept = ob.add_concept("Show");
        let show = ob.add_action("show", concept);
        let shown_show = ob.add_call("Shown.show", ProcSignature::new(1, 0), |b| {
            b.emit(Instruction::Load { target: LoadTarget::Argument, address: 0 });
            b.i64(100);
            b.emit(Instruction::I64Add);
        });
        let shown = ob.add_class(Section::Class, ClassDescriptor {
            name: "Shown".into(),
            allocator: Some(trap("alloc.object")),
            impls: vec![ImplBinding {
                concept,
                actions: vec![ActionBinding { action: show, implementation: shown_show }],
            }],
            ..Default::default()
        });
        let plain = ob.add_class(Section::Class, ClassDescriptor {
            name: "Plain".into(),
            allocator: Some(trap("alloc.object")),
            ..Default::default()
        });
        let class = if implemented { shown } else { plain };
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::New {
                new_type: NewType::Class,
                flags: CallFlags::empty(),
                address: class,
                placement: 0,
            });
            b.i64(1);
            b.emit(Instruction::Descriptor { section: Section::Concept, address: concept });
            b.emit(Instruction::CallConcept {
                flags: CallFlags::empty(),
                address: show,
                placement: 1,
            });
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        ob.finish()
    }

    #[test]
    fn concept_action_dispatches_through_the_receiver() {
        let (interpreter, result) = run(concept_program(true));
        assert_eq!(result, Ok(DataCell::I64(101)));
        assert!(main_data(&interpreter).is_empty());

        let err = run(concept_program(false)).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::MissingDescriptor);
        assert!(err.message.contains("does not implement action"));
    }

    #[test]
    fn existential_methods_take_scalar_receivers() {
        let mut ob = ObjectBuilder::new("existentials");
        let double = ob.add_call("Int.times", ProcSignature::new(1, 0), |b| {
            b.emit(Instruction::Synthetic { kind: Synthetic::This });
            b.emit(Instruction::Load { target: LoadTarget::Argument, address: 0 });
            b.emit(Instruction::I64Mul);
        });
        let unbound = ob.add_call("Int.unbound", ProcSignature::new(0, 0), |b| b.i64(0));
        let int = ob.add_existential(ExistentialDescriptor {
            name: "Int".into(),
            type_address: None,
            methods: vec![MethodBinding { call: double, implementation: double }],
        });
        let call = |b: &mut BytecodeBuilder, address: u32| {
            b.i64(7);
            b.emit(Instruction::Descriptor { section: Section::Existential, address: int });
            b.i64(6);
            b.emit(Instruction::CallExistential {
                flags: CallFlags::empty(),
                address,
                placement: 1,
            });
            b.emit(Instruction::Halt);
        };
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| call(b, double));
        let broken = ob.add_call("broken", ProcSignature::new(0, 0), |b| call(b, unbound));
        ob.set_entry(main);
        let object = ob.finish();
        assert_eq!(run(object.clone()).1, Ok(DataCell::I64(42)));

        let mut object = object;
        object.entry = Some(broken);
        let err = run(object).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::MissingDescriptor);
        assert!(err.message.contains("existential Int"));
    }

    #[test]
    fn receiver_follows_and_rest_is_forwarded() {
        let mut ob = ObjectBuilder::new("forwarding");
        let sum = ob.add_call("Acc.sum", ProcSignature::new(1, 0), |b| {
            b.emit(Instruction::Load { target: LoadTarget::Argument, address: 0 });
            b.i64(0);
            b.emit(Instruction::VaLoad);
            b.emit(Instruction::I64Add);
            b.emit(Instruction::VaSize);
            b.emit(Instruction::I64Add);
        });
        let acc = ob.add_class(Section::Class, ClassDescriptor {
            name: "Acc".into(),
            allocator: Some(trap("alloc.object")),
            methods: vec![MethodBinding { call: sum, implementation: sum }],
            ..Default::default()
        });
        let new_acc = |b: &mut BytecodeBuilder| {
            b.emit(Instruction::New {
                new_type: NewType::Class,
                flags: CallFlags::empty(),
                address: acc,
                placement: 0,
            });
        };
        let outer = ob.add_call("outer", ProcSignature::new(0, 0), |b| {
            b.i64(30);
            new_acc(b);
            b.emit(Instruction::CallVirtual {
                flags: CallFlags::RECEIVER_FOLLOWS | CallFlags::FORWARD_REST,
                address: sum,
                placement: 1,
            });
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(5);
            b.call_static(outer, 1);
            b.emit(Instruction::Halt);
        });
        let misplaced = ob.add_call("misplaced", ProcSignature::new(0, 0), |b| {
            new_acc(b);
            b.i64(30);
            b.emit(Instruction::CallVirtual {
                flags: CallFlags::RECEIVER_FOLLOWS,
                address: sum,
                placement: 1,
            });
        });
        ob.set_entry(main);
        let object = ob.finish();
        assert_eq!(run(object.clone()).1, Ok(DataCell::I64(36)));

        let mut object = object;
        object.entry = Some(misplaced);
        let err = run(object).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::InvalidReceiver);
    }

    fn interrupt_program() -> BytecodeObject {
        let mut ob = ObjectBuilder::new("interrupt");
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(3);
            b.emit(Instruction::Interrupt);
            b.i64(4);
            b.emit(Instruction::I64Add);
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        ob.finish()
    }

    #[derive(Default)]
    struct Interrupts {
        seen: std::rc::Rc<std::cell::RefCell<Vec<DataCell>>>,
    }

    impl Inspector for Interrupts {
        fn on_interrupt(
            &mut self,
            _state: &InterpreterState,
            value: DataCell,
        ) -> InterpreterResult<()> {
            self.seen.borrow_mut().push(value);
            Ok(())
        }
    }

    #[test]
    fn interrupt_without_an_inspector_stops() {
        let err = run(interrupt_program()).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::Interrupted);
        assert!(err.message.contains('3'));
    }

    #[test]
    fn interrupt_hands_the_top_value_to_the_inspector() {
        let inspector = Interrupts::default();
        let seen = inspector.seen.clone();
        let mut interpreter =
            BytecodeInterpreter::new(&InterpreterCreateInfo::default(), TrapTable::default())
                .with_inspector(Box::new(inspector));
        interpreter.load_main(interrupt_program()).unwrap();
        assert_eq!(interpreter.run(), Ok(DataCell::I64(7)));
        assert_eq!(*seen.borrow(), vec![DataCell::I64(3)]);
    }

    #[test]
    fn type_of_and_type_cmp_follow_supertypes() {
        let mut ob = ObjectBuilder::new("types");
        let any = ob.add_type("Any", None);
        let int = ob.add_type("Int", Some(any));
        let point_type = ob.add_type("Point", Some(any));
        ob.intrinsics_mut().i64 = Some(int);
        let point = ob.add_class(Section::Class, ClassDescriptor {
            name: "Point".into(),
            type_address: Some(point_type),
            allocator: Some(trap("alloc.object")),
            ..Default::default()
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(5);
            b.emit(Instruction::TypeOf);
            b.emit(Instruction::Descriptor { section: Section::Type, address: any });
            b.emit(Instruction::TypeCmp);

            b.emit(Instruction::Descriptor { section: Section::Type, address: any });
            b.emit(Instruction::Descriptor { section: Section::Type, address: int });
            b.emit(Instruction::TypeCmp);

            b.emit(Instruction::New {
                new_type: NewType::Class,
                flags: CallFlags::empty(),
                address: point,
                placement: 0,
            });
            b.emit(Instruction::TypeOf);
            b.emit(Instruction::Descriptor { section: Section::Type, address: point_type });
            b.emit(Instruction::TypeCmp);
            b.emit(Instruction::Halt);
        });
        let untyped = ob.add_call("untyped", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::True);
            b.emit(Instruction::TypeOf);
        });
        ob.set_entry(main);
        let object = ob.finish();
        let (interpreter, result) = run(object.clone());
        assert_eq!(result, Ok(DataCell::I64(0)));
        assert_eq!(main_data(&interpreter), vec![DataCell::I64(-1), DataCell::I64(1)]);

        let mut object = object;
        object.entry = Some(untyped);
        let err = run(object).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::MissingDescriptor);
    }

    #[test]
    fn trap_index_can_follow_on_the_stack() {
        let mut ob = ObjectBuilder::new("dynamic-trap");
        let text = ob.add_literal(LiteralDescriptor::Utf8("hello".into()));
        let length = trap("string.length");
        let dynamic = ob.add_call("dynamic", ProcSignature::new(1, 0), |b| {
            b.i64(length as i64);
            b.emit(Instruction::Trap { flags: TrapFlags::INDEX_FOLLOWS, index: 0 });
        });
        let bad_operand = ob.add_call("bad_operand", ProcSignature::new(1, 0), |b| {
            b.i64(length as i64);
            b.emit(Instruction::Trap { flags: TrapFlags::INDEX_FOLLOWS, index: length });
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::String { address: text });
            b.call_static(dynamic, 1);
            b.emit(Instruction::Halt);
        });
        let broken = ob.add_call("broken", ProcSignature::new(0, 0), |b| {
            b.emit(Instruction::String { address: text });
            b.call_static(bad_operand, 1);
        });
        ob.set_entry(main);
        let object = ob.finish();
        assert_eq!(run(object.clone()).1, Ok(DataCell::I64(5)));

        let mut object = object;
        object.entry = Some(broken);
        let err = run(object).1.unwrap_err();
        assert_eq!(err.condition, InterpreterCondition::InvalidOperandFlagsAddressV1);
    }

    #[test]
    fn singletons_are_constructed_on_first_load_only() {
        let mut ob = ObjectBuilder::new("singletons");
        let x = ob.add_field("x");
        let constructed = ob.add_static("constructed", None);
        let init = ob.add_call("Config.init", ProcSignature::new(0, 0).returns_nothing(), |b| {
            b.emit(Instruction::Load { target: LoadTarget::Static, address: constructed });
            b.i64(1);
            b.emit(Instruction::I64Add);
            b.emit(Instruction::Store { target: StoreTarget::Static, address: constructed });
            b.emit(Instruction::Synthetic { kind: Synthetic::This });
            b.i64(7);
            b.emit(Instruction::Store { target: StoreTarget::Field, address: x });
            b.emit(Instruction::Pop);
        });
        let config = ob.add_class(Section::Instance, ClassDescriptor {
            name: "Config".into(),
            allocator: Some(trap("alloc.singleton")),
            ctor: Some(init),
            fields: vec![x],
            ..Default::default()
        });
        let colour = ob.add_class(Section::Enum, ClassDescriptor {
            name: "Red".into(),
            allocator: Some(trap("alloc.singleton")),
            ..Default::default()
        });
        let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
            b.i64(0);
            b.emit(Instruction::Store { target: StoreTarget::Static, address: constructed });
            b.emit(Instruction::Load { target: LoadTarget::Instance, address: config });
            b.emit(Instruction::Load { target: LoadTarget::Instance, address: config });
            b.emit(Instruction::Load { target: LoadTarget::Enum, address: colour });
            b.emit(Instruction::Load { target: LoadTarget::Enum, address: colour });
            b.emit(Instruction::Load { target: LoadTarget::Static, address: constructed });
            b.emit(Instruction::Halt);
        });
        ob.set_entry(main);
        let (interpreter, result) = run(ob.finish());
        assert_eq!(result, Ok(DataCell::I64(1)));

        let data = main_data(&interpreter);
        assert_eq!(data.len(), 4);
        assert_eq!(data[0], data[1]);
        assert_eq!(data[2], data[3]);
        assert_ne!(data[0], data[2]);
        let instance = data[0].as_ref().unwrap();
        let fields = interpreter.state().heap().get(instance).unwrap();
        assert_eq!(fields.get_field(x), Ok(DataCell::I64(7)));
        assert_eq!(
            interpreter.state().segments().load_slot(0, SlotTable::Enum, colour),
            Ok(data[2])
        );
    }
}
