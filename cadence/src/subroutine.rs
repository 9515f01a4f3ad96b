//! Activation management: building call frames, importing lexicals and
//! returning to the caller.

use std::rc::Rc;

use cadence_bytecode::{CallFlags, LexicalTarget, NewType, ProcLexical, Section, parse_proc};

use crate::objects::ClosureObject;
use crate::segment::SegmentManager;
use crate::{
    CallCell, DataCell, Descriptor, HeapObject, HeapRef, InstructionPointer, InterpreterError,
    InterpreterResult, InterpreterState, StackfulCoroutine, TaskId, VirtualTable,
};

/// What to activate and with which frame context.
#[derive(Debug, Clone)]
pub(crate) struct Activation {
    segment: u32,
    call: u32,
    receiver: DataCell,
    vtable: Option<Rc<VirtualTable>>,
    lexicals: Option<Vec<DataCell>>,
    discard_result: bool,
}

impl Activation {
    pub(crate) fn new(segment: u32, call: u32) -> Self {
        Self {
            segment,
            call,
            receiver: DataCell::Invalid,
            vtable: None,
            lexicals: None,
            discard_result: false,
        }
    }

    pub(crate) fn with_receiver(mut self, receiver: DataCell) -> Self {
        self.receiver = receiver;
        self
    }

    pub(crate) fn with_vtable(mut self, vtable: Option<Rc<VirtualTable>>) -> Self {
        self.vtable = vtable;
        self
    }

    /// Use already captured lexicals instead of importing them from the
    /// call stack.
    pub(crate) fn with_lexicals(mut self, lexicals: Vec<DataCell>) -> Self {
        self.lexicals = Some(lexicals);
        self
    }

    /// The frame leaves nothing on the caller's stack, whatever the call
    /// descriptor says.
    pub(crate) fn discard_result(mut self) -> Self {
        self.discard_result = true;
        self
    }
}

/// Copy the slots named by `lexicals` out of the nearest matching
/// activations on the stack.
pub(crate) fn capture_lexicals(
    coro: &StackfulCoroutine,
    segment: u32,
    lexicals: &[ProcLexical],
) -> InterpreterResult<Vec<DataCell>> {
    lexicals
        .iter()
        .map(|lexical| {
            let frame = coro
                .calls_from_top()
                .find(|f| f.call_segment() == segment && f.call_index() == lexical.activation_call)
                .ok_or_else(|| {
                    InterpreterError::invariant(format!(
                        "missing lexical: no activation of call #{} on the stack",
                        lexical.activation_call
                    ))
                })?;
            let index = lexical.target_offset as usize;
            match lexical.target {
                LexicalTarget::Argument => frame.get_argument(index),
                LexicalTarget::Local => frame.get_local(index),
            }
        })
        .collect()
}

/// Push a frame for `activation` onto `coro` and jump to its body.
///
/// Placement values beyond the proc's declared arguments become rest
/// arguments.
pub(crate) fn push_activation(
    segments: &SegmentManager,
    coro: &mut StackfulCoroutine,
    activation: Activation,
    mut placement: Vec<DataCell>,
    return_ip: Option<InstructionPointer>,
) -> InterpreterResult<()> {
    let descriptor = segments.call(activation.segment, activation.call)?;
    let bytecode = segments.segment(activation.segment)?.bytecode();
    let proc = parse_proc(bytecode, descriptor.proc_offset as usize)?;

    if placement.len() > u16::MAX as usize {
        return Err(InterpreterError::rhs(format!(
            "{} arguments exceed the placement limit",
            placement.len()
        )));
    }
    let num_arguments = proc.header.num_arguments as usize;
    if placement.len() < num_arguments {
        return Err(InterpreterError::lhs(format!(
            "not enough arguments for {}: expected {num_arguments}, found {}",
            descriptor.name,
            placement.len()
        )));
    }
    let rest = placement.split_off(num_arguments);

    let lexicals = match activation.lexicals {
        Some(lexicals) if lexicals.len() == proc.lexicals.len() => lexicals,
        Some(lexicals) => {
            return Err(InterpreterError::invariant(format!(
                "{} expects {} lexicals, closure captured {}",
                descriptor.name,
                proc.lexicals.len(),
                lexicals.len()
            )));
        }
        None => capture_lexicals(coro, activation.segment, &proc.lexicals)?,
    };

    let frame = CallCell::new(
        activation.call,
        activation.segment,
        descriptor.proc_offset,
        return_ip,
        descriptor.returns_value && !activation.discard_result,
        coro.data_stack_size(),
        placement,
        proc.header.num_locals as usize,
        rest,
    )
    .with_receiver(activation.receiver)
    .with_vtable(activation.vtable)
    .with_lexicals(lexicals);

    coro.push_call(frame, InstructionPointer {
        segment: activation.segment,
        offset: proc.body_start,
        end: proc.body_end,
    });
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Returned {
    pub has_caller: bool,
    pub returns_value: bool,
}

/// Pop the top frame and resume its caller.
///
/// A value-returning frame leaves exactly its top value (or nil) on the
/// caller's stack; any other frame leaves the stack at the height it was
/// activated with.
pub(crate) fn return_to_caller(coro: &mut StackfulCoroutine) -> InterpreterResult<Returned> {
    let frame = coro.pop_call()?;
    let guard = frame.stack_guard();
    if coro.data_stack_size() < guard {
        return Err(InterpreterError::invariant(format!(
            "data stack fell below the frame guard ({} < {guard})",
            coro.data_stack_size()
        )));
    }
    if frame.returns_value() {
        let result = if coro.data_stack_size() > guard {
            coro.pop_data()?
        } else {
            DataCell::Nil
        };
        coro.resize_data_stack(guard);
        coro.push_data(result);
    } else {
        coro.resize_data_stack(guard);
    }
    coro.transfer_control(frame.return_ip());
    Ok(Returned {
        has_caller: frame.return_ip().is_some(),
        returns_value: frame.returns_value(),
    })
}

fn no_current_task() -> InterpreterError {
    InterpreterError::invariant("no current task")
}

/// Pop the receiver and placement of a virtual call in the order the flags
/// describe.
fn pop_receiver_and_placement(
    coro: &mut StackfulCoroutine,
    flags: CallFlags,
    placement: u16,
) -> InterpreterResult<(DataCell, Vec<DataCell>)> {
    if flags.contains(CallFlags::RECEIVER_FOLLOWS) {
        let receiver = coro.pop_data()?;
        let args = coro.pop_data_n(placement as usize)?;
        Ok((receiver, args))
    } else {
        let args = coro.pop_data_n(placement as usize)?;
        let receiver = coro.pop_data()?;
        Ok((receiver, args))
    }
}

fn forward_rest(
    coro: &StackfulCoroutine,
    flags: CallFlags,
    args: &mut Vec<DataCell>,
) -> InterpreterResult<()> {
    if flags.contains(CallFlags::FORWARD_REST) {
        args.extend_from_slice(coro.peek_call()?.rest());
    }
    Ok(())
}

impl InterpreterState {
    /// Segment of the code currently executing.
    pub(crate) fn current_segment(&self) -> InterpreterResult<u32> {
        self.current_coroutine()?
            .ip()
            .map(|ip| ip.segment)
            .ok_or_else(|| InterpreterError::invariant("no instruction pointer"))
    }

    pub(crate) fn call_static(
        &mut self,
        flags: CallFlags,
        address: u32,
        placement: u16,
    ) -> InterpreterResult<()> {
        let segment = self.current_segment()?;
        let coro = self.scheduler.current_coroutine_mut().ok_or_else(no_current_task)?;
        let mut args = coro.pop_data_n(placement as usize)?;
        forward_rest(coro, flags, &mut args)?;
        let return_ip = coro.ip();
        push_activation(&self.segments, coro, Activation::new(segment, address), args, return_ip)
    }

    pub(crate) fn call_virtual(
        &mut self,
        flags: CallFlags,
        address: u32,
        placement: u16,
    ) -> InterpreterResult<()> {
        let coro = self.scheduler.current_coroutine_mut().ok_or_else(no_current_task)?;
        let (receiver, mut args) = pop_receiver_and_placement(coro, flags, placement)?;
        let r = receiver
            .as_ref()
            .ok_or_else(|| InterpreterError::receiver("invalid receiver for virtual call"))?;
        forward_rest(coro, flags, &mut args)?;

        let vtable = self.heap.get(r)?.vtable().cloned().ok_or_else(|| {
            InterpreterError::receiver("receiver of virtual call has no virtual table")
        })?;
        let implementation = vtable.method(address).ok_or_else(|| {
            InterpreterError::missing(format!(
                "missing virtual method #{address} in {}",
                vtable.name()
            ))
        })?;
        let activation = Activation::new(vtable.segment(), implementation)
            .with_receiver(receiver)
            .with_vtable(Some(vtable));
        let return_ip = coro.ip();
        push_activation(&self.segments, coro, activation, args, return_ip)
    }

    /// Dispatch a concept action. The concept descriptor is on top, then the
    /// placement, then the receiver.
    pub(crate) fn call_concept(
        &mut self,
        flags: CallFlags,
        address: u32,
        placement: u16,
    ) -> InterpreterResult<()> {
        let coro = self.scheduler.current_coroutine_mut().ok_or_else(no_current_task)?;
        let concept = coro
            .pop_data()?
            .as_descriptor(Section::Concept)
            .ok_or_else(|| InterpreterError::lhs("invalid descriptor for action call"))?;
        let mut args = coro.pop_data_n(placement as usize)?;
        let receiver = coro.pop_data()?;
        let r = receiver
            .as_ref()
            .ok_or_else(|| InterpreterError::receiver("invalid receiver for action call"))?;
        forward_rest(coro, flags, &mut args)?;

        let vtable = self.heap.get(r)?.vtable().cloned().ok_or_else(|| {
            InterpreterError::receiver("receiver of action call has no virtual table")
        })?;
        let implementation = vtable.action(concept.address, address).ok_or_else(|| {
            InterpreterError::missing(format!(
                "{} does not implement action #{address} of concept #{}",
                vtable.name(),
                concept.address
            ))
        })?;
        let activation = Activation::new(vtable.segment(), implementation)
            .with_receiver(receiver)
            .with_vtable(Some(vtable));
        let return_ip = coro.ip();
        push_activation(&self.segments, coro, activation, args, return_ip)
    }

    /// Dispatch a method of an existential. The receiver is on top, then the
    /// existential descriptor, then the placement. Any valid value may be
    /// the receiver.
    pub(crate) fn call_existential(
        &mut self,
        flags: CallFlags,
        address: u32,
        placement: u16,
    ) -> InterpreterResult<()> {
        let coro = self.scheduler.current_coroutine_mut().ok_or_else(no_current_task)?;
        let receiver = coro.pop_data()?;
        if !receiver.is_valid() {
            return Err(InterpreterError::receiver("invalid receiver for existential call"));
        }
        let existential = coro
            .pop_data()?
            .as_descriptor(Section::Existential)
            .ok_or_else(|| InterpreterError::lhs("invalid descriptor for existential call"))?;
        let mut args = coro.pop_data_n(placement as usize)?;
        forward_rest(coro, flags, &mut args)?;

        let descriptor = self
            .segments
            .segment(existential.segment)?
            .object()
            .existentials
            .get(existential.address as usize)
            .ok_or_else(|| {
                InterpreterError::missing(format!("no existential #{}", existential.address))
            })?;
        let implementation = descriptor
            .methods
            .iter()
            .find(|binding| binding.call == address)
            .map(|binding| binding.implementation)
            .ok_or_else(|| {
                InterpreterError::missing(format!(
                    "missing method #{address} in existential {}",
                    descriptor.name
                ))
            })?;
        let activation =
            Activation::new(existential.segment, implementation).with_receiver(receiver);
        let return_ip = coro.ip();
        push_activation(&self.segments, coro, activation, args, return_ip)
    }

    /// Push the initializer frame of a static. Returns `false` when the
    /// static has no initializer.
    pub(crate) fn init_static(&mut self, address: u32) -> InterpreterResult<bool> {
        let segment = self.current_segment()?;
        let descriptor = self
            .segments
            .segment(segment)?
            .object()
            .statics
            .get(address as usize)
            .ok_or_else(|| InterpreterError::missing(format!("no static #{address}")))?;
        let Some(initializer) = descriptor.initializer else {
            return Ok(false);
        };
        log::debug!("initialising static {}", descriptor.name);
        let coro = self.scheduler.current_coroutine_mut().ok_or_else(no_current_task)?;
        let return_ip = coro.ip();
        push_activation(
            &self.segments,
            coro,
            Activation::new(segment, initializer),
            Vec::new(),
            return_ip,
        )?;
        Ok(true)
    }

    /// Push the allocator frame for a `new` of `address` in the current
    /// segment. Returns the table and the allocator trap to invoke; the trap
    /// leaves the new object on the stack and the caller pops the frame with
    /// [`return_to_caller`].
    pub(crate) fn prepare_new(
        &mut self,
        new_type: NewType,
        address: u32,
    ) -> InterpreterResult<(Rc<VirtualTable>, u32)> {
        let segment = self.current_segment()?;
        let section = match new_type {
            NewType::Class => Section::Class,
            NewType::Enum => Section::Enum,
            NewType::Instance => Section::Instance,
            NewType::Struct => Section::Struct,
        };
        let vtable = self
            .segments
            .resolve_vtable(Descriptor::new(section, segment, address))?;
        let allocator = vtable.allocator().ok_or_else(|| {
            InterpreterError::missing(format!("{} has no allocator", vtable.name()))
        })?;

        let coro = self.scheduler.current_coroutine_mut().ok_or_else(no_current_task)?;
        let ip = coro
            .ip()
            .ok_or_else(|| InterpreterError::invariant("no instruction pointer"))?;
        let frame = CallCell::new(
            address,
            segment,
            0,
            Some(ip),
            true,
            coro.data_stack_size(),
            Vec::new(),
            0,
            Vec::new(),
        )
        .with_vtable(Some(vtable.clone()));
        coro.push_call(frame, ip);
        Ok((vtable, allocator))
    }

    /// Push the constructor frame for a freshly allocated `value`. Returns
    /// `false` when the table has no constructor.
    pub(crate) fn construct_new(
        &mut self,
        vtable: Rc<VirtualTable>,
        value: DataCell,
        placement: Vec<DataCell>,
    ) -> InterpreterResult<bool> {
        let Some(ctor) = vtable.ctor() else {
            if !placement.is_empty() {
                log::warn!(
                    "{} has no constructor; dropping {} arguments",
                    vtable.name(),
                    placement.len()
                );
            }
            return Ok(false);
        };
        let coro = self.scheduler.current_coroutine_mut().ok_or_else(no_current_task)?;
        let activation = Activation::new(vtable.segment(), ctor)
            .with_receiver(value)
            .with_vtable(Some(vtable))
            .discard_result();
        let return_ip = coro.ip();
        push_activation(&self.segments, coro, activation, placement, return_ip)?;
        Ok(true)
    }

    /// Build a closure over `call`, capturing its lexicals from the current
    /// stack.
    pub(crate) fn make_closure(
        &mut self,
        call: Descriptor,
        vtable: Option<Rc<VirtualTable>>,
    ) -> InterpreterResult<DataCell> {
        let descriptor = self.segments.call(call.segment, call.address)?;
        let bytecode = self.segments.segment(call.segment)?.bytecode();
        let proc = parse_proc(bytecode, descriptor.proc_offset as usize)?;
        let coro = self.current_coroutine()?;
        let lexicals = capture_lexicals(coro, call.segment, &proc.lexicals)?;
        let closure = ClosureObject::new(vtable, call.segment, call.address, lexicals);
        Ok(DataCell::Ref(self.heap.allocate(closure)))
    }

    /// Activate a closure. On the current task the frame returns to the
    /// current instruction; on another task it becomes that task's bottom
    /// frame.
    pub(crate) fn apply_closure(
        &mut self,
        closure: HeapRef,
        args: Vec<DataCell>,
        task: Option<TaskId>,
    ) -> InterpreterResult<()> {
        let object = self.heap.get_as::<ClosureObject>(closure)?;
        let activation = Activation::new(object.segment(), object.call())
            .with_vtable(HeapObject::vtable(object).cloned())
            .with_lexicals(object.lexicals().to_vec());

        let (coro, return_ip) = match task {
            Some(id) => {
                let coro = self
                    .scheduler
                    .task_mut(id)
                    .map(|t| t.coroutine_mut())
                    .ok_or_else(|| InterpreterError::invariant(format!("unknown {id}")))?;
                (coro, None)
            }
            None => {
                let coro = self.scheduler.current_coroutine_mut().ok_or_else(no_current_task)?;
                let ip = coro.ip();
                (coro, ip)
            }
        };
        push_activation(&self.segments, coro, activation, args, return_ip)
    }
}
