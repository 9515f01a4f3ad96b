use cadence_bytecode::Section;

use crate::{DataCell, InterpreterError, InterpreterResult, InterpreterState};

use super::{expect_ref, frame_vtable};

/// Closure over the call descriptor in the subject. Lexicals are copied
/// from the activations below the trap's own frame.
pub fn closure_ctor(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let call = subject
        .as_descriptor(Section::Call)
        .ok_or_else(|| InterpreterError::lhs("closure constructor needs a call descriptor"))?;
    let vtable = frame_vtable(state)?;
    state.make_closure(call, vtable).map(Some)
}

/// Activate the subject closure on the current task. Its result lands on
/// the trap frame's stack when it returns.
pub fn closure_apply(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let closure = expect_ref(subject)?;
    state.apply_closure(closure, args.to_vec(), None)?;
    Ok(None)
}
