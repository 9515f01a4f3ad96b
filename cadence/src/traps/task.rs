//! Task traps. Suspending ones only work in the outermost dispatch loop: a
//! nested loop cannot give up its host stack.

use std::time::Duration;

use crate::objects::FutureObject;
use crate::{DataCell, InterpreterError, InterpreterResult, InterpreterState, PromiseState};

use super::{expect_i64, expect_object, expect_ref};

fn ensure_suspendable(state: &InterpreterState, what: &str) -> InterpreterResult<()> {
    if state.depth() > 1 {
        return Err(InterpreterError::invariant(format!(
            "cannot {what} inside a nested evaluation (depth {})",
            state.depth()
        )));
    }
    Ok(())
}

/// Run the subject closure on a new worker task and return a future of its
/// result.
pub fn task_spawn(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let closure = expect_ref(subject)?;
    let id = state.scheduler_mut().create_task();
    state.apply_closure(closure, args.to_vec(), Some(id))?;
    let promise = state.scheduler_mut().register_worker(id)?;
    state.scheduler_mut().resume_task(id)?;
    log::debug!("spawned {id}");
    Ok(Some(state.allocate(FutureObject::new(None, promise))))
}

/// Result of the subject future. An unsettled future suspends the task; the
/// result is pushed when it is next selected.
pub fn task_await(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let promise = expect_object::<FutureObject>(state, subject)?.promise().clone();
    match promise.state() {
        PromiseState::Completed | PromiseState::Rejected => Ok(Some(promise.result())),
        PromiseState::Initial | PromiseState::Pending => {
            ensure_suspendable(state, "await")?;
            let current = state.current_task()?;
            if state.scheduler_mut().await_promise(current, &promise)? {
                Ok(None)
            } else {
                Ok(Some(promise.result()))
            }
        }
    }
}

/// Suspend for the subject's number of milliseconds, then push nil.
pub fn task_sleep(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let millis = expect_i64(subject)?;
    ensure_suspendable(state, "sleep")?;
    let promise = crate::Promise::new();
    state
        .scheduler_mut()
        .register_timer(Duration::from_millis(millis.max(0) as u64), promise.clone());
    let current = state.current_task()?;
    state.scheduler_mut().await_promise(current, &promise)?;
    Ok(None)
}

pub fn task_yield(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    ensure_suspendable(state, "yield")?;
    state.scheduler_mut().yield_current();
    Ok(None)
}
