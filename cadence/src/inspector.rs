use cadence_bytecode::Instruction;

use crate::{DataCell, InterpreterError, InterpreterResult, InterpreterState};

/// Host hook observing the dispatch loop.
///
/// Every method has a pass-through default, so an implementation only
/// overrides what it watches.
pub trait Inspector {
    fn before_op(&mut self, _state: &InterpreterState, _op: &Instruction) -> InterpreterResult<()> {
        Ok(())
    }

    fn after_op(&mut self, _state: &InterpreterState, _op: &Instruction) -> InterpreterResult<()> {
        Ok(())
    }

    /// Called with a failed instruction's error. Returning `Ok` resumes the
    /// loop at the next instruction.
    fn on_error(
        &mut self,
        _state: &InterpreterState,
        _op: &Instruction,
        error: InterpreterError,
    ) -> InterpreterResult<()> {
        Err(error)
    }

    fn on_interrupt(
        &mut self,
        _state: &InterpreterState,
        _value: DataCell,
    ) -> InterpreterResult<()> {
        Ok(())
    }

    fn on_halt(&mut self, _state: &InterpreterState, _result: &DataCell) {}
}

/// Logs every instruction with the current task and stack depths.
#[derive(Debug, Default)]
pub struct TracingInspector {
    executed: u64,
}

impl TracingInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl Inspector for TracingInspector {
    fn before_op(&mut self, state: &InterpreterState, op: &Instruction) -> InterpreterResult<()> {
        self.executed += 1;
        if let Ok(coro) = state.current_coroutine() {
            let offset = coro.ip().map_or(0, |ip| ip.offset);
            log::info!(
                "[{}] @{offset:<5} {op} data={} calls={} depth={}",
                state.scheduler().current_task().map_or_else(|| "-".to_string(), |t| t.to_string()),
                coro.data_stack_size(),
                coro.call_stack_size(),
                state.depth()
            );
        }
        Ok(())
    }

    fn on_error(
        &mut self,
        _state: &InterpreterState,
        op: &Instruction,
        error: InterpreterError,
    ) -> InterpreterResult<()> {
        log::error!("{op} failed: {error}");
        Err(error)
    }

    fn on_interrupt(&mut self, state: &InterpreterState, value: DataCell) -> InterpreterResult<()> {
        log::info!("interrupted with {}", state.describe(&value));
        Ok(())
    }

    fn on_halt(&mut self, state: &InterpreterState, result: &DataCell) {
        log::info!(
            "halted after {} instructions with {}",
            self.executed,
            state.describe(result)
        );
    }
}
