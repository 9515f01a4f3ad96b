//! Bytecode interpreter with cooperative tasks and persistent collections.
//!
//! A program is a [`cadence_bytecode::BytecodeObject`]. It is loaded into an
//! [`InterpreterState`] and run by a [`BytecodeInterpreter`], which resolves
//! `TRAP` instructions through a [`TrapTable`].

pub mod cell;
pub mod coroutine;
pub mod demos;
pub mod error;
pub mod frame;
pub mod heap;
pub mod inspector;
pub mod interpreter;
pub mod object;
pub mod objects;
pub mod rope;
pub mod scheduler;
pub mod segment;
pub mod state;
pub(crate) mod subroutine;
pub mod task;
pub mod traps;
pub mod trie;
pub mod visitor;
pub mod vtable;

pub use cell::{DataCell, Descriptor, HeapRef};
pub use coroutine::StackfulCoroutine;
pub use error::{InterpreterCondition, InterpreterError, InterpreterResult};
pub use frame::{CallCell, InstructionPointer};
pub use heap::{GarbageCollectionStats, Heap, HeapCreateInfo, HeapSettings};
pub use inspector::{Inspector, TracingInspector};
pub use interpreter::{BytecodeInterpreter, InterpreterCreateInfo, InterpreterSettings};
pub use object::{HeapObject, ObjectKind};
pub use scheduler::{AsyncHandle, SystemScheduler};
pub use state::InterpreterState;
pub use task::{Promise, PromiseState, Task, TaskId, TaskKind, TaskState};
pub use traps::{TrapDesc, TrapTable};
pub use visitor::{RootProvider, Visitor};
pub use vtable::VirtualTable;
