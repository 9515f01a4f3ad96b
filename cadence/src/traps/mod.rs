//! Native operations reachable through the `TRAP` instruction.
//!
//! A trap runs inside the frame of the proc that executed it. The proc's
//! receiver (or, for a static proc, its first argument) is the trap's
//! subject; the remaining arguments and the rest arguments follow in order.
//! A returned value is pushed on the current data stack.

use std::collections::HashMap;
use std::rc::Rc;

use crate::{
    CallCell, DataCell, HeapObject, HeapRef, InterpreterError, InterpreterResult, InterpreterState,
    VirtualTable,
};

pub mod alloc;
pub mod closure;
pub mod map;
pub mod pair;
pub mod scalar;
pub mod seq;
pub mod string;
pub mod system;
pub mod task;

pub type TrapFn =
    fn(&mut InterpreterState, DataCell, &[DataCell]) -> InterpreterResult<Option<DataCell>>;

#[derive(Clone, Copy)]
pub struct TrapDesc {
    pub name: &'static str,
    /// Values required after the subject.
    pub arity: u8,
    pub func: TrapFn,
}

impl TrapDesc {
    pub const fn new(name: &'static str, arity: u8, func: TrapFn) -> Self {
        Self { name, arity, func }
    }
}

impl std::fmt::Debug for TrapDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrapDesc")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

pub fn default_traps() -> Vec<TrapDesc> {
    vec![
        TrapDesc::new("alloc.object", 0, alloc::alloc_object),
        TrapDesc::new("alloc.record", 0, alloc::alloc_record),
        TrapDesc::new("alloc.category", 0, alloc::alloc_category),
        TrapDesc::new("alloc.singleton", 0, alloc::alloc_singleton),
        TrapDesc::new("alloc.status", 0, alloc::alloc_status),
        TrapDesc::new("alloc.pair", 0, alloc::alloc_pair),
        TrapDesc::new("alloc.map", 0, alloc::alloc_map),
        TrapDesc::new("alloc.seq", 0, alloc::alloc_seq),
        TrapDesc::new("alloc.future", 0, alloc::alloc_future),
        TrapDesc::new("map.ctor", 0, map::map_ctor),
        TrapDesc::new("map.size", 0, map::map_size),
        TrapDesc::new("map.contains", 1, map::map_contains),
        TrapDesc::new("map.get", 1, map::map_get),
        TrapDesc::new("map.update", 2, map::map_update),
        TrapDesc::new("map.remove", 1, map::map_remove),
        TrapDesc::new("map.iterate", 0, map::map_iterate),
        TrapDesc::new("map.iterator.valid", 0, map::map_iterator_valid),
        TrapDesc::new("map.iterator.next", 0, map::map_iterator_next),
        TrapDesc::new("seq.ctor", 0, seq::seq_ctor),
        TrapDesc::new("seq.size", 0, seq::seq_size),
        TrapDesc::new("seq.get", 1, seq::seq_get),
        TrapDesc::new("seq.append", 0, seq::seq_append),
        TrapDesc::new("seq.extend", 1, seq::seq_extend),
        TrapDesc::new("seq.slice", 2, seq::seq_slice),
        TrapDesc::new("seq.iterate", 0, seq::seq_iterate),
        TrapDesc::new("seq.iterator.valid", 0, seq::seq_iterator_valid),
        TrapDesc::new("seq.iterator.next", 0, seq::seq_iterator_next),
        TrapDesc::new("pair.ctor", 2, pair::pair_ctor),
        TrapDesc::new("pair.first", 0, pair::pair_first),
        TrapDesc::new("pair.second", 0, pair::pair_second),
        TrapDesc::new("closure.ctor", 0, closure::closure_ctor),
        TrapDesc::new("closure.apply", 0, closure::closure_apply),
        TrapDesc::new("string.ctor", 0, string::string_ctor),
        TrapDesc::new("string.length", 0, string::string_length),
        TrapDesc::new("string.at", 1, string::string_at),
        TrapDesc::new("string.concat", 1, string::string_concat),
        TrapDesc::new("string.compare", 1, string::string_compare),
        TrapDesc::new("string.to_bytes", 0, string::string_to_bytes),
        TrapDesc::new("url.to_string", 0, string::url_to_string),
        TrapDesc::new("bytes.size", 0, string::bytes_size),
        TrapDesc::new("i64.to_string", 0, scalar::i64_to_string),
        TrapDesc::new("dbl.to_string", 0, scalar::dbl_to_string),
        TrapDesc::new("chr.to_string", 0, scalar::chr_to_string),
        TrapDesc::new("i64.to_dbl", 0, scalar::i64_to_dbl),
        TrapDesc::new("dbl.to_i64", 0, scalar::dbl_to_i64),
        TrapDesc::new("task.spawn", 0, task::task_spawn),
        TrapDesc::new("task.await", 0, task::task_await),
        TrapDesc::new("task.sleep", 0, task::task_sleep),
        TrapDesc::new("task.yield", 0, task::task_yield),
        TrapDesc::new("system.collect", 0, system::system_collect),
        TrapDesc::new("system.print", 0, system::system_print),
    ]
}

/// Trap registry indexed by the `TRAP` operand.
#[derive(Debug, Clone)]
pub struct TrapTable {
    traps: Vec<TrapDesc>,
    by_name: HashMap<&'static str, u32, ahash::RandomState>,
}

impl TrapTable {
    pub fn new() -> Self {
        Self {
            traps: Vec::new(),
            by_name: HashMap::default(),
        }
    }

    pub fn from_traps(traps: Vec<TrapDesc>) -> Self {
        let mut table = Self::new();
        for desc in traps {
            table.register(desc);
        }
        table
    }

    /// Append a trap and return its index. A later registration under the
    /// same name shadows the earlier one for name lookups.
    pub fn register(&mut self, desc: TrapDesc) -> u32 {
        let index = self.traps.len() as u32;
        if self.by_name.insert(desc.name, index).is_some() {
            log::warn!("trap {} registered twice", desc.name);
        }
        self.traps.push(desc);
        index
    }

    pub fn get(&self, index: u32) -> Option<&TrapDesc> {
        self.traps.get(index as usize)
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.traps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrapDesc> {
        self.traps.iter()
    }
}

impl Default for TrapTable {
    fn default() -> Self {
        Self::from_traps(default_traps())
    }
}

/// Split a frame into the trap subject and the values after it.
pub(crate) fn trap_arguments(frame: &CallCell) -> (DataCell, Vec<DataCell>) {
    let mut values: Vec<DataCell> = frame
        .arguments()
        .iter()
        .chain(frame.rest())
        .copied()
        .collect();
    let receiver = frame.receiver();
    if receiver.is_valid() {
        (receiver, values)
    } else if values.is_empty() {
        (DataCell::Invalid, values)
    } else {
        let subject = values.remove(0);
        (subject, values)
    }
}

pub(crate) fn expect_i64(value: DataCell) -> InterpreterResult<i64> {
    value
        .as_i64()
        .ok_or_else(|| InterpreterError::lhs(format!("expected i64, found {}", value.type_name())))
}

pub(crate) fn expect_dbl(value: DataCell) -> InterpreterResult<f64> {
    match value {
        DataCell::Dbl(v) => Ok(v),
        other => Err(InterpreterError::lhs(format!(
            "expected dbl, found {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn expect_chr(value: DataCell) -> InterpreterResult<char> {
    match value {
        DataCell::Chr(v) => Ok(v),
        other => Err(InterpreterError::lhs(format!(
            "expected chr, found {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn expect_ref(value: DataCell) -> InterpreterResult<HeapRef> {
    value.as_ref().ok_or_else(|| {
        InterpreterError::receiver(format!("expected object, found {}", value.type_name()))
    })
}

/// Borrow the subject as a concrete object kind.
pub(crate) fn expect_object<T: HeapObject>(
    state: &InterpreterState,
    value: DataCell,
) -> InterpreterResult<&T> {
    let r = expect_ref(value)?;
    state.heap().get_as::<T>(r)
}

pub(crate) fn arg(args: &[DataCell], index: usize) -> InterpreterResult<DataCell> {
    args.get(index).copied().ok_or_else(|| {
        InterpreterError::lhs(format!("missing trap argument {index}"))
    })
}

/// Virtual table of the executing frame; allocators and intrinsic
/// constructors brand new objects with it.
pub(crate) fn frame_vtable(
    state: &InterpreterState,
) -> InterpreterResult<Option<Rc<VirtualTable>>> {
    Ok(state.current_frame()?.vtable().cloned())
}

pub(crate) fn require_vtable(state: &InterpreterState) -> InterpreterResult<Rc<VirtualTable>> {
    frame_vtable(state)?
        .ok_or_else(|| InterpreterError::invariant("allocator trap outside an allocation frame"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_to_registration_order() {
        let table = TrapTable::default();
        assert_eq!(table.len(), default_traps().len());
        assert_eq!(table.index_of("alloc.object"), Some(0));
        let print = table.index_of("system.print").unwrap();
        assert_eq!(table.get(print).unwrap().name, "system.print");
        assert_eq!(table.index_of("no.such.trap"), None);
    }

    #[test]
    fn static_frames_use_the_first_argument_as_subject() {
        let frame = CallCell::new(
            0,
            0,
            0,
            None,
            true,
            0,
            vec![DataCell::I64(1), DataCell::I64(2)],
            0,
            vec![DataCell::I64(3)],
        );
        let (subject, args) = trap_arguments(&frame);
        assert_eq!(subject, DataCell::I64(1));
        assert_eq!(args, vec![DataCell::I64(2), DataCell::I64(3)]);

        let frame = frame.with_receiver(DataCell::Nil);
        let (subject, args) = trap_arguments(&frame);
        assert_eq!(subject, DataCell::Nil);
        assert_eq!(args.len(), 3);
    }
}
