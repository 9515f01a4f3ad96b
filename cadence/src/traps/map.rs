use std::rc::Rc;

use crate::objects::{MapIterator, MapObject, PairObject};
use crate::trie::PersistentMap;
use crate::{
    DataCell, HeapObject, InterpreterError, InterpreterResult, InterpreterState, VirtualTable,
};

use super::{arg, expect_object, expect_ref};

/// Snapshot of a map's root and branding.
fn load(
    state: &InterpreterState,
    subject: DataCell,
) -> InterpreterResult<(Option<Rc<VirtualTable>>, PersistentMap)> {
    let map = expect_object::<MapObject>(state, subject)?;
    Ok((HeapObject::vtable(map).cloned(), map.map().clone()))
}

/// Fill a freshly allocated map from alternating key/value arguments.
pub fn map_ctor(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    if args.len() % 2 != 0 {
        return Err(InterpreterError::lhs("map constructor needs key/value pairs"));
    }
    let r = expect_ref(subject)?;
    let mut map = state.heap().get_as::<MapObject>(r)?.map().clone();
    for entry in args.chunks_exact(2) {
        map = map.update(state.heap(), entry[0], entry[1]);
    }
    state.heap_mut().get_as_mut::<MapObject>(r)?.set_map(map);
    Ok(None)
}

pub fn map_size(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let map = expect_object::<MapObject>(state, subject)?;
    Ok(Some(DataCell::I64(map.map().len() as i64)))
}

pub fn map_contains(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let key = arg(args, 0)?;
    let map = expect_object::<MapObject>(state, subject)?;
    Ok(Some(DataCell::Bool(map.map().contains(state.heap(), &key))))
}

/// Value under the key, else the optional default, else invalid.
pub fn map_get(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let key = arg(args, 0)?;
    let map = expect_object::<MapObject>(state, subject)?;
    let value = map
        .map()
        .get(state.heap(), &key)
        .unwrap_or_else(|| args.get(1).copied().unwrap_or(DataCell::Invalid));
    Ok(Some(value))
}

/// New map sharing every untouched subtree with the subject.
pub fn map_update(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let (key, value) = (arg(args, 0)?, arg(args, 1)?);
    let (vtable, base) = load(state, subject)?;
    let updated = base.update(state.heap(), key, value);
    Ok(Some(state.allocate(MapObject::new(vtable, updated))))
}

/// Removing an absent key hands back the subject itself.
pub fn map_remove(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let key = arg(args, 0)?;
    let (vtable, base) = load(state, subject)?;
    match base.remove(state.heap(), &key) {
        Some(removed) => Ok(Some(state.allocate(MapObject::new(vtable, removed)))),
        None => Ok(Some(subject)),
    }
}

pub fn map_iterate(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let r = expect_ref(subject)?;
    let snapshot = state.heap().get_as::<MapObject>(r)?.map().clone();
    Ok(Some(state.allocate(MapIterator::new(None, r, &snapshot))))
}

pub fn map_iterator_valid(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let iterator = expect_object::<MapIterator>(state, subject)?;
    Ok(Some(DataCell::Bool(iterator.valid())))
}

/// Next entry as a key/value pair, or invalid once exhausted.
pub fn map_iterator_next(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let r = expect_ref(subject)?;
    match state.heap_mut().get_as_mut::<MapIterator>(r)?.next_entry() {
        Some((key, value)) => Ok(Some(state.allocate(PairObject::new(None, key, value)))),
        None => Ok(Some(DataCell::Invalid)),
    }
}
