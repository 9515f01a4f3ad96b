//! Allocator traps. Each runs in the allocation frame pushed for `NEW` and
//! brands the new object with that frame's virtual table.

use crate::objects::{FieldsObject, FutureObject, MapObject, PairObject, SeqObject};
use crate::rope::PersistentSeq;
use crate::trie::PersistentMap;
use crate::{DataCell, InterpreterResult, InterpreterState, ObjectKind, Promise};

use super::require_vtable;

fn alloc_fields(
    state: &mut InterpreterState,
    kind: ObjectKind,
) -> InterpreterResult<Option<DataCell>> {
    let vtable = require_vtable(state)?;
    log::trace!("allocating {} {}", kind.as_str(), vtable.name());
    Ok(Some(state.allocate(FieldsObject::new(kind, vtable))))
}

pub fn alloc_object(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    alloc_fields(state, ObjectKind::Object)
}

pub fn alloc_record(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    alloc_fields(state, ObjectKind::Record)
}

pub fn alloc_category(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    alloc_fields(state, ObjectKind::Category)
}

pub fn alloc_singleton(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    alloc_fields(state, ObjectKind::Singleton)
}

pub fn alloc_status(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    alloc_fields(state, ObjectKind::Status)
}

pub fn alloc_pair(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let vtable = require_vtable(state)?;
    Ok(Some(state.allocate(PairObject::new(
        Some(vtable),
        DataCell::Invalid,
        DataCell::Invalid,
    ))))
}

pub fn alloc_map(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let vtable = require_vtable(state)?;
    Ok(Some(state.allocate(MapObject::new(Some(vtable), PersistentMap::new()))))
}

pub fn alloc_seq(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let vtable = require_vtable(state)?;
    Ok(Some(state.allocate(SeqObject::new(Some(vtable), PersistentSeq::new()))))
}

/// A future over a fresh promise; the host settles it through
/// [`SystemScheduler::register_async`](crate::SystemScheduler::register_async).
pub fn alloc_future(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let vtable = require_vtable(state)?;
    Ok(Some(state.allocate(FutureObject::new(Some(vtable), Promise::new()))))
}
