use std::rc::Rc;

use crate::objects::{SeqIterator, SeqObject};
use crate::rope::PersistentSeq;
use crate::{DataCell, HeapObject, InterpreterResult, InterpreterState, VirtualTable};

use super::{arg, expect_i64, expect_object, expect_ref};

fn load(
    state: &InterpreterState,
    subject: DataCell,
) -> InterpreterResult<(Option<Rc<VirtualTable>>, PersistentSeq)> {
    let seq = expect_object::<SeqObject>(state, subject)?;
    Ok((HeapObject::vtable(seq).cloned(), seq.seq().clone()))
}

/// Fill a freshly allocated seq from the constructor's arguments.
pub fn seq_ctor(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let r = expect_ref(subject)?;
    state
        .heap_mut()
        .get_as_mut::<SeqObject>(r)?
        .set_seq(PersistentSeq::from_values(args.to_vec()));
    Ok(None)
}

pub fn seq_size(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let seq = expect_object::<SeqObject>(state, subject)?;
    Ok(Some(DataCell::I64(seq.seq().len() as i64)))
}

/// Element at the index, else the optional default, else invalid.
pub fn seq_get(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let index = expect_i64(arg(args, 0)?)?;
    let seq = expect_object::<SeqObject>(state, subject)?;
    let value = seq
        .seq()
        .get(index)
        .unwrap_or_else(|| args.get(1).copied().unwrap_or(DataCell::Invalid));
    Ok(Some(value))
}

pub fn seq_append(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let (vtable, base) = load(state, subject)?;
    let appended = base.append(args.to_vec());
    Ok(Some(state.allocate(SeqObject::new(vtable, appended))))
}

pub fn seq_extend(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let (vtable, base) = load(state, subject)?;
    let (_, other) = load(state, arg(args, 0)?)?;
    Ok(Some(state.allocate(SeqObject::new(vtable, base.extend(&other)))))
}

pub fn seq_slice(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let start = expect_i64(arg(args, 0)?)?;
    let length = expect_i64(arg(args, 1)?)?;
    let (vtable, base) = load(state, subject)?;
    Ok(Some(state.allocate(SeqObject::new(vtable, base.slice(start, length)))))
}

pub fn seq_iterate(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let r = expect_ref(subject)?;
    let snapshot = state.heap().get_as::<SeqObject>(r)?.seq().clone();
    Ok(Some(state.allocate(SeqIterator::new(None, r, snapshot))))
}

pub fn seq_iterator_valid(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let iterator = expect_object::<SeqIterator>(state, subject)?;
    Ok(Some(DataCell::Bool(iterator.valid())))
}

pub fn seq_iterator_next(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let r = expect_ref(subject)?;
    let next = state.heap_mut().get_as_mut::<SeqIterator>(r)?.next_value();
    Ok(Some(next.unwrap_or(DataCell::Invalid)))
}
