use crate::objects::PairObject;
use crate::{DataCell, InterpreterResult, InterpreterState};

use super::{arg, expect_object, expect_ref};

pub fn pair_ctor(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let (first, second) = (arg(args, 0)?, arg(args, 1)?);
    let r = expect_ref(subject)?;
    let pair = state.heap_mut().get_as_mut::<PairObject>(r)?;
    pair.set_slot(0, first)?;
    pair.set_slot(1, second)?;
    Ok(None)
}

pub fn pair_first(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    Ok(Some(expect_object::<PairObject>(state, subject)?.first()))
}

pub fn pair_second(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    Ok(Some(expect_object::<PairObject>(state, subject)?.second()))
}
