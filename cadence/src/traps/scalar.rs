use crate::objects::StringObject;
use crate::{DataCell, InterpreterResult, InterpreterState};

use super::{expect_chr, expect_dbl, expect_i64};

pub fn i64_to_string(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let value = expect_i64(subject)?;
    Ok(Some(state.allocate(StringObject::new(value.to_string()))))
}

pub fn dbl_to_string(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let value = expect_dbl(subject)?;
    Ok(Some(state.allocate(StringObject::new(value.to_string()))))
}

pub fn chr_to_string(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let value = expect_chr(subject)?;
    Ok(Some(state.allocate(StringObject::new(value.to_string()))))
}

pub fn i64_to_dbl(
    _: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    Ok(Some(DataCell::Dbl(expect_i64(subject)? as f64)))
}

/// Truncates toward zero; NaN becomes 0 and out-of-range values saturate.
pub fn dbl_to_i64(
    _: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    Ok(Some(DataCell::I64(expect_dbl(subject)? as i64)))
}
