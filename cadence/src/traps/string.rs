use std::cmp::Ordering;

use cadence_bytecode::{LiteralDescriptor, Section};

use crate::objects::{BytesObject, StringObject, UrlObject};
use crate::{DataCell, InterpreterError, InterpreterResult, InterpreterState};

use super::{arg, expect_i64, expect_object};

/// String from a UTF-8 literal descriptor.
pub fn string_ctor(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let literal = subject
        .as_descriptor(Section::Literal)
        .ok_or_else(|| InterpreterError::lhs("string constructor needs a literal descriptor"))?;
    let text = match state.segments().literal(literal.segment, literal.address)? {
        LiteralDescriptor::Utf8(text) => text.clone(),
        other => {
            return Err(InterpreterError::lhs(format!(
                "literal #{} is not a string: {other:?}",
                literal.address
            )));
        }
    };
    Ok(Some(state.allocate(StringObject::new(text))))
}

pub fn string_length(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let string = expect_object::<StringObject>(state, subject)?;
    Ok(Some(DataCell::I64(string.length() as i64)))
}

pub fn string_at(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let index = expect_i64(arg(args, 0)?)?;
    let string = expect_object::<StringObject>(state, subject)?;
    let chr = usize::try_from(index)
        .ok()
        .and_then(|i| string.char_at(i))
        .map_or(DataCell::Invalid, DataCell::Chr);
    Ok(Some(chr))
}

/// Concatenate the text of any value onto the subject.
pub fn string_concat(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let other = arg(args, 0)?;
    let mut text = expect_object::<StringObject>(state, subject)?.as_str().to_owned();
    text.push_str(&state.describe(&other));
    Ok(Some(state.allocate(StringObject::new(text))))
}

pub fn string_compare(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let lhs = expect_object::<StringObject>(state, subject)?;
    let rhs = expect_object::<StringObject>(state, arg(args, 0)?)
        .map_err(|e| InterpreterError::rhs(e.message))?;
    let order = match lhs.as_str().cmp(rhs.as_str()) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    };
    Ok(Some(DataCell::I64(order)))
}

pub fn string_to_bytes(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let bytes = expect_object::<StringObject>(state, subject)?.as_str().as_bytes().to_vec();
    Ok(Some(state.allocate(BytesObject::new(bytes))))
}

pub fn url_to_string(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let text = expect_object::<UrlObject>(state, subject)?.as_str().to_owned();
    Ok(Some(state.allocate(StringObject::new(text))))
}

pub fn bytes_size(
    state: &mut InterpreterState,
    subject: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let bytes = expect_object::<BytesObject>(state, subject)?;
    Ok(Some(DataCell::I64(bytes.as_slice().len() as i64)))
}
