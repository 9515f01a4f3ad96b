use crate::{DataCell, InterpreterResult, InterpreterState};

/// Run a collection now and return the number of live objects.
pub fn system_collect(
    state: &mut InterpreterState,
    _: DataCell,
    _: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let stats = state.collect_garbage();
    log::debug!("collection: {stats:?}");
    Ok(Some(DataCell::I64(stats.live_after as i64)))
}

/// Write the subject and every argument to stdout, space separated.
pub fn system_print(
    state: &mut InterpreterState,
    subject: DataCell,
    args: &[DataCell],
) -> InterpreterResult<Option<DataCell>> {
    let line = std::iter::once(&subject)
        .chain(args)
        .filter(|cell| cell.is_valid())
        .map(|cell| state.describe(cell))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{line}");
    Ok(None)
}
