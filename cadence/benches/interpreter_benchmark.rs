use cadence::{BytecodeInterpreter, InterpreterCreateInfo, TrapTable, demos};
use cadence_bytecode::BytecodeObject;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn run(object: &BytecodeObject, info: &InterpreterCreateInfo) {
    let mut interpreter = BytecodeInterpreter::new(info, TrapTable::default());
    interpreter.load_main(object.clone()).expect("load");
    black_box(interpreter.run().expect("run"));
}

fn bench_dispatch(c: &mut Criterion) {
    let info = InterpreterCreateInfo::default();
    let sum = demos::sum_to(10_000);
    c.bench_function("sum_to_10000", |b| b.iter(|| run(&sum, &info)));

    let fib = demos::fib(20);
    c.bench_function("fib_20", |b| b.iter(|| run(&fib, &info)));
}

fn bench_collections(c: &mut Criterion) {
    let info = InterpreterCreateInfo::default();
    let traps = TrapTable::default();

    let map = demos::map_squares(&traps, 1_000).expect("map program");
    c.bench_function("map_squares_1000", |b| b.iter(|| run(&map, &info)));

    let seq = demos::seq_append(&traps, 1_000).expect("seq program");
    c.bench_function("seq_append_1000", |b| b.iter(|| run(&seq, &info)));
}

fn bench_time_slice(c: &mut Criterion) {
    let program = demos::sum_to(10_000);
    let mut group = c.benchmark_group("time_slice");
    for slice in [1, 64, 4096] {
        let info = InterpreterCreateInfo {
            time_slice: Some(slice),
            ..Default::default()
        };
        group.bench_function(slice.to_string(), |b| b.iter(|| run(&program, &info)));
    }
    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_collections, bench_time_slice);
criterion_main!(benches);
