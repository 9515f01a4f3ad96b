//! Small programs assembled with [`ObjectBuilder`], shared by the command
//! line driver and the benchmarks.

use cadence_bytecode::{
    BytecodeBuilder, BytecodeObject, CallFlags, ClassDescriptor, Condition, Instruction,
    LexicalTarget, LoadTarget, NewType, ObjectBuilder, ProcLexical, ProcSignature, Section,
    StoreTarget,
};

use crate::{InterpreterError, InterpreterResult, TrapTable};

fn trap_index(traps: &TrapTable, name: &str) -> InterpreterResult<u32> {
    traps
        .index_of(name)
        .ok_or_else(|| InterpreterError::missing(format!("no trap named {name}")))
}

/// Static proc that forwards its arguments to one trap.
fn native(
    ob: &mut ObjectBuilder,
    traps: &TrapTable,
    name: &str,
    arguments: u16,
    returns_value: bool,
) -> InterpreterResult<u32> {
    let index = trap_index(traps, name)?;
    let mut signature = ProcSignature::new(arguments, 0);
    if !returns_value {
        signature = signature.returns_nothing();
    }
    Ok(ob.add_call(name, signature, |b| b.trap(index)))
}

fn load(b: &mut BytecodeBuilder, target: LoadTarget, address: u32) {
    b.emit(Instruction::Load { target, address });
}

fn store_local(b: &mut BytecodeBuilder, address: u32) {
    b.emit(Instruction::Store { target: StoreTarget::Local, address });
}

fn new_class(b: &mut BytecodeBuilder, address: u32, placement: u16) {
    b.emit(Instruction::New {
        new_type: NewType::Class,
        flags: CallFlags::empty(),
        address,
        placement,
    });
}

/// Sum of `1..=n` in a counted loop.
pub fn sum_to(n: i64) -> BytecodeObject {
    let mut ob = ObjectBuilder::new("sum");
    let main = ob.add_call("main", ProcSignature::new(0, 2), |b| {
        b.i64(0);
        store_local(b, 0);
        b.i64(n);
        store_local(b, 1);
        let top = b.current_offset();
        load(b, LoadTarget::Local, 1);
        let done = b.branch(Condition::Zero);
        load(b, LoadTarget::Local, 0);
        load(b, LoadTarget::Local, 1);
        b.emit(Instruction::I64Add);
        store_local(b, 0);
        load(b, LoadTarget::Local, 1);
        b.i64(1);
        b.emit(Instruction::I64Sub);
        store_local(b, 1);
        b.jump_back(top);
        b.bind(done);
        load(b, LoadTarget::Local, 0);
        b.emit(Instruction::Halt);
    });
    ob.set_entry(main);
    ob.finish()
}

/// Doubly recursive Fibonacci through static calls.
pub fn fib(n: i64) -> BytecodeObject {
    let mut ob = ObjectBuilder::new("fib");
    let fib = ob.declare_call("fib");
    ob.define_call(fib, ProcSignature::new(1, 0), |b| {
        load(b, LoadTarget::Argument, 0);
        b.i64(2);
        b.emit(Instruction::I64Cmp);
        let recurse = b.branch(Condition::Ge);
        load(b, LoadTarget::Argument, 0);
        b.return_();
        b.bind(recurse);
        load(b, LoadTarget::Argument, 0);
        b.i64(1);
        b.emit(Instruction::I64Sub);
        b.call_static(fib, 1);
        load(b, LoadTarget::Argument, 0);
        b.i64(2);
        b.emit(Instruction::I64Sub);
        b.call_static(fib, 1);
        b.emit(Instruction::I64Add);
    });
    let main = ob.add_call("main", ProcSignature::new(0, 0), |b| {
        b.i64(n);
        b.call_static(fib, 1);
        b.emit(Instruction::Halt);
    });
    ob.set_entry(main);
    ob.finish()
}

/// Builds a map of `i -> i * i` for `i < count`, prints its size, then
/// iterates it and halts with the sum of the values.
pub fn map_squares(traps: &TrapTable, count: i64) -> InterpreterResult<BytecodeObject> {
    let mut ob = ObjectBuilder::new("map");
    let ctor = native(&mut ob, traps, "map.ctor", 0, false)?;
    let update = native(&mut ob, traps, "map.update", 3, true)?;
    let size = native(&mut ob, traps, "map.size", 1, true)?;
    let iterate = native(&mut ob, traps, "map.iterate", 1, true)?;
    let valid = native(&mut ob, traps, "map.iterator.valid", 1, true)?;
    let next = native(&mut ob, traps, "map.iterator.next", 1, true)?;
    let second = native(&mut ob, traps, "pair.second", 1, true)?;
    let print = native(&mut ob, traps, "system.print", 1, false)?;
    let class = ob.add_class(Section::Class, ClassDescriptor {
        name: "Map".into(),
        allocator: Some(trap_index(traps, "alloc.map")?),
        ctor: Some(ctor),
        ..Default::default()
    });

    // locals: map, counter, iterator, sum
    let main = ob.add_call("main", ProcSignature::new(0, 4), |b| {
        new_class(b, class, 0);
        store_local(b, 0);
        b.i64(0);
        store_local(b, 1);
        let top = b.current_offset();
        load(b, LoadTarget::Local, 1);
        b.i64(count);
        b.emit(Instruction::I64Cmp);
        let filled = b.branch(Condition::Ge);
        load(b, LoadTarget::Local, 0);
        load(b, LoadTarget::Local, 1);
        load(b, LoadTarget::Local, 1);
        load(b, LoadTarget::Local, 1);
        b.emit(Instruction::I64Mul);
        b.call_static(update, 3);
        store_local(b, 0);
        load(b, LoadTarget::Local, 1);
        b.i64(1);
        b.emit(Instruction::I64Add);
        store_local(b, 1);
        b.jump_back(top);
        b.bind(filled);

        load(b, LoadTarget::Local, 0);
        b.call_static(size, 1);
        b.call_static(print, 1);

        load(b, LoadTarget::Local, 0);
        b.call_static(iterate, 1);
        store_local(b, 2);
        b.i64(0);
        store_local(b, 3);
        let step = b.current_offset();
        load(b, LoadTarget::Local, 2);
        b.call_static(valid, 1);
        let done = b.branch(Condition::False);
        load(b, LoadTarget::Local, 3);
        load(b, LoadTarget::Local, 2);
        b.call_static(next, 1);
        b.call_static(second, 1);
        b.emit(Instruction::I64Add);
        store_local(b, 3);
        b.jump_back(step);
        b.bind(done);
        load(b, LoadTarget::Local, 3);
        b.emit(Instruction::Halt);
    });
    ob.set_entry(main);
    Ok(ob.finish())
}

/// Appends `0..count` to a sequence one element at a time, then halts with
/// the size of its upper half.
pub fn seq_append(traps: &TrapTable, count: i64) -> InterpreterResult<BytecodeObject> {
    let mut ob = ObjectBuilder::new("seq");
    let ctor = native(&mut ob, traps, "seq.ctor", 0, false)?;
    let append = native(&mut ob, traps, "seq.append", 1, true)?;
    let slice = native(&mut ob, traps, "seq.slice", 3, true)?;
    let size = native(&mut ob, traps, "seq.size", 1, true)?;
    let get = native(&mut ob, traps, "seq.get", 2, true)?;
    let print = native(&mut ob, traps, "system.print", 1, false)?;
    let class = ob.add_class(Section::Class, ClassDescriptor {
        name: "Seq".into(),
        allocator: Some(trap_index(traps, "alloc.seq")?),
        ctor: Some(ctor),
        ..Default::default()
    });

    let main = ob.add_call("main", ProcSignature::new(0, 2), |b| {
        new_class(b, class, 0);
        store_local(b, 0);
        b.i64(0);
        store_local(b, 1);
        let top = b.current_offset();
        load(b, LoadTarget::Local, 1);
        b.i64(count);
        b.emit(Instruction::I64Cmp);
        let filled = b.branch(Condition::Ge);
        load(b, LoadTarget::Local, 0);
        load(b, LoadTarget::Local, 1);
        b.call_static(append, 2);
        store_local(b, 0);
        load(b, LoadTarget::Local, 1);
        b.i64(1);
        b.emit(Instruction::I64Add);
        store_local(b, 1);
        b.jump_back(top);
        b.bind(filled);

        load(b, LoadTarget::Local, 0);
        b.i64(count - 1);
        b.call_static(get, 2);
        b.call_static(print, 1);
        load(b, LoadTarget::Local, 0);
        b.i64(count / 2);
        b.i64(count - count / 2);
        b.call_static(slice, 3);
        b.call_static(size, 1);
        b.emit(Instruction::Halt);
    });
    ob.set_entry(main);
    Ok(ob.finish())
}

/// `adder(n)` returns a closure over `n`; main applies it twice.
pub fn closure_adder(traps: &TrapTable) -> InterpreterResult<BytecodeObject> {
    let mut ob = ObjectBuilder::new("closure");
    let make = native(&mut ob, traps, "closure.ctor", 1, true)?;
    let apply = native(&mut ob, traps, "closure.apply", 1, true)?;
    let adder = ob.declare_call("adder");
    let add = ob.add_call(
        "adder.add",
        ProcSignature::new(1, 0).with_lexicals(vec![ProcLexical {
            activation_call: adder,
            target_offset: 0,
            target: LexicalTarget::Argument,
        }]),
        |b| {
            load(b, LoadTarget::Lexical, 0);
            load(b, LoadTarget::Argument, 0);
            b.emit(Instruction::I64Add);
        },
    );
    ob.define_call(adder, ProcSignature::new(1, 0), |b| {
        b.emit(Instruction::Descriptor { section: Section::Call, address: add });
        b.call_static(make, 1);
    });
    let main = ob.add_call("main", ProcSignature::new(0, 1), |b| {
        b.i64(40);
        b.call_static(adder, 1);
        store_local(b, 0);
        load(b, LoadTarget::Local, 0);
        load(b, LoadTarget::Local, 0);
        b.i64(1);
        b.call_static(apply, 2);
        b.call_static(apply, 2);
        b.emit(Instruction::Halt);
    });
    ob.set_entry(main);
    Ok(ob.finish())
}

/// Spawns `workers` tasks that each sleep, print their number and return
/// its square; main awaits them in order and halts with the total.
pub fn sleeping_workers(traps: &TrapTable, workers: i64) -> InterpreterResult<BytecodeObject> {
    let mut ob = ObjectBuilder::new("tasks");
    let make = native(&mut ob, traps, "closure.ctor", 1, true)?;
    let spawn = native(&mut ob, traps, "task.spawn", 1, true)?;
    let await_ = native(&mut ob, traps, "task.await", 1, true)?;
    let sleep = native(&mut ob, traps, "task.sleep", 1, true)?;
    let print = native(&mut ob, traps, "system.print", 1, false)?;
    let seq_ctor = native(&mut ob, traps, "seq.ctor", 0, false)?;
    let append = native(&mut ob, traps, "seq.append", 1, true)?;
    let get = native(&mut ob, traps, "seq.get", 2, true)?;
    let seq = ob.add_class(Section::Class, ClassDescriptor {
        name: "Futures".into(),
        allocator: Some(trap_index(traps, "alloc.seq")?),
        ctor: Some(seq_ctor),
        ..Default::default()
    });

    let job = ob.declare_call("job");
    let work = ob.add_call(
        "job.work",
        ProcSignature::new(0, 0).with_lexicals(vec![ProcLexical {
            activation_call: job,
            target_offset: 0,
            target: LexicalTarget::Argument,
        }]),
        |b| {
            // later workers sleep less, so they finish first
            b.i64(workers + 1);
            load(b, LoadTarget::Lexical, 0);
            b.emit(Instruction::I64Sub);
            b.call_static(sleep, 1);
            b.emit(Instruction::Pop);
            load(b, LoadTarget::Lexical, 0);
            b.call_static(print, 1);
            load(b, LoadTarget::Lexical, 0);
            load(b, LoadTarget::Lexical, 0);
            b.emit(Instruction::I64Mul);
        },
    );
    ob.define_call(job, ProcSignature::new(1, 0), |b| {
        b.emit(Instruction::Descriptor { section: Section::Call, address: work });
        b.call_static(make, 1);
    });

    // locals: futures, counter, total
    let main = ob.add_call("main", ProcSignature::new(0, 3), |b| {
        new_class(b, seq, 0);
        store_local(b, 0);
        b.i64(0);
        store_local(b, 1);
        let spawning = b.current_offset();
        load(b, LoadTarget::Local, 1);
        b.i64(workers);
        b.emit(Instruction::I64Cmp);
        let spawned = b.branch(Condition::Ge);
        load(b, LoadTarget::Local, 0);
        load(b, LoadTarget::Local, 1);
        b.call_static(job, 1);
        b.call_static(spawn, 1);
        b.call_static(append, 2);
        store_local(b, 0);
        load(b, LoadTarget::Local, 1);
        b.i64(1);
        b.emit(Instruction::I64Add);
        store_local(b, 1);
        b.jump_back(spawning);
        b.bind(spawned);

        b.i64(0);
        store_local(b, 1);
        b.i64(0);
        store_local(b, 2);
        let awaiting = b.current_offset();
        load(b, LoadTarget::Local, 1);
        b.i64(workers);
        b.emit(Instruction::I64Cmp);
        let finished = b.branch(Condition::Ge);
        load(b, LoadTarget::Local, 2);
        load(b, LoadTarget::Local, 0);
        load(b, LoadTarget::Local, 1);
        b.call_static(get, 2);
        b.call_static(await_, 1);
        b.emit(Instruction::I64Add);
        store_local(b, 2);
        load(b, LoadTarget::Local, 1);
        b.i64(1);
        b.emit(Instruction::I64Add);
        store_local(b, 1);
        b.jump_back(awaiting);
        b.bind(finished);
        load(b, LoadTarget::Local, 2);
        b.emit(Instruction::Halt);
    });
    ob.set_entry(main);
    Ok(ob.finish())
}
