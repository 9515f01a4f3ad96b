use std::process;

use cadence::{
    BytecodeInterpreter, HeapCreateInfo, InterpreterCreateInfo, InterpreterResult,
    TracingInspector, TrapTable, demos,
};
use cadence_bytecode::{BytecodeDecoder, BytecodeObject, Section, parse_proc};
use clap::{Parser as ClapParser, ValueEnum};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Demo {
    /// Sum of 1..=N in a loop
    Sum,
    /// Recursive Fibonacci of N
    Fib,
    /// Persistent map of N squares
    Map,
    /// Persistent sequence of N appends
    Seq,
    /// Closure capturing an argument
    Closure,
    /// N sleeping worker tasks
    Tasks,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Program to run
    #[arg(value_enum, default_value = "sum")]
    demo: Demo,

    /// Size parameter of the program
    #[arg(short, long, default_value_t = 20)]
    n: i64,

    /// Print the disassembled procs instead of running
    #[arg(long, help = "Dump the bytecode of every call")]
    dump_bytecode: bool,

    /// Log every executed instruction
    #[arg(long)]
    trace: bool,

    #[arg(long, default_value = "warn", help = "Log filter when RUST_LOG is unset")]
    log_level: String,

    #[arg(long, help = "Instructions between scheduling points")]
    time_slice: Option<u32>,

    #[arg(long, help = "Maximum nesting of static initialisers and constructors")]
    max_recursion_depth: Option<usize>,

    #[arg(long, help = "Allocations between collections, 0 disables")]
    collect_threshold: Option<usize>,
}

fn build(demo: Demo, n: i64, traps: &TrapTable) -> InterpreterResult<BytecodeObject> {
    match demo {
        Demo::Sum => Ok(demos::sum_to(n)),
        Demo::Fib => Ok(demos::fib(n)),
        Demo::Map => demos::map_squares(traps, n),
        Demo::Seq => demos::seq_append(traps, n),
        Demo::Closure => demos::closure_adder(traps),
        Demo::Tasks => demos::sleeping_workers(traps, n),
    }
}

fn dump_object(object: &BytecodeObject) {
    println!("== {} ==", object.name);
    for (address, call) in object.calls.iter().enumerate() {
        let Ok(proc) = parse_proc(&object.bytecode, call.proc_offset as usize) else {
            println!("{address:>4} {} <undefined>", call.name);
            continue;
        };
        println!(
            "{address:>4} {} args={} locals={} lexicals={}",
            call.name,
            proc.header.num_arguments,
            proc.header.num_locals,
            proc.lexicals.len()
        );
        let mut decoder = BytecodeDecoder::at(&object.bytecode, proc.body_start);
        while decoder.offset() < proc.body_end {
            let offset = decoder.offset();
            match decoder.decode_next() {
                Ok(Some(instruction)) => println!("     {offset:>6}  {instruction}"),
                Ok(None) => break,
                Err(err) => {
                    println!("     {offset:>6}  <{err}>");
                    break;
                }
            }
        }
    }
    for (address, class) in object.classes.iter().enumerate() {
        println!(
            "{:?} {address} {} allocator={:?} ctor={:?}",
            Section::Class,
            class.name,
            class.allocator,
            class.ctor
        );
    }
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.trace { "info" } else { cli.log_level.as_str() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let traps = TrapTable::default();
    let object = match build(cli.demo, cli.n, &traps) {
        Ok(object) => object,
        Err(err) => {
            eprintln!("Error building {:?}: {}", cli.demo, err);
            process::exit(1);
        }
    };

    if cli.dump_bytecode {
        dump_object(&object);
        return;
    }

    let info = InterpreterCreateInfo {
        time_slice: cli.time_slice,
        max_recursion_depth: cli.max_recursion_depth,
        heap: HeapCreateInfo {
            collect_threshold: cli.collect_threshold,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut interpreter = BytecodeInterpreter::new(&info, traps);
    if cli.trace {
        interpreter = interpreter.with_inspector(Box::new(TracingInspector::new()));
    }

    let result = interpreter.load_main(object).and_then(|_| interpreter.run());
    match result {
        Ok(value) => println!("{}", interpreter.state().describe(&value)),
        Err(err) => {
            eprintln!("Error executing {:?}: {}", cli.demo, err);
            process::exit(1);
        }
    }
}
