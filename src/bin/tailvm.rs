//! Interpreter driver: loads a `.tailc` image and runs its `Main`.

use std::path::Path;
use std::process;

use taillang::bytecode::format;
use taillang::vm::Vm;

fn print_usage() {
    eprintln!("Usage: tailvm <file.tailc>");
    eprintln!("Executes Tail bytecode in the Tail virtual machine.");
    eprintln!();
    eprintln!("First compile your Tail source code:");
    eprintln!("  tailc program.tail");
    eprintln!("Then execute it:");
    eprintln!("  tailvm program.tailc");
    eprintln!();
    eprintln!("Set TAIL_TRACE=1 to trace every instruction to stderr.");
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [input] = args.as_slice() else {
        print_usage();
        process::exit(2);
    };

    if Path::new(input).extension().and_then(|e| e.to_str()) != Some("tailc") {
        eprintln!("Warning: expected a .tailc file extension");
    }

    let data = match std::fs::read(input) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("Error: cannot open file '{}': {}", input, err);
            process::exit(1);
        }
    };

    let image = match format::deserialize(&data) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("Error: invalid bytecode file: {}", err);
            process::exit(1);
        }
    };

    let mut vm = Vm::new(image);
    if std::env::var("TAIL_TRACE").as_deref() == Ok("1") {
        vm.set_trace(true);
        eprintln!("[tracing enabled]");
    }

    if let Err(err) = vm.run() {
        eprintln!("Runtime error: {}", err);
        process::exit(1);
    }
}
