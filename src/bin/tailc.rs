//! Compiler driver: `.tail` source files to a `.tailc` bytecode image.

use std::path::PathBuf;
use std::process;

use taillang::bytecode::{disassembler, format, Compiler, SourceModule};
use taillang::lexer::Scanner;
use taillang::parser::Parser;
use taillang::resolver;

struct Options {
    inputs: Vec<PathBuf>,
    output: Option<PathBuf>,
    dump: bool,
}

fn print_usage() {
    eprintln!("Usage: tailc <file1.tail> [file2.tail ...] [-o output.tailc] [--dump]");
    eprintln!("Compiles Tail source code to Tail bytecode.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -o <file>   Output path (default: <first input stem>.tailc)");
    eprintln!("  --dump      Print a disassembly of the compiled image");
    eprintln!("  --help, -h  Show this help message");
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut options = Options {
        inputs: Vec::new(),
        output: None,
        dump: false,
    };

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        match arg.as_str() {
            "-o" => {
                i += 1;
                match args.get(i) {
                    Some(path) => options.output = Some(PathBuf::from(path)),
                    None => {
                        eprintln!("Error: -o flag requires an output filename");
                        process::exit(2);
                    }
                }
            }
            "--dump" => options.dump = true,
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            _ if arg.ends_with(".tail") => options.inputs.push(PathBuf::from(arg)),
            _ => {
                eprintln!("Error: unknown argument or not a .tail file: {}", arg);
                process::exit(2);
            }
        }
        i += 1;
    }

    if options.inputs.is_empty() {
        print_usage();
        process::exit(2);
    }

    options
}

fn main() {
    let options = parse_args();

    let output = options.output.clone().unwrap_or_else(|| {
        let stem = options.inputs[0]
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".to_string());
        PathBuf::from(format!("{}.tailc", stem))
    });

    let files = match resolver::collect_sources(&options.inputs) {
        Ok(files) => files,
        Err(err) => {
            eprintln!("Error: {}", err);
            process::exit(1);
        }
    };

    // Lex and parse every file before code generation; all diagnostics for a
    // failing phase are reported together.
    let mut modules = Vec::new();
    for file in &files {
        let (tokens, lex_errors) = Scanner::new(&file.source).tokenize();
        if !lex_errors.is_empty() {
            eprintln!("Lexer errors in {}:", file.path.display());
            for err in &lex_errors {
                eprintln!("  {}", err);
            }
            process::exit(1);
        }

        let mut parser = Parser::new(tokens);
        let program = parser.parse();
        if !parser.errors().is_empty() {
            eprintln!("Parser errors in {}:", file.path.display());
            for err in parser.errors() {
                eprintln!("  {}", err);
            }
            process::exit(1);
        }

        modules.push(SourceModule {
            name: file.module_name.clone(),
            is_primary: file.is_primary,
            program,
        });
    }

    let image = match Compiler::compile(&modules) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("Compile error: {}", err);
            process::exit(1);
        }
    };

    if options.dump {
        print!("{}", disassembler::dump_image(&image));
    }

    let data = format::serialize(&image);
    if let Err(err) = std::fs::write(&output, &data) {
        eprintln!("Error: cannot write to '{}': {}", output.display(), err);
        process::exit(1);
    }

    eprintln!(
        "Compiled {} file(s) -> {} ({} bytes, {} instructions, {} functions)",
        files.len(),
        output.display(),
        data.len(),
        image.code.len(),
        image.functions.len()
    );
}
