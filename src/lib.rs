//! Tail: a small statically-typed imperative language with a two-stage
//! toolchain.
//!
//! The `tailc` driver translates `.tail` source into a binary bytecode
//! image; the `tailvm` driver loads that image and executes it. Both stages
//! share this library: value representation, constant pools, function table
//! and control-flow conventions agree bit-for-bit between them.
//!
//! Pipeline: source text → lexer → tokens → parser → AST → compiler →
//! bytecode image → (serialize / deserialize) → VM.

pub mod ast;
pub mod bytecode;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod span;
pub mod vm;

use bytecode::{BytecodeImage, Compiler, SourceModule};
use error::TailError;

/// Compile a single source buffer into an image. Convenience for tests and
/// embedding; the `tailc` driver goes through [`resolver`] for multi-file
/// programs.
pub fn compile_source(source: &str) -> Result<BytecodeImage, TailError> {
    let (tokens, lex_errors) = lexer::Scanner::new(source).tokenize();
    if let Some(err) = lex_errors.into_iter().next() {
        return Err(err.into());
    }

    let mut parser = parser::Parser::new(tokens);
    let program = parser.parse();
    if let Some(err) = parser.errors().first() {
        return Err(err.clone().into());
    }

    let image = Compiler::compile(&[SourceModule::primary("main", program)])?;
    Ok(image)
}

/// Run an image to completion on a fresh VM.
pub fn run_image(image: BytecodeImage) -> Result<(), TailError> {
    let mut vm = vm::Vm::new(image);
    vm.run()?;
    Ok(())
}

/// Compile and immediately execute a source buffer.
pub fn run_source(source: &str) -> Result<(), TailError> {
    run_image(compile_source(source)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_source_produces_a_runnable_image() {
        let image = compile_source("fn Main(){ }").expect("compile");
        assert!(image.find_function("Main").is_some());
        run_image(image).expect("run");
    }

    #[test]
    fn compile_source_surfaces_lex_errors() {
        assert!(matches!(
            compile_source("fn Main(){ @ }"),
            Err(TailError::Lexer(_))
        ));
    }

    #[test]
    fn compile_source_surfaces_parse_errors() {
        assert!(matches!(
            compile_source("fn Main({ }"),
            Err(TailError::Parser(_))
        ));
    }

    #[test]
    fn compile_source_surfaces_compile_errors() {
        assert!(matches!(
            compile_source("fn f(){ return 1; }"),
            Err(TailError::Compile(_))
        ));
    }
}
