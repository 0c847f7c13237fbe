//! Bytecode: instruction set, image container, binary format and the
//! AST-to-bytecode compiler.

pub mod compiler;
pub mod disassembler;
pub mod format;
pub mod image;
pub mod opcode;

pub use compiler::{Compiler, SourceModule};
pub use image::{BytecodeImage, Constant, FunctionInfo, Instruction};
pub use opcode::OpCode;
