//! Textual dump of a bytecode image, used by `tailc --dump` and by the VM's
//! instruction tracing.

use std::fmt::Write as _;

use crate::bytecode::image::{BytecodeImage, Constant, Instruction};
use crate::bytecode::opcode::OpCode;

/// Render one instruction as `MNEMONIC [operand]`.
pub fn format_instruction(instr: &Instruction) -> String {
    match OpCode::from_u8(instr.opcode) {
        Some(op) if op.has_operand() => format!("{} {}", op.mnemonic(), instr.operand),
        Some(op) => op.mnemonic().to_string(),
        None => format!("UNKNOWN(0x{:02X})", instr.opcode),
    }
}

/// Render a whole image: code listing, constants, pools, function table and
/// native imports.
pub fn dump_image(image: &BytecodeImage) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "=== Tail Bytecode Image ===");
    let _ = writeln!(out, "Version: {}", image.version);
    let _ = writeln!(out, "Code size: {} instructions", image.code.len());
    let _ = writeln!(out, "Constants: {}", image.constants.len());
    let _ = writeln!(out, "Strings: {}", image.strings.len());
    let _ = writeln!(out, "Int arrays: {}", image.int_arrays.len());
    let _ = writeln!(out, "Float arrays: {}", image.float_arrays.len());
    let _ = writeln!(out, "String arrays: {}", image.string_arrays.len());
    let _ = writeln!(out, "Functions: {}", image.functions.len());
    let _ = writeln!(out, "Native imports: {}", image.native_imports.len());

    if !image.code.is_empty() {
        let _ = writeln!(out, "\n=== Code ===");
        for (i, instr) in image.code.iter().enumerate() {
            let _ = writeln!(out, "{:04}: {}", i, format_instruction(instr));
        }
    }

    if !image.constants.is_empty() {
        let _ = writeln!(out, "\n=== Constants ===");
        for (i, constant) in image.constants.iter().enumerate() {
            let rendered = match constant {
                Constant::Nil => "NIL".to_string(),
                Constant::Int(v) => format!("INT {}", v),
                Constant::Float(v) => format!("FLOAT {}", v),
                Constant::Bool(v) => format!("BOOL {}", v),
                Constant::Str(idx) => format!("STRING idx={}", idx),
                Constant::IntArray(idx) => format!("ARRAY_INT idx={}", idx),
                Constant::FloatArray(idx) => format!("ARRAY_FLOAT idx={}", idx),
                Constant::StrArray(idx) => format!("ARRAY_STRING idx={}", idx),
            };
            let _ = writeln!(out, "{:4}: {}", i, rendered);
        }
    }

    if !image.strings.is_empty() {
        let _ = writeln!(out, "\n=== Strings ===");
        for (i, s) in image.strings.iter().enumerate() {
            let _ = writeln!(out, "{:4}: {:?}", i, s);
        }
    }

    if !image.functions.is_empty() {
        let _ = writeln!(out, "\n=== Functions ===");
        for func in &image.functions {
            let _ = writeln!(
                out,
                "{} @ {} (arity={}, locals={})",
                func.name, func.address, func.arity, func.locals
            );
        }
    }

    if !image.native_imports.is_empty() {
        let _ = writeln!(out, "\n=== Native Imports ===");
        for (i, name) in image.native_imports.iter().enumerate() {
            let _ = writeln!(out, "{}: {}", i, name);
        }
    }

    out
}
