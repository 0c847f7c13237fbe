//! Error types for every phase of the toolchain.

use crate::span::Span;
use thiserror::Error;

/// Lexer errors. These are accumulated into a list during scanning rather
/// than aborting the scan; the driver inspects the list afterwards.
#[derive(Debug, Clone, Error)]
pub enum LexerError {
    #[error("Unexpected character '{0}' at {1}")]
    UnexpectedChar(char, Span),

    #[error("Unterminated string at {0}")]
    UnterminatedString(Span),

    #[error("Invalid number '{0}' at {1}")]
    InvalidNumber(String, Span),
}

impl LexerError {
    pub fn span(&self) -> Span {
        match self {
            Self::UnexpectedChar(_, span) => *span,
            Self::UnterminatedString(span) => *span,
            Self::InvalidNumber(_, span) => *span,
        }
    }
}

/// Parser errors. Each one triggers panic-mode synchronization to the next
/// statement boundary; all are reported together.
#[derive(Debug, Clone, Error)]
pub enum ParserError {
    #[error("Unexpected token '{found}', expected {expected} at {span}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("Invalid assignment target at {0}")]
    InvalidAssignmentTarget(Span),

    #[error("{message} at {span}")]
    General { message: String, span: Span },
}

impl ParserError {
    pub fn unexpected_token(
        expected: impl Into<String>,
        found: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::UnexpectedToken {
            expected: expected.into(),
            found: found.into(),
            span,
        }
    }

    pub fn general(message: impl Into<String>, span: Span) -> Self {
        Self::General {
            message: message.into(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::UnexpectedToken { span, .. } => *span,
            Self::InvalidAssignmentTarget(span) => *span,
            Self::General { span, .. } => *span,
        }
    }
}

/// Code generation errors. These abort compilation immediately.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("Undefined variable '{0}' at {1}")]
    UndefinedVariable(String, Span),

    #[error("Undefined function '{0}' at {1}")]
    UndefinedFunction(String, Span),

    #[error("'break' outside of a loop at {0}")]
    BreakOutsideLoop(Span),

    #[error("'continue' outside of a loop at {0}")]
    ContinueOutsideLoop(Span),

    #[error("Empty array literal needs an element type at {0}")]
    UntypedEmptyArray(Span),

    #[error("No function named 'Main'")]
    MissingMain,

    #[error("Duplicate 'Main' function (module '{0}')")]
    DuplicateMain(String),

    #[error("{message} at {span}")]
    General { message: String, span: Span },
}

impl CompileError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self::General {
            message: message.into(),
            span,
        }
    }
}

/// Errors decoding a binary bytecode image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Bad magic number 0x{0:08X} (expected 0x5441494C)")]
    BadMagic(u32),

    #[error("Unknown constant type tag 0x{0:02X}")]
    UnknownConstantType(u8),

    #[error("Pool entry is not valid UTF-8")]
    InvalidUtf8,
}

/// Runtime errors raised by the virtual machine. Every variant carries the
/// program counter at the point of failure.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Stack underflow at pc={0}")]
    StackUnderflow(usize),

    #[error("Division by zero at pc={0}")]
    DivisionByZero(usize),

    #[error("Modulo by zero at pc={0}")]
    ModuloByZero(usize),

    #[error("Constant index {index} out of bounds at pc={pc}")]
    BadConstantIndex { index: u32, pc: usize },

    #[error("Local slot {index} out of bounds at pc={pc}")]
    BadLocalSlot { index: u32, pc: usize },

    #[error("Jump target {target} out of bounds at pc={pc}")]
    BadJumpTarget { target: u32, pc: usize },

    #[error("String index {index} out of bounds at pc={pc}")]
    BadStringIndex { index: u32, pc: usize },

    #[error("Array index {index} out of bounds (length {length}) at pc={pc}")]
    IndexOutOfBounds { index: i64, length: usize, pc: usize },

    #[error("No function at address {address} (pc={pc})")]
    NoFunctionAtAddress { address: u32, pc: usize },

    #[error("Native import index {index} out of bounds at pc={pc}")]
    BadNativeIndex { index: u32, pc: usize },

    #[error("Native function '{name}' not implemented (pc={pc})")]
    UnknownNative { name: String, pc: usize },

    #[error("Unknown opcode 0x{opcode:02X} at pc={pc}")]
    UnknownOpcode { opcode: u8, pc: usize },

    #[error("Type error at pc={pc}: {message}")]
    TypeMismatch { message: String, pc: usize },

    #[error("Runtime error at pc={pc}: {message}")]
    General { message: String, pc: usize },
}

impl RuntimeError {
    pub fn type_mismatch(message: impl Into<String>, pc: usize) -> Self {
        Self::TypeMismatch {
            message: message.into(),
            pc,
        }
    }

    pub fn general(message: impl Into<String>, pc: usize) -> Self {
        Self::General {
            message: message.into(),
            pc,
        }
    }
}

/// A unified error type covering the whole pipeline.
#[derive(Debug, Error)]
pub enum TailError {
    #[error("Lexer error: {0}")]
    Lexer(#[from] LexerError),

    #[error("Parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
