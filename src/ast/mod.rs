//! Abstract syntax tree produced by the parser.

pub mod expr;
pub mod stmt;

pub use expr::{BinaryOp, Expr, ExprKind, UnaryOp};
pub use stmt::{FunctionDecl, Parameter, Program, Stmt, StmtKind, TypeName};
