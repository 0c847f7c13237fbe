//! Single-pass code generator: AST to bytecode image.
//!
//! Emission order is fixed: include-module functions first (qualified
//! `<module>_<name>`), then primary-file functions (short name plus a
//! qualified alias), then `Main`, then a trailing `HALT`.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::ast::{BinaryOp, Expr, ExprKind, FunctionDecl, Program, Stmt, StmtKind, TypeName, UnaryOp};
use crate::bytecode::image::{BytecodeImage, Constant, FunctionInfo, Instruction};
use crate::bytecode::opcode::OpCode;
use crate::error::CompileError;
use crate::span::Span;

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Placeholder operand for a forward jump, overwritten when the target is
/// known.
const JUMP_SENTINEL: u32 = 0xFFFF_FFFF;

/// One parsed source file with its logical module name.
#[derive(Debug, Clone)]
pub struct SourceModule {
    pub name: String,
    pub is_primary: bool,
    pub program: Program,
}

impl SourceModule {
    pub fn primary(name: impl Into<String>, program: Program) -> Self {
        Self {
            name: name.into(),
            is_primary: true,
            program,
        }
    }

    pub fn include(name: impl Into<String>, program: Program) -> Self {
        Self {
            name: name.into(),
            is_primary: false,
            program,
        }
    }
}

/// Per-function compile state: a lexical scope chain for name resolution over
/// a single flat slot counter. Blocks open a new naming scope but never reset
/// slot numbering.
#[allow(dead_code)]
struct FunctionContext {
    scopes: Vec<HashMap<String, u32>>,
    next_slot: u32,
    start_addr: u32,
    param_count: u32,
}

impl FunctionContext {
    fn new(start_addr: u32, param_count: u32) -> Self {
        Self {
            scopes: vec![HashMap::new()],
            next_slot: 0,
            start_addr,
            param_count,
        }
    }

    fn declare(&mut self, name: &str) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.scopes
            .last_mut()
            .expect("scope chain is never empty")
            .insert(name.to_string(), slot);
        slot
    }

    fn resolve(&self, name: &str) -> Option<u32> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }
}

/// Pending break/continue patch sites for one loop.
#[derive(Default)]
struct LoopContext {
    break_sites: Vec<u32>,
    continue_sites: Vec<u32>,
}

/// The bytecode compiler.
pub struct Compiler {
    image: BytecodeImage,
    contexts: Vec<FunctionContext>,
    loops: Vec<LoopContext>,
    globals: IndexMap<String, u32>,
    function_addrs: IndexMap<String, u32>,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            image: BytecodeImage::new(),
            // Root context so statement compilation always has a frame.
            contexts: vec![FunctionContext::new(0, 0)],
            loops: Vec::new(),
            globals: IndexMap::new(),
            function_addrs: IndexMap::new(),
        }
    }

    /// Compile a set of modules into one image.
    pub fn compile(modules: &[SourceModule]) -> CompileResult<BytecodeImage> {
        Compiler::new().compile_modules(modules)
    }

    pub fn compile_modules(mut self, modules: &[SourceModule]) -> CompileResult<BytecodeImage> {
        // Include-module functions come first, under qualified names. An
        // include's Main is ignored.
        for module in modules.iter().filter(|m| !m.is_primary) {
            for func in module.program.functions() {
                if func.name != "Main" {
                    self.compile_function(func, Some(&module.name), true)?;
                }
            }
        }

        // Primary-file functions keep their short name in the table and also
        // register the qualified alias.
        for module in modules.iter().filter(|m| m.is_primary) {
            for func in module.program.functions() {
                if func.name != "Main" {
                    self.compile_function(func, Some(&module.name), false)?;
                }
            }
        }

        // Main is emitted last, unqualified.
        let mut has_main = false;
        for module in modules.iter().filter(|m| m.is_primary) {
            for func in module.program.functions() {
                if func.name == "Main" {
                    if has_main {
                        return Err(CompileError::DuplicateMain(module.name.clone()));
                    }
                    has_main = true;
                    self.compile_function(func, None, false)?;
                }
            }
        }

        if !has_main {
            return Err(CompileError::MissingMain);
        }

        if self.image.code.last().map(|i| i.opcode) != Some(OpCode::Halt as u8) {
            self.emit(OpCode::Halt, 0);
        }

        Ok(self.image)
    }

    fn compile_function(
        &mut self,
        decl: &FunctionDecl,
        module: Option<&str>,
        qualify_table_name: bool,
    ) -> CompileResult<()> {
        let address = self.image.code.len() as u32;
        let qualified = module.map(|m| format!("{}_{}", m, decl.name));

        self.function_addrs.insert(decl.name.clone(), address);
        if let Some(q) = &qualified {
            self.function_addrs.insert(q.clone(), address);
        }

        let table_name = if qualify_table_name {
            qualified.expect("qualified table name requires a module")
        } else {
            decl.name.clone()
        };

        if decl.params.len() > u8::MAX as usize {
            return Err(CompileError::new(
                format!("Function '{}' has too many parameters", decl.name),
                decl.span,
            ));
        }

        // One pass to size the frame: parameters plus every declaration
        // reachable in the body.
        let locals = decl.params.len() as u32 + count_locals(&decl.body);
        if locals > u8::MAX as u32 {
            return Err(CompileError::new(
                format!("Function '{}' has too many locals", decl.name),
                decl.span,
            ));
        }

        let mut ctx = FunctionContext::new(address, decl.params.len() as u32);
        for param in &decl.params {
            ctx.declare(&param.name);
        }
        self.contexts.push(ctx);

        for stmt in &decl.body {
            self.compile_stmt(stmt)?;
        }

        // Implicit return nil for bodies that do not end in one. An empty
        // body emitted nothing, so the global last instruction belongs to the
        // previous function and does not count.
        let needs_ret = self.image.code.len() as u32 == address
            || !matches!(
                self.image.code.last().map(|i| i.opcode),
                Some(op) if op == OpCode::Ret as u8 || op == OpCode::Halt as u8
            );
        if needs_ret {
            self.emit_push_nil();
            self.emit(OpCode::Ret, 0);
        }

        self.contexts.pop();

        self.image.functions.push(FunctionInfo::new(
            table_name,
            address,
            decl.params.len() as u8,
            locals as u8,
        ));

        Ok(())
    }

    // ===== Statements =====

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.compile_expr(expr)?;
                // Native print calls already balance the stack at the opcode
                // level; everything else gets its result popped.
                if !is_console_print(expr) {
                    self.emit(OpCode::Pop, 0);
                }
            }

            StmtKind::VarDecl {
                ty,
                name,
                initializer,
                ..
            } => {
                match initializer {
                    Some(init) => self.compile_expr(init)?,
                    None => self.emit_default(*ty),
                }
                let slot = self.current_context().declare(name);
                self.emit(OpCode::Store, slot);
            }

            StmtKind::ArrayDecl {
                ty,
                name,
                size,
                initializer,
            } => {
                match (size, initializer) {
                    (Some(size), _) => {
                        self.compile_expr(size)?;
                        self.emit_new_array(*ty, 0, stmt.span)?;
                    }
                    (None, Some(init)) => self.compile_expr(init)?,
                    (None, None) => {
                        self.emit_push_int(0);
                        self.emit_new_array(*ty, 0, stmt.span)?;
                    }
                }
                let slot = self.current_context().declare(name);
                self.emit(OpCode::Store, slot);
            }

            StmtKind::Block(statements) => {
                self.current_context().push_scope();
                for stmt in statements {
                    self.compile_stmt(stmt)?;
                }
                self.current_context().pop_scope();
            }

            StmtKind::Function(decl) => {
                self.compile_function(decl, None, false)?;
            }

            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(condition)?;
                let then_jump = self.emit_jump(OpCode::JmpIfNot);

                self.compile_stmt(then_branch)?;

                if let Some(else_stmt) = else_branch {
                    let else_jump = self.emit_jump(OpCode::Jmp);
                    self.patch_jump(then_jump);
                    self.compile_stmt(else_stmt)?;
                    self.patch_jump(else_jump);
                } else {
                    self.patch_jump(then_jump);
                }
            }

            StmtKind::While { condition, body } => {
                self.loops.push(LoopContext::default());
                let loop_start = self.image.code.len() as u32;

                self.compile_expr(condition)?;
                let exit_jump = self.emit_jump(OpCode::JmpIfNot);

                self.compile_stmt(body)?;

                let continue_target = self.image.code.len() as u32;
                let continues =
                    std::mem::take(&mut self.loops.last_mut().expect("loop context").continue_sites);
                self.patch_jumps(&continues, continue_target);

                self.emit(OpCode::Jmp, loop_start);
                self.patch_jump(exit_jump);

                let loop_ctx = self.loops.pop().expect("loop context");
                let exit = self.image.code.len() as u32;
                self.patch_jumps(&loop_ctx.break_sites, exit);
            }

            StmtKind::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                // The initializer's declaration lives in the surrounding
                // scope, like the original emission.
                if let Some(init) = initializer {
                    self.compile_stmt(init)?;
                }

                self.loops.push(LoopContext::default());
                let loop_start = self.image.code.len() as u32;

                if let Some(cond) = condition {
                    self.compile_expr(cond)?;
                    let exit_jump = self.emit_jump(OpCode::JmpIfNot);
                    self.loops
                        .last_mut()
                        .expect("loop context")
                        .break_sites
                        .push(exit_jump);
                }

                self.compile_stmt(body)?;

                let continue_target = self.image.code.len() as u32;
                let continues =
                    std::mem::take(&mut self.loops.last_mut().expect("loop context").continue_sites);
                self.patch_jumps(&continues, continue_target);

                if let Some(incr) = increment {
                    self.compile_expr(incr)?;
                    self.emit(OpCode::Pop, 0);
                }

                self.emit(OpCode::Jmp, loop_start);

                let loop_ctx = self.loops.pop().expect("loop context");
                let exit = self.image.code.len() as u32;
                self.patch_jumps(&loop_ctx.break_sites, exit);
            }

            StmtKind::Break => {
                if self.loops.is_empty() {
                    return Err(CompileError::BreakOutsideLoop(stmt.span));
                }
                let site = self.emit_jump(OpCode::Jmp);
                self.loops
                    .last_mut()
                    .expect("loop context")
                    .break_sites
                    .push(site);
            }

            StmtKind::Continue => {
                if self.loops.is_empty() {
                    return Err(CompileError::ContinueOutsideLoop(stmt.span));
                }
                let site = self.emit_jump(OpCode::Jmp);
                self.loops
                    .last_mut()
                    .expect("loop context")
                    .continue_sites
                    .push(site);
            }

            StmtKind::Return(value) => {
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_push_nil(),
                }
                self.emit(OpCode::Ret, 0);
            }
        }

        Ok(())
    }

    // ===== Expressions =====

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::IntLiteral(v) => self.emit_push_int(*v),
            ExprKind::FloatLiteral(v) => self.emit_push_float(*v),
            ExprKind::StringLiteral(s) => self.emit_push_string(s),
            ExprKind::BoolLiteral(b) => self.emit_push_bool(*b),
            ExprKind::Nil => self.emit_push_nil(),

            ExprKind::Variable(name) => {
                if let Some(slot) = self.current_context().resolve(name) {
                    self.emit(OpCode::Load, slot);
                } else if let Some(&idx) = self.globals.get(name) {
                    self.emit(OpCode::LoadGlobal, idx);
                } else {
                    return Err(CompileError::UndefinedVariable(name.clone(), expr.span));
                }
            }

            ExprKind::Assign { target, value } => match &target.kind {
                ExprKind::Variable(name) => {
                    self.compile_expr(value)?;
                    if let Some(slot) = self.current_context().resolve(name) {
                        self.emit(OpCode::Store, slot);
                    } else if let Some(&idx) = self.globals.get(name) {
                        self.emit(OpCode::StoreGlobal, idx);
                    } else {
                        return Err(CompileError::UndefinedVariable(name.clone(), target.span));
                    }
                }
                ExprKind::Index { array, index } => {
                    self.compile_expr(array)?;
                    self.compile_expr(index)?;
                    self.compile_expr(value)?;
                    self.emit(OpCode::StoreIndex, 0);
                }
                _ => {
                    return Err(CompileError::new("Invalid assignment target", target.span));
                }
            },

            ExprKind::Binary {
                left,
                operator,
                right,
            } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let op = match operator {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Subtract => OpCode::Sub,
                    BinaryOp::Multiply => OpCode::Mul,
                    BinaryOp::Divide => OpCode::Div,
                    BinaryOp::Modulo => OpCode::Mod,
                    BinaryOp::Equal => OpCode::Eq,
                    BinaryOp::NotEqual => OpCode::Neq,
                    BinaryOp::Less => OpCode::Lt,
                    BinaryOp::LessEqual => OpCode::Lte,
                    BinaryOp::Greater => OpCode::Gt,
                    BinaryOp::GreaterEqual => OpCode::Gte,
                };
                self.emit(op, 0);
            }

            ExprKind::Unary { operator, operand } => {
                self.compile_expr(operand)?;
                match operator {
                    UnaryOp::Negate => self.emit(OpCode::Neg, 0),
                    UnaryOp::Not => self.emit(OpCode::Not, 0),
                }
            }

            // Short-circuit: the left value survives the jump as the result.
            ExprKind::LogicalAnd { left, right } => {
                self.compile_expr(left)?;
                self.emit(OpCode::Dup, 0);
                let end_jump = self.emit_jump(OpCode::JmpIfNot);
                self.emit(OpCode::Pop, 0);
                self.compile_expr(right)?;
                self.patch_jump(end_jump);
            }

            ExprKind::LogicalOr { left, right } => {
                self.compile_expr(left)?;
                self.emit(OpCode::Dup, 0);
                let end_jump = self.emit_jump(OpCode::JmpIf);
                self.emit(OpCode::Pop, 0);
                self.compile_expr(right)?;
                self.patch_jump(end_jump);
            }

            ExprKind::Call {
                module,
                name,
                arguments,
                is_native,
            } => {
                for arg in arguments {
                    self.compile_expr(arg)?;
                }

                if *is_native {
                    let qualifier = module.as_deref().unwrap_or("");
                    let full_name = format!("{}.{}", qualifier, name);
                    match full_name.as_str() {
                        "Console.println" => self.emit(OpCode::Println, 0),
                        "Console.print" => self.emit(OpCode::Print, 0),
                        "Console.read" => self.emit(OpCode::Read, 0),
                        "Array.length" => self.emit(OpCode::ArrayLen, 0),
                        _ => {
                            let idx = self.add_native_import(&full_name);
                            self.emit(OpCode::CallNative, idx);
                        }
                    }
                } else {
                    let address = self.resolve_function(module.as_deref(), name);
                    match address {
                        Some(addr) => self.emit(OpCode::Call, addr),
                        None => {
                            let shown = match module {
                                Some(m) => format!("{}.{}", m, name),
                                None => name.clone(),
                            };
                            return Err(CompileError::UndefinedFunction(shown, expr.span));
                        }
                    }
                }
            }

            ExprKind::Array(elements) => {
                if elements.is_empty() {
                    return Err(CompileError::UntypedEmptyArray(expr.span));
                }
                for element in elements {
                    self.compile_expr(element)?;
                }
                let ty = infer_element_type(&elements[0]);
                self.emit_new_array(ty, elements.len() as u32, expr.span)?;
            }

            ExprKind::Index { array, index } => {
                self.compile_expr(array)?;
                self.compile_expr(index)?;
                self.emit(OpCode::LoadIndex, 0);
            }
        }

        Ok(())
    }

    /// Call-site resolution: the qualified `<module>_<name>` first, then the
    /// bare name.
    fn resolve_function(&self, module: Option<&str>, name: &str) -> Option<u32> {
        if let Some(m) = module {
            let qualified = format!("{}_{}", m, name);
            if let Some(&addr) = self.function_addrs.get(&qualified) {
                return Some(addr);
            }
        }
        self.function_addrs.get(name).copied()
    }

    fn current_context(&mut self) -> &mut FunctionContext {
        self.contexts.last_mut().expect("context stack is never empty")
    }

    // ===== Emission =====

    fn emit(&mut self, op: OpCode, operand: u32) {
        self.image.code.push(Instruction::new(op, operand));
    }

    /// Emit a forward jump with a sentinel operand; returns the site to patch.
    fn emit_jump(&mut self, op: OpCode) -> u32 {
        self.emit(op, JUMP_SENTINEL);
        self.image.code.len() as u32 - 1
    }

    /// Point a pending jump at the current end of code.
    fn patch_jump(&mut self, site: u32) {
        let target = self.image.code.len() as u32;
        self.image.code[site as usize].operand = target;
    }

    fn patch_jumps(&mut self, sites: &[u32], target: u32) {
        for &site in sites {
            self.image.code[site as usize].operand = target;
        }
    }

    fn emit_push_int(&mut self, value: i64) {
        let idx = self.add_constant(Constant::Int(value));
        self.emit(OpCode::Push, idx);
    }

    fn emit_push_float(&mut self, value: f64) {
        let idx = self.add_constant(Constant::Float(value));
        self.emit(OpCode::Push, idx);
    }

    fn emit_push_bool(&mut self, value: bool) {
        let idx = self.add_constant(Constant::Bool(value));
        self.emit(OpCode::Push, idx);
    }

    fn emit_push_string(&mut self, value: &str) {
        let idx = self.add_string_constant(value);
        self.emit(OpCode::Push, idx);
    }

    /// Nil cells are never deduplicated; every push gets a fresh cell.
    fn emit_push_nil(&mut self) {
        let idx = self.image.constants.len() as u32;
        self.image.constants.push(Constant::Nil);
        self.emit(OpCode::Push, idx);
    }

    /// Default value for an uninitialized declaration.
    fn emit_default(&mut self, ty: TypeName) {
        match ty {
            TypeName::Int => self.emit_push_int(0),
            TypeName::Float => self.emit_push_float(0.0),
            TypeName::Bool => self.emit_push_bool(false),
            TypeName::Str => self.emit_push_string(""),
            TypeName::Byte => self.emit_push_nil(),
        }
    }

    /// Emit `NEW_ARRAY` with a typed cell. `count` is the literal element
    /// count; 0 means the length is taken from the stack.
    fn emit_new_array(&mut self, ty: TypeName, count: u32, span: Span) -> CompileResult<()> {
        let cell = match ty {
            TypeName::Int => Constant::IntArray(count),
            TypeName::Float => Constant::FloatArray(count),
            TypeName::Str => Constant::StrArray(count),
            other => {
                return Err(CompileError::new(
                    format!("Unsupported array type '{}'", other),
                    span,
                ));
            }
        };
        // NEW_ARRAY cells are positional, not interned: the payload is a
        // count, not a pool index.
        let idx = self.image.constants.len() as u32;
        self.image.constants.push(cell);
        self.emit(OpCode::NewArray, idx);
        Ok(())
    }

    /// Intern a scalar constant; int, float and bool cells are deduplicated.
    /// Only scalar cells come through here, so plain equality suffices.
    fn add_constant(&mut self, constant: Constant) -> u32 {
        if let Some(idx) = self.image.constants.iter().position(|c| *c == constant) {
            return idx as u32;
        }
        let idx = self.image.constants.len() as u32;
        self.image.constants.push(constant);
        idx
    }

    /// Strings deduplicate at both the pool level and the cell level: one
    /// pool entry and one cell per distinct string.
    fn add_string_constant(&mut self, value: &str) -> u32 {
        let str_idx = self.image.intern_string(value);
        if let Some(cell_idx) = self
            .image
            .constants
            .iter()
            .position(|c| matches!(c, Constant::Str(i) if *i == str_idx))
        {
            return cell_idx as u32;
        }
        let cell_idx = self.image.constants.len() as u32;
        self.image.constants.push(Constant::Str(str_idx));
        cell_idx
    }

    fn add_native_import(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.image.native_imports.iter().position(|n| n == name) {
            return idx as u32;
        }
        let idx = self.image.native_imports.len() as u32;
        self.image.native_imports.push(name.to_string());
        idx
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an expression is a native print call, which balances the stack at
/// the opcode level and therefore skips the statement-level `POP`.
fn is_console_print(expr: &Expr) -> bool {
    matches!(
        &expr.kind,
        ExprKind::Call {
            module: Some(m),
            name,
            is_native: true,
            ..
        } if m == "Console" && (name == "println" || name == "print")
    )
}

/// Element type hint for an array literal, from its first element.
fn infer_element_type(first: &Expr) -> TypeName {
    match &first.kind {
        ExprKind::FloatLiteral(_) => TypeName::Float,
        ExprKind::StringLiteral(_) => TypeName::Str,
        _ => TypeName::Int,
    }
}

/// Count every declaration reachable in a body: nested blocks, both `if`
/// branches, loop bodies and `for` initializers all contribute to the frame.
fn count_locals(stmts: &[Stmt]) -> u32 {
    stmts.iter().map(count_locals_in).sum()
}

fn count_locals_in(stmt: &Stmt) -> u32 {
    match &stmt.kind {
        StmtKind::VarDecl { .. } | StmtKind::ArrayDecl { .. } => 1,
        StmtKind::Block(inner) => count_locals(inner),
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            count_locals_in(then_branch)
                + else_branch.as_deref().map(count_locals_in).unwrap_or(0)
        }
        StmtKind::While { body, .. } => count_locals_in(body),
        StmtKind::For {
            initializer, body, ..
        } => {
            initializer.as_deref().map(count_locals_in).unwrap_or(0) + count_locals_in(body)
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn parse(source: &str) -> Program {
        let (tokens, lex_errors) = Scanner::new(source).tokenize();
        assert!(lex_errors.is_empty(), "lex errors: {:?}", lex_errors);
        let mut parser = Parser::new(tokens);
        let program = parser.parse();
        assert!(
            parser.errors().is_empty(),
            "parse errors: {:?}",
            parser.errors()
        );
        program
    }

    fn compile_source(source: &str) -> CompileResult<BytecodeImage> {
        Compiler::compile(&[SourceModule::primary("main", parse(source))])
    }

    fn assert_invariants(image: &BytecodeImage) {
        for instr in &image.code {
            let Some(op) = OpCode::from_u8(instr.opcode) else {
                panic!("unknown opcode 0x{:02X}", instr.opcode);
            };
            match op {
                OpCode::Push => {
                    assert!((instr.operand as usize) < image.constants.len());
                }
                OpCode::Jmp | OpCode::JmpIf | OpCode::JmpIfNot => {
                    assert!((instr.operand as usize) < image.code.len());
                }
                _ => {}
            }
        }
        assert_eq!(
            image.functions.iter().filter(|f| f.name == "Main").count(),
            1
        );
        assert_eq!(image.code.last().unwrap().opcode, OpCode::Halt as u8);
    }

    #[test]
    fn empty_main_is_push_nil_ret_halt() {
        let image = compile_source("fn Main(){ }").unwrap();
        assert_invariants(&image);
        assert_eq!(image.code.len(), 3);
        assert_eq!(image.code[0].opcode, OpCode::Push as u8);
        assert!(matches!(
            image.constants[image.code[0].operand as usize],
            Constant::Nil
        ));
        assert_eq!(image.code[1].opcode, OpCode::Ret as u8);
        assert_eq!(image.code[2].opcode, OpCode::Halt as u8);
    }

    #[test]
    fn missing_main_fails() {
        let result = compile_source("fn helper(){ return 1; }");
        assert!(matches!(result, Err(CompileError::MissingMain)));
    }

    #[test]
    fn main_in_include_is_ignored() {
        let lib = SourceModule::include("lib", parse("fn Main(){ } fn util(){ return 1; }"));
        let result = Compiler::compile(&[lib]);
        assert!(matches!(result, Err(CompileError::MissingMain)));
    }

    #[test]
    fn int_constants_are_interned() {
        let image = compile_source("fn Main(){ int x = 7; int y = 7; }").unwrap();
        let sevens = image
            .constants
            .iter()
            .filter(|c| matches!(c, Constant::Int(7)))
            .count();
        assert_eq!(sevens, 1);
    }

    #[test]
    fn nil_constants_are_never_interned() {
        let image = compile_source("fn f(){ return; } fn Main(){ f(); return; }").unwrap();
        let nils = image
            .constants
            .iter()
            .filter(|c| matches!(c, Constant::Nil))
            .count();
        assert!(nils >= 2);
    }

    #[test]
    fn string_constants_share_pool_and_cell() {
        let image =
            compile_source("fn Main(){ str a = \"hi\"; str b = \"hi\"; }").unwrap();
        assert_eq!(image.strings.iter().filter(|s| *s == "hi").count(), 1);
        let cells = image
            .constants
            .iter()
            .filter(|c| matches!(c, Constant::Str(_)))
            .count();
        assert_eq!(cells, 1);
    }

    #[test]
    fn jumps_are_patched_no_sentinels_remain() {
        let image = compile_source(
            "fn Main(){ mut int i=0; while(i<3){ if(i==1){ i=i+1; continue; } i=i+1; } \
             for(int j=0;j<2;j=j+1){ if(j==5){ break; } } }",
        )
        .unwrap();
        assert_invariants(&image);
        for instr in &image.code {
            assert_ne!(instr.operand, JUMP_SENTINEL, "unpatched jump sentinel");
        }
    }

    #[test]
    fn break_outside_loop_fails() {
        let result = compile_source("fn Main(){ break; }");
        assert!(matches!(result, Err(CompileError::BreakOutsideLoop(_))));
    }

    #[test]
    fn continue_outside_loop_fails() {
        let result = compile_source("fn Main(){ continue; }");
        assert!(matches!(result, Err(CompileError::ContinueOutsideLoop(_))));
    }

    #[test]
    fn undefined_variable_fails() {
        let result = compile_source("fn Main(){ x = 1; }");
        assert!(matches!(result, Err(CompileError::UndefinedVariable(_, _))));
    }

    #[test]
    fn undefined_function_fails() {
        let result = compile_source("fn Main(){ missing(); }");
        assert!(matches!(result, Err(CompileError::UndefinedFunction(_, _))));
    }

    #[test]
    fn empty_array_literal_fails() {
        let result = compile_source("fn Main(){ int a[] = []; }");
        assert!(matches!(result, Err(CompileError::UntypedEmptyArray(_))));
    }

    #[test]
    fn console_println_lowers_to_opcode() {
        let image = compile_source("fn Main(){ Console.println(\"x\"); }").unwrap();
        assert!(image
            .code
            .iter()
            .any(|i| i.opcode == OpCode::Println as u8));
        assert!(image.native_imports.is_empty());
        // The print balances its own stack; no statement-level POP follows.
        let println_at = image
            .code
            .iter()
            .position(|i| i.opcode == OpCode::Println as u8)
            .unwrap();
        assert_ne!(image.code[println_at + 1].opcode, OpCode::Pop as u8);
    }

    #[test]
    fn other_natives_go_through_the_import_table() {
        let image = compile_source("fn Main(){ System.env(\"HOME\"); }").unwrap();
        assert_eq!(image.native_imports, vec!["System.env".to_string()]);
        assert!(image
            .code
            .iter()
            .any(|i| i.opcode == OpCode::CallNative as u8 && i.operand == 0));
    }

    #[test]
    fn array_length_lowers_to_opcode() {
        let image =
            compile_source("fn Main(){ int a[] = [1,2]; Console.println(Array.length(a)); }")
                .unwrap();
        assert!(image.code.iter().any(|i| i.opcode == OpCode::ArrayLen as u8));
        assert!(image.native_imports.is_empty());
    }

    #[test]
    fn include_functions_are_qualified_and_emitted_first() {
        let lib = SourceModule::include("mathx", parse("fn double(int n){ return n*2; }"));
        let main = SourceModule::primary(
            "app",
            parse("fn helper(){ return 1; } fn Main(){ Console.println(mathx.double(21)); }"),
        );
        let image = Compiler::compile(&[lib, main]).unwrap();
        assert_invariants(&image);

        assert_eq!(image.functions[0].name, "mathx_double");
        assert_eq!(image.functions[0].address, 0);
        assert_eq!(image.functions[1].name, "helper");
        assert_eq!(image.functions.last().unwrap().name, "Main");

        // The call site resolved to the include function's address.
        let double_addr = image.functions[0].address;
        assert!(image
            .code
            .iter()
            .any(|i| i.opcode == OpCode::Call as u8 && i.operand == double_addr));
    }

    #[test]
    fn bare_call_falls_back_to_unqualified_name() {
        let lib = SourceModule::include("strutil", parse("fn shout(str s){ return s + \"!\"; }"));
        let main = SourceModule::primary("app", parse("fn Main(){ Console.println(shout(\"hi\")); }"));
        let image = Compiler::compile(&[lib, main]).unwrap();
        assert_invariants(&image);
    }

    #[test]
    fn duplicate_main_fails() {
        let a = SourceModule::primary("a", parse("fn Main(){ }"));
        let b = SourceModule::primary("b", parse("fn Main(){ }"));
        let result = Compiler::compile(&[a, b]);
        assert!(matches!(result, Err(CompileError::DuplicateMain(_))));
    }

    #[test]
    fn locals_count_covers_nested_declarations() {
        let image = compile_source(
            "fn Main(){ int a = 1; { int b = 2; } if(a==1){ int c = 3; }else{ int d = 4; } \
             while(a<0){ int e = 5; } for(int f=0;f<1;f=f+1){ int g=6; } }",
        )
        .unwrap();
        let main = image.find_function("Main").unwrap();
        assert_eq!(main.locals, 7);
        assert_eq!(main.arity, 0);
    }

    #[test]
    fn arity_and_locals_in_function_table() {
        let image =
            compile_source("fn add(int a, int b){ int sum = a + b; return sum; } fn Main(){ add(1,2); }")
                .unwrap();
        let add = image.find_function("add").unwrap();
        assert_eq!(add.arity, 2);
        assert_eq!(add.locals, 3);
    }

    #[test]
    fn block_scope_shares_flat_slot_numbering() {
        // The inner `b` must get slot 1, not restart at 0 and collide with `a`.
        let image = compile_source("fn Main(){ int a = 1; { int b = 2; } }").unwrap();
        let stores: Vec<u32> = image
            .code
            .iter()
            .filter(|i| i.opcode == OpCode::Store as u8)
            .map(|i| i.operand)
            .collect();
        assert_eq!(stores, vec![0, 1]);
    }

    #[test]
    fn expression_statement_pops_its_result() {
        let image = compile_source("fn f(){ return 1; } fn Main(){ f(); }").unwrap();
        let call_at = image
            .code
            .iter()
            .position(|i| i.opcode == OpCode::Call as u8)
            .unwrap();
        assert_eq!(image.code[call_at + 1].opcode, OpCode::Pop as u8);
    }

    #[test]
    fn logical_and_preserves_short_circuit_value() {
        let image = compile_source("fn Main(){ bool x = true and false; }").unwrap();
        // left; DUP; JMP_IFNOT end; POP; right; end:
        let dup_at = image
            .code
            .iter()
            .position(|i| i.opcode == OpCode::Dup as u8)
            .unwrap();
        assert_eq!(image.code[dup_at + 1].opcode, OpCode::JmpIfNot as u8);
        assert_eq!(image.code[dup_at + 2].opcode, OpCode::Pop as u8);
    }

    #[test]
    fn halt_is_not_duplicated() {
        let image = compile_source("fn Main(){ }").unwrap();
        let halts = image
            .code
            .iter()
            .filter(|i| i.opcode == OpCode::Halt as u8)
            .count();
        assert_eq!(halts, 1);
    }
}
