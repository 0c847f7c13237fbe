//! The virtual machine: loads an image and interprets it on a value stack
//! with call frames over a flat locals vector.

use std::io::{self, Write};

use indexmap::IndexMap;

use crate::bytecode::disassembler::format_instruction;
use crate::bytecode::image::{BytecodeImage, Constant, Instruction};
use crate::bytecode::opcode::OpCode;
use crate::error::RuntimeError;
use crate::vm::natives::{self, NativeFn};
use crate::vm::value::Value;

/// Result type for VM operations.
pub type VmResult<T> = Result<T, RuntimeError>;

/// Return-address sentinel for the root frame: returning through it halts
/// the machine.
const ROOT_FRAME: usize = usize::MAX;

/// One function activation. Local slots live in the VM's flat locals vector;
/// this frame owns `[local_start, local_start + locals)`.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    return_addr: usize,
    local_start: usize,
}

/// The Tail virtual machine.
pub struct Vm {
    image: BytecodeImage,
    pc: usize,
    stack: Vec<Value>,
    locals: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Vec<Value>,
    natives: IndexMap<String, NativeFn>,
    running: bool,
    trace: bool,
    rng_state: i64,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new(image: BytecodeImage) -> Self {
        Self::with_output(image, Box::new(io::stdout()))
    }

    /// Build a VM writing program output to `out` instead of stdout.
    pub fn with_output(image: BytecodeImage, out: Box<dyn Write>) -> Self {
        Self {
            image,
            pc: 0,
            stack: Vec::new(),
            locals: Vec::new(),
            frames: Vec::new(),
            globals: Vec::new(),
            natives: natives::default_registry(),
            running: false,
            trace: false,
            rng_state: 12345,
            out,
        }
    }

    /// Enable per-instruction tracing to stderr.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn image(&self) -> &BytecodeImage {
        &self.image
    }

    /// Locate `Main`, set up the root frame and run to completion.
    pub fn run(&mut self) -> VmResult<()> {
        let main = self
            .image
            .find_function("Main")
            .cloned()
            .ok_or_else(|| RuntimeError::general("Main function not found", 0))?;

        self.stack.clear();
        self.locals.clear();
        self.frames.clear();
        self.globals.clear();

        self.frames.push(CallFrame {
            return_addr: ROOT_FRAME,
            local_start: 0,
        });
        self.locals.resize(main.locals as usize, Value::Nil);
        self.pc = main.address as usize;
        self.running = true;

        while self.running && self.pc < self.image.code.len() {
            let instr = self.image.code[self.pc];
            if self.trace {
                self.trace_instruction(&instr);
            }
            if let Err(err) = self.step(instr) {
                if self.trace {
                    self.dump_state();
                }
                return Err(err);
            }
        }

        Ok(())
    }

    /// Execute one instruction. The jump family, `CALL` and `RET` manage the
    /// program counter themselves; everything else advances by one.
    fn step(&mut self, instr: Instruction) -> VmResult<()> {
        let op = OpCode::from_u8(instr.opcode).ok_or(RuntimeError::UnknownOpcode {
            opcode: instr.opcode,
            pc: self.pc,
        })?;

        match op {
            // Stack operations
            OpCode::Push => {
                let constant = self.constant(instr.operand)?;
                self.stack.push(Value::from_constant(&constant));
            }
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Dup => {
                let top = *self
                    .stack
                    .last()
                    .ok_or(RuntimeError::StackUnderflow(self.pc))?;
                self.stack.push(top);
            }
            OpCode::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.stack.push(a);
                self.stack.push(b);
            }

            // Arithmetic
            OpCode::Add => self.op_add()?,
            OpCode::Sub => self.op_sub()?,
            OpCode::Mul => self.op_mul()?,
            OpCode::Div => self.op_div()?,
            OpCode::Mod => self.op_mod()?,
            OpCode::Neg => self.op_neg()?,
            OpCode::Inc => self.op_inc_dec(1)?,
            OpCode::Dec => self.op_inc_dec(-1)?,

            // Comparisons
            OpCode::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                let equal = a.stringify(&self.image) == b.stringify(&self.image);
                self.stack.push(Value::Bool(equal));
            }
            OpCode::Neq => {
                let b = self.pop()?;
                let a = self.pop()?;
                let equal = a.stringify(&self.image) == b.stringify(&self.image);
                self.stack.push(Value::Bool(!equal));
            }
            OpCode::Lt | OpCode::Lte | OpCode::Gt | OpCode::Gte => self.op_order(op)?,

            // Logic
            OpCode::And => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(a.is_truthy() && b.is_truthy()));
            }
            OpCode::Or => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(a.is_truthy() || b.is_truthy()));
            }
            OpCode::Not => {
                let a = self.pop()?;
                self.stack.push(Value::Bool(!a.is_truthy()));
            }

            // Variables
            OpCode::Load => {
                let slot = self.local_slot(instr.operand)?;
                self.stack.push(self.locals[slot]);
            }
            OpCode::Store => {
                let slot = self.local_slot(instr.operand)?;
                let value = *self
                    .stack
                    .last()
                    .ok_or(RuntimeError::StackUnderflow(self.pc))?;
                self.locals[slot] = value;
            }
            OpCode::LoadGlobal => {
                let idx = instr.operand as usize;
                if idx >= self.globals.len() {
                    self.globals.resize(idx + 1, Value::Nil);
                }
                self.stack.push(self.globals[idx]);
            }
            OpCode::StoreGlobal => {
                let idx = instr.operand as usize;
                if idx >= self.globals.len() {
                    self.globals.resize(idx + 1, Value::Nil);
                }
                self.globals[idx] = *self
                    .stack
                    .last()
                    .ok_or(RuntimeError::StackUnderflow(self.pc))?;
            }

            // Control flow
            OpCode::Jmp => {
                self.jump(instr.operand)?;
            }
            OpCode::JmpIf => {
                let cond = self.pop()?;
                if cond.is_truthy() {
                    self.jump(instr.operand)?;
                } else {
                    self.pc += 1;
                }
            }
            OpCode::JmpIfNot => {
                let cond = self.pop()?;
                if !cond.is_truthy() {
                    self.jump(instr.operand)?;
                } else {
                    self.pc += 1;
                }
            }
            OpCode::Call => self.op_call(instr.operand)?,
            OpCode::Ret => self.op_ret()?,
            OpCode::CallNative => self.op_call_native(instr.operand)?,

            // Arrays
            OpCode::NewArray => self.op_new_array(instr.operand)?,
            OpCode::LoadIndex => self.op_load_index()?,
            OpCode::StoreIndex => self.op_store_index()?,
            OpCode::ArrayLen => self.op_array_len()?,

            // I/O
            OpCode::Print => {
                let value = self.pop()?;
                let text = value.stringify(&self.image);
                self.write_out(&text)?;
                self.flush_out()?;
            }
            OpCode::Println => {
                let value = self.pop()?;
                let text = value.stringify(&self.image);
                self.write_out(&text)?;
                self.write_out("\n")?;
            }
            OpCode::Read => {
                let line = read_stdin_line();
                let idx = self.image.push_string(line);
                self.stack.push(Value::Str(idx));
            }

            // System
            OpCode::Halt => {
                self.running = false;
            }
        }

        if !op.is_control() {
            self.pc += 1;
        }

        Ok(())
    }

    // ===== Arithmetic =====

    fn op_add(&mut self) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;

        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(y)),
            (Value::Float(x), Value::Float(y)) => Value::Float(x + y),
            (Value::Int(x), Value::Float(y)) => Value::Float(x as f64 + y),
            (Value::Float(x), Value::Int(y)) => Value::Float(x + y as f64),
            (a, b) if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) => {
                let text = format!("{}{}", a.stringify(&self.image), b.stringify(&self.image));
                let idx = self.image.push_string(text);
                Value::Str(idx)
            }
            _ => Value::Nil,
        };

        self.stack.push(result);
        Ok(())
    }

    fn op_sub(&mut self) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_sub(y)),
            (Value::Float(x), Value::Float(y)) => Value::Float(x - y),
            _ => return Err(RuntimeError::type_mismatch("Invalid types for subtraction", self.pc)),
        };
        self.stack.push(result);
        Ok(())
    }

    fn op_mul(&mut self) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_mul(y)),
            (Value::Float(x), Value::Float(y)) => Value::Float(x * y),
            _ => {
                return Err(RuntimeError::type_mismatch(
                    "Invalid types for multiplication",
                    self.pc,
                ))
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn op_div(&mut self) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;

        match b {
            Value::Int(0) => return Err(RuntimeError::DivisionByZero(self.pc)),
            Value::Float(f) if f == 0.0 => return Err(RuntimeError::DivisionByZero(self.pc)),
            _ => {}
        }

        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_div(y)),
            (Value::Float(x), Value::Float(y)) => Value::Float(x / y),
            _ => return Err(RuntimeError::type_mismatch("Invalid types for division", self.pc)),
        };
        self.stack.push(result);
        Ok(())
    }

    fn op_mod(&mut self) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Int(_), Value::Int(0)) => Err(RuntimeError::ModuloByZero(self.pc)),
            (Value::Int(x), Value::Int(y)) => {
                self.stack.push(Value::Int(x.wrapping_rem(y)));
                Ok(())
            }
            _ => Err(RuntimeError::type_mismatch("Invalid types for modulo", self.pc)),
        }
    }

    fn op_neg(&mut self) -> VmResult<()> {
        let a = self.pop()?;
        let result = match a {
            Value::Int(v) => Value::Int(v.wrapping_neg()),
            Value::Float(v) => Value::Float(-v),
            _ => return Err(RuntimeError::type_mismatch("Invalid type for negation", self.pc)),
        };
        self.stack.push(result);
        Ok(())
    }

    /// `INC`/`DEC` mutate the stack top in place.
    fn op_inc_dec(&mut self, delta: i64) -> VmResult<()> {
        let pc = self.pc;
        let top = self
            .stack
            .last_mut()
            .ok_or(RuntimeError::StackUnderflow(pc))?;
        match top {
            Value::Int(v) => *v = v.wrapping_add(delta),
            Value::Float(v) => *v += delta as f64,
            _ => {
                return Err(RuntimeError::type_mismatch(
                    "Invalid type for increment/decrement",
                    pc,
                ))
            }
        }
        Ok(())
    }

    fn op_order(&mut self, op: OpCode) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;

        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => match op {
                OpCode::Lt => x < y,
                OpCode::Lte => x <= y,
                OpCode::Gt => x > y,
                _ => x >= y,
            },
            (Value::Float(x), Value::Float(y)) => match op {
                OpCode::Lt => x < y,
                OpCode::Lte => x <= y,
                OpCode::Gt => x > y,
                _ => x >= y,
            },
            _ => {
                return Err(RuntimeError::type_mismatch(
                    "Invalid types for comparison",
                    self.pc,
                ))
            }
        };

        self.stack.push(Value::Bool(result));
        Ok(())
    }

    // ===== Calls =====

    fn op_call(&mut self, address: u32) -> VmResult<()> {
        let func = self
            .image
            .function_at(address)
            .cloned()
            .ok_or(RuntimeError::NoFunctionAtAddress {
                address,
                pc: self.pc,
            })?;

        let arity = func.arity as usize;
        if self.stack.len() < arity {
            return Err(RuntimeError::general(
                format!("Not enough arguments for function {}", func.name),
                self.pc,
            ));
        }

        let frame = CallFrame {
            return_addr: self.pc + 1,
            local_start: self.locals.len(),
        };
        self.frames.push(frame);
        self.locals
            .resize(frame.local_start + func.locals as usize, Value::Nil);

        // Arguments transfer from the stack into slots [0, arity) of the new
        // frame: popping in reverse slot order preserves argument order.
        for i in (0..arity).rev() {
            self.locals[frame.local_start + i] = self.pop()?;
        }

        self.pc = func.address as usize;
        Ok(())
    }

    fn op_ret(&mut self) -> VmResult<()> {
        let Some(frame) = self.frames.pop() else {
            self.running = false;
            return Ok(());
        };

        if frame.return_addr == ROOT_FRAME {
            self.running = false;
            return Ok(());
        }

        let return_value = self.stack.pop().unwrap_or(Value::Nil);
        self.locals.truncate(frame.local_start);
        self.pc = frame.return_addr;
        self.stack.push(return_value);
        Ok(())
    }

    fn op_call_native(&mut self, index: u32) -> VmResult<()> {
        let name = self
            .image
            .native_imports
            .get(index as usize)
            .ok_or(RuntimeError::BadNativeIndex {
                index,
                pc: self.pc,
            })?
            .clone();

        let Some(&handler) = self.natives.get(&name) else {
            return Err(RuntimeError::UnknownNative { name, pc: self.pc });
        };
        handler(self)
    }

    // ===== Arrays =====

    /// `NEW_ARRAY k`: the cell at `k` names the element type; its payload is
    /// the literal element count, with 0 meaning the length is on the stack.
    fn op_new_array(&mut self, operand: u32) -> VmResult<()> {
        let cell = self.constant(operand)?;
        let count = match cell {
            Constant::IntArray(n) | Constant::FloatArray(n) | Constant::StrArray(n) => n as usize,
            _ => {
                return Err(RuntimeError::type_mismatch(
                    "NEW_ARRAY operand must reference an array-typed constant",
                    self.pc,
                ))
            }
        };

        if count == 0 {
            let length = match self.pop()? {
                Value::Int(n) if n >= 0 => n as usize,
                Value::Int(_) => {
                    return Err(RuntimeError::type_mismatch(
                        "Array length must be non-negative",
                        self.pc,
                    ))
                }
                _ => {
                    return Err(RuntimeError::type_mismatch(
                        "Array length must be an integer",
                        self.pc,
                    ))
                }
            };
            let value = match cell {
                Constant::IntArray(_) => {
                    let idx = self.image.int_arrays.len() as u32;
                    self.image.int_arrays.push(vec![0; length]);
                    Value::IntArray(idx)
                }
                Constant::FloatArray(_) => {
                    let idx = self.image.float_arrays.len() as u32;
                    self.image.float_arrays.push(vec![0.0; length]);
                    Value::FloatArray(idx)
                }
                _ => {
                    let idx = self.image.string_arrays.len() as u32;
                    self.image.string_arrays.push(vec![String::new(); length]);
                    Value::StrArray(idx)
                }
            };
            self.stack.push(value);
            return Ok(());
        }

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop()?);
        }
        values.reverse();

        // Element type follows the first element; arrays are homogeneous.
        let value = match values[0] {
            Value::Int(_) => {
                let mut elements = Vec::with_capacity(count);
                for v in &values {
                    match v {
                        Value::Int(n) => elements.push(*n),
                        _ => {
                            return Err(RuntimeError::type_mismatch(
                                "Array elements must all be int",
                                self.pc,
                            ))
                        }
                    }
                }
                let idx = self.image.int_arrays.len() as u32;
                self.image.int_arrays.push(elements);
                Value::IntArray(idx)
            }
            Value::Float(_) => {
                let mut elements = Vec::with_capacity(count);
                for v in &values {
                    match v {
                        Value::Float(n) => elements.push(*n),
                        _ => {
                            return Err(RuntimeError::type_mismatch(
                                "Array elements must all be float",
                                self.pc,
                            ))
                        }
                    }
                }
                let idx = self.image.float_arrays.len() as u32;
                self.image.float_arrays.push(elements);
                Value::FloatArray(idx)
            }
            Value::Str(_) => {
                let mut elements = Vec::with_capacity(count);
                for v in &values {
                    match v {
                        Value::Str(s) => elements.push(self.string(*s)?.to_string()),
                        _ => {
                            return Err(RuntimeError::type_mismatch(
                                "Array elements must all be str",
                                self.pc,
                            ))
                        }
                    }
                }
                let idx = self.image.string_arrays.len() as u32;
                self.image.string_arrays.push(elements);
                Value::StrArray(idx)
            }
            _ => {
                return Err(RuntimeError::type_mismatch(
                    "Unsupported array element type",
                    self.pc,
                ))
            }
        };

        self.stack.push(value);
        Ok(())
    }

    fn op_load_index(&mut self) -> VmResult<()> {
        let index = self.pop_index()?;
        let array = self.pop()?;

        let value = match array {
            Value::IntArray(ai) => {
                let arr = self.int_array(ai)?;
                let i = self.check_bounds(index, arr.len())?;
                Value::Int(arr[i])
            }
            Value::FloatArray(ai) => {
                let arr = self.float_array(ai)?;
                let i = self.check_bounds(index, arr.len())?;
                Value::Float(arr[i])
            }
            Value::StrArray(ai) => {
                let arr = self.string_array(ai)?;
                let i = self.check_bounds(index, arr.len())?;
                let element = arr[i].clone();
                let idx = self.image.push_string(element);
                Value::Str(idx)
            }
            other => {
                return Err(RuntimeError::type_mismatch(
                    format!("Cannot index a value of type {}", other.type_name()),
                    self.pc,
                ))
            }
        };

        self.stack.push(value);
        Ok(())
    }

    fn op_store_index(&mut self) -> VmResult<()> {
        let value = self.pop()?;
        let index = self.pop_index()?;
        let array = self.pop()?;
        let pc = self.pc;

        match (array, value) {
            (Value::IntArray(ai), Value::Int(v)) => {
                let len = self.int_array(ai)?.len();
                let i = self.check_bounds(index, len)?;
                self.image.int_arrays[ai as usize][i] = v;
            }
            (Value::FloatArray(ai), Value::Float(v)) => {
                let len = self.float_array(ai)?.len();
                let i = self.check_bounds(index, len)?;
                self.image.float_arrays[ai as usize][i] = v;
            }
            (Value::StrArray(ai), Value::Str(s)) => {
                let text = self.string(s)?.to_string();
                let len = self.string_array(ai)?.len();
                let i = self.check_bounds(index, len)?;
                self.image.string_arrays[ai as usize][i] = text;
            }
            (Value::IntArray(_) | Value::FloatArray(_) | Value::StrArray(_), other) => {
                return Err(RuntimeError::type_mismatch(
                    format!("Cannot store {} in this array", other.type_name()),
                    pc,
                ))
            }
            (other, _) => {
                return Err(RuntimeError::type_mismatch(
                    format!("Cannot index a value of type {}", other.type_name()),
                    pc,
                ))
            }
        }

        // Like STORE, the stored value stays available to the expression.
        self.stack.push(value);
        Ok(())
    }

    fn op_array_len(&mut self) -> VmResult<()> {
        let array = self.pop()?;
        let len = match array {
            Value::IntArray(ai) => self.int_array(ai)?.len(),
            Value::FloatArray(ai) => self.float_array(ai)?.len(),
            Value::StrArray(ai) => self.string_array(ai)?.len(),
            other => {
                return Err(RuntimeError::type_mismatch(
                    format!("Cannot take the length of {}", other.type_name()),
                    self.pc,
                ))
            }
        };
        self.stack.push(Value::Int(len as i64));
        Ok(())
    }

    // ===== Access helpers =====

    pub(crate) fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow(self.pc))
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pc(&self) -> usize {
        self.pc
    }

    pub(crate) fn image_mut(&mut self) -> &mut BytecodeImage {
        &mut self.image
    }

    pub(crate) fn next_random(&mut self) -> i64 {
        self.rng_state = (self.rng_state.wrapping_mul(1103515245).wrapping_add(12345))
            & 0x7fff_ffff;
        self.rng_state % 100
    }

    pub(crate) fn write_out(&mut self, text: &str) -> VmResult<()> {
        let pc = self.pc;
        self.out
            .write_all(text.as_bytes())
            .map_err(|e| RuntimeError::general(format!("I/O error: {}", e), pc))
    }

    pub(crate) fn flush_out(&mut self) -> VmResult<()> {
        let pc = self.pc;
        self.out
            .flush()
            .map_err(|e| RuntimeError::general(format!("I/O error: {}", e), pc))
    }

    pub(crate) fn stringify(&self, value: Value) -> String {
        value.stringify(&self.image)
    }

    fn constant(&self, index: u32) -> VmResult<Constant> {
        self.image
            .constants
            .get(index as usize)
            .copied()
            .ok_or(RuntimeError::BadConstantIndex {
                index,
                pc: self.pc,
            })
    }

    fn string(&self, index: u32) -> VmResult<&str> {
        self.image
            .strings
            .get(index as usize)
            .map(|s| s.as_str())
            .ok_or(RuntimeError::BadStringIndex {
                index,
                pc: self.pc,
            })
    }

    fn int_array(&self, index: u32) -> VmResult<&Vec<i64>> {
        self.image
            .int_arrays
            .get(index as usize)
            .ok_or_else(|| RuntimeError::general("Array pool index out of bounds", self.pc))
    }

    fn float_array(&self, index: u32) -> VmResult<&Vec<f64>> {
        self.image
            .float_arrays
            .get(index as usize)
            .ok_or_else(|| RuntimeError::general("Array pool index out of bounds", self.pc))
    }

    fn string_array(&self, index: u32) -> VmResult<&Vec<String>> {
        self.image
            .string_arrays
            .get(index as usize)
            .ok_or_else(|| RuntimeError::general("Array pool index out of bounds", self.pc))
    }

    /// Frame-relative local slot to an absolute index into the locals vector.
    fn local_slot(&self, index: u32) -> VmResult<usize> {
        let frame = self
            .frames
            .last()
            .ok_or(RuntimeError::StackUnderflow(self.pc))?;
        let slot = frame.local_start + index as usize;
        if slot >= self.locals.len() {
            return Err(RuntimeError::BadLocalSlot {
                index,
                pc: self.pc,
            });
        }
        Ok(slot)
    }

    fn pop_index(&mut self) -> VmResult<i64> {
        match self.pop()? {
            Value::Int(i) => Ok(i),
            _ => Err(RuntimeError::type_mismatch(
                "Array index must be an integer",
                self.pc,
            )),
        }
    }

    fn check_bounds(&self, index: i64, length: usize) -> VmResult<usize> {
        if index < 0 || index as usize >= length {
            return Err(RuntimeError::IndexOutOfBounds {
                index,
                length,
                pc: self.pc,
            });
        }
        Ok(index as usize)
    }

    fn jump(&mut self, target: u32) -> VmResult<()> {
        if target as usize >= self.image.code.len() {
            return Err(RuntimeError::BadJumpTarget {
                target,
                pc: self.pc,
            });
        }
        self.pc = target as usize;
        Ok(())
    }

    // ===== Tracing =====

    fn trace_instruction(&self, instr: &Instruction) {
        eprintln!("PC={:4}: {}", self.pc, format_instruction(instr));
        let rendered: Vec<String> = self
            .stack
            .iter()
            .map(|v| v.stringify(&self.image))
            .collect();
        eprintln!("  Stack [{}]: {}", self.stack.len(), rendered.join(" "));
    }

    fn dump_state(&self) {
        eprintln!("\n=== VM State Dump ===");
        eprintln!("PC: {}", self.pc);
        eprintln!("Running: {}", if self.running { "yes" } else { "no" });
        eprintln!("Call stack depth: {}", self.frames.len());
        eprintln!("Locals: {}", self.locals.len());
        eprintln!("Globals: {}", self.globals.len());
        eprintln!("\nStack ({} items):", self.stack.len());
        for (i, value) in self.stack.iter().enumerate().rev() {
            eprintln!("  [{}] {}", i, value.stringify(&self.image));
        }
    }
}

/// Read one line from stdin with the trailing newline stripped.
fn read_stdin_line() -> String {
    let mut line = String::new();
    let _ = io::stdin().read_line(&mut line);
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::bytecode::compiler::{Compiler, SourceModule};
    use crate::bytecode::image::FunctionInfo;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn compile(source: &str) -> BytecodeImage {
        let (tokens, lex_errors) = Scanner::new(source).tokenize();
        assert!(lex_errors.is_empty(), "lex errors: {:?}", lex_errors);
        let mut parser = Parser::new(tokens);
        let program = parser.parse();
        assert!(
            parser.errors().is_empty(),
            "parse errors: {:?}",
            parser.errors()
        );
        Compiler::compile(&[SourceModule::primary("main", program)]).expect("compile")
    }

    fn run_source(source: &str) -> (VmResult<()>, String) {
        run_image(compile(source))
    }

    fn run_image(image: BytecodeImage) -> (VmResult<()>, String) {
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(image, Box::new(buf.clone()));
        let result = vm.run();
        let output = String::from_utf8(buf.0.borrow().clone()).expect("utf8 output");
        (result, output)
    }

    fn expect_output(source: &str, expected: &str) {
        let (result, output) = run_source(source);
        result.expect("clean run");
        assert_eq!(output, expected);
    }

    #[test]
    fn scenario_hello() {
        expect_output("fn Main(){ Console.println(\"hello\"); }", "hello\n");
    }

    #[test]
    fn scenario_function_call() {
        expect_output(
            "fn add(int a,int b){ return a+b; } fn Main(){ Console.println(add(2,3)); }",
            "5\n",
        );
    }

    #[test]
    fn scenario_while_loop() {
        expect_output(
            "fn Main(){ mut int i=0; while(i<3){ Console.println(i); i=i+1; } }",
            "0\n1\n2\n",
        );
    }

    #[test]
    fn scenario_for_continue() {
        expect_output(
            "fn Main(){ for(int i=0;i<3;i=i+1){ if(i==1){continue;} Console.println(i); } }",
            "0\n2\n",
        );
    }

    #[test]
    fn scenario_recursion() {
        expect_output(
            "fn fact(int n){ if(n<=1){return 1;} return n*fact(n-1); } \
             fn Main(){ Console.println(fact(5)); }",
            "120\n",
        );
    }

    #[test]
    fn scenario_string_concat() {
        expect_output("fn Main(){ Console.println(\"x=\"+1); }", "x=1\n");
    }

    #[test]
    fn int_plus_float_widens() {
        expect_output("fn Main(){ Console.println(1 + 0.5); }", "1.5\n");
    }

    #[test]
    fn print_has_no_newline() {
        expect_output(
            "fn Main(){ Console.print(\"a\"); Console.print(\"b\"); }",
            "ab",
        );
    }

    #[test]
    fn eq_compares_string_forms() {
        expect_output("fn Main(){ Console.println(1 == 1.0); }", "true\n");
        expect_output("fn Main(){ Console.println(true == \"true\"); }", "true\n");
        expect_output("fn Main(){ Console.println(1 != 2); }", "true\n");
    }

    #[test]
    fn logical_operators_short_circuit() {
        // A falsy left side must skip the right side entirely.
        expect_output(
            "fn boom(){ Console.println(\"side effect\"); return true; } \
             fn Main(){ if(false and boom()){ Console.println(\"yes\"); } \
             Console.println(\"done\"); }",
            "done\n",
        );
        expect_output(
            "fn Main(){ if(true or false){ Console.println(\"taken\"); } }",
            "taken\n",
        );
    }

    #[test]
    fn unary_operators() {
        expect_output("fn Main(){ Console.println(-(3)); }", "-3\n");
        expect_output("fn Main(){ Console.println(!true); }", "false\n");
        expect_output("fn Main(){ Console.println(!nil); }", "true\n");
    }

    #[test]
    fn break_exits_loop() {
        expect_output(
            "fn Main(){ mut int i=0; while(true){ if(i==2){ break; } Console.println(i); i=i+1; } }",
            "0\n1\n",
        );
    }

    #[test]
    fn else_branch_runs() {
        expect_output(
            "fn Main(){ if(1>2){ Console.println(\"then\"); }else{ Console.println(\"else\"); } }",
            "else\n",
        );
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let (result, _) = run_source("fn Main(){ Console.println(1/0); }");
        assert!(matches!(result, Err(RuntimeError::DivisionByZero(_))));
    }

    #[test]
    fn modulo_by_zero_is_a_runtime_error() {
        let (result, _) = run_source("fn Main(){ Console.println(1%0); }");
        assert!(matches!(result, Err(RuntimeError::ModuloByZero(_))));
    }

    #[test]
    fn comparison_type_mismatch_is_a_runtime_error() {
        let (result, _) = run_source("fn Main(){ Console.println(1 < \"a\"); }");
        assert!(matches!(result, Err(RuntimeError::TypeMismatch { .. })));
    }

    #[test]
    fn array_literal_and_indexing() {
        expect_output(
            "fn Main(){ int a[] = [10, 20, 30]; Console.println(a[1]); }",
            "20\n",
        );
    }

    #[test]
    fn array_store_and_length() {
        expect_output(
            "fn Main(){ int a[] = [1, 2, 3]; a[0] = 9; \
             Console.println(a[0]); Console.println(Array.length(a)); }",
            "9\n3\n",
        );
    }

    #[test]
    fn sized_array_is_zero_filled() {
        expect_output(
            "fn Main(){ int a[3]; Console.println(a[2]); Console.println(Array.length(a)); }",
            "0\n3\n",
        );
    }

    #[test]
    fn string_array_elements() {
        expect_output(
            "fn Main(){ str s[] = [\"a\", \"b\"]; Console.println(s[1]); }",
            "b\n",
        );
    }

    #[test]
    fn array_index_out_of_bounds() {
        let (result, _) = run_source("fn Main(){ int a[] = [1]; Console.println(a[5]); }");
        assert!(matches!(result, Err(RuntimeError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn array_index_must_be_integer() {
        let (result, _) = run_source("fn Main(){ int a[] = [1]; Console.println(a[\"x\"]); }");
        assert!(matches!(result, Err(RuntimeError::TypeMismatch { .. })));
    }

    #[test]
    fn module_qualified_call_runs() {
        let (tokens, _) = Scanner::new("fn triple(int n){ return n*3; }").tokenize();
        let mut parser = Parser::new(tokens);
        let lib = SourceModule::include("mathx", parser.parse());

        let (tokens, _) =
            Scanner::new("fn Main(){ Console.println(mathx.triple(7)); }").tokenize();
        let mut parser = Parser::new(tokens);
        let main = SourceModule::primary("app", parser.parse());

        let image = Compiler::compile(&[lib, main]).expect("compile");
        let (result, output) = run_image(image);
        result.expect("clean run");
        assert_eq!(output, "21\n");
    }

    #[test]
    fn uninitialized_declarations_have_defaults() {
        expect_output(
            "fn Main(){ int i; float f; bool b; str s; \
             Console.println(i); Console.println(f); Console.println(b); Console.println(s); }",
            "0\n0\nfalse\n\n",
        );
    }

    #[test]
    fn runtime_string_results_append_to_the_pool() {
        let image = compile("fn Main(){ Console.println(\"a\"+\"b\"); }");
        let pool_before = image.strings.len();
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(image, Box::new(buf.clone()));
        vm.run().expect("clean run");
        assert!(vm.image().strings.len() > pool_before);
        assert_eq!(String::from_utf8(buf.0.borrow().clone()).unwrap(), "ab\n");
    }

    #[test]
    fn in_memory_image_matches_roundtripped_image_output() {
        let source = "fn fact(int n){ if(n<=1){return 1;} return n*fact(n-1); } \
                      fn Main(){ Console.println(fact(6)); }";
        let image = compile(source);

        let bytes = crate::bytecode::format::serialize(&image);
        let decoded = crate::bytecode::format::deserialize(&bytes).expect("deserialize");
        assert_eq!(image, decoded);

        let (r1, out1) = run_image(image);
        let (r2, out2) = run_image(decoded);
        r1.expect("direct run");
        r2.expect("roundtripped run");
        assert_eq!(out1, out2);
        assert_eq!(out1, "720\n");
    }

    // Opcodes with no compiler-side producer still execute; exercise them
    // with a hand-built image.
    fn hand_image(code: Vec<Instruction>, constants: Vec<Constant>) -> BytecodeImage {
        let mut image = BytecodeImage::new();
        image.code = code;
        image.constants = constants;
        let locals = 1;
        image
            .functions
            .push(FunctionInfo::new("Main", 0, 0, locals));
        image
    }

    #[test]
    fn swap_inc_dec_execute() {
        let image = hand_image(
            vec![
                Instruction::new(OpCode::Push, 0), // 1
                Instruction::new(OpCode::Push, 1), // 2
                Instruction::new(OpCode::Swap, 0), // 2 1
                Instruction::new(OpCode::Inc, 0),  // 2 2
                Instruction::new(OpCode::Inc, 0),  // 2 3
                Instruction::new(OpCode::Dec, 0),  // 2 2
                Instruction::new(OpCode::Println, 0),
                Instruction::new(OpCode::Println, 0),
                Instruction::new(OpCode::Halt, 0),
            ],
            vec![Constant::Int(1), Constant::Int(2)],
        );
        let (result, output) = run_image(image);
        result.expect("clean run");
        assert_eq!(output, "2\n2\n");
    }

    #[test]
    fn and_or_opcodes_execute() {
        let image = hand_image(
            vec![
                Instruction::new(OpCode::Push, 0),
                Instruction::new(OpCode::Push, 1),
                Instruction::new(OpCode::And, 0),
                Instruction::new(OpCode::Println, 0),
                Instruction::new(OpCode::Push, 0),
                Instruction::new(OpCode::Push, 1),
                Instruction::new(OpCode::Or, 0),
                Instruction::new(OpCode::Println, 0),
                Instruction::new(OpCode::Halt, 0),
            ],
            vec![Constant::Bool(true), Constant::Int(0)],
        );
        let (result, output) = run_image(image);
        result.expect("clean run");
        assert_eq!(output, "false\ntrue\n");
    }

    #[test]
    fn globals_grow_on_demand() {
        let image = hand_image(
            vec![
                Instruction::new(OpCode::Push, 0),
                Instruction::new(OpCode::StoreGlobal, 7),
                Instruction::new(OpCode::Pop, 0),
                Instruction::new(OpCode::LoadGlobal, 7),
                Instruction::new(OpCode::Println, 0),
                Instruction::new(OpCode::LoadGlobal, 2), // untouched: nil
                Instruction::new(OpCode::Println, 0),
                Instruction::new(OpCode::Halt, 0),
            ],
            vec![Constant::Int(41)],
        );
        let (result, output) = run_image(image);
        result.expect("clean run");
        assert_eq!(output, "41\nnil\n");
    }

    #[test]
    fn stack_underflow_is_reported() {
        let image = hand_image(vec![Instruction::new(OpCode::Pop, 0)], vec![]);
        let (result, _) = run_image(image);
        assert!(matches!(result, Err(RuntimeError::StackUnderflow(0))));
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let image = hand_image(
            vec![Instruction {
                opcode: 0x99,
                operand: 0,
            }],
            vec![],
        );
        let (result, _) = run_image(image);
        assert!(matches!(
            result,
            Err(RuntimeError::UnknownOpcode { opcode: 0x99, pc: 0 })
        ));
    }

    #[test]
    fn bad_constant_index_is_reported() {
        let image = hand_image(vec![Instruction::new(OpCode::Push, 9)], vec![]);
        let (result, _) = run_image(image);
        assert!(matches!(
            result,
            Err(RuntimeError::BadConstantIndex { index: 9, pc: 0 })
        ));
    }

    #[test]
    fn bad_jump_target_is_reported() {
        let image = hand_image(vec![Instruction::new(OpCode::Jmp, 100)], vec![]);
        let (result, _) = run_image(image);
        assert!(matches!(
            result,
            Err(RuntimeError::BadJumpTarget { target: 100, .. })
        ));
    }

    #[test]
    fn ret_through_root_frame_halts() {
        // Empty Main: push nil, ret, halt. The root RET halts before HALT runs.
        let (result, output) = run_source("fn Main(){ }");
        result.expect("clean run");
        assert_eq!(output, "");
    }

    #[test]
    fn missing_main_in_image_is_a_runtime_error() {
        let mut image = BytecodeImage::new();
        image.code.push(Instruction::new(OpCode::Halt, 0));
        let (result, _) = run_image(image);
        assert!(result.is_err());
    }

    #[test]
    fn random_int_is_deterministic() {
        // Random.* is registry-only (not a parser namespace), so drive it
        // through CALL_NATIVE directly.
        let build = || {
            let mut image = hand_image(
                vec![
                    Instruction::new(OpCode::CallNative, 0),
                    Instruction::new(OpCode::Println, 0),
                    Instruction::new(OpCode::CallNative, 0),
                    Instruction::new(OpCode::Println, 0),
                    Instruction::new(OpCode::Halt, 0),
                ],
                vec![],
            );
            image.native_imports.push("Random.int".to_string());
            image
        };
        let (r1, out1) = run_image(build());
        let (r2, out2) = run_image(build());
        r1.expect("clean run");
        r2.expect("clean run");
        assert_eq!(out1, out2);
        assert!(!out1.is_empty());
    }

    #[test]
    fn unknown_native_is_reported() {
        let mut image = hand_image(vec![Instruction::new(OpCode::CallNative, 0)], vec![]);
        image.native_imports.push("Nope.nothing".to_string());
        let (result, _) = run_image(image);
        assert!(matches!(result, Err(RuntimeError::UnknownNative { .. })));
    }
}
