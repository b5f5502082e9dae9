/// The Ratsnake virtual machine: a single-threaded, non-preemptive stack
/// interpreter over a loaded bytecode image.
///
/// Each iteration reads one tag byte at the instruction pointer, consumes
/// the operand bytes the opcode declares, and dispatches. Fatal conditions
/// (stack overflow, unknown tag, running off the image) return an error to
/// the caller; type and name errors print a diagnostic on stderr and
/// execution continues, with the failed operation pushing nothing.
///
/// Identifiers travel on the operand stack: ID pushes a name entry and
/// LOCAL pushes a slot-index entry, each consumed by the next
/// global/local/call opcode.

use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;

use crate::bytecode::{self, BytecodeHeader, Op};
use crate::core::ops::{self, BitOp};
use crate::core::pool::ConstantPool;
use crate::core::value::Value;
use crate::errors::VmError;
use crate::loader::{self, FunctionRecord, MAX_FUNCTIONS};
use crate::stack::{Frame, LocalFault, Stack, StackEntry};
use crate::table::Table;

pub const MAX_GLOBALS: usize = 1024;

pub struct Vm {
    stack: Stack,
    globals: Table<StackEntry>,
    functions: Table<FunctionRecord>,
    pool: ConstantPool,
    image: Vec<u8>,
    ip: usize,
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            stack: Stack::new(),
            globals: Table::with_capacity(MAX_GLOBALS),
            functions: Table::with_capacity(MAX_FUNCTIONS),
            pool: ConstantPool::new(),
            image: Vec::new(),
            ip: 0,
        }
    }

    pub fn pool(&self) -> &ConstantPool {
        &self.pool
    }

    pub fn global(&self, name: &str) -> Option<&StackEntry> {
        self.globals.get(name)
    }

    /// The primitive bound to a global, if the global exists and holds one.
    pub fn global_value(&self, name: &str) -> Option<Rc<Value>> {
        match self.globals.get(name) {
            Some(StackEntry::Primitive(v)) => Some(Rc::clone(v)),
            _ => None,
        }
    }

    pub fn stack_top(&self) -> usize {
        self.stack.top()
    }

    pub fn base_pointer(&self) -> usize {
        self.stack.base_pointer
    }

    pub fn run_file(&mut self, path: &Path) -> Result<(), VmError> {
        let image = fs::read(path)?;
        self.run_image(image)
    }

    /// Load the image, populate the function directory, and execute from
    /// `execution_section_start` until OP_HALT.
    pub fn run_image(&mut self, image: Vec<u8>) -> Result<(), VmError> {
        let header = BytecodeHeader::parse(&image)?;
        self.functions = loader::scan_functions(&image, &header)?;
        self.image = image;
        self.ip = header.execution_section_start as usize;
        self.dispatch_loop()
    }

    // ── Fetch helpers ────────────────────────────────────────────────────

    fn fetch_u8(&mut self) -> Result<u8, VmError> {
        let v = bytecode::read_u8(&self.image, self.ip)?;
        self.ip += 1;
        Ok(v)
    }

    fn fetch_u16(&mut self) -> Result<u16, VmError> {
        let v = bytecode::read_u16(&self.image, self.ip)?;
        self.ip += 2;
        Ok(v)
    }

    fn fetch_u32(&mut self) -> Result<u32, VmError> {
        let v = bytecode::read_u32(&self.image, self.ip)?;
        self.ip += 4;
        Ok(v)
    }

    fn fetch_i32(&mut self) -> Result<i32, VmError> {
        let v = bytecode::read_i32(&self.image, self.ip)?;
        self.ip += 4;
        Ok(v)
    }

    fn fetch_i64(&mut self) -> Result<i64, VmError> {
        let v = bytecode::read_i64(&self.image, self.ip)?;
        self.ip += 8;
        Ok(v)
    }

    fn fetch_f64(&mut self) -> Result<f64, VmError> {
        let v = bytecode::read_f64(&self.image, self.ip)?;
        self.ip += 8;
        Ok(v)
    }

    fn fetch_string(&mut self, len: usize) -> Result<String, VmError> {
        let bytes = bytecode::read_bytes(&self.image, self.ip, len)?;
        let s = String::from_utf8_lossy(bytes).into_owned();
        self.ip += len;
        Ok(s)
    }

    // ── Stack helpers ────────────────────────────────────────────────────

    /// Pop, substituting the Null sentinel on underflow.
    fn pop_entry(&mut self) -> StackEntry {
        match self.stack.pop() {
            Some(entry) => entry,
            None => {
                eprintln!("Attempted to pop from an empty stack. Stack underflow error.");
                StackEntry::Primitive(self.pool.null())
            }
        }
    }

    /// Pop the two operands of a binary op, right first. Non-primitive
    /// operands are a type error and yield nothing.
    fn binary_operands(&mut self, what: &str) -> Option<(Rc<Value>, Rc<Value>)> {
        let b = self.pop_entry();
        let a = self.pop_entry();
        match (a, b) {
            (StackEntry::Primitive(a), StackEntry::Primitive(b)) => Some((a, b)),
            _ => {
                eprintln!("Error: Invalid types for {what} operation.");
                None
            }
        }
    }

    fn arith(
        &mut self,
        what: &str,
        op: fn(&ConstantPool, &Value, &Value) -> Option<Rc<Value>>,
    ) -> Result<(), VmError> {
        if let Some((a, b)) = self.binary_operands(what) {
            if let Some(result) = op(&self.pool, &a, &b) {
                self.stack.push(StackEntry::Primitive(result))?;
            }
        }
        Ok(())
    }

    fn compare(&mut self, what: &str, op: fn(&Value, &Value) -> bool) -> Result<(), VmError> {
        if let Some((a, b)) = self.binary_operands(what) {
            let result = self.pool.bool(op(&a, &b));
            self.stack.push(StackEntry::Primitive(result))?;
        }
        Ok(())
    }

    fn bitop(&mut self, what: &str, op: BitOp) -> Result<(), VmError> {
        if let Some((a, b)) = self.binary_operands(what) {
            if let Some(result) = ops::bitwise(&self.pool, op, &a, &b) {
                self.stack.push(StackEntry::Primitive(result))?;
            }
        }
        Ok(())
    }

    fn jump(&mut self, delta: i32) -> Result<(), VmError> {
        let target = self.ip as i64 + delta as i64;
        if target < 0 || target > self.image.len() as i64 {
            return Err(VmError::JumpOutOfBounds { target });
        }
        self.ip = target as usize;
        Ok(())
    }

    /// The return protocol: pop the return value, discard the frame and
    /// everything above it, push the return value, restore the caller's IP
    /// and base pointer.
    fn do_return(&mut self) -> Result<(), VmError> {
        let bp = self.stack.base_pointer;
        let (return_ip, parent_bp) = match self.stack.entry(bp) {
            Some(StackEntry::Frame(frame)) => (frame.return_ip, frame.parent_base_pointer),
            _ => {
                eprintln!("Error: Expected stack frame at base pointer.");
                return Ok(());
            }
        };
        let ret = self.pop_entry();
        self.stack.truncate(bp);
        self.stack.push(ret)?;
        self.ip = return_ip;
        self.stack.base_pointer = parent_bp;
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    fn dispatch_loop(&mut self) -> Result<(), VmError> {
        loop {
            let at = self.ip;
            let byte = self.fetch_u8().map_err(|_| VmError::Truncated { offset: at })?;
            let Some(op) = Op::from_byte(byte) else {
                return Err(VmError::UnknownInstruction { byte, offset: at });
            };

            match op {
                Op::Halt => return Ok(()),

                // ── Literals ─────────────────────────────────────────────
                Op::Int => {
                    let v = self.fetch_i64()?;
                    self.stack.push(StackEntry::Primitive(self.pool.int(v)))?;
                }
                Op::Float => {
                    let v = self.fetch_f64()?;
                    self.stack.push(StackEntry::Primitive(self.pool.float(v)))?;
                }
                Op::Bool => {
                    let v = self.fetch_u8()?;
                    self.stack.push(StackEntry::Primitive(self.pool.bool(v != 0)))?;
                }
                Op::Str => {
                    let len = self.fetch_u32()? as usize;
                    let s = self.fetch_string(len)?;
                    self.stack.push(StackEntry::Primitive(Rc::new(Value::Str(s))))?;
                }
                Op::Null => {
                    self.stack.push(StackEntry::Primitive(self.pool.null()))?;
                }
                Op::Id => {
                    let len = self.fetch_u16()? as usize;
                    let name = self.fetch_string(len)?;
                    self.stack.push(StackEntry::Name(name))?;
                }
                Op::Local => {
                    let index = self.fetch_u16()?;
                    self.stack.push(StackEntry::Slot(index))?;
                }

                // ── Arithmetic ───────────────────────────────────────────
                Op::Add => self.arith("ADD", ops::add)?,
                Op::Sub => self.arith("SUB", ops::sub)?,
                Op::Mul => self.arith("MUL", ops::mul)?,
                Op::Div => self.arith("DIV", ops::div)?,
                Op::Mod => self.arith("MOD", ops::modulo)?,

                // ── Bitwise ──────────────────────────────────────────────
                Op::Blshift => self.bitop("BLSHIFT", BitOp::Lshift)?,
                Op::Brshift => self.bitop("BRSHIFT", BitOp::Rshift)?,
                Op::Bxor => self.bitop("BXOR", BitOp::Xor)?,
                Op::Bor => self.bitop("BOR", BitOp::Or)?,
                Op::Band => self.bitop("BAND", BitOp::And)?,

                // ── Comparisons ──────────────────────────────────────────
                Op::Eq => self.compare("EQ", ops::eq)?,
                Op::Neq => self.compare("NEQ", ops::neq)?,
                Op::Lt => self.compare("LT", ops::lt)?,
                Op::Leq => self.compare("LEQ", ops::leq)?,
                Op::Gt => self.compare("GT", ops::gt)?,
                Op::Geq => self.compare("GEQ", ops::geq)?,

                // ── Logical ──────────────────────────────────────────────
                Op::LogicalAnd => {
                    if let Some((a, b)) = self.binary_operands("LOGICAL_AND") {
                        let result = self.pool.bool(a.is_truthy() && b.is_truthy());
                        self.stack.push(StackEntry::Primitive(result))?;
                    }
                }
                Op::LogicalOr => {
                    if let Some((a, b)) = self.binary_operands("LOGICAL_OR") {
                        let result = self.pool.bool(a.is_truthy() || b.is_truthy());
                        self.stack.push(StackEntry::Primitive(result))?;
                    }
                }
                Op::LogicalNot => match self.pop_entry() {
                    StackEntry::Primitive(v) => {
                        let result = self.pool.bool(!v.is_truthy());
                        self.stack.push(StackEntry::Primitive(result))?;
                    }
                    _ => eprintln!("Error: Invalid types for LOGICAL_NOT operation."),
                },

                // ── Globals ──────────────────────────────────────────────
                Op::GetGlobal => match self.pop_entry() {
                    StackEntry::Name(name) => match self.globals.get(&name) {
                        Some(entry) => {
                            let entry = entry.clone();
                            self.stack.push(entry)?;
                        }
                        None => eprintln!("Error: Undefined global variable {name}."),
                    },
                    other => eprintln!(
                        "Error: expected identifier for OP_GET_GLOBAL, got {}.",
                        other.kind_name()
                    ),
                },
                Op::SetGlobal => {
                    let id = self.pop_entry();
                    // A store with no value to pop is abandoned, so a jump
                    // into an ID/SET pair cannot bind the name.
                    let Some(value) = self.stack.pop() else {
                        eprintln!("Attempted to pop from an empty stack. Stack underflow error.");
                        continue;
                    };
                    match id {
                        StackEntry::Name(name) => self.globals.set(&name, value),
                        other => eprintln!(
                            "Error: expected identifier for OP_SET_GLOBAL, got {}.",
                            other.kind_name()
                        ),
                    }
                }

                // ── Locals ───────────────────────────────────────────────
                Op::GetLocal => match self.pop_entry() {
                    StackEntry::Slot(index) => {
                        let bp = self.stack.base_pointer;
                        let fetched = match self.stack.entry(bp) {
                            Some(StackEntry::Frame(frame)) => match frame.get_local(index) {
                                Ok(entry) => Some(entry.clone()),
                                Err(LocalFault::OutOfBounds) => {
                                    eprintln!(
                                        "Error: Local variable index out of bounds ({index} >= {}).",
                                        frame.local_count()
                                    );
                                    None
                                }
                                Err(LocalFault::Uninitialized) => {
                                    eprintln!("Error: Accessing uninitialized local variable.");
                                    None
                                }
                            },
                            _ => {
                                eprintln!("Error: Expected stack frame at base pointer.");
                                None
                            }
                        };
                        if let Some(entry) = fetched {
                            self.stack.push(entry)?;
                        }
                    }
                    other => eprintln!(
                        "Error: expected local index for OP_GET_LOCAL, got {}.",
                        other.kind_name()
                    ),
                },
                Op::SetLocal => {
                    let id = self.pop_entry();
                    let Some(value) = self.stack.pop() else {
                        eprintln!("Attempted to pop from an empty stack. Stack underflow error.");
                        continue;
                    };
                    match id {
                        StackEntry::Slot(index) => {
                            let bp = self.stack.base_pointer;
                            match self.stack.entry_mut(bp) {
                                Some(StackEntry::Frame(frame)) => {
                                    if frame.set_local(index, value).is_err() {
                                        eprintln!(
                                            "Error: Local variable index out of bounds ({index} >= {}).",
                                            frame.local_count()
                                        );
                                    }
                                }
                                _ => eprintln!("Error: Expected stack frame at base pointer."),
                            }
                        }
                        other => eprintln!(
                            "Error: expected local index for OP_SET_LOCAL, got {}.",
                            other.kind_name()
                        ),
                    }
                }

                // ── Control flow ─────────────────────────────────────────
                Op::Jmp => {
                    let delta = self.fetch_i32()?;
                    self.jump(delta)?;
                }
                Op::JmpIf => {
                    let delta = self.fetch_i32()?;
                    let jump_taken = match self.pop_entry() {
                        StackEntry::Primitive(v) => !v.is_truthy(),
                        _ => {
                            eprintln!("Error: Invalid type for OP_JMPIF condition.");
                            false
                        }
                    };
                    if jump_taken {
                        self.jump(delta)?;
                    }
                }

                // ── Calls ────────────────────────────────────────────────
                Op::Call => match self.pop_entry() {
                    StackEntry::Name(name) => match self.functions.get(&name).cloned() {
                        Some(func) => self.enter_function(&func)?,
                        None => eprintln!("Error: Undefined function '{name}'"),
                    },
                    other => eprintln!(
                        "Error: expected identifier for OP_CALL, got {}.",
                        other.kind_name()
                    ),
                },
                Op::Return => self.do_return()?,

                // ── Misc ─────────────────────────────────────────────────
                Op::Pop => {
                    self.pop_entry();
                }
                Op::Print => match self.pop_entry() {
                    StackEntry::Primitive(v) => println!("{v}"),
                    StackEntry::Name(name) => println!("{name}"),
                    StackEntry::Slot(index) => println!("{index}"),
                    StackEntry::Frame(_) => {
                        eprintln!("Error: Invalid type for PRINT operation.")
                    }
                },
                Op::Input => {
                    let mut line = String::new();
                    io::stdin().read_line(&mut line)?;
                    while line.ends_with('\n') || line.ends_with('\r') {
                        line.pop();
                    }
                    self.stack.push(StackEntry::Primitive(Rc::new(Value::Str(line))))?;
                }

                // ── Definition blocks in the instruction stream ──────────
                Op::FuncDef => {
                    let after_counts = bytecode::skip_operands(&self.image, self.ip, Op::FuncDef)?;
                    self.ip = loader::skip_block(&self.image, after_counts, Op::EndFunc)?;
                }
                // A body that falls through without OP_RETURN returns Null.
                Op::EndFunc => {
                    self.stack.push(StackEntry::Primitive(self.pool.null()))?;
                    self.do_return()?;
                }
                Op::ClassDef => {
                    self.ip = loader::skip_block(&self.image, self.ip, Op::EndClass)?;
                }
                Op::EndClass => {
                    eprintln!("Error: Unexpected OP_ENDCLASS in instruction stream.");
                }
            }
        }
    }

    /// OP_CALL protocol: arguments were pushed first-to-last, so popping
    /// fills the last local first and arg[0] lands in slot 0.
    fn enter_function(&mut self, func: &FunctionRecord) -> Result<(), VmError> {
        let mut frame = Frame::new(self.ip, self.stack.base_pointer, func.local_count as usize);
        for index in (0..func.num_args).rev() {
            let arg = self.pop_entry();
            if frame.set_local(index, arg).is_err() {
                eprintln!(
                    "Error: Local variable index out of bounds ({index} >= {}).",
                    frame.local_count()
                );
            }
        }
        let new_base = self.stack.top();
        self.stack.push(StackEntry::Frame(frame))?;
        self.stack.base_pointer = new_base;
        self.ip = func.body_ip;
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
