use std::fmt;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::ast::Value;
use crate::collections::{self, PersistentList};
use crate::error::CinderError;
use crate::interop;
use crate::options;
use crate::rt;
use crate::types;
use crate::vm::bytecode::{CodeObject, CompareOp, Op};

/// Shared mutable slot through which a captured variable is reached.
pub type Cell = Arc<Mutex<Option<Value>>>;

fn new_cell(value: Option<Value>) -> Cell {
    Arc::new(Mutex::new(value))
}

pub struct Closure {
    code: Arc<CodeObject>,
    cells: Vec<Cell>,
}

impl Closure {
    pub fn new(code: Arc<CodeObject>, cells: Vec<Cell>) -> Self {
        Self { code, cells }
    }

    pub fn name(&self) -> &str {
        &self.code.name
    }

    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Closure({})", self.code.name)
    }
}

#[derive(Clone)]
enum Slot {
    Value(Value),
    Cell(Cell),
    Cells(Vec<Cell>),
    /// Exception in flight, pushed when a block handler is entered.
    Pending(Box<CinderError>),
}

#[derive(Clone, Copy, Debug)]
struct Block {
    handler: usize,
    depth: usize,
}

struct Frame<'a> {
    code: &'a CodeObject,
    locals: Vec<Option<Value>>,
    cells: Vec<Cell>,
    stack: Vec<Slot>,
    blocks: Vec<Block>,
    pc: usize,
}

static MAX_CALL_DEPTH: Lazy<usize> = Lazy::new(options::max_call_depth_from_env);

thread_local! {
    static CALL_DEPTH: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Counts one closure frame on this thread for as long as it lives.
struct DepthGuard;

impl DepthGuard {
    fn enter(name: &str) -> Result<Self, CinderError> {
        CALL_DEPTH.with(|depth| {
            let next = depth.get() + 1;
            if next > *MAX_CALL_DEPTH {
                return Err(CinderError::illegal_state(format!(
                    "maximum call depth ({}) exceeded calling {}",
                    *MAX_CALL_DEPTH, name
                )));
            }
            depth.set(next);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Calls any callable value.
pub fn call_value(func: &Value, args: Vec<Value>) -> Result<Value, CinderError> {
    match func {
        Value::Func(native) => native.call(&args),
        Value::Closure(closure) => invoke_closure(closure, args),
        Value::ProtocolFn(pfn) => pfn.invoke(&args),
        Value::Type(key) => Ok(types::make_instance(*key, &args)),
        Value::Var(var) => call_value(&var.deref()?, args),
        Value::Keyword(_) | Value::Map(_) | Value::Vector(_) | Value::Set(_) => {
            lookup_call(func, &args)
        }
        other => Err(CinderError::illegal_argument(format!(
            "{} is not callable",
            other.type_name()
        ))),
    }
}

fn lookup_call(func: &Value, args: &[Value]) -> Result<Value, CinderError> {
    if args.is_empty() || args.len() > 2 {
        return Err(CinderError::arity(format!(
            "Wrong number of args ({}) passed to: {}",
            args.len(),
            func.type_name()
        )));
    }
    let default = args.get(1).cloned().unwrap_or(Value::Nil);
    let found = match (func, &args[0]) {
        (Value::Keyword(_), target) => rt::lookup(target, func)?,
        (coll, key) => rt::lookup(coll, key)?,
    };
    Ok(found.unwrap_or(default))
}

pub fn invoke_closure(closure: &Arc<Closure>, args: Vec<Value>) -> Result<Value, CinderError> {
    let code = closure.code.as_ref();
    let fixed = if code.varargs {
        code.argcount.saturating_sub(1)
    } else {
        code.argcount
    };
    let accepted = if code.varargs {
        args.len() >= fixed
    } else {
        args.len() == fixed
    };
    if !accepted {
        return Err(CinderError::arity(format!(
            "Wrong number of args ({}) passed to: {}",
            args.len(),
            code.name
        )));
    }
    let mut locals = vec![None; code.varnames.len()];
    let mut args = args.into_iter();
    for slot in locals.iter_mut().take(fixed) {
        *slot = args.next();
    }
    if code.varargs {
        let rest: Vec<Value> = args.collect();
        locals[fixed] = Some(if rest.is_empty() {
            Value::Nil
        } else {
            Value::List(PersistentList::from_vec(rest))
        });
    }
    let mut cells = closure.cells.clone();
    cells.extend(code.cellvars.iter().map(|_| new_cell(None)));
    let _depth = DepthGuard::enter(&code.name)?;
    Frame::new(code, locals, cells).run()
}

/// Runs a top-level code object with no arguments.
pub fn execute(code: &Arc<CodeObject>) -> Result<Value, CinderError> {
    let closure = Arc::new(Closure::new(code.clone(), Vec::new()));
    invoke_closure(&closure, Vec::new())
}

impl<'a> Frame<'a> {
    fn new(code: &'a CodeObject, locals: Vec<Option<Value>>, cells: Vec<Cell>) -> Self {
        Self {
            code,
            locals,
            cells,
            stack: Vec::with_capacity(16),
            blocks: Vec::new(),
            pc: 0,
        }
    }

    fn run(&mut self) -> Result<Value, CinderError> {
        loop {
            let pc = self.pc;
            let Some(op) = self.code.ops.get(pc).copied() else {
                return Err(self.vm_error("fell off the end of the code object"));
            };
            self.pc += 1;
            match self.step(op) {
                Ok(Some(ret)) => return Ok(ret),
                Ok(None) => {}
                Err(err) => {
                    let err = err
                        .with_line(self.code.line_for(pc))
                        .with_function(&self.code.name);
                    self.unwind(err)?;
                }
            }
        }
    }

    /// Hands `err` to the innermost block, or propagates it.
    fn unwind(&mut self, err: CinderError) -> Result<(), CinderError> {
        let Some(block) = self.blocks.pop() else {
            return Err(err);
        };
        self.stack.truncate(block.depth);
        self.stack.push(Slot::Pending(Box::new(err)));
        self.pc = block.handler;
        Ok(())
    }

    fn step(&mut self, op: Op) -> Result<Option<Value>, CinderError> {
        match op {
            Op::LoadConst(idx) => {
                let value = self
                    .code
                    .consts
                    .get(idx as usize)
                    .cloned()
                    .ok_or_else(|| self.vm_error("invalid constant index"))?;
                self.push(value);
            }
            Op::LoadFast(idx) => {
                let value = self.locals.get(idx as usize).cloned().flatten().ok_or_else(|| {
                    self.vm_error(&format!(
                        "local variable '{}' referenced before assignment",
                        self.local_name(idx)
                    ))
                })?;
                self.push(value);
            }
            Op::StoreFast(idx) => {
                let value = self.pop_value()?;
                let slot = self
                    .locals
                    .get_mut(idx as usize)
                    .ok_or_else(|| CinderError::runtime("invalid local index"))?;
                *slot = Some(value);
            }
            Op::LoadDeref(idx) => {
                let cell = self.cell(idx)?;
                let value = cell.lock().unwrap().clone().ok_or_else(|| {
                    self.vm_error(&format!(
                        "free variable '{}' referenced before assignment",
                        self.cell_name(idx)
                    ))
                })?;
                self.push(value);
            }
            Op::StoreDeref(idx) => {
                let value = self.pop_value()?;
                let cell = self.cell(idx)?;
                *cell.lock().unwrap() = Some(value);
            }
            Op::StoreCell(idx) => {
                let value = self.pop_value()?;
                let slot = self
                    .cells
                    .get_mut(idx as usize)
                    .ok_or_else(|| CinderError::runtime("invalid cell index"))?;
                *slot = new_cell(Some(value));
            }
            Op::LoadClosure(idx) => {
                let cell = self.cell(idx)?;
                self.stack.push(Slot::Cell(cell));
            }
            Op::LoadAttr(idx) => {
                let name = self
                    .code
                    .names
                    .get(idx as usize)
                    .cloned()
                    .ok_or_else(|| self.vm_error("invalid name index"))?;
                let target = self.pop_value()?;
                self.push(interop::get_attr(&target, &name)?);
            }
            Op::DerefVar => match self.pop_value()? {
                Value::Var(var) => {
                    let value = var.deref()?;
                    self.push(value);
                }
                other => {
                    return Err(self.vm_error(&format!("cannot deref {}", other.type_name())))
                }
            },
            Op::BuildTuple(count) => {
                let mut cells = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    match self.pop_slot()? {
                        Slot::Cell(cell) => cells.push(cell),
                        _ => return Err(self.vm_error("closure tuple expects cells")),
                    }
                }
                cells.reverse();
                self.stack.push(Slot::Cells(cells));
            }
            Op::MakeFunction => {
                let code = self.pop_code()?;
                self.push(Value::Closure(Arc::new(Closure::new(code, Vec::new()))));
            }
            Op::MakeClosure => {
                let code = self.pop_code()?;
                let cells = match self.pop_slot()? {
                    Slot::Cells(cells) => cells,
                    _ => return Err(self.vm_error("MakeClosure expects a cell tuple")),
                };
                if cells.len() != code.freevars.len() {
                    return Err(self.vm_error("closure cell count mismatch"));
                }
                self.push(Value::Closure(Arc::new(Closure::new(code, cells))));
            }
            Op::CallFunction(argc) => {
                let args = self.pop_values(argc as usize)?;
                let func = self.pop_value()?;
                let result = call_value(&func, args)?;
                self.push(result);
            }
            Op::CallFunctionVar(argc) => {
                let spread = self.pop_value()?;
                let mut args = self.pop_values(argc as usize)?;
                args.extend(collections::to_vec(&spread)?);
                let func = self.pop_value()?;
                let result = call_value(&func, args)?;
                self.push(result);
            }
            Op::PopTop => {
                self.pop_slot()?;
            }
            Op::DupTop => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| self.vm_error("stack underflow"))?;
                self.stack.push(top);
            }
            Op::RotTwo => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.vm_error("stack underflow"));
                }
                self.stack.swap(len - 1, len - 2);
            }
            Op::Jump(target) => self.pc = target as usize,
            Op::PopJumpIfFalse(target) => {
                if !self.pop_value()?.truthy() {
                    self.pc = target as usize;
                }
            }
            Op::CompareOp(cmp) => {
                let right = self.pop_value()?;
                let left = self.pop_slot()?;
                let result = self.compare(cmp, left, &right)?;
                self.push(Value::Bool(result));
            }
            Op::SetupExcept(handler) | Op::SetupFinally(handler) => {
                self.blocks.push(Block {
                    handler: handler as usize,
                    depth: self.stack.len(),
                });
            }
            Op::PopBlock => {
                self.blocks
                    .pop()
                    .ok_or_else(|| self.vm_error("PopBlock without an active block"))?;
            }
            Op::EndFinally => match self.pop_slot()? {
                Slot::Pending(err) => return Err(*err),
                Slot::Value(Value::Nil) => {}
                _ => return Err(self.vm_error("EndFinally expects nil or a pending exception")),
            },
            Op::Raise => {
                let value = self.pop_value()?;
                return Err(CinderError::thrown(value));
            }
            Op::ReturnValue => return self.pop_value().map(Some),
            Op::BinarySubscr => {
                let index = self.pop_value()?;
                let coll = self.pop_value()?;
                self.push(rt::nth(&coll, &index)?);
            }
            Op::Slice1 => {
                let start = self.pop_value()?;
                let coll = self.pop_value()?;
                let Value::Int(start) = start else {
                    return Err(self.vm_error("slice start must be an integer"));
                };
                let rest: Vec<Value> = collections::to_vec(&coll)?
                    .into_iter()
                    .skip(start.max(0) as usize)
                    .collect();
                self.push(if rest.is_empty() {
                    Value::Nil
                } else {
                    Value::List(PersistentList::from_vec(rest))
                });
            }
        }
        Ok(None)
    }

    fn compare(&self, cmp: CompareOp, left: Slot, right: &Value) -> Result<bool, CinderError> {
        if cmp == CompareOp::ExceptionMatch {
            return self.exception_match(&left, right);
        }
        let left = self.slot_value(left)?;
        match cmp {
            CompareOp::Is => Ok(left.identical(right)),
            CompareOp::IsNot => Ok(!left.identical(right)),
            CompareOp::Eq => Ok(left == *right),
            CompareOp::NotEq => Ok(left != *right),
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                let ordering = rt::compare_numbers(&left, right)?;
                Ok(match cmp {
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::Le => ordering.is_le(),
                    CompareOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })
            }
            CompareOp::ExceptionMatch => self.exception_match(&Slot::Value(left), right),
        }
    }

    fn exception_match(&self, raised: &Slot, expected: &Value) -> Result<bool, CinderError> {
        let raised = match raised {
            Slot::Pending(err) => err.exception_type(),
            Slot::Value(value) => value.type_key(),
            _ => return Err(self.vm_error("exception match on a cell")),
        };
        match expected {
            Value::Type(expected) => Ok(types::is_subtype(raised, *expected)),
            other => Err(CinderError::illegal_argument(format!(
                "catch expects an exception type, got {}",
                other.type_name()
            ))),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(Slot::Value(value));
    }

    fn pop_slot(&mut self) -> Result<Slot, CinderError> {
        self.stack.pop().ok_or_else(|| self.vm_error("stack underflow"))
    }

    fn slot_value(&self, slot: Slot) -> Result<Value, CinderError> {
        match slot {
            Slot::Value(value) => Ok(value),
            Slot::Pending(err) => Ok(err.to_value()),
            Slot::Cell(_) | Slot::Cells(_) => Err(self.vm_error("expected a value, found a cell")),
        }
    }

    fn pop_value(&mut self) -> Result<Value, CinderError> {
        let slot = self.pop_slot()?;
        self.slot_value(slot)
    }

    fn pop_values(&mut self, count: usize) -> Result<Vec<Value>, CinderError> {
        if self.stack.len() < count {
            return Err(self.vm_error("stack underflow"));
        }
        let slots = self.stack.split_off(self.stack.len() - count);
        slots.into_iter().map(|slot| self.slot_value(slot)).collect()
    }

    fn pop_code(&mut self) -> Result<Arc<CodeObject>, CinderError> {
        match self.pop_value()? {
            Value::Code(code) => Ok(code),
            other => Err(self.vm_error(&format!(
                "expected a code object, found {}",
                other.type_name()
            ))),
        }
    }

    fn cell(&self, idx: u32) -> Result<Cell, CinderError> {
        self.cells
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| self.vm_error("invalid cell index"))
    }

    fn local_name(&self, idx: u32) -> &str {
        self.code
            .varnames
            .get(idx as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }

    fn cell_name(&self, idx: u32) -> &str {
        let idx = idx as usize;
        let free = self.code.freevars.len();
        let name = if idx < free {
            self.code.freevars.get(idx)
        } else {
            self.code.cellvars.get(idx - free)
        };
        name.map(String::as_str).unwrap_or("?")
    }

    fn vm_error(&self, msg: &str) -> CinderError {
        CinderError::runtime(msg.to_string())
    }
}
