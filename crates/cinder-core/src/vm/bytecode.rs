use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::ast::Value;

static NEXT_LABEL: AtomicU32 = AtomicU32::new(0);

/// Jump target inside a fragment, resolved to an offset at assembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    pub fn fresh() -> Label {
        Label(NEXT_LABEL.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    NotEq,
    Gt,
    Ge,
    Is,
    IsNot,
    ExceptionMatch,
}

impl CompareOp {
    pub fn from_name(name: &str) -> Option<CompareOp> {
        Some(match name {
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            "==" => CompareOp::Eq,
            "!=" => CompareOp::NotEq,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            "is" => CompareOp::Is,
            "is not" => CompareOp::IsNot,
            "exception match" => CompareOp::ExceptionMatch,
            _ => return None,
        })
    }
}

/// How a deferred global reference is lowered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PtrMode {
    /// Inline non-dynamic values; read dynamic vars directly.
    #[default]
    Direct,
    /// Always go through the var's `deref` method. Only dynamic vars qualify.
    Deref,
}

/// Unresolved reference to `ns/name`, lowered by the finishing pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeferredPtr {
    pub ns: String,
    pub name: String,
}

/// Symbolic instruction. Fragments are `Vec<Instruction>` and compose by
/// concatenation; names and labels are resolved by the assembler.
#[derive(Clone, Debug)]
pub enum Instruction {
    SetLineno(u32),
    Label(Label),
    LoadConst(Value),
    LoadFast(String),
    StoreFast(String),
    /// Reads a closure cell.
    LoadDeref(String),
    /// Writes into the existing closure cell.
    StoreDeref(String),
    /// Pops a value into a freshly allocated cell bound to the name.
    StoreCell(String),
    /// Pushes the cell itself, for closure construction.
    LoadClosure(String),
    LoadAttr(String),
    /// Pops a var, pushes its current value.
    DerefVar,
    BuildTuple(usize),
    MakeFunction,
    MakeClosure,
    CallFunction(usize),
    /// Like `CallFunction`, with a trailing seq spread into arguments.
    CallFunctionVar(usize),
    PopTop,
    DupTop,
    RotTwo,
    Jump(Label),
    PopJumpIfFalse(Label),
    CompareOp(CompareOp),
    SetupExcept(Label),
    SetupFinally(Label),
    PopBlock,
    EndFinally,
    Raise,
    ReturnValue,
    BinarySubscr,
    /// `TOS1[TOS:]`, as a list or nil when nothing remains.
    Slice1,
    Deferred(DeferredPtr),
}

pub type Fragment = Vec<Instruction>;

impl Instruction {
    /// Stack effect as (pops, pushes) for the opcodes reachable through the
    /// raw bytecode escape.
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Instruction::LoadConst(_) | Instruction::LoadFast(_) => (0, 1),
            Instruction::StoreFast(_) | Instruction::PopTop | Instruction::Raise => (1, 0),
            Instruction::LoadAttr(_) | Instruction::DerefVar => (1, 1),
            Instruction::DupTop => (1, 2),
            Instruction::RotTwo => (2, 2),
            Instruction::CallFunction(n) => (n + 1, 1),
            Instruction::CompareOp(_) | Instruction::BinarySubscr | Instruction::Slice1 => (2, 1),
            Instruction::ReturnValue => (1, 0),
            _ => (0, 0),
        }
    }
}

/// Assembled instruction; operands index the owning [`CodeObject`]'s tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    LoadConst(u32),
    LoadFast(u32),
    StoreFast(u32),
    LoadDeref(u32),
    StoreDeref(u32),
    StoreCell(u32),
    LoadClosure(u32),
    LoadAttr(u32),
    DerefVar,
    BuildTuple(u32),
    MakeFunction,
    MakeClosure,
    CallFunction(u32),
    CallFunctionVar(u32),
    PopTop,
    DupTop,
    RotTwo,
    Jump(u32),
    PopJumpIfFalse(u32),
    CompareOp(CompareOp),
    SetupExcept(u32),
    SetupFinally(u32),
    PopBlock,
    EndFinally,
    Raise,
    ReturnValue,
    BinarySubscr,
    Slice1,
}

/// Executable unit produced by the assembler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    pub filename: String,
    pub first_line: u32,
    /// Declared parameters, rest parameter included.
    pub argcount: usize,
    pub varargs: bool,
    /// Parameters first, then every other local.
    pub varnames: Vec<String>,
    /// Cells received from the enclosing closure, in capture order.
    pub freevars: Vec<String>,
    /// Cells owned by this frame.
    pub cellvars: Vec<String>,
    pub names: Vec<String>,
    #[serde(with = "crate::vm::module::const_pool")]
    pub consts: Vec<Value>,
    pub ops: Vec<Op>,
    /// `(offset, line)` pairs in offset order.
    pub lines: Vec<(u32, u32)>,
}

impl CodeObject {
    pub fn line_for(&self, pc: usize) -> Option<u32> {
        self.lines
            .iter()
            .take_while(|(offset, _)| *offset as usize <= pc)
            .last()
            .map(|(_, line)| *line)
    }

    pub fn cell_count(&self) -> usize {
        self.freevars.len() + self.cellvars.len()
    }
}
