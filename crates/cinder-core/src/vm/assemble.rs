use std::collections::HashMap;

use crate::error::CompileError;
use crate::vm::bytecode::{CodeObject, Instruction, Label, Op};

/// Signature and naming details for a code object under assembly.
#[derive(Clone, Debug, Default)]
pub struct CodeSpec {
    pub name: String,
    pub filename: String,
    pub first_line: u32,
    pub argnames: Vec<String>,
    pub varargs: bool,
    pub freevars: Vec<String>,
}

struct Tables {
    varnames: Vec<String>,
    cells: Vec<String>,
    freevar_count: usize,
    names: Vec<String>,
}

impl Tables {
    fn index_of(list: &mut Vec<String>, name: &str) -> u32 {
        match list.iter().position(|n| n == name) {
            Some(idx) => idx as u32,
            None => {
                list.push(name.to_string());
                (list.len() - 1) as u32
            }
        }
    }

    fn local(&mut self, name: &str) -> u32 {
        Self::index_of(&mut self.varnames, name)
    }

    fn cell(&mut self, name: &str) -> u32 {
        Self::index_of(&mut self.cells, name)
    }

    fn name(&mut self, name: &str) -> u32 {
        Self::index_of(&mut self.names, name)
    }
}

/// Lowers a resolved fragment to a [`CodeObject`]: labels become offsets,
/// names become table indices, and line markers become the line table.
pub fn assemble(fragment: &[Instruction], spec: CodeSpec) -> Result<CodeObject, CompileError> {
    let mut targets: HashMap<Label, u32> = HashMap::new();
    let mut pc = 0u32;
    for instr in fragment {
        match instr {
            Instruction::Label(label) => {
                targets.insert(*label, pc);
            }
            Instruction::SetLineno(_) => {}
            _ => pc += 1,
        }
    }
    let target = |label: &Label| {
        targets
            .get(label)
            .copied()
            .ok_or_else(|| CompileError::new(format!("jump to undefined label {:?}", label)))
    };

    let mut tables = Tables {
        varnames: spec.argnames.clone(),
        cells: spec.freevars.clone(),
        freevar_count: spec.freevars.len(),
        names: Vec::new(),
    };
    let mut consts = Vec::new();
    let mut ops = Vec::with_capacity(pc as usize);
    let mut lines: Vec<(u32, u32)> = Vec::new();

    for instr in fragment {
        let op = match instr {
            Instruction::Label(_) => continue,
            Instruction::SetLineno(line) => {
                let offset = ops.len() as u32;
                match lines.last_mut() {
                    Some(last) if last.0 == offset => last.1 = *line,
                    _ => lines.push((offset, *line)),
                }
                continue;
            }
            Instruction::LoadConst(value) => {
                consts.push(value.clone());
                Op::LoadConst((consts.len() - 1) as u32)
            }
            Instruction::LoadFast(name) => Op::LoadFast(tables.local(name)),
            Instruction::StoreFast(name) => Op::StoreFast(tables.local(name)),
            Instruction::LoadDeref(name) => Op::LoadDeref(tables.cell(name)),
            Instruction::StoreDeref(name) => Op::StoreDeref(tables.cell(name)),
            Instruction::StoreCell(name) => Op::StoreCell(tables.cell(name)),
            Instruction::LoadClosure(name) => Op::LoadClosure(tables.cell(name)),
            Instruction::LoadAttr(name) => Op::LoadAttr(tables.name(name)),
            Instruction::DerefVar => Op::DerefVar,
            Instruction::BuildTuple(n) => Op::BuildTuple(*n as u32),
            Instruction::MakeFunction => Op::MakeFunction,
            Instruction::MakeClosure => Op::MakeClosure,
            Instruction::CallFunction(n) => Op::CallFunction(*n as u32),
            Instruction::CallFunctionVar(n) => Op::CallFunctionVar(*n as u32),
            Instruction::PopTop => Op::PopTop,
            Instruction::DupTop => Op::DupTop,
            Instruction::RotTwo => Op::RotTwo,
            Instruction::Jump(label) => Op::Jump(target(label)?),
            Instruction::PopJumpIfFalse(label) => Op::PopJumpIfFalse(target(label)?),
            Instruction::CompareOp(cmp) => Op::CompareOp(*cmp),
            Instruction::SetupExcept(label) => Op::SetupExcept(target(label)?),
            Instruction::SetupFinally(label) => Op::SetupFinally(target(label)?),
            Instruction::PopBlock => Op::PopBlock,
            Instruction::EndFinally => Op::EndFinally,
            Instruction::Raise => Op::Raise,
            Instruction::ReturnValue => Op::ReturnValue,
            Instruction::BinarySubscr => Op::BinarySubscr,
            Instruction::Slice1 => Op::Slice1,
            Instruction::Deferred(ptr) => {
                return Err(CompileError::new(format!(
                    "unresolved reference to {}/{} reached the assembler",
                    ptr.ns, ptr.name
                )))
            }
        };
        ops.push(op);
    }

    let cellvars = tables.cells.split_off(tables.freevar_count);
    Ok(CodeObject {
        name: spec.name,
        filename: spec.filename,
        first_line: spec.first_line,
        argcount: spec.argnames.len(),
        varargs: spec.varargs,
        varnames: tables.varnames,
        freevars: tables.cells,
        cellvars,
        names: tables.names,
        consts,
        ops,
        lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Value;

    #[test]
    fn labels_resolve_to_offsets_without_markers() {
        let skip = Label::fresh();
        let fragment = vec![
            Instruction::SetLineno(3),
            Instruction::LoadConst(Value::Bool(true)),
            Instruction::PopJumpIfFalse(skip),
            Instruction::LoadConst(Value::Int(1)),
            Instruction::ReturnValue,
            Instruction::Label(skip),
            Instruction::SetLineno(4),
            Instruction::LoadConst(Value::Int(2)),
            Instruction::ReturnValue,
        ];
        let code = assemble(&fragment, CodeSpec::default()).expect("assemble");
        assert_eq!(code.ops[1], Op::PopJumpIfFalse(4));
        assert_eq!(code.lines, vec![(0, 3), (4, 4)]);
        assert_eq!(code.line_for(5), Some(4));
    }

    #[test]
    fn locals_follow_arguments_and_cells_follow_freevars() {
        let fragment = vec![
            Instruction::LoadFast("tmp".into()),
            Instruction::LoadFast("a".into()),
            Instruction::LoadDeref("outer".into()),
            Instruction::StoreCell("fresh".into()),
        ];
        let spec = CodeSpec {
            argnames: vec!["a".into()],
            freevars: vec!["outer".into()],
            ..CodeSpec::default()
        };
        let code = assemble(&fragment, spec).expect("assemble");
        assert_eq!(code.varnames, vec!["a".to_string(), "tmp".to_string()]);
        assert_eq!(code.freevars, vec!["outer".to_string()]);
        assert_eq!(code.cellvars, vec!["fresh".to_string()]);
        assert_eq!(code.ops[3], Op::StoreCell(1));
    }

    #[test]
    fn unresolved_pointer_is_rejected() {
        let fragment = vec![Instruction::Deferred(crate::vm::bytecode::DeferredPtr {
            ns: "user".into(),
            name: "x".into(),
        })];
        assert!(assemble(&fragment, CodeSpec::default()).is_err());
    }
}
