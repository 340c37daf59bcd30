use crate::ast::Value;
use crate::error::CompileError;
use crate::options::CompileOptions;
use crate::symbols::Symbol;
use crate::vm::bytecode::{CompareOp, Fragment, Instruction};

use super::{into_compile_error, Compiler};

pub(super) const BYTECODE_NS: &str = "bytecode";

/// Operand taken by an opcode of the raw escape.
enum Operand {
    None,
    Const,
    Name,
    Count,
    Compare,
}

fn operand_of(op: &str) -> Option<Operand> {
    Some(match op {
        "LOAD_CONST" => Operand::Const,
        "LOAD_FAST" | "STORE_FAST" | "LOAD_ATTR" => Operand::Name,
        "CALL_FUNCTION" => Operand::Count,
        "COMPARE_OP" => Operand::Compare,
        "POP_TOP" | "DUP_TOP" | "ROT_TWO" | "BINARY_SUBSCR" | "RAISE" | "RETURN_VALUE" => {
            Operand::None
        }
        _ => return None,
    })
}

fn name_operand(op: &str, value: &Value) -> Result<String, CompileError> {
    match value {
        Value::Symbol(sym) => Ok(sym.to_string()),
        Value::Str(text) => Ok(text.clone()),
        other => Err(CompileError::new(format!(
            "{} expects a name, got {}",
            op,
            other.type_name()
        ))),
    }
}

impl Compiler {
    /// `(bytecode/OPNAME operand? forms...)`: compiles `forms`, then emits the
    /// opcode itself. The forms must leave exactly the values it pops. The
    /// form's value is whatever the opcode leaves on top; a second pushed
    /// value underneath is dropped.
    pub(super) fn compile_bytecode(&mut self, head: &Symbol, items: &[Value]) -> Result<Fragment, CompileError> {
        let op = head.name();
        let operand = operand_of(op)
            .ok_or_else(|| CompileError::new(format!("unknown bytecode {}", op)))?;
        let mut args = &items[1..];
        let mut take_operand = || {
            let (first, rest) = args
                .split_first()
                .ok_or_else(|| CompileError::new(format!("{} requires an operand", op)))?;
            args = rest;
            Ok::<Value, CompileError>(first.clone())
        };
        let instruction = match operand {
            Operand::None => match op {
                "POP_TOP" => Instruction::PopTop,
                "DUP_TOP" => Instruction::DupTop,
                "ROT_TWO" => Instruction::RotTwo,
                "BINARY_SUBSCR" => Instruction::BinarySubscr,
                "RAISE" => Instruction::Raise,
                _ => Instruction::ReturnValue,
            },
            Operand::Const => {
                let form = take_operand()?;
                Instruction::LoadConst(self.eval_operand(&form)?)
            }
            Operand::Name => {
                let name = name_operand(op, &take_operand()?)?;
                match op {
                    "LOAD_FAST" => Instruction::LoadFast(name),
                    "STORE_FAST" => Instruction::StoreFast(name),
                    _ => Instruction::LoadAttr(name),
                }
            }
            Operand::Count => match take_operand()? {
                Value::Int(n) if n >= 0 => Instruction::CallFunction(
                    usize::try_from(n)
                        .map_err(|_| CompileError::new(format!("{} count {} is too large", op, n)))?,
                ),
                other => {
                    return Err(CompileError::new(format!(
                        "{} expects a non-negative count, got {}",
                        op,
                        other.type_name()
                    )))
                }
            },
            Operand::Compare => {
                let name = name_operand(op, &take_operand()?)?;
                let cmp = CompareOp::from_name(&name)
                    .ok_or_else(|| CompileError::new(format!("unknown comparison {}", name)))?;
                Instruction::CompareOp(cmp)
            }
        };
        let (pops, pushes) = instruction.stack_effect();
        if args.len() != pops || pushes > 2 {
            return Err(CompileError::new(format!("literal bytecode {} not supported", op)));
        }
        let mut out = Vec::new();
        for form in args {
            out.extend(self.compile(form)?);
        }
        out.push(instruction);
        match pushes {
            0 => out.push(Instruction::LoadConst(Value::Nil)),
            2 => out.extend([Instruction::RotTwo, Instruction::PopTop]),
            _ => {}
        }
        Ok(out)
    }

    /// Evaluates a `LOAD_CONST` operand now, in the current namespace.
    fn eval_operand(&self, form: &Value) -> Result<Value, CompileError> {
        let mut nested = Compiler::with_options(CompileOptions {
            default_ns: self.ns.name().to_string(),
            ..self.options.clone()
        });
        nested.eval(form).map_err(into_compile_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> Compiler {
        Compiler::with_options(CompileOptions {
            default_ns: "bytecode-test".to_string(),
            ..CompileOptions::default()
        })
    }

    fn op(name: &str, args: Vec<Value>) -> Value {
        let mut items = vec![Value::Symbol(Symbol::new(Some(BYTECODE_NS), name))];
        items.extend(args);
        Value::list(items)
    }

    #[test]
    fn load_const_operand_is_evaluated_at_compile_time() {
        let mut c = compiler();
        let form = op(
            "LOAD_CONST",
            vec![Value::list(vec![Value::symbol("+"), Value::Int(1), Value::Int(2)])],
        );
        let fragment = c.compile(&form).expect("compile");
        assert!(matches!(fragment.as_slice(), [Instruction::LoadConst(Value::Int(3))]));
    }

    #[test]
    fn compare_op_consumes_two_forms() {
        let mut c = compiler();
        let form = op(
            "COMPARE_OP",
            vec![Value::string("<"), Value::Int(1), Value::Int(2)],
        );
        assert_eq!(c.eval(&form).expect("eval"), Value::Bool(true));
    }

    #[test]
    fn popping_op_needs_matching_forms() {
        let mut c = compiler();
        let err = c
            .compile(&op("BINARY_SUBSCR", vec![Value::Int(1)]))
            .expect_err("one form for two pops");
        assert_eq!(err.message, "literal bytecode BINARY_SUBSCR not supported");
        assert!(c.compile(&op("DUP_TOP", vec![])).is_err());
        assert!(c.compile(&op("ROT_TWO", vec![Value::Int(1)])).is_err());
    }

    #[test]
    fn dup_top_yields_its_operand() {
        let mut c = compiler();
        let fragment = c
            .compile(&op("DUP_TOP", vec![Value::Int(4)]))
            .expect("compile");
        assert!(matches!(
            fragment.as_slice(),
            [
                Instruction::LoadConst(Value::Int(4)),
                Instruction::DupTop,
                Instruction::RotTwo,
                Instruction::PopTop
            ]
        ));
        assert_eq!(c.eval(&op("DUP_TOP", vec![Value::Int(4)])).expect("eval"), Value::Int(4));
    }

    #[test]
    fn rot_two_leaves_the_first_form_on_top() {
        let mut c = compiler();
        let form = op("ROT_TWO", vec![Value::keyword("first"), Value::keyword("second")]);
        assert_eq!(c.eval(&form).expect("eval"), Value::keyword("first"));
    }

    #[test]
    fn popping_op_without_result_loads_nil() {
        let mut c = compiler();
        let fragment = c
            .compile(&op("POP_TOP", vec![Value::Int(1)]))
            .expect("compile");
        assert!(matches!(fragment.last(), Some(Instruction::LoadConst(Value::Nil))));
    }
}
