use crate::ast::Value;
use crate::error::CompileError;
use crate::symbols::Symbol;
use crate::vm::bytecode::{CompareOp, Fragment, Instruction, Label};

use super::alias::Alias;
use super::special_forms::{list_items, local_name};
use super::Compiler;

struct CatchClause {
    ty: Symbol,
    binding: Symbol,
    handler: Value,
}

#[derive(Default)]
struct TryParts {
    body: Vec<Value>,
    catches: Vec<CatchClause>,
    finally: Option<Vec<Value>>,
    otherwise: Option<Vec<Value>>,
}

fn clause_head(form: &Value) -> Option<(String, Vec<Value>)> {
    let items = list_items(form)?;
    match items.first() {
        Some(Value::Symbol(sym)) if sym.ns().is_none() => match sym.name() {
            "catch" | "finally" | "else" => Some((sym.name().to_string(), items)),
            _ => None,
        },
        _ => None,
    }
}

fn parse_try(items: &[Value]) -> Result<TryParts, CompileError> {
    let mut parts = TryParts::default();
    let mut in_clauses = false;
    for form in &items[1..] {
        let Some((kind, clause)) = clause_head(form) else {
            if in_clauses {
                return Err(CompileError::new(
                    "try body forms must come before catch, finally and else clauses",
                ));
            }
            parts.body.push(form.clone());
            continue;
        };
        in_clauses = true;
        match kind.as_str() {
            "catch" => {
                if clause.len() != 4 {
                    return Err(CompileError::new("catch takes a type, a name and one handler form"));
                }
                let Value::Symbol(ty) = &clause[1] else {
                    return Err(CompileError::new("catch type must be a symbol"));
                };
                if parts.catches.iter().any(|c| c.ty == *ty) {
                    return Err(CompileError::new(format!(
                        "duplicate catch clause for {}",
                        ty
                    )));
                }
                parts.catches.push(CatchClause {
                    ty: ty.clone(),
                    binding: local_name("catch", &clause[2])?,
                    handler: clause[3].clone(),
                });
            }
            "finally" => {
                if parts.finally.replace(clause[1..].to_vec()).is_some() {
                    return Err(CompileError::new("try accepts only one finally clause"));
                }
            }
            _ => {
                if parts.otherwise.replace(clause[1..].to_vec()).is_some() {
                    return Err(CompileError::new("try accepts only one else clause"));
                }
            }
        }
    }
    if parts.otherwise.is_some() && parts.catches.is_empty() {
        return Err(CompileError::new("try with else requires at least one catch clause"));
    }
    Ok(parts)
}

impl Compiler {
    /// `(try body... (catch T e handler)... (else form...)? (finally form...)?)`
    ///
    /// The result is kept in a temporary local so `finally` cannot change it.
    /// Catches run in declaration order; an unmatched exception is re-raised,
    /// and an exception raised by `finally` replaces whatever was in flight.
    pub(super) fn compile_try(&mut self, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
        let parts = parse_try(items)?;
        self.try_depth += 1;
        let result = self.compile_try_parts(&parts);
        self.try_depth -= 1;
        result
    }

    fn compile_try_parts(&mut self, parts: &TryParts) -> Result<Fragment, CompileError> {
        if parts.catches.is_empty() && parts.finally.is_none() {
            return self.compile_body(&parts.body);
        }
        let ret = format!("__ret_val_{}", self.fresh_id());
        let inner = if parts.catches.is_empty() {
            let mut out = self.compile_body(&parts.body)?;
            out.push(Instruction::StoreFast(ret.clone()));
            out
        } else {
            self.compile_catches(parts, &ret)?
        };
        let Some(finally) = &parts.finally else {
            let mut out = inner;
            out.push(Instruction::LoadFast(ret));
            return Ok(out);
        };
        let handler = Label::fresh();
        let mut out = vec![Instruction::SetupFinally(handler)];
        out.extend(inner);
        out.push(Instruction::PopBlock);
        out.push(Instruction::LoadConst(Value::Nil));
        out.push(Instruction::Label(handler));
        out.extend(self.compile_body(finally)?);
        out.push(Instruction::PopTop);
        out.push(Instruction::EndFinally);
        out.push(Instruction::LoadFast(ret));
        Ok(out)
    }

    /// Leaves the stack as it found it, with the outcome stored in `ret`.
    fn compile_catches(&mut self, parts: &TryParts, ret: &str) -> Result<Fragment, CompileError> {
        let dispatch = Label::fresh();
        let end = Label::fresh();
        let mut out = vec![Instruction::SetupExcept(dispatch)];
        out.extend(self.compile_body(&parts.body)?);
        out.push(Instruction::StoreFast(ret.to_string()));
        out.push(Instruction::PopBlock);
        if let Some(otherwise) = &parts.otherwise {
            out.extend(self.compile_body(otherwise)?);
            out.push(Instruction::StoreFast(ret.to_string()));
        }
        out.push(Instruction::Jump(end));
        out.push(Instruction::Label(dispatch));
        for clause in &parts.catches {
            let next = Label::fresh();
            out.push(Instruction::DupTop);
            out.extend(self.compile_symbol(&clause.ty)?);
            out.push(Instruction::CompareOp(CompareOp::ExceptionMatch));
            out.push(Instruction::PopJumpIfFalse(next));
            let handler = self.scoped(|c, pushed| {
                let id = c.fresh_id();
                let alias = Alias::RenamedLocal(format!("{}_{}", clause.binding.name(), id));
                let mut handler = c.compile_set(&alias)?;
                c.push_alias(clause.binding.name(), alias);
                pushed.push(clause.binding.name().to_string());
                handler.extend(c.compile(&clause.handler)?);
                Ok(handler)
            })?;
            out.extend(handler);
            out.push(Instruction::StoreFast(ret.to_string()));
            out.push(Instruction::Jump(end));
            out.push(Instruction::Label(next));
        }
        out.push(Instruction::EndFinally);
        out.push(Instruction::Label(end));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Value {
        Value::symbol(name)
    }

    fn clause(items: Vec<Value>) -> Value {
        Value::list(items)
    }

    #[test]
    fn duplicate_catch_types_are_rejected() {
        let items = vec![
            sym("try"),
            Value::Int(1),
            clause(vec![sym("catch"), sym("Exception"), sym("e"), Value::Nil]),
            clause(vec![sym("catch"), sym("Exception"), sym("f"), Value::Nil]),
        ];
        let err = parse_try(&items).err().expect("duplicate");
        assert!(err.message.starts_with("duplicate catch clause"));
    }

    #[test]
    fn else_requires_a_catch() {
        let items = vec![
            sym("try"),
            Value::Int(1),
            clause(vec![sym("else"), Value::Int(2)]),
            clause(vec![sym("finally"), Value::Int(3)]),
        ];
        assert!(parse_try(&items).is_err());
    }

    #[test]
    fn body_after_clause_is_rejected() {
        let items = vec![
            sym("try"),
            clause(vec![sym("finally"), Value::Int(3)]),
            Value::Int(1),
        ];
        assert!(parse_try(&items).is_err());
    }

    #[test]
    fn clauses_split_from_body() {
        let items = vec![
            sym("try"),
            Value::Int(1),
            Value::Int(2),
            clause(vec![sym("catch"), sym("Exception"), sym("e"), sym("e")]),
            clause(vec![sym("finally"), Value::Nil]),
        ];
        let parts = parse_try(&items).expect("parse");
        assert_eq!(parts.body.len(), 2);
        assert_eq!(parts.catches.len(), 1);
        assert!(parts.finally.is_some());
    }
}
