use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::ast::Value;
use crate::error::CompileError;
use crate::rt::RT_NS;
use crate::symbols::Symbol;
use crate::vm::assemble::{assemble, CodeSpec};
use crate::vm::bytecode::{CodeObject, CompareOp, Fragment, Instruction, Label};

use super::alias::{Alias, CaptureScope, CaptureSource, ClosureAlias, RecurPoint};
use super::special_forms::local_name;
use super::{expand_deferred, runtime_value, Compiler};

/// Parameter slot that receives every argument of a multi-arity fn.
const ARGS_VECTOR: &str = "__argsv__";

struct Arity {
    params: Vec<Symbol>,
    rest: Option<Symbol>,
    body: Vec<Value>,
}

impl Arity {
    fn parse(params: &Value, body: &[Value]) -> Result<Arity, CompileError> {
        let Value::Vector(params) = params else {
            return Err(CompileError::new(format!(
                "fn* parameter list must be a vector, got {}",
                params.type_name()
            )));
        };
        let items = params.to_vec();
        let mut fixed = Vec::new();
        let mut rest = None;
        let mut iter = items.iter();
        while let Some(item) = iter.next() {
            let sym = local_name("fn*", item)?;
            if sym.name() != "&" {
                fixed.push(sym);
                continue;
            }
            let Some(rest_param) = iter.next() else {
                return Err(CompileError::new("& must be followed by a rest parameter"));
            };
            rest = Some(local_name("fn*", rest_param)?);
            if iter.next().is_some() {
                return Err(CompileError::new("only one parameter may follow &"));
            }
        }
        Ok(Arity {
            params: fixed,
            rest,
            body: body.to_vec(),
        })
    }

    fn fixed(&self) -> usize {
        self.params.len()
    }

    fn is_variadic(&self) -> bool {
        self.rest.is_some()
    }

    fn all_params(&self) -> impl Iterator<Item = &Symbol> {
        self.params.iter().chain(self.rest.iter())
    }
}

fn parse_arities(forms: &[Value]) -> Result<Vec<Arity>, CompileError> {
    match forms.first() {
        Some(Value::Vector(_)) => Ok(vec![Arity::parse(&forms[0], &forms[1..])?]),
        Some(_) => {
            let mut arities = forms
                .iter()
                .map(|form| match form {
                    Value::List(list) if !list.is_empty() => {
                        let parts = list.to_vec();
                        Arity::parse(&parts[0], &parts[1..])
                    }
                    other => Err(CompileError::new(format!(
                        "fn* overload must be a list of ([params] body...), got {}",
                        other.type_name()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            check_overloads(&mut arities)?;
            Ok(arities)
        }
        None => Err(CompileError::new("fn* requires a parameter vector")),
    }
}

/// Rejects ambiguous overload sets and orders the rest by fixed count,
/// fixed before variadic.
/// An argument index or count as an integer constant.
fn index_const(n: usize) -> Result<Value, CompileError> {
    i64::try_from(n)
        .map(Value::Int)
        .map_err(|_| CompileError::new(format!("argument index {} does not fit an integer", n)))
}

fn check_overloads(arities: &mut [Arity]) -> Result<(), CompileError> {
    let variadic: Vec<usize> = arities
        .iter()
        .filter(|arity| arity.is_variadic())
        .map(Arity::fixed)
        .collect();
    if variadic.len() > 1 {
        return Err(CompileError::new("Can't have more than 1 variadic overload"));
    }
    let mut seen = HashSet::new();
    for arity in arities.iter().filter(|arity| !arity.is_variadic()) {
        if !seen.insert(arity.fixed()) {
            return Err(CompileError::new("Can't have 2 overloads with same arity"));
        }
        if variadic.first().map_or(false, |&min| arity.fixed() > min) {
            return Err(CompileError::new(
                "Can't have fixed arity function with more params than variadic function",
            ));
        }
    }
    arities.sort_by_key(|arity| (arity.fixed(), arity.is_variadic()));
    Ok(())
}

/// Compiled body plus the signature it was compiled against.
struct FnBody {
    fragment: Fragment,
    argnames: Vec<String>,
    varargs: bool,
}

impl Compiler {
    pub(super) fn compile_fn(&mut self, form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
        let mut rest = &items[1..];
        let own_name = match rest.first() {
            Some(name @ Value::Symbol(_)) => {
                rest = &rest[1..];
                Some(local_name("fn*", name)?.with_meta(None))
            }
            _ => None,
        };
        let arities = parse_arities(rest)?;
        let id = self.fresh_id();
        let short = match &own_name {
            Some(name) => name.name().to_string(),
            None => format!(
                "{}_auto_{}",
                self.names.last().map(String::as_str).unwrap_or("fn"),
                id
            ),
        };
        let qualified = format!("{}/{}", self.ns.name(), short);
        debug!(name = %qualified, overloads = arities.len(), "compiling fn*");

        let scope = self.offer_captures(own_name.as_ref());
        for (sym, closure) in &scope.offered {
            self.push_alias(sym.name(), Alias::Closure(closure.clone()));
        }
        self.capture_scopes.push(scope);
        self.names.push(short);
        let saved_try_depth = std::mem::replace(&mut self.try_depth, 0);

        let body = if arities.len() == 1 {
            self.compile_single_arity(&arities[0], form.line())
        } else {
            self.compile_multi_arity(&arities, &qualified, form.line())
        };

        self.try_depth = saved_try_depth;
        self.names.pop();
        let (offered, used) = self.capture_scopes.pop().unwrap_or_default().into_used();
        for sym in offered.iter().rev() {
            self.pop_alias(sym.name());
        }
        let body = body?;

        let fragment = expand_deferred(body.fragment, self.options.deref_mode)?;
        let spec = CodeSpec {
            name: qualified,
            filename: self.options.filename.clone(),
            first_line: form.line().unwrap_or(0),
            argnames: body.argnames,
            varargs: body.varargs,
            freevars: used.iter().map(|capture| capture.cell.clone()).collect(),
        };
        let code = Arc::new(assemble(&fragment, spec)?);
        self.emit_closure(code, used)
    }

    /// Every visible runtime binding becomes a potential capture, plus the
    /// fn's own name when it has one.
    fn offer_captures(&mut self, own_name: Option<&Symbol>) -> CaptureScope {
        let mut names: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, stack)| stack.last().map_or(false, Alias::is_capturable))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        let mut scope = CaptureScope::default();
        for name in names {
            let Some(outer) = self.top_alias(&name).cloned() else {
                continue;
            };
            let id = self.fresh_id();
            scope.offered.push((
                Symbol::simple(&name),
                ClosureAlias {
                    id,
                    cell: format!("{}_{}", name, id),
                    source: CaptureSource::Outer(Box::new(outer)),
                },
            ));
        }
        if let Some(own) = own_name {
            let id = self.fresh_id();
            scope.offered.push((
                own.clone(),
                ClosureAlias {
                    id,
                    cell: format!("{}_{}", own.name(), id),
                    source: CaptureSource::OwnName,
                },
            ));
        }
        scope
    }

    fn bind_params(&mut self, arity: &Arity, pushed: &mut Vec<String>) -> Vec<Alias> {
        arity
            .all_params()
            .map(|param| {
                let alias = Alias::FnArgument(param.name().to_string());
                self.push_alias(param.name(), alias.clone());
                pushed.push(param.name().to_string());
                alias
            })
            .collect()
    }

    fn line_marker(&self, line: Option<u32>) -> Option<Instruction> {
        line.filter(|_| self.options.track_lines)
            .map(Instruction::SetLineno)
    }

    /// Body of `label: body; return`, with `recur` jumping back to `label`.
    fn compile_recur_body(&mut self, targets: Vec<Alias>, body: &[Value]) -> Result<Fragment, CompileError> {
        let label = Label::fresh();
        self.recur_points.push(RecurPoint {
            label,
            targets,
            try_depth: self.try_depth,
        });
        let compiled = self.compile_body(body);
        self.recur_points.pop();
        let mut out = vec![Instruction::Label(label)];
        out.extend(compiled?);
        out.push(Instruction::ReturnValue);
        Ok(out)
    }

    fn compile_single_arity(&mut self, arity: &Arity, line: Option<u32>) -> Result<FnBody, CompileError> {
        let marker = self.line_marker(line);
        self.scoped(|c, pushed| {
            let targets = c.bind_params(arity, pushed);
            let mut fragment: Fragment = marker.into_iter().collect();
            fragment.extend(c.compile_recur_body(targets, &arity.body)?);
            Ok(FnBody {
                fragment,
                argnames: arity.all_params().map(|p| p.name().to_string()).collect(),
                varargs: arity.is_variadic(),
            })
        })
    }

    /// Dispatches on the argument count at run time, trying overloads in
    /// ascending order and failing with an arity error when none match.
    fn compile_multi_arity(
        &mut self,
        arities: &[Arity],
        qualified: &str,
        line: Option<u32>,
    ) -> Result<FnBody, CompileError> {
        let count = runtime_value(RT_NS, "count")?;
        let throw_arity = runtime_value(RT_NS, "throw-arity")?;
        let mut fragment: Fragment = self.line_marker(line).into_iter().collect();
        for arity in arities {
            let next = Label::fresh();
            let fixed = index_const(arity.fixed())?;
            fragment.extend([
                Instruction::LoadConst(count.clone()),
                Instruction::LoadFast(ARGS_VECTOR.to_string()),
                Instruction::CallFunction(1),
                Instruction::LoadConst(fixed.clone()),
                Instruction::CompareOp(if arity.is_variadic() {
                    CompareOp::Ge
                } else {
                    CompareOp::Eq
                }),
                Instruction::PopJumpIfFalse(next),
            ]);
            for (idx, param) in arity.params.iter().enumerate() {
                fragment.extend([
                    Instruction::LoadFast(ARGS_VECTOR.to_string()),
                    Instruction::LoadConst(index_const(idx)?),
                    Instruction::BinarySubscr,
                    Instruction::StoreFast(param.name().to_string()),
                ]);
            }
            if let Some(rest) = &arity.rest {
                fragment.extend([
                    Instruction::LoadFast(ARGS_VECTOR.to_string()),
                    Instruction::LoadConst(fixed.clone()),
                    Instruction::Slice1,
                    Instruction::StoreFast(rest.name().to_string()),
                ]);
            }
            let body = self.scoped(|c, pushed| {
                let targets = c.bind_params(arity, pushed);
                c.compile_recur_body(targets, &arity.body)
            })?;
            fragment.extend(body);
            fragment.push(Instruction::Label(next));
        }
        fragment.extend([
            Instruction::LoadConst(throw_arity),
            Instruction::LoadConst(Value::string(qualified)),
            Instruction::LoadFast(ARGS_VECTOR.to_string()),
            Instruction::CallFunction(2),
            Instruction::ReturnValue,
        ]);
        Ok(FnBody {
            fragment,
            argnames: vec![ARGS_VECTOR.to_string()],
            varargs: true,
        })
    }

    /// Builds the function value in the enclosing frame. Each capture gets a
    /// fresh cell; the own-name cell is filled once the closure exists.
    fn emit_closure(&mut self, code: Arc<CodeObject>, captures: Vec<ClosureAlias>) -> Result<Fragment, CompileError> {
        if captures.is_empty() {
            return Ok(vec![Instruction::LoadConst(Value::Code(code)), Instruction::MakeFunction]);
        }
        let own_cell = captures
            .iter()
            .find(|capture| matches!(capture.source, CaptureSource::OwnName))
            .map(|capture| capture.cell.clone());
        let mut out = Vec::new();
        if let Some(cell) = &own_cell {
            out.push(Instruction::LoadConst(Value::Nil));
            out.push(Instruction::StoreCell(cell.clone()));
        }
        for capture in &captures {
            if let CaptureSource::Outer(outer) = &capture.source {
                out.extend(self.compile_alias(&capture.cell, (**outer).clone())?);
                out.push(Instruction::StoreCell(capture.cell.clone()));
            }
        }
        for capture in &captures {
            out.push(Instruction::LoadClosure(capture.cell.clone()));
        }
        out.push(Instruction::BuildTuple(captures.len()));
        out.push(Instruction::LoadConst(Value::Code(code)));
        out.push(Instruction::MakeClosure);
        if let Some(cell) = own_cell {
            out.push(Instruction::DupTop);
            out.push(Instruction::StoreDeref(cell));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arity(params: &[&str]) -> Arity {
        Arity::parse(
            &Value::vector(params.iter().map(|p| Value::symbol(p)).collect()),
            &[],
        )
        .expect("params")
    }

    #[test]
    fn rest_parameter_follows_ampersand() {
        let parsed = arity(&["a", "&", "more"]);
        assert_eq!(parsed.fixed(), 1);
        assert_eq!(parsed.rest.as_ref().map(Symbol::name), Some("more"));
    }

    #[test]
    fn overloads_are_sorted_fixed_before_variadic() {
        let mut overloads = vec![arity(&["a", "&", "r"]), arity(&["a", "b"]), arity(&["a"])];
        let err = check_overloads(&mut overloads).expect_err("fixed beyond variadic");
        assert!(err.message.starts_with("Can't have fixed arity"));

        let mut overloads = vec![arity(&["a", "b", "&", "r"]), arity(&["a", "b"]), arity(&[])];
        check_overloads(&mut overloads).expect("valid");
        let order: Vec<(usize, bool)> = overloads
            .iter()
            .map(|a| (a.fixed(), a.is_variadic()))
            .collect();
        assert_eq!(order, vec![(0, false), (2, false), (2, true)]);
    }

    #[test]
    fn duplicate_fixed_arity_is_rejected() {
        let mut overloads = vec![arity(&["a"]), arity(&["b"])];
        let err = check_overloads(&mut overloads).expect_err("duplicate");
        assert_eq!(err.message, "Can't have 2 overloads with same arity");
    }

    #[test]
    fn dangling_ampersand_is_rejected() {
        let params = Value::vector(vec![Value::symbol("a"), Value::symbol("&")]);
        assert!(Arity::parse(&params, &[]).is_err());
    }

    #[test]
    fn index_constants_are_range_checked() {
        assert_eq!(index_const(3).expect("small"), Value::Int(3));
        if usize::BITS >= 64 {
            assert!(index_const(usize::MAX).is_err());
        }
    }
}
