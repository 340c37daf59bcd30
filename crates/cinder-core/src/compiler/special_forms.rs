use tracing::trace;

use crate::ast::Value;
use crate::collections;
use crate::error::CompileError;
use crate::namespaces::intern_variable;
use crate::symbols::Symbol;
use crate::vm::bytecode::{CompareOp, Fragment, Instruction, Label};

use super::alias::{Alias, RecurPoint};
use super::Compiler;

pub(super) type SpecialForm = fn(&mut Compiler, &Value, &[Value]) -> Result<Fragment, CompileError>;

pub(super) fn lookup(name: &str) -> Option<SpecialForm> {
    let special: SpecialForm = match name {
        "def" => compile_def,
        "if*" | "if" => compile_if,
        "let*" => compile_let,
        "loop*" => compile_loop,
        "fn*" => Compiler::compile_fn,
        "do" => compile_do,
        "quote" => compile_quote,
        "try" => Compiler::compile_try,
        "recur" => compile_recur,
        "." => compile_dot,
        "throw" => compile_throw,
        "is?" => compile_is,
        "var" => compile_var,
        "in-ns" => compile_in_ns,
        "let-macro" => compile_let_macro,
        "applyTo" => compile_apply_to,
        _ => return None,
    };
    Some(special)
}

pub(super) fn is_special(name: &str) -> bool {
    lookup(name).is_some()
}

fn expect_len(
    construct: &str,
    items: &[Value],
    range: std::ops::RangeInclusive<usize>,
) -> Result<(), CompileError> {
    if range.contains(&items.len()) {
        Ok(())
    } else {
        Err(CompileError::new(format!(
            "{} takes {} arguments, got {}",
            construct,
            describe_args(&range),
            items.len() - 1
        )))
    }
}

fn describe_args(range: &std::ops::RangeInclusive<usize>) -> String {
    let (lo, hi) = (range.start() - 1, range.end() - 1);
    if lo == hi {
        lo.to_string()
    } else {
        format!("{} to {}", lo, hi)
    }
}

pub(super) fn local_name(construct: &str, value: &Value) -> Result<Symbol, CompileError> {
    match value {
        Value::Symbol(sym) if sym.ns().is_none() => Ok(sym.clone()),
        Value::Symbol(sym) => Err(CompileError::new(format!(
            "{} binding names must not be namespace qualified, got {}",
            construct, sym
        ))),
        other => Err(CompileError::new(format!(
            "{} binding names must be symbols, got {}",
            construct,
            other.type_name()
        ))),
    }
}

fn compile_def(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    expect_len("def", items, 2..=3)?;
    let Value::Symbol(name) = &items[1] else {
        return Err(CompileError::new("def requires a symbol name"));
    };
    if let Some(ns) = name.ns() {
        if ns != c.ns.name() {
            return Err(CompileError::new(format!(
                "can't def {} outside of the current namespace {}",
                name,
                c.ns.name()
            )));
        }
    }
    let var = intern_variable(&c.ns, &name.without_ns());
    var.set_dynamic(true);
    if let Some(meta) = name.meta() {
        let merged = meta
            .iter()
            .fold(var.meta().unwrap_or_default(), |acc, (k, v)| {
                acc.assoc(k.clone(), v.clone())
            });
        var.set_meta(Some(merged));
    }
    trace!(var = %var, "def");
    let mut out = vec![Instruction::LoadConst(Value::Var(var.clone()))];
    let Some(value) = items.get(2) else {
        return Ok(out);
    };
    out.push(Instruction::LoadAttr("bindRoot".to_string()));
    let short = name.name().to_string();
    c.push_alias(&short, Alias::SelfReference(var));
    c.names.push(short.clone());
    let compiled = c.compile(value);
    c.names.pop();
    c.pop_alias(&short);
    out.extend(compiled?);
    out.push(Instruction::CallFunction(1));
    Ok(out)
}

fn compile_if(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    expect_len("if", items, 3..=4)?;
    let else_label = Label::fresh();
    let end_label = Label::fresh();
    let mut out = c.compile(&items[1])?;
    out.push(Instruction::PopJumpIfFalse(else_label));
    out.extend(c.compile(&items[2])?);
    out.push(Instruction::Jump(end_label));
    out.push(Instruction::Label(else_label));
    match items.get(3) {
        Some(otherwise) => out.extend(c.compile(otherwise)?),
        None => out.push(Instruction::LoadConst(Value::Nil)),
    }
    out.push(Instruction::Label(end_label));
    Ok(out)
}

fn compile_do(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    c.compile_body(&items[1..])
}

fn compile_quote(_c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    expect_len("quote", items, 2..=2)?;
    Ok(vec![Instruction::LoadConst(items[1].clone())])
}

/// Validated `[name value ...]` pairs of a binding vector.
fn binding_pairs(construct: &str, value: Option<&Value>) -> Result<Vec<(Symbol, Value)>, CompileError> {
    let Some(Value::Vector(bindings)) = value else {
        return Err(CompileError::new(format!("{} requires a binding vector", construct)));
    };
    if bindings.count() % 2 != 0 {
        return Err(CompileError::new(format!(
            "{} requires an even number of forms in binding vector",
            construct
        )));
    }
    let items = bindings.to_vec();
    items
        .chunks(2)
        .map(|pair| Ok((local_name(construct, &pair[0])?, pair[1].clone())))
        .collect()
}

/// Binds each pair in turn, so later values see earlier names.
fn compile_bindings(
    c: &mut Compiler,
    pairs: &[(Symbol, Value)],
    pushed: &mut Vec<String>,
) -> Result<(Fragment, Vec<Alias>), CompileError> {
    let mut out = Vec::new();
    let mut targets = Vec::with_capacity(pairs.len());
    for (name, value) in pairs {
        out.extend(c.compile(value)?);
        let id = c.fresh_id();
        let alias = Alias::RenamedLocal(format!("{}_{}", name.name(), id));
        out.extend(c.compile_set(&alias)?);
        c.push_alias(name.name(), alias.clone());
        pushed.push(name.name().to_string());
        targets.push(alias);
    }
    Ok((out, targets))
}

fn compile_let(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    let pairs = binding_pairs("let*", items.get(1))?;
    c.scoped(|c, pushed| {
        let (mut out, _) = compile_bindings(c, &pairs, pushed)?;
        out.extend(c.compile_body(&items[2..])?);
        Ok(out)
    })
}

fn compile_loop(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    let pairs = binding_pairs("loop*", items.get(1))?;
    c.scoped(|c, pushed| {
        let (mut out, targets) = compile_bindings(c, &pairs, pushed)?;
        let label = Label::fresh();
        out.push(Instruction::Label(label));
        c.recur_points.push(RecurPoint {
            label,
            targets,
            try_depth: c.try_depth,
        });
        let body = c.compile_body(&items[2..]);
        c.recur_points.pop();
        out.extend(body?);
        Ok(out)
    })
}

fn compile_recur(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    let Some(point) = c.recur_points.last().cloned() else {
        return Err(CompileError::new("recur outside of loop or fn"));
    };
    if point.try_depth != c.try_depth {
        return Err(CompileError::new("Cannot recur across try"));
    }
    let args = &items[1..];
    if args.len() > point.targets.len() {
        return Err(CompileError::new(format!(
            "too many arguments to recur, expected at most {}, got {}",
            point.targets.len(),
            args.len()
        )));
    }
    let mut out = Vec::new();
    for arg in args {
        out.extend(c.compile(arg)?);
    }
    for target in point.targets[..args.len()].iter().rev() {
        out.extend(c.compile_set(target)?);
    }
    out.push(Instruction::Jump(point.label));
    Ok(out)
}

fn compile_dot(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    if items.len() < 3 {
        return Err(CompileError::new("dot form requires a target and a member"));
    }
    let (member, args): (Symbol, Vec<Value>) = match &items[2] {
        Value::Symbol(sym) => (sym.clone(), items[3..].to_vec()),
        Value::List(list) if !list.is_empty() && items.len() == 3 => {
            let parts = list.to_vec();
            let Value::Symbol(sym) = &parts[0] else {
                return Err(CompileError::new("dot form method must be a symbol"));
            };
            (sym.clone(), parts[1..].to_vec())
        }
        other => {
            return Err(CompileError::new(format!(
                "dot form member must be a symbol, got {}",
                other.type_name()
            )))
        }
    };
    let mut out = c.compile(&items[1])?;
    if let Some(field) = member.name().strip_prefix('-') {
        if !args.is_empty() {
            return Err(CompileError::new(format!(
                "field access .-{} takes no arguments",
                field
            )));
        }
        out.push(Instruction::LoadAttr(field.to_string()));
        return Ok(out);
    }
    out.push(Instruction::LoadAttr(member.name().to_string()));
    for arg in &args {
        out.extend(c.compile(arg)?);
    }
    out.push(Instruction::CallFunction(args.len()));
    Ok(out)
}

fn compile_throw(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    expect_len("throw", items, 2..=2)?;
    let mut out = c.compile(&items[1])?;
    out.push(Instruction::Raise);
    Ok(out)
}

fn compile_is(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    expect_len("is?", items, 3..=3)?;
    let mut out = c.compile(&items[1])?;
    out.extend(c.compile(&items[2])?);
    out.push(Instruction::CompareOp(CompareOp::Is));
    Ok(out)
}

fn compile_var(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    expect_len("var", items, 2..=2)?;
    let Value::Symbol(sym) = &items[1] else {
        return Err(CompileError::new("var requires a symbol"));
    };
    let var = c.resolve_var(sym)?;
    Ok(vec![Instruction::LoadConst(Value::Var(var))])
}

fn compile_in_ns(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    expect_len("in-ns", items, 2..=2)?;
    let name = match &items[1] {
        Value::Symbol(sym) => sym.clone(),
        Value::List(list) if list.count() == 2 => match list.to_vec().as_slice() {
            [Value::Symbol(quote), Value::Symbol(sym)] if quote.name() == "quote" => sym.clone(),
            _ => return Err(CompileError::new("in-ns requires a symbol")),
        },
        _ => return Err(CompileError::new("in-ns requires a symbol")),
    };
    c.set_ns(&name.to_string());
    Ok(vec![Instruction::LoadConst(Value::Symbol(name))])
}

fn compile_let_macro(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    let pairs = binding_pairs("let-macro", items.get(1))?;
    c.scoped(|c, pushed| {
        for (name, expansion) in &pairs {
            c.push_alias(name.name(), Alias::LocalMacro(expansion.clone()));
            pushed.push(name.name().to_string());
        }
        c.compile_body(&items[2..])
    })
}

fn compile_apply_to(c: &mut Compiler, _form: &Value, items: &[Value]) -> Result<Fragment, CompileError> {
    if items.len() < 3 {
        return Err(CompileError::new("applyTo requires a function and a seq"));
    }
    let mut out = Vec::new();
    for item in &items[1..] {
        out.extend(c.compile(item)?);
    }
    out.push(Instruction::CallFunctionVar(items.len() - 3));
    Ok(out)
}

/// Elements of a list-shaped form, or `None` for anything else.
pub(super) fn list_items(form: &Value) -> Option<Vec<Value>> {
    match form {
        Value::List(list) if !list.is_empty() => Some(list.to_vec()),
        Value::Seq(_) => collections::to_vec(form).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CompileOptions;

    fn compiler(ns: &str) -> Compiler {
        Compiler::with_options(CompileOptions {
            default_ns: ns.to_string(),
            ..CompileOptions::default()
        })
    }

    fn form(items: Vec<Value>) -> Value {
        Value::list(items)
    }

    fn sym(name: &str) -> Value {
        Value::symbol(name)
    }

    #[test]
    fn if_without_else_yields_nil() {
        let mut c = compiler("special-test.if");
        let result = c
            .eval(&form(vec![sym("if*"), Value::Bool(false), Value::Int(1)]))
            .expect("eval");
        assert_eq!(result, Value::Nil);
    }

    #[test]
    fn odd_binding_vector_is_rejected() {
        let mut c = compiler("special-test.let");
        let err = c
            .compile(&form(vec![
                sym("let*"),
                Value::vector(vec![sym("a")]),
                sym("a"),
            ]))
            .expect_err("odd bindings");
        assert!(err.message.contains("even number of forms"));
    }

    #[test]
    fn qualified_binding_names_are_rejected() {
        let mut c = compiler("special-test.qualified");
        let err = c
            .compile(&form(vec![
                sym("let*"),
                Value::vector(vec![sym("user/a"), Value::Int(1)]),
                Value::Nil,
            ]))
            .expect_err("qualified");
        assert!(err.message.contains("namespace qualified"));
    }

    #[test]
    fn recur_needs_a_target() {
        let mut c = compiler("special-test.recur");
        let err = c
            .compile(&form(vec![sym("recur"), Value::Int(1)]))
            .expect_err("no loop");
        assert_eq!(err.message, "recur outside of loop or fn");
    }

    #[test]
    fn quote_returns_form_unevaluated() {
        let mut c = compiler("special-test.quote");
        let quoted = form(vec![sym("no-such-fn"), Value::Int(1)]);
        let result = c
            .eval(&form(vec![sym("quote"), quoted.clone()]))
            .expect("eval");
        assert_eq!(result, quoted);
    }

    #[test]
    fn in_ns_switches_the_current_namespace() {
        let mut c = compiler("special-test.from");
        c.eval(&form(vec![sym("in-ns"), sym("special-test.to")]))
            .expect("eval");
        assert_eq!(c.ns().name(), "special-test.to");
    }

    #[test]
    fn arity_messages_count_arguments() {
        assert_eq!(describe_args(&(3..=4)), "2 to 3");
        assert_eq!(describe_args(&(2..=2)), "1");
    }
}
