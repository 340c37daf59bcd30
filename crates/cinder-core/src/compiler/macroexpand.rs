use tracing::debug;

use crate::ast::Value;
use crate::error::CompileError;
use crate::vm::runtime::call_value;

use super::special_forms::{is_special, list_items};
use super::Compiler;

impl Compiler {
    /// Expands macro calls at the head of `form`. With `once`, stops after a
    /// single step.
    pub fn macroexpand(&mut self, form: &Value, once: bool) -> Result<Value, CompileError> {
        let mut current = form.clone();
        loop {
            let Some(items) = list_items(&current) else {
                return Ok(current);
            };
            match self.expand_once(&current, &items)? {
                Some(expanded) if once => return Ok(expanded),
                Some(expanded) => current = expanded,
                None => return Ok(current),
            }
        }
    }

    /// One expansion step, or `None` when the head is not a macro.
    pub(super) fn expand_once(
        &mut self,
        form: &Value,
        items: &[Value],
    ) -> Result<Option<Value>, CompileError> {
        let Some(Value::Symbol(head)) = items.first() else {
            return Ok(None);
        };
        if head.ns().is_none() && (is_special(head.name()) || self.top_alias(head.name()).is_some()) {
            return Ok(None);
        }
        let Ok(var) = self.resolve_var(head) else {
            return Ok(None);
        };
        if !var.is_macro() {
            return Ok(None);
        }
        debug!(macro_name = %head, "expanding macro");
        let failed = |err: &dyn std::fmt::Display| {
            CompileError::new(format!("macroexpansion of {} failed: {}", head, err))
        };
        let expander = var.deref().map_err(|err| failed(&err))?;
        let mut args = Vec::with_capacity(items.len() + 1);
        args.push(form.clone());
        args.push(Value::Nil);
        args.extend(items[1..].iter().cloned());
        let expanded = call_value(&expander, args).map_err(|err| failed(&err))?;
        Ok(Some(carry_meta(form, expanded)))
    }
}

/// Copies the call site's metadata onto the expansion. Keys present on both
/// take the call site's value.
fn carry_meta(form: &Value, expanded: Value) -> Value {
    let Some(meta) = form.meta() else {
        return expanded;
    };
    let merged = match expanded.meta() {
        Some(own) => meta
            .iter()
            .fold(own, |acc, (k, v)| acc.assoc(k.clone(), v.clone())),
        None => meta,
    };
    expanded.with_meta(Some(merged)).unwrap_or(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FnArity, NativeFn};
    use crate::collections::PersistentMap;
    use crate::namespaces::intern_variable;
    use crate::options::CompileOptions;
    use crate::symbols::{line_key, Symbol};

    fn compiler(ns: &str) -> Compiler {
        Compiler::with_options(CompileOptions {
            default_ns: ns.to_string(),
            ..CompileOptions::default()
        })
    }

    /// `(unless c body)` expanding to `(if* c nil body)`.
    fn define_unless(c: &Compiler) {
        let var = intern_variable(c.ns(), &Symbol::simple("unless"));
        var.bind_root(Value::native(NativeFn::with_name(
            FnArity::exact(4),
            "unless".to_string(),
            |args| {
                Ok(Value::list(vec![
                    Value::symbol("if*"),
                    args[2].clone(),
                    Value::Nil,
                    args[3].clone(),
                ]))
            },
        )));
        var.set_macro();
    }

    #[test]
    fn macro_calls_expand_before_compiling() {
        let mut c = compiler("macro-test.unless");
        define_unless(&c);
        let form = Value::list(vec![Value::symbol("unless"), Value::Bool(false), Value::Int(5)]);
        assert_eq!(c.eval(&form).expect("eval"), Value::Int(5));
    }

    #[test]
    fn single_step_expansion_returns_the_expansion() {
        let mut c = compiler("macro-test.once");
        define_unless(&c);
        let form = Value::list(vec![Value::symbol("unless"), Value::Bool(true), Value::Int(5)]);
        let expanded = c.macroexpand(&form, true).expect("expand");
        assert_eq!(
            expanded,
            Value::list(vec![Value::symbol("if*"), Value::Bool(true), Value::Nil, Value::Int(5)])
        );
    }

    #[test]
    fn failing_macro_reports_its_name() {
        let mut c = compiler("macro-test.fails");
        define_unless(&c);
        let form = Value::list(vec![Value::symbol("unless"), Value::Bool(true)]);
        let err = c.compile(&form).expect_err("wrong arity");
        assert!(err.message.starts_with("macroexpansion of unless failed"));
    }

    fn line_meta(line: i64) -> PersistentMap {
        PersistentMap::new().assoc(Value::Keyword(line_key()), Value::Int(line))
    }

    #[test]
    fn call_site_metadata_overrides_the_expansion() {
        let mut c = compiler("macro-test.meta");
        let var = intern_variable(c.ns(), &Symbol::simple("tagged"));
        var.bind_root(Value::native(NativeFn::with_name(
            FnArity::exact(3),
            "tagged".to_string(),
            |args| {
                let meta = line_meta(999).assoc(Value::keyword("origin"), Value::keyword("macro"));
                Ok(Value::list(vec![Value::symbol("do"), args[2].clone()])
                    .with_meta(Some(meta))
                    .expect("lists hold metadata"))
            },
        )));
        var.set_macro();
        let form = Value::list(vec![Value::symbol("tagged"), Value::Int(1)])
            .with_meta(Some(line_meta(7)))
            .expect("lists hold metadata");

        let expanded = c.macroexpand(&form, true).expect("expand");
        let meta = expanded.meta().expect("metadata carried");
        assert_eq!(meta.val_at(&Value::Keyword(line_key())), Some(Value::Int(7)));
        assert_eq!(meta.val_at(&Value::keyword("origin")), Some(Value::keyword("macro")));
    }
}
