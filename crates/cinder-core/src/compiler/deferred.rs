//! Finishing pass that lowers [`Instruction::Deferred`] placeholders once
//! every referenced var exists and its dynamic flag is settled.

use crate::ast::Value;
use crate::error::CompileError;
use crate::namespaces::{find_namespace, find_variable};
use crate::symbols::Symbol;
use crate::vm::bytecode::{DeferredPtr, Fragment, Instruction, PtrMode};

pub fn expand_deferred(fragment: Fragment, mode: PtrMode) -> Result<Fragment, CompileError> {
    let mut out = Vec::with_capacity(fragment.len());
    for instr in fragment {
        match instr {
            Instruction::Deferred(ptr) => out.extend(resolve(&ptr, mode)?),
            other => out.push(other),
        }
    }
    Ok(out)
}

fn resolve(ptr: &DeferredPtr, mode: PtrMode) -> Result<Fragment, CompileError> {
    let var = find_namespace(&ptr.ns)
        .and_then(|ns| find_variable(&ns, &Symbol::simple(&ptr.name)))
        .ok_or_else(|| CompileError::new(format!("{} does not define {}", ptr.ns, ptr.name)))?;
    match (var.is_dynamic(), mode) {
        (false, PtrMode::Direct) => var
            .root()
            .map(|value| vec![Instruction::LoadConst(value)])
            .ok_or_else(|| CompileError::new(format!("Var {} is unbound", var))),
        (false, PtrMode::Deref) => Err(CompileError::new(format!(
            "Invalid deref mode: {} is not dynamic",
            var
        ))),
        (true, PtrMode::Direct) => Ok(vec![Instruction::LoadConst(Value::Var(var)), Instruction::DerefVar]),
        (true, PtrMode::Deref) => Ok(vec![
            Instruction::LoadConst(Value::Var(var)),
            Instruction::LoadAttr("deref".to_string()),
            Instruction::CallFunction(0),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespaces::{find_or_create_namespace, intern_variable};

    fn ptr(ns: &str, name: &str) -> Instruction {
        Instruction::Deferred(DeferredPtr {
            ns: ns.to_string(),
            name: name.to_string(),
        })
    }

    #[test]
    fn static_vars_inline_their_value() {
        let ns = find_or_create_namespace("deferred-test.static");
        intern_variable(&ns, &Symbol::simple("k")).bind_root(Value::Int(7));
        let out = expand_deferred(vec![ptr("deferred-test.static", "k")], PtrMode::Direct)
            .expect("expand");
        assert!(matches!(out.as_slice(), [Instruction::LoadConst(Value::Int(7))]));
    }

    #[test]
    fn dynamic_vars_are_read_at_run_time() {
        let ns = find_or_create_namespace("deferred-test.dynamic");
        let var = intern_variable(&ns, &Symbol::simple("d"));
        var.set_dynamic(true);
        let direct = expand_deferred(vec![ptr("deferred-test.dynamic", "d")], PtrMode::Direct)
            .expect("expand");
        assert!(matches!(direct.as_slice(), [Instruction::LoadConst(Value::Var(_)), Instruction::DerefVar]));
        let forced = expand_deferred(vec![ptr("deferred-test.dynamic", "d")], PtrMode::Deref)
            .expect("expand");
        assert_eq!(forced.len(), 3);
    }

    #[test]
    fn forced_deref_of_static_var_is_rejected() {
        let ns = find_or_create_namespace("deferred-test.forced");
        intern_variable(&ns, &Symbol::simple("s")).bind_root(Value::Nil);
        let err = expand_deferred(vec![ptr("deferred-test.forced", "s")], PtrMode::Deref)
            .expect_err("not dynamic");
        assert!(err.message.contains("Invalid deref mode"));
    }
}
