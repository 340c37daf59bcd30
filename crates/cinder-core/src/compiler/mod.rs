//! Form compiler: turns forms into symbolic instruction fragments, resolves
//! deferred global references and hands the result to the assembler.

mod alias;
mod bytecode_form;
pub mod deferred;
mod fn_form;
mod macroexpand;
mod special_forms;
mod try_form;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::ast::Value;
use crate::error::{CinderError, CompileError};
use crate::namespaces::{find_namespace, find_variable, Namespace, Var};
use crate::options::CompileOptions;
use crate::rt::{self, RT_NS};
use crate::symbols::Symbol;
use crate::vm::assemble::{assemble, CodeSpec};
use crate::vm::bytecode::{CodeObject, DeferredPtr, Fragment, Instruction};
use crate::vm::{module, runtime};

use alias::{Alias, CaptureScope, RecurPoint};
pub use deferred::expand_deferred;

pub struct Compiler {
    ns: Arc<Namespace>,
    aliases: HashMap<String, Vec<Alias>>,
    recur_points: Vec<RecurPoint>,
    capture_scopes: Vec<CaptureScope>,
    /// Names of the enclosing `def`s and fns, innermost last.
    names: Vec<String>,
    last_lineno: u32,
    options: CompileOptions,
    next_id: usize,
    try_depth: usize,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_options(CompileOptions::default())
    }

    pub fn with_options(options: CompileOptions) -> Self {
        let ns = rt::prepare_namespace(&options.default_ns);
        Self {
            ns,
            aliases: HashMap::new(),
            recur_points: Vec::new(),
            capture_scopes: Vec::new(),
            names: Vec::new(),
            last_lineno: 0,
            options,
            next_id: 0,
            try_depth: 0,
        }
    }

    pub fn ns(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Switches the current namespace, creating it when needed.
    pub fn set_ns(&mut self, name: &str) {
        debug!(ns = name, "switching namespace");
        self.ns = rt::prepare_namespace(name);
    }

    /// Compiles a form to an unresolved fragment.
    pub fn compile(&mut self, form: &Value) -> Result<Fragment, CompileError> {
        let mut out = Vec::new();
        if self.options.track_lines {
            if let Some(line) = form.line() {
                if line > self.last_lineno {
                    self.last_lineno = line;
                    out.push(Instruction::SetLineno(line));
                }
            }
        }
        let body = match form {
            Value::List(list) if !list.is_empty() => self.compile_list(form, list.to_vec()),
            Value::Seq(seq) => self.compile_list(form, seq.iter().collect()),
            Value::Symbol(sym) => self.compile_symbol(sym),
            Value::Vector(vec) => self.compile_constructor("vector", vec.to_vec()),
            Value::Map(map) => {
                let mut items = Vec::with_capacity(map.count() * 2);
                for (key, value) in map.iter() {
                    items.push(key.clone());
                    items.push(value.clone());
                }
                self.compile_constructor("map", items)
            }
            Value::List(_)
            | Value::Nil
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Ratio(_)
            | Value::Str(_)
            | Value::Regex(_)
            | Value::Keyword(_)
            | Value::Set(_)
            | Value::Var(_)
            | Value::Type(_)
            | Value::Code(_) => Ok(vec![Instruction::LoadConst(form.clone())]),
            other => Err(CompileError::new(format!(
                "don't know how to compile {}",
                other.type_name()
            ))),
        };
        out.extend(body.map_err(|err| err.at(form))?);
        Ok(out)
    }

    /// Compiles, resolves and assembles one top-level form.
    pub fn compile_top_level(&mut self, form: &Value) -> Result<Arc<CodeObject>, CompileError> {
        trace!(ns = %self.ns.name(), "compiling top-level form");
        self.last_lineno = 0;
        let first_line = form.line().unwrap_or(0);
        let result = self.compile(form).and_then(|mut fragment| {
            fragment.push(Instruction::ReturnValue);
            self.finish(fragment, "<top>", first_line)
        });
        if result.is_err() {
            self.reset_lexical_state();
        }
        result
    }

    /// Compiles and runs one top-level form.
    pub fn eval(&mut self, form: &Value) -> Result<Value, CinderError> {
        let code = self.compile_top_level(form)?;
        runtime::execute(&code)
    }

    /// Compiles a whole module into one code object returning the value of
    /// its last form. Macros defined by the module are not run here.
    pub fn compile_module(&mut self, forms: &[Value]) -> Result<Arc<CodeObject>, CompileError> {
        debug!(forms = forms.len(), ns = %self.ns.name(), "compiling module");
        self.last_lineno = 0;
        let first_line = forms.first().and_then(Value::line).unwrap_or(0);
        let mut fragment = Vec::new();
        for (idx, form) in forms.iter().enumerate() {
            if idx > 0 {
                fragment.push(Instruction::PopTop);
            }
            match self.compile(form) {
                Ok(code) => fragment.extend(code),
                Err(err) => {
                    self.reset_lexical_state();
                    return Err(err);
                }
            }
        }
        if forms.is_empty() {
            fragment.push(Instruction::LoadConst(Value::Nil));
        }
        fragment.push(Instruction::ReturnValue);
        self.finish(fragment, "<module>", first_line)
    }

    /// Compiles `forms` and writes the module artifact into the configured
    /// directory.
    pub fn write_module(&mut self, forms: &[Value]) -> Result<PathBuf, CinderError> {
        let code = self.compile_module(forms)?;
        let dir = self
            .options
            .module_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        module::write_module(&dir, &code)
    }

    fn finish(
        &self,
        fragment: Fragment,
        name: &str,
        first_line: u32,
    ) -> Result<Arc<CodeObject>, CompileError> {
        let fragment = expand_deferred(fragment, self.options.deref_mode)?;
        let spec = CodeSpec {
            name: format!("{}/{}", self.ns.name(), name),
            filename: self.options.filename.clone(),
            first_line,
            ..CodeSpec::default()
        };
        assemble(&fragment, spec).map(Arc::new)
    }

    fn reset_lexical_state(&mut self) {
        self.aliases.clear();
        self.recur_points.clear();
        self.capture_scopes.clear();
        self.names.clear();
        self.try_depth = 0;
    }

    fn fresh_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn compile_list(&mut self, form: &Value, items: Vec<Value>) -> Result<Fragment, CompileError> {
        if let Value::Symbol(head) = &items[0] {
            if head.ns().is_none() {
                if let Some(rewritten) = rewrite_dot_shorthand(form, head, &items) {
                    return self.compile(&rewritten);
                }
                if let Some(special) = special_forms::lookup(head.name()) {
                    return special(self, form, &items);
                }
            }
            if head.ns() == Some(bytecode_form::BYTECODE_NS) {
                return self.compile_bytecode(head, &items);
            }
            if let Some(expanded) = self.expand_once(form, &items)? {
                return self.compile(&expanded);
            }
        }
        self.compile_call(&items)
    }

    fn compile_call(&mut self, items: &[Value]) -> Result<Fragment, CompileError> {
        let mut out = self.compile(&items[0])?;
        for arg in &items[1..] {
            out.extend(self.compile(arg)?);
        }
        out.push(Instruction::CallFunction(items.len() - 1));
        Ok(out)
    }

    fn compile_constructor(&mut self, name: &str, items: Vec<Value>) -> Result<Fragment, CompileError> {
        let mut out = vec![Instruction::LoadConst(runtime_value(RT_NS, name)?)];
        for item in &items {
            out.extend(self.compile(item)?);
        }
        out.push(Instruction::CallFunction(items.len()));
        Ok(out)
    }

    fn compile_symbol(&mut self, sym: &Symbol) -> Result<Fragment, CompileError> {
        if sym.ns().is_none() {
            if let Some(alias) = self.top_alias(sym.name()).cloned() {
                return self.compile_alias(sym.name(), alias);
            }
        }
        let var = self.resolve_var(sym)?;
        Ok(vec![Instruction::Deferred(DeferredPtr {
            ns: var.ns_name().to_string(),
            name: var.name().to_string(),
        })])
    }

    pub(crate) fn resolve_var(&self, sym: &Symbol) -> Result<Arc<Var>, CompileError> {
        match sym.ns() {
            None => find_variable(&self.ns, sym).ok_or_else(|| {
                CompileError::new(format!(
                    "could not resolve '{}', '{}' not found in {}",
                    sym,
                    sym.name(),
                    self.ns.name()
                ))
            }),
            Some(ns) if ns == self.ns.name() => find_variable(&self.ns, sym)
                .ok_or_else(|| CompileError::new(format!("{} does not define {}", ns, sym.name()))),
            Some(alias) => {
                let target = self
                    .ns
                    .resolve_alias(alias)
                    .unwrap_or_else(|| alias.to_string());
                let ns = find_namespace(&target)
                    .ok_or_else(|| CompileError::new(format!("no namespace named {}", target)))?;
                find_variable(&ns, sym)
                    .ok_or_else(|| CompileError::new(format!("{} does not define {}", target, sym.name())))
            }
        }
    }

    fn compile_alias(&mut self, name: &str, alias: Alias) -> Result<Fragment, CompileError> {
        match alias {
            Alias::FnArgument(local) | Alias::RenamedLocal(local) => {
                Ok(vec![Instruction::LoadFast(local)])
            }
            Alias::Closure(closure) => {
                self.mark_capture_used(closure.id);
                Ok(vec![Instruction::LoadDeref(closure.cell)])
            }
            Alias::LocalMacro(form) => {
                let hidden = self.aliases.get_mut(name).and_then(Vec::pop);
                let result = self.compile(&form);
                if let Some(hidden) = hidden {
                    self.push_alias(name, hidden);
                }
                result
            }
            Alias::SelfReference(var) => Ok(vec![
                Instruction::LoadConst(Value::Var(var)),
                Instruction::LoadAttr("deref".to_string()),
                Instruction::CallFunction(0),
            ]),
        }
    }

    fn compile_set(&mut self, alias: &Alias) -> Result<Fragment, CompileError> {
        match alias {
            Alias::FnArgument(local) | Alias::RenamedLocal(local) => {
                Ok(vec![Instruction::StoreFast(local.clone())])
            }
            Alias::Closure(closure) => {
                self.mark_capture_used(closure.id);
                Ok(vec![Instruction::StoreDeref(closure.cell.clone())])
            }
            Alias::LocalMacro(_) | Alias::SelfReference(_) => {
                Err(CompileError::new("cannot assign to this binding"))
            }
        }
    }

    fn mark_capture_used(&mut self, id: usize) {
        if let Some(scope) = self
            .capture_scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.offers(id))
        {
            scope.used.insert(id);
        }
    }

    fn top_alias(&self, name: &str) -> Option<&Alias> {
        self.aliases.get(name).and_then(|stack| stack.last())
    }

    fn push_alias(&mut self, name: &str, alias: Alias) {
        self.aliases.entry(name.to_string()).or_default().push(alias);
    }

    fn pop_alias(&mut self, name: &str) {
        if let Some(stack) = self.aliases.get_mut(name) {
            stack.pop();
            if stack.is_empty() {
                self.aliases.remove(name);
            }
        }
    }

    /// Runs `body` and pops every alias it recorded in `pushed`, on success
    /// or failure.
    fn scoped<T>(
        &mut self,
        body: impl FnOnce(&mut Self, &mut Vec<String>) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        let mut pushed = Vec::new();
        let result = body(self, &mut pushed);
        for name in pushed.iter().rev() {
            self.pop_alias(name);
        }
        result
    }

    /// Forms compiled in sequence, keeping only the last value.
    fn compile_body(&mut self, forms: &[Value]) -> Result<Fragment, CompileError> {
        if forms.is_empty() {
            return Ok(vec![Instruction::LoadConst(Value::Nil)]);
        }
        let mut out = Vec::new();
        for (idx, form) in forms.iter().enumerate() {
            if idx > 0 {
                out.push(Instruction::PopTop);
            }
            out.extend(self.compile(form)?);
        }
        Ok(out)
    }
}

/// Root value of a runtime function the compiler embeds as a constant.
fn runtime_value(ns: &str, name: &str) -> Result<Value, CompileError> {
    rt::runtime_fn(ns, name).map_err(into_compile_error)
}

pub(crate) fn into_compile_error(err: CinderError) -> CompileError {
    match err {
        CinderError::Compile(err) => err,
        other => CompileError::new(other.to_string()),
    }
}

/// `(.foo target args...)` to `(. target foo args...)`; `.-foo` keeps its
/// dash so it reads as a field.
fn rewrite_dot_shorthand(form: &Value, head: &Symbol, items: &[Value]) -> Option<Value> {
    let member = head.name().strip_prefix('.')?;
    if member.is_empty() || member.starts_with('.') || items.len() < 2 {
        return None;
    }
    let mut rewritten = vec![Value::symbol("."), items[1].clone(), Value::symbol(member)];
    rewritten.extend(items[2..].iter().cloned());
    let rewritten = Value::list(rewritten);
    Some(rewritten.with_meta(form.meta()).unwrap_or(rewritten))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::line_key;
    use crate::collections::PersistentMap;

    fn sym(name: &str) -> Value {
        Value::symbol(name)
    }

    fn list(items: Vec<Value>) -> Value {
        Value::list(items)
    }

    fn at_line(form: Value, line: i64) -> Value {
        let meta = PersistentMap::new().assoc(Value::Keyword(line_key()), Value::Int(line));
        form.with_meta(Some(meta)).expect("list holds meta")
    }

    fn compiler(ns: &str) -> Compiler {
        Compiler::with_options(CompileOptions {
            track_lines: true,
            default_ns: ns.to_string(),
            ..CompileOptions::default()
        })
    }

    #[test]
    fn line_markers_are_monotonic() {
        let mut c = compiler("compiler-test.lines");
        let inner = at_line(list(vec![sym("+"), Value::Int(1), Value::Int(2)]), 3);
        let outer = at_line(list(vec![sym("+"), inner, Value::Int(3)]), 3);
        let fragment = c.compile(&outer).expect("compile");
        let markers = fragment
            .iter()
            .filter(|i| matches!(i, Instruction::SetLineno(_)))
            .count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn unresolved_symbol_names_the_namespace() {
        let mut c = compiler("compiler-test.unresolved");
        let err = c.compile(&sym("nope")).expect_err("unresolved");
        assert_eq!(
            err.message,
            "could not resolve 'nope', 'nope' not found in compiler-test.unresolved"
        );
    }

    #[test]
    fn globals_stay_deferred_until_finished() {
        let mut c = compiler("compiler-test.deferred");
        let fragment = c.compile(&sym("first")).expect("compile");
        assert!(matches!(fragment.as_slice(), [Instruction::Deferred(ptr)] if ptr.name == "first"));
    }

    #[test]
    fn failed_forms_leave_no_aliases_behind() {
        let mut c = compiler("compiler-test.reset");
        let bad = list(vec![
            sym("let*"),
            Value::vector(vec![sym("a"), Value::Int(1)]),
            sym("missing"),
        ]);
        assert!(c.compile_top_level(&bad).is_err());
        assert!(c.aliases.is_empty());
        assert!(c.compile(&sym("a")).is_err());
    }

    #[test]
    fn dot_shorthand_rewrites_to_dot_form() {
        let form = list(vec![sym(".count"), sym("v")]);
        let Value::List(items) = &form else { unreachable!() };
        let head = Symbol::simple(".count");
        let rewritten = rewrite_dot_shorthand(&form, &head, &items.to_vec()).expect("rewrite");
        assert_eq!(rewritten, list(vec![sym("."), sym("v"), sym("count")]));
    }
}
