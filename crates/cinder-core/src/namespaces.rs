use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::ast::{NativeFn, Value};
use crate::collections::PersistentMap;
use crate::dynamic_vars;
use crate::error::CinderError;
use crate::symbols::{macro_key, Symbol};

/// A namespace-owned, optionally thread-rebindable cell.
pub struct Var {
    ns: String,
    name: String,
    root: RwLock<Option<Value>>,
    dynamic: AtomicBool,
    meta: RwLock<Option<PersistentMap>>,
}

impl Var {
    fn new(ns: &str, name: &str) -> Self {
        Self {
            ns: ns.to_string(),
            name: name.to_string(),
            root: RwLock::new(None),
            dynamic: AtomicBool::new(false),
            meta: RwLock::new(None),
        }
    }

    pub fn ns_name(&self) -> &str {
        &self.ns
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.ns, self.name)
    }

    pub fn symbol(&self) -> Symbol {
        Symbol::new(Some(&self.ns), &self.name)
    }

    /// Innermost thread binding, then the root value.
    pub fn deref(self: &Arc<Self>) -> Result<Value, CinderError> {
        if self.is_dynamic() {
            if let Some(value) = dynamic_vars::current_value(self) {
                return Ok(value);
            }
        }
        self.root
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| CinderError::illegal_state(format!("Var {} is unbound", self)))
    }

    pub fn root(&self) -> Option<Value> {
        self.root.read().unwrap().clone()
    }

    pub fn has_root(&self) -> bool {
        self.root.read().unwrap().is_some()
    }

    pub fn bind_root(&self, value: Value) {
        *self.root.write().unwrap() = Some(value);
    }

    /// Replaces the innermost thread binding; fails when there is none.
    pub fn set(self: &Arc<Self>, value: Value) -> Result<Value, CinderError> {
        if dynamic_vars::set_current_value(self, value.clone()) {
            Ok(value)
        } else {
            Err(CinderError::illegal_state(format!(
                "Can't change/establish root binding of: {} with set",
                self
            )))
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic.load(Ordering::Acquire)
    }

    pub fn set_dynamic(&self, dynamic: bool) {
        self.dynamic.store(dynamic, Ordering::Release);
    }

    pub fn meta(&self) -> Option<PersistentMap> {
        self.meta.read().unwrap().clone()
    }

    pub fn set_meta(&self, meta: Option<PersistentMap>) {
        *self.meta.write().unwrap() = meta;
    }

    pub fn is_macro(&self) -> bool {
        self.meta()
            .and_then(|m| m.val_at(&Value::Keyword(macro_key())))
            .map_or(false, |v| v.truthy())
    }

    pub fn set_macro(&self) {
        let meta = self.meta().unwrap_or_default();
        self.set_meta(Some(meta.assoc(Value::Keyword(macro_key()), Value::Bool(true))));
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var({}/{})", self.ns, self.name)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#'{}/{}", self.ns, self.name)
    }
}

pub struct Namespace {
    name: String,
    mappings: RwLock<HashMap<String, Arc<Var>>>,
    refers: RwLock<HashMap<String, Arc<Var>>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl Namespace {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mappings: RwLock::new(HashMap::new()),
            refers: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interned names, sorted, for diagnostics.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mappings.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn public_vars(&self) -> Vec<Arc<Var>> {
        self.mappings.read().unwrap().values().cloned().collect()
    }

    /// Makes every var interned in `other` visible here by its bare name.
    pub fn refer_all(&self, other: &Namespace) {
        let vars = other.public_vars();
        let mut refers = self.refers.write().unwrap();
        for var in vars {
            refers.insert(var.name().to_string(), var);
        }
    }

    pub fn add_alias(&self, alias: &str, target: &str) {
        self.aliases
            .write()
            .unwrap()
            .insert(alias.to_string(), target.to_string());
    }

    pub fn resolve_alias(&self, alias: &str) -> Option<String> {
        self.aliases.read().unwrap().get(alias).cloned()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", self.name)
    }
}

static NAMESPACES: Lazy<RwLock<HashMap<String, Arc<Namespace>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn find_or_create_namespace(name: &str) -> Arc<Namespace> {
    if let Some(ns) = find_namespace(name) {
        return ns;
    }
    let mut table = NAMESPACES.write().unwrap();
    table
        .entry(name.to_string())
        .or_insert_with(|| {
            debug!(ns = name, "created namespace");
            Arc::new(Namespace::new(name))
        })
        .clone()
}

pub fn find_namespace(name: &str) -> Option<Arc<Namespace>> {
    NAMESPACES.read().unwrap().get(name).cloned()
}

/// Idempotent: interning the same name twice yields the same var.
pub fn intern_variable(ns: &Namespace, sym: &Symbol) -> Arc<Var> {
    let mut mappings = ns.mappings.write().unwrap();
    mappings
        .entry(sym.name().to_string())
        .or_insert_with(|| Arc::new(Var::new(&ns.name, sym.name())))
        .clone()
}

/// Own mappings first, then referred vars.
pub fn find_variable(ns: &Namespace, sym: &Symbol) -> Option<Arc<Var>> {
    if let Some(var) = ns.mappings.read().unwrap().get(sym.name()) {
        return Some(var.clone());
    }
    ns.refers.read().unwrap().get(sym.name()).cloned()
}

/// Interns `name` in `ns` bound to a native function named `ns/name`.
pub fn intern_native(
    ns: &Namespace,
    name: &str,
    arity: crate::ast::FnArity,
    func: impl Fn(&[Value]) -> Result<Value, CinderError> + Send + Sync + 'static,
) -> Arc<Var> {
    let var = intern_variable(ns, &Symbol::simple(name));
    let native = NativeFn::with_name(arity, format!("{}/{}", ns.name(), name), func);
    var.bind_root(Value::native(native));
    var
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let ns = find_or_create_namespace("ns-test.intern");
        let a = intern_variable(&ns, &Symbol::simple("x"));
        let b = intern_variable(&ns, &Symbol::simple("x"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(find_variable(&ns, &Symbol::simple("y")).is_none());
    }

    #[test]
    fn debug_names_the_qualified_var() {
        let ns = find_or_create_namespace("ns-test.debug");
        let var = intern_variable(&ns, &Symbol::simple("x"));
        assert_eq!(format!("{:?}", var), "Var(ns-test.debug/x)");
    }

    #[test]
    fn unbound_var_fails_to_deref() {
        let ns = find_or_create_namespace("ns-test.unbound");
        let var = intern_variable(&ns, &Symbol::simple("nothing"));
        assert!(var.deref().is_err());
        var.bind_root(Value::Int(4));
        assert_eq!(var.deref().expect("bound"), Value::Int(4));
    }

    #[test]
    fn referred_vars_resolve_by_bare_name() {
        let lib = find_or_create_namespace("ns-test.lib");
        intern_variable(&lib, &Symbol::simple("helper")).bind_root(Value::Int(1));
        let user = find_or_create_namespace("ns-test.user");
        user.refer_all(&lib);
        let found = find_variable(&user, &Symbol::simple("helper")).expect("referred");
        assert_eq!(found.ns_name(), "ns-test.lib");
    }
}
