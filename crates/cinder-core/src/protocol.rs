//! Open, retroactively extensible operations dispatched on the runtime
//! type of their first argument.
//!
//! User types (which accept attribute injection) carry their
//! implementation as a `__proto__<name>` type attribute; builtin types go
//! through the function's side table. Both sit behind `RwLock`s: extension
//! takes the write side, dispatch only reads.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::ast::Value;
use crate::collections::PersistentMap;
use crate::error::CinderError;
use crate::namespaces::{find_variable, intern_variable, Namespace};
use crate::symbols::Symbol;
use crate::types::{self, TypeKey};
use crate::vm::runtime::call_value;

pub struct ProtocolFn {
    name: String,
    ns: String,
    attr_name: String,
    table: RwLock<HashMap<TypeKey, Value>>,
    default: RwLock<Option<Value>>,
}

impl ProtocolFn {
    pub fn new(ns: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ns: ns.to_string(),
            attr_name: format!("__proto__{}", name),
            table: RwLock::new(HashMap::new()),
            default: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.ns, self.name)
    }

    /// Installs `func` for exactly `ty`, replacing any earlier implementation.
    pub fn extend(&self, ty: TypeKey, func: Value) {
        debug!(op = %self.name, ty = %ty, "extending protocol fn");
        if types::is_injectable(ty) {
            // Injectable types never get a table entry, so this cannot fail.
            let _ = types::set_type_attr(ty, &self.attr_name, func);
        } else {
            self.table.write().unwrap().insert(ty, func);
        }
    }

    pub fn extend_for_types(&self, tys: &[TypeKey], func: Value) {
        for ty in tys {
            self.extend(*ty, func.clone());
        }
    }

    pub fn set_default(&self, func: Value) {
        *self.default.write().unwrap() = Some(func);
    }

    pub fn default_impl(&self) -> Option<Value> {
        self.default.read().unwrap().clone()
    }

    fn direct(&self, ty: TypeKey) -> Option<Value> {
        types::type_attr(ty, &self.attr_name)
            .or_else(|| self.table.read().unwrap().get(&ty).cloned())
    }

    /// First implementation along the linearized ancestors of `ty`.
    pub fn find(&self, ty: TypeKey) -> Option<Value> {
        types::mro(ty).iter().find_map(|t| self.direct(*t))
    }

    pub fn is_extended_by(&self, ty: TypeKey) -> bool {
        self.find(ty).is_some()
    }

    pub fn resolve(&self, ty: TypeKey) -> Result<Value, CinderError> {
        self.find(ty)
            .or_else(|| self.default_impl())
            .ok_or_else(|| CinderError::dispatch(&self.name, types::type_name(ty)))
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value, CinderError> {
        let Some(receiver) = args.first() else {
            return Err(CinderError::arity(format!(
                "protocol fn {} needs at least one argument",
                self.name
            )));
        };
        let implementation = self.resolve(receiver.type_key())?;
        call_value(&implementation, args.to_vec())
    }
}

impl fmt::Debug for ProtocolFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolFn({})", self.qualified_name())
    }
}

pub struct Protocol {
    name: String,
    ns: String,
    fns: BTreeMap<String, Arc<ProtocolFn>>,
    implementors: RwLock<HashSet<TypeKey>>,
}

impl Protocol {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.ns, self.name)
    }

    pub fn function(&self, name: &str) -> Option<Arc<ProtocolFn>> {
        self.fns.get(name).cloned()
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.fns.keys().map(String::as_str).collect()
    }

    pub fn mark_implementor(&self, ty: TypeKey) {
        self.implementors.write().unwrap().insert(ty);
    }

    /// Every name is validated before anything is installed.
    pub fn extend_for_type(&self, ty: TypeKey, impls: &[(String, Value)]) -> Result<(), CinderError> {
        if let Some((unknown, _)) = impls.iter().find(|(name, _)| !self.fns.contains_key(name)) {
            return Err(CinderError::illegal_argument(format!(
                "No method found for name {} in protocol {}",
                unknown, self.name
            )));
        }
        for (name, func) in impls {
            if let Some(pfn) = self.fns.get(name) {
                pfn.extend(ty, func.clone());
            }
        }
        self.mark_implementor(ty);
        Ok(())
    }

    /// Map form of [`Protocol::extend_for_type`]; keys are keywords,
    /// symbols or strings naming protocol functions.
    pub fn extend_for_type_map(&self, ty: TypeKey, map: &PersistentMap) -> Result<(), CinderError> {
        let impls = map
            .iter()
            .map(|(key, func)| {
                let name = match key {
                    Value::Keyword(kw) => kw.name().to_string(),
                    Value::Symbol(sym) => sym.name().to_string(),
                    Value::Str(s) => s.clone(),
                    other => {
                        return Err(CinderError::illegal_argument(format!(
                            "protocol method names must be keywords, got {}",
                            other.type_name()
                        )))
                    }
                };
                Ok((name, func.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.extend_for_type(ty, &impls)
    }

    /// Uses attributes already present on `ty` whose names match protocol functions.
    pub fn extend_from_type_methods(&self, ty: TypeKey) -> Result<(), CinderError> {
        let impls: Vec<(String, Value)> = self
            .fns
            .keys()
            .filter_map(|name| types::lookup_attr(ty, name).map(|func| (name.clone(), func)))
            .collect();
        self.extend_for_type(ty, &impls)
    }

    pub fn is_implemented_by(&self, ty: TypeKey) -> bool {
        let implementors = self.implementors.read().unwrap();
        types::mro(ty).iter().any(|t| implementors.contains(t))
    }

    pub fn satisfies(&self, value: &Value) -> bool {
        self.is_implemented_by(value.type_key())
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protocol({})", self.qualified_name())
    }
}

static PROTOCOLS: Lazy<RwLock<HashMap<String, Arc<Protocol>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Creates protocol `name` in `ns`. Function names already bound to protocol
/// functions in `ns` are reused; the rest are interned fresh.
pub fn make_protocol(ns: &Namespace, name: &str, fn_names: &[&str]) -> Arc<Protocol> {
    let mut fns = BTreeMap::new();
    for fn_name in fn_names {
        let sym = Symbol::simple(fn_name);
        let existing = find_variable(ns, &sym).and_then(|var| match var.root() {
            Some(Value::ProtocolFn(pfn)) if var.ns_name() == ns.name() => Some(pfn),
            _ => None,
        });
        let pfn = existing.unwrap_or_else(|| {
            let pfn = Arc::new(ProtocolFn::new(ns.name(), fn_name));
            intern_variable(ns, &sym).bind_root(Value::ProtocolFn(pfn.clone()));
            pfn
        });
        fns.insert(fn_name.to_string(), pfn);
    }
    let protocol = Arc::new(Protocol {
        name: name.to_string(),
        ns: ns.name().to_string(),
        fns,
        implementors: RwLock::new(HashSet::new()),
    });
    debug!(protocol = %protocol.qualified_name(), "defined protocol");
    PROTOCOLS
        .write()
        .unwrap()
        .insert(protocol.qualified_name(), protocol.clone());
    protocol
}

pub fn find_protocol(qualified_name: &str) -> Option<Arc<Protocol>> {
    PROTOCOLS.read().unwrap().get(qualified_name).cloned()
}

/// Bulk extension of one type across several protocols.
pub fn extend_type(
    ty: TypeKey,
    extensions: &[(Arc<Protocol>, Vec<(String, Value)>)],
) -> Result<(), CinderError> {
    for (protocol, impls) in extensions {
        protocol.extend_for_type(ty, impls)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FnArity, NativeFn};
    use crate::namespaces::find_or_create_namespace;

    fn constant(v: i64) -> Value {
        Value::native(NativeFn::new(FnArity::at_least(0), move |_| Ok(Value::Int(v))))
    }

    #[test]
    fn subtype_falls_back_to_ancestor_implementation() {
        let base = types::define_type("ProtoBase", &[]).expect("type");
        let child = types::define_type("ProtoChild", &[base]).expect("type");
        let pfn = ProtocolFn::new("proto-test", "describe");
        pfn.extend(base, constant(1));
        let instance = types::make_instance(child, &[]);
        assert_eq!(pfn.invoke(&[instance]).expect("dispatch"), Value::Int(1));
    }

    #[test]
    fn side_table_serves_builtin_types() {
        let pfn = ProtocolFn::new("proto-test", "size");
        pfn.extend(types::VECTOR, constant(7));
        assert_eq!(
            pfn.invoke(&[Value::vector(vec![])]).expect("dispatch"),
            Value::Int(7)
        );
        assert!(pfn.find(types::MAP).is_none());
    }

    #[test]
    fn make_protocol_reuses_existing_functions() {
        let ns = find_or_create_namespace("proto-test.reuse");
        let first = make_protocol(&ns, "IFoo", &["foo"]);
        let second = make_protocol(&ns, "IFooAgain", &["foo"]);
        let a = first.function("foo").expect("fn");
        let b = second.function("foo").expect("fn");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
