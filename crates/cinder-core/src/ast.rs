use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use num_rational::Rational64;
use regex::Regex;

use crate::collections::{PersistentList, PersistentMap, PersistentSet, PersistentVector, Seq, TransientHandle};
use crate::error::CinderError;
use crate::namespaces::Var;
use crate::protocol::ProtocolFn;
use crate::reference::RefHandle;
use crate::symbols::{Keyword, Symbol};
use crate::types::{self, TypeKey};
use crate::vm::bytecode::CodeObject;
use crate::vm::runtime::Closure;

/// Runtime value. Forms handed to the compiler are values too.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Ratio(Rational64),
    Str(String),
    Regex(RegexValue),
    Symbol(Symbol),
    Keyword(Keyword),
    List(PersistentList),
    Vector(PersistentVector),
    Map(PersistentMap),
    Set(PersistentSet),
    Seq(Seq),
    Func(Arc<NativeFn>),
    Closure(Arc<Closure>),
    ProtocolFn(Arc<ProtocolFn>),
    Var(Arc<Var>),
    Type(TypeKey),
    Instance(Arc<Instance>),
    Ref(RefHandle),
    Transient(TransientHandle),
    Code(Arc<CodeObject>),
}

impl Value {
    pub fn string(text: impl Into<String>) -> Self {
        Value::Str(text.into())
    }

    pub fn symbol(text: &str) -> Self {
        Value::Symbol(Symbol::parse(text))
    }

    pub fn keyword(name: &str) -> Self {
        Value::Keyword(Keyword::simple(name))
    }

    pub fn native(func: NativeFn) -> Self {
        Value::Func(Arc::new(func))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(PersistentList::from_vec(items))
    }

    pub fn vector(items: Vec<Value>) -> Self {
        Value::Vector(PersistentVector::from_vec(items))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Only `nil` and `false` are falsy.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn type_key(&self) -> TypeKey {
        types::type_of(self)
    }

    pub fn type_name(&self) -> String {
        types::type_name(self.type_key())
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, Value::List(_) | Value::Vector(_) | Value::Seq(_))
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Func(_)
                | Value::Closure(_)
                | Value::ProtocolFn(_)
                | Value::Type(_)
                | Value::Keyword(_)
                | Value::Var(_)
        )
    }

    /// Metadata attached to symbols and collections.
    pub fn meta(&self) -> Option<PersistentMap> {
        match self {
            Value::Symbol(sym) => sym.meta().cloned(),
            Value::List(list) => list.meta().cloned(),
            Value::Vector(vec) => vec.meta().cloned(),
            Value::Map(map) => map.meta().cloned(),
            Value::Set(set) => set.meta().cloned(),
            _ => None,
        }
    }

    /// Returns a copy carrying `meta`, or `None` when the value cannot hold metadata.
    pub fn with_meta(&self, meta: Option<PersistentMap>) -> Option<Value> {
        match self {
            Value::Symbol(sym) => Some(Value::Symbol(sym.with_meta(meta))),
            Value::List(list) => Some(Value::List(list.with_meta(meta))),
            Value::Vector(vec) => Some(Value::Vector(vec.with_meta(meta))),
            Value::Map(map) => Some(Value::Map(map.with_meta(meta))),
            Value::Set(set) => Some(Value::Set(set.with_meta(meta))),
            _ => None,
        }
    }

    /// Source line recorded by the reader under `:line`.
    pub fn line(&self) -> Option<u32> {
        let meta = self.meta()?;
        match meta.val_at(&Value::Keyword(crate::symbols::line_key())) {
            Some(Value::Int(n)) if n >= 0 => u32::try_from(n).ok(),
            _ => None,
        }
    }

    /// Identity comparison used by `is?` and `identical?`.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Keyword(a), Value::Keyword(b)) => a.ptr_eq(b),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => std::ptr::eq(a.as_str(), b.as_str()) || a == b,
            (Value::List(a), Value::List(b)) => a.ptr_eq(b),
            (Value::Vector(a), Value::Vector(b)) => a.ptr_eq(b),
            (Value::Map(a), Value::Map(b)) => a.ptr_eq(b),
            (Value::Set(a), Value::Set(b)) => a.ptr_eq(b),
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::ProtocolFn(a), Value::ProtocolFn(b)) => Arc::ptr_eq(a, b),
            (Value::Var(a), Value::Var(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Ref(a), Value::Ref(b)) => a.ptr_eq(b),
            (Value::Transient(a), Value::Transient(b)) => a.ptr_eq(b),
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn float_hash_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0f64.to_bits()
    } else if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_eq(*a, *b),
            (Value::Ratio(a), Value::Ratio(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Regex(a), Value::Regex(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (a, b) if a.is_sequential() && b.is_sequential() => {
                crate::collections::sequential_eq(a, b)
            }
            (Value::Type(a), Value::Type(b)) => a == b,
            _ => self.identical(other),
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Nil => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(n) => {
                2u8.hash(state);
                n.hash(state);
            }
            Value::Float(f) => {
                3u8.hash(state);
                float_hash_bits(*f).hash(state);
            }
            Value::Ratio(r) => {
                4u8.hash(state);
                r.hash(state);
            }
            Value::Str(s) => {
                5u8.hash(state);
                s.hash(state);
            }
            Value::Regex(re) => {
                6u8.hash(state);
                re.as_str().hash(state);
            }
            Value::Symbol(sym) => {
                7u8.hash(state);
                sym.hash(state);
            }
            Value::Keyword(kw) => {
                8u8.hash(state);
                kw.hash(state);
            }
            Value::List(_) | Value::Vector(_) | Value::Seq(_) => {
                9u8.hash(state);
                for item in crate::collections::iter_sequential(self) {
                    item.hash(state);
                }
            }
            Value::Map(map) => {
                10u8.hash(state);
                map.unordered_hash().hash(state);
            }
            Value::Set(set) => {
                11u8.hash(state);
                set.unordered_hash().hash(state);
            }
            Value::Type(key) => {
                12u8.hash(state);
                key.hash(state);
            }
            Value::Func(f) => (Arc::as_ptr(f) as *const u8 as usize).hash(state),
            Value::Closure(c) => (Arc::as_ptr(c) as *const u8 as usize).hash(state),
            Value::ProtocolFn(p) => (Arc::as_ptr(p) as *const u8 as usize).hash(state),
            Value::Var(v) => (Arc::as_ptr(v) as *const u8 as usize).hash(state),
            Value::Instance(i) => (Arc::as_ptr(i) as *const u8 as usize).hash(state),
            Value::Ref(r) => r.addr().hash(state),
            Value::Transient(t) => t.addr().hash(state),
            Value::Code(c) => (Arc::as_ptr(c) as *const u8 as usize).hash(state),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::value_format::format_value(self))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::value_format::format_value(self))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

/// Compiled regular expression compared by its source pattern.
#[derive(Clone, Debug)]
pub struct RegexValue(Arc<Regex>);

impl RegexValue {
    pub fn new(pattern: &str) -> Result<Self, CinderError> {
        Regex::new(pattern)
            .map(|re| RegexValue(Arc::new(re)))
            .map_err(|err| CinderError::illegal_argument(format!("invalid regex: {}", err)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn regex(&self) -> &Regex {
        &self.0
    }
}

impl PartialEq for RegexValue {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// Object of a registered type. Fields are mutable, like host objects.
pub struct Instance {
    ty: TypeKey,
    fields: RwLock<HashMap<String, Value>>,
}

impl Instance {
    pub fn new(ty: TypeKey, fields: HashMap<String, Value>) -> Self {
        Self {
            ty,
            fields: RwLock::new(fields),
        }
    }

    pub fn type_key(&self) -> TypeKey {
        self.ty
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.read().unwrap().get(name).cloned()
    }

    pub fn set_field(&self, name: &str, value: Value) {
        self.fields.write().unwrap().insert(name.to_string(), value);
    }

    pub fn message(&self) -> Option<String> {
        match self.field("message") {
            Some(Value::Str(s)) => Some(s),
            Some(Value::Nil) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FnArity {
    min: usize,
    max: Option<usize>,
}

impl FnArity {
    pub fn new(min: usize, max: Option<usize>) -> Self {
        if let Some(max_val) = max {
            assert!(min <= max_val, "min arity cannot exceed max arity");
        }
        Self { min, max }
    }

    pub fn exact(count: usize) -> Self {
        Self::new(count, Some(count))
    }

    pub fn at_least(min: usize) -> Self {
        Self::new(min, None)
    }

    pub fn range(min: usize, max: usize) -> Self {
        Self::new(min, Some(max))
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min && self.max.map_or(true, |max| count <= max)
    }

    pub fn describe(&self) -> String {
        match self.max {
            Some(max) if max == self.min => format!("{}", max),
            Some(max) => format!("between {} and {}", self.min, max),
            None => format!("at least {}", self.min),
        }
    }
}

pub type NativeFnImpl = dyn Fn(&[Value]) -> Result<Value, CinderError> + Send + Sync;

pub struct NativeFn {
    func: Box<NativeFnImpl>,
    arity: FnArity,
    name: Option<Arc<str>>,
}

impl NativeFn {
    pub fn new(
        arity: FnArity,
        func: impl Fn(&[Value]) -> Result<Value, CinderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            func: Box::new(func),
            arity,
            name: None,
        }
    }

    pub fn with_name(
        arity: FnArity,
        name: impl Into<String>,
        func: impl Fn(&[Value]) -> Result<Value, CinderError> + Send + Sync + 'static,
    ) -> Self {
        let mut nf = Self::new(arity, func);
        nf.name = Some(name.into().into());
        nf
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, CinderError> {
        if !self.arity.accepts(args.len()) {
            return Err(CinderError::arity(format!(
                "{} expects {} args, got {}",
                self.name().unwrap_or("native fn"),
                self.arity.describe(),
                args.len()
            )));
        }
        (self.func)(args)
    }

    pub fn arity(&self) -> FnArity {
        self.arity
    }

    /// Qualified `ns/name` once registered in a namespace.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_and_list_compare_sequentially() {
        let v = Value::vector(vec![Value::Int(1), Value::Int(2)]);
        let l = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(v, l);
    }

    #[test]
    fn truthiness_only_rejects_nil_and_false() {
        assert!(Value::Int(0).truthy());
        assert!(Value::string("").truthy());
        assert!(!Value::Nil.truthy());
        assert!(!Value::Bool(false).truthy());
    }

    #[test]
    fn native_fn_checks_arity() {
        let f = NativeFn::with_name(FnArity::exact(1), "id", |args| Ok(args[0].clone()));
        assert!(f.call(&[Value::Int(1)]).is_ok());
        let err = f.call(&[]).expect_err("arity");
        assert!(matches!(err, CinderError::Arity(_)));
    }
}
