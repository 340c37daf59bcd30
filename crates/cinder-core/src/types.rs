//! Process-wide type registry.
//!
//! Every type gets a stable [`TypeKey`] and a linearized ancestor list
//! (C3 order, most-derived first) computed once when it is registered.
//! Protocol dispatch walks that list instead of asking values for their
//! ancestry at call time. Entries are never removed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::ast::{Instance, Value};
use crate::collections::PersistentVector;
use crate::error::CinderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(u32);

impl TypeKey {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", type_name(*self))
    }
}

pub const OBJECT: TypeKey = TypeKey(0);
pub const NIL: TypeKey = TypeKey(1);
pub const BOOL: TypeKey = TypeKey(2);
pub const NUMBER: TypeKey = TypeKey(3);
pub const INT: TypeKey = TypeKey(4);
pub const FLOAT: TypeKey = TypeKey(5);
pub const RATIO: TypeKey = TypeKey(6);
pub const STRING: TypeKey = TypeKey(7);
pub const REGEX: TypeKey = TypeKey(8);
pub const SYMBOL: TypeKey = TypeKey(9);
pub const KEYWORD: TypeKey = TypeKey(10);
pub const LIST: TypeKey = TypeKey(11);
pub const VECTOR: TypeKey = TypeKey(12);
pub const MAP: TypeKey = TypeKey(13);
pub const SET: TypeKey = TypeKey(14);
pub const SEQ: TypeKey = TypeKey(15);
pub const FUNCTION: TypeKey = TypeKey(16);
pub const VAR: TypeKey = TypeKey(17);
pub const TYPE: TypeKey = TypeKey(18);
pub const REF: TypeKey = TypeKey(19);
pub const CODE: TypeKey = TypeKey(20);
pub const EXCEPTION: TypeKey = TypeKey(21);
pub const ARITY_EXCEPTION: TypeKey = TypeKey(22);
pub const ILLEGAL_STATE_EXCEPTION: TypeKey = TypeKey(23);
pub const PROTOCOL_EXCEPTION: TypeKey = TypeKey(24);
pub const INDEX_OUT_OF_BOUNDS_EXCEPTION: TypeKey = TypeKey(25);
pub const ILLEGAL_ARGUMENT_EXCEPTION: TypeKey = TypeKey(26);
pub const COMPILER_EXCEPTION: TypeKey = TypeKey(27);
pub const TRANSIENT: TypeKey = TypeKey(28);

const BUILTINS: &[(&str, &[TypeKey])] = &[
    ("Object", &[]),
    ("Nil", &[OBJECT]),
    ("Boolean", &[OBJECT]),
    ("Number", &[OBJECT]),
    ("Int", &[NUMBER]),
    ("Float", &[NUMBER]),
    ("Ratio", &[NUMBER]),
    ("String", &[OBJECT]),
    ("Regex", &[OBJECT]),
    ("Symbol", &[OBJECT]),
    ("Keyword", &[OBJECT]),
    ("PersistentList", &[OBJECT]),
    ("PersistentVector", &[OBJECT]),
    ("PersistentHashMap", &[OBJECT]),
    ("PersistentHashSet", &[OBJECT]),
    ("Seq", &[OBJECT]),
    ("Function", &[OBJECT]),
    ("Var", &[OBJECT]),
    ("Type", &[OBJECT]),
    ("Atom", &[OBJECT]),
    ("Code", &[OBJECT]),
    ("Exception", &[OBJECT]),
    ("ArityException", &[EXCEPTION]),
    ("IllegalStateException", &[EXCEPTION]),
    ("ProtocolException", &[EXCEPTION]),
    ("IndexOutOfBoundsException", &[EXCEPTION]),
    ("IllegalArgumentException", &[EXCEPTION]),
    ("CompilerException", &[EXCEPTION]),
    ("Transient", &[OBJECT]),
];

/// Builtin exception types exposed to compiled code by name.
pub const EXCEPTION_TYPES: &[TypeKey] = &[
    EXCEPTION,
    ARITY_EXCEPTION,
    ILLEGAL_STATE_EXCEPTION,
    PROTOCOL_EXCEPTION,
    INDEX_OUT_OF_BOUNDS_EXCEPTION,
    ILLEGAL_ARGUMENT_EXCEPTION,
    COMPILER_EXCEPTION,
];

pub struct TypeInfo {
    pub name: String,
    pub parents: Vec<TypeKey>,
    pub mro: Arc<[TypeKey]>,
    /// User types accept attribute injection; builtins use side tables.
    pub injectable: bool,
    attrs: RwLock<HashMap<String, Value>>,
}

struct TypeTable {
    types: Vec<Arc<TypeInfo>>,
    by_name: HashMap<String, TypeKey>,
}

impl TypeTable {
    fn bootstrap() -> Self {
        let mut table = TypeTable {
            types: Vec::new(),
            by_name: HashMap::new(),
        };
        for (name, parents) in BUILTINS {
            // Builtin hierarchies are single-inheritance, so this cannot fail.
            let mro = table.linearize(parents).unwrap_or_default();
            table.insert(name, parents, mro, false);
        }
        table
    }

    fn insert(
        &mut self,
        name: &str,
        parents: &[TypeKey],
        tail: Vec<TypeKey>,
        injectable: bool,
    ) -> TypeKey {
        let key = TypeKey(self.types.len() as u32);
        let mut mro = Vec::with_capacity(tail.len() + 1);
        mro.push(key);
        mro.extend(tail);
        self.types.push(Arc::new(TypeInfo {
            name: name.to_string(),
            parents: parents.to_vec(),
            mro: mro.into(),
            injectable,
            attrs: RwLock::new(HashMap::new()),
        }));
        self.by_name.insert(name.to_string(), key);
        key
    }

    /// Linearization of the ancestors only (the new type is prepended later).
    fn linearize(&self, parents: &[TypeKey]) -> Option<Vec<TypeKey>> {
        if parents.is_empty() {
            return Some(if self.types.is_empty() {
                Vec::new()
            } else {
                vec![OBJECT]
            });
        }
        let mut seqs: Vec<Vec<TypeKey>> = parents
            .iter()
            .map(|p| self.types[p.index()].mro.to_vec())
            .collect();
        seqs.push(parents.to_vec());
        c3_merge(seqs)
    }
}

fn c3_merge(mut seqs: Vec<Vec<TypeKey>>) -> Option<Vec<TypeKey>> {
    let mut out = Vec::new();
    loop {
        seqs.retain(|s| !s.is_empty());
        if seqs.is_empty() {
            return Some(out);
        }
        let head = seqs
            .iter()
            .map(|s| s[0])
            .find(|candidate| !seqs.iter().any(|s| s[1..].contains(candidate)))?;
        out.push(head);
        for seq in seqs.iter_mut() {
            if seq[0] == head {
                seq.remove(0);
            }
        }
    }
}

static REGISTRY: Lazy<RwLock<TypeTable>> = Lazy::new(|| RwLock::new(TypeTable::bootstrap()));

fn info(key: TypeKey) -> Arc<TypeInfo> {
    let table = REGISTRY.read().unwrap();
    table
        .types
        .get(key.index())
        .cloned()
        .unwrap_or_else(|| table.types[OBJECT.index()].clone())
}

/// Registers a user type. Its ancestors are linearized once, here.
pub fn define_type(name: &str, parents: &[TypeKey]) -> Result<TypeKey, CinderError> {
    let mut table = REGISTRY.write().unwrap();
    if let Some(bad) = parents.iter().find(|p| p.index() >= table.types.len()) {
        return Err(CinderError::illegal_argument(format!(
            "unknown parent type id {}",
            bad.0
        )));
    }
    let tail = table.linearize(parents).ok_or_else(|| {
        CinderError::illegal_argument(format!(
            "Cannot create a consistent method resolution order for {}",
            name
        ))
    })?;
    let key = table.insert(name, parents, tail, true);
    debug!(type_name = name, id = key.0, "registered type");
    Ok(key)
}

pub fn find_type(name: &str) -> Option<TypeKey> {
    REGISTRY.read().unwrap().by_name.get(name).copied()
}

pub fn type_name(key: TypeKey) -> String {
    info(key).name.clone()
}

pub fn mro(key: TypeKey) -> Arc<[TypeKey]> {
    info(key).mro.clone()
}

pub fn is_subtype(child: TypeKey, ancestor: TypeKey) -> bool {
    child == ancestor || info(child).mro.contains(&ancestor)
}

pub fn is_injectable(key: TypeKey) -> bool {
    info(key).injectable
}

pub fn type_attr(key: TypeKey, name: &str) -> Option<Value> {
    info(key).attrs.read().unwrap().get(name).cloned()
}

/// Looks `name` up along the linearized ancestors.
pub fn lookup_attr(key: TypeKey, name: &str) -> Option<Value> {
    mro(key).iter().find_map(|t| type_attr(*t, name))
}

pub fn set_type_attr(key: TypeKey, name: &str, value: Value) -> Result<(), CinderError> {
    let info = info(key);
    if !info.injectable {
        return Err(CinderError::illegal_argument(format!(
            "can't set attributes of built-in type {}",
            info.name
        )));
    }
    info.attrs.write().unwrap().insert(name.to_string(), value);
    Ok(())
}

pub fn type_of(value: &Value) -> TypeKey {
    match value {
        Value::Nil => NIL,
        Value::Bool(_) => BOOL,
        Value::Int(_) => INT,
        Value::Float(_) => FLOAT,
        Value::Ratio(_) => RATIO,
        Value::Str(_) => STRING,
        Value::Regex(_) => REGEX,
        Value::Symbol(_) => SYMBOL,
        Value::Keyword(_) => KEYWORD,
        Value::List(_) => LIST,
        Value::Vector(_) => VECTOR,
        Value::Map(_) => MAP,
        Value::Set(_) => SET,
        Value::Seq(_) => SEQ,
        Value::Func(_) | Value::Closure(_) | Value::ProtocolFn(_) => FUNCTION,
        Value::Var(_) => VAR,
        Value::Type(_) => TYPE,
        Value::Instance(inst) => inst.type_key(),
        Value::Ref(_) => REF,
        Value::Transient(_) => TRANSIENT,
        Value::Code(_) => CODE,
    }
}

/// Calling a type value: positional arguments land in `args`, and a first
/// argument becomes the `message`.
pub fn make_instance(key: TypeKey, args: &[Value]) -> Value {
    let mut fields = HashMap::new();
    fields.insert(
        "args".to_string(),
        Value::Vector(PersistentVector::from_vec(args.to_vec())),
    );
    fields.insert(
        "message".to_string(),
        args.first().cloned().unwrap_or(Value::Nil),
    );
    Value::Instance(Arc::new(Instance::new(key, fields)))
}

pub fn make_exception(key: TypeKey, message: &str) -> Value {
    make_instance(key, &[Value::string(message)])
}
