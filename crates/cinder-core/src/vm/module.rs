//! Precompiled module artifact: magic, 32-bit little-endian mtime, then the
//! serialized top-level [`CodeObject`].

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::error::CinderError;
use crate::vm::bytecode::CodeObject;

pub const MODULE_MAGIC: [u8; 4] = *b"CND\x01";
pub const MODULE_FILE_NAME: &str = "output.cnc";

fn io_error(context: &str, err: impl std::fmt::Display) -> CinderError {
    CinderError::runtime(format!("{}: {}", context, err))
}

pub fn write_module_to<W: Write>(
    out: &mut W,
    code: &CodeObject,
    mtime: u32,
) -> Result<(), CinderError> {
    let body = serde_json::to_vec(code).map_err(|err| io_error("cannot serialize module", err))?;
    out.write_all(&MODULE_MAGIC)
        .and_then(|_| out.write_all(&mtime.to_le_bytes()))
        .and_then(|_| out.write_all(&body))
        .map_err(|err| io_error("cannot write module", err))
}

/// Writes `dir/output.cnc` stamped with the current time.
pub fn write_module(dir: &Path, code: &CodeObject) -> Result<PathBuf, CinderError> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let path = dir.join(MODULE_FILE_NAME);
    let file = File::create(&path).map_err(|err| io_error("cannot create module file", err))?;
    let mut out = BufWriter::new(file);
    write_module_to(&mut out, code, mtime)?;
    out.flush()
        .map_err(|err| io_error("cannot flush module file", err))?;
    info!(path = %path.display(), "wrote module artifact");
    Ok(path)
}

/// Returns the recorded mtime and the code object.
pub fn read_module<R: Read>(mut input: R) -> Result<(u32, CodeObject), CinderError> {
    let mut header = [0u8; 8];
    input
        .read_exact(&mut header)
        .map_err(|err| io_error("truncated module header", err))?;
    if header[..4] != MODULE_MAGIC {
        return Err(CinderError::illegal_argument("bad magic number in module"));
    }
    let mtime = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let code = serde_json::from_reader(input).map_err(|err| io_error("corrupt module body", err))?;
    Ok((mtime, code))
}

/// Serde adapter for constant pools. Data values serialize structurally;
/// natives, protocol functions, vars and types by name.
pub(crate) mod const_pool {
    use std::sync::Arc;

    use num_rational::Rational64;
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::ast::{RegexValue, Value};
    use crate::collections::{PersistentList, PersistentMap, PersistentSet, PersistentVector};
    use crate::namespaces::{find_namespace, find_or_create_namespace, find_variable, intern_variable};
    use crate::symbols::{Keyword, Symbol};
    use crate::types;
    use crate::vm::bytecode::CodeObject;

    #[derive(Serialize, Deserialize)]
    #[serde(tag = "t", content = "v")]
    enum ConstRepr {
        Nil,
        Bool(bool),
        Int(i64),
        Float(f64),
        Ratio(i64, i64),
        Str(String),
        Regex(String),
        Symbol(Option<String>, String),
        Keyword(Option<String>, String),
        List(Vec<ConstRepr>),
        Vector(Vec<ConstRepr>),
        Map(Vec<(ConstRepr, ConstRepr)>),
        Set(Vec<ConstRepr>),
        Global(String),
        Var(String, String),
        Type(String),
        Code(Arc<CodeObject>),
    }

    fn all(items: impl Iterator<Item = Value>) -> Result<Vec<ConstRepr>, String> {
        items.map(|v| to_repr(&v)).collect()
    }

    fn to_repr(value: &Value) -> Result<ConstRepr, String> {
        Ok(match value {
            Value::Nil => ConstRepr::Nil,
            Value::Bool(b) => ConstRepr::Bool(*b),
            Value::Int(n) => ConstRepr::Int(*n),
            Value::Float(f) => ConstRepr::Float(*f),
            Value::Ratio(r) => ConstRepr::Ratio(*r.numer(), *r.denom()),
            Value::Str(s) => ConstRepr::Str(s.clone()),
            Value::Regex(re) => ConstRepr::Regex(re.as_str().to_string()),
            Value::Symbol(sym) => {
                ConstRepr::Symbol(sym.ns().map(str::to_string), sym.name().to_string())
            }
            Value::Keyword(kw) => {
                ConstRepr::Keyword(kw.ns().map(str::to_string), kw.name().to_string())
            }
            Value::List(list) => ConstRepr::List(all(list.iter())?),
            Value::Seq(seq) => ConstRepr::List(all(seq.iter())?),
            Value::Vector(vec) => ConstRepr::Vector(all(vec.iter().cloned())?),
            Value::Set(set) => ConstRepr::Set(all(set.iter().cloned())?),
            Value::Map(map) => ConstRepr::Map(
                map.iter()
                    .map(|(k, v)| Ok((to_repr(k)?, to_repr(v)?)))
                    .collect::<Result<_, String>>()?,
            ),
            Value::Func(native) => match native.name() {
                Some(name) if name.contains('/') => ConstRepr::Global(name.to_string()),
                _ => return Err("cannot serialize an anonymous native function".into()),
            },
            Value::ProtocolFn(pfn) => ConstRepr::Global(pfn.qualified_name()),
            Value::Var(var) => ConstRepr::Var(var.ns_name().to_string(), var.name().to_string()),
            Value::Type(key) => ConstRepr::Type(types::type_name(*key)),
            Value::Code(code) => ConstRepr::Code(code.clone()),
            other => return Err(format!("cannot serialize constant of type {}", other.type_name())),
        })
    }

    fn from_repr(repr: ConstRepr) -> Result<Value, String> {
        let many = |items: Vec<ConstRepr>| items.into_iter().map(from_repr).collect::<Result<Vec<_>, _>>();
        Ok(match repr {
            ConstRepr::Nil => Value::Nil,
            ConstRepr::Bool(b) => Value::Bool(b),
            ConstRepr::Int(n) => Value::Int(n),
            ConstRepr::Float(f) => Value::Float(f),
            ConstRepr::Ratio(n, d) => {
                if d == 0 {
                    return Err("ratio with zero denominator".into());
                }
                Value::Ratio(Rational64::new(n, d))
            }
            ConstRepr::Str(s) => Value::Str(s),
            ConstRepr::Regex(pattern) => {
                Value::Regex(RegexValue::new(&pattern).map_err(|e| e.to_string())?)
            }
            ConstRepr::Symbol(ns, name) => Value::Symbol(Symbol::new(ns.as_deref(), &name)),
            ConstRepr::Keyword(ns, name) => Value::Keyword(Keyword::intern(ns.as_deref(), &name)),
            ConstRepr::List(items) => Value::List(PersistentList::from_vec(many(items)?)),
            ConstRepr::Vector(items) => Value::Vector(PersistentVector::from_vec(many(items)?)),
            ConstRepr::Set(items) => Value::Set(PersistentSet::from_vec(many(items)?)),
            ConstRepr::Map(pairs) => Value::Map(PersistentMap::from_pairs(
                pairs
                    .into_iter()
                    .map(|(k, v)| Ok((from_repr(k)?, from_repr(v)?)))
                    .collect::<Result<Vec<_>, String>>()?,
            )),
            ConstRepr::Global(qualified) => {
                let sym = Symbol::parse(&qualified);
                let ns = sym
                    .ns()
                    .and_then(find_namespace)
                    .ok_or_else(|| format!("no namespace for {}", qualified))?;
                find_variable(&ns, &sym.without_ns())
                    .and_then(|var| var.root())
                    .ok_or_else(|| format!("unresolved global {}", qualified))?
            }
            ConstRepr::Var(ns, name) => {
                let ns = find_or_create_namespace(&ns);
                Value::Var(intern_variable(&ns, &Symbol::simple(&name)))
            }
            ConstRepr::Type(name) => Value::Type(
                types::find_type(&name).ok_or_else(|| format!("unknown type {}", name))?,
            ),
            ConstRepr::Code(code) => Value::Code(code),
        })
    }

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(consts: &Vec<Value>, serializer: S) -> Result<S::Ok, S::Error> {
        let reprs = consts
            .iter()
            .map(to_repr)
            .collect::<Result<Vec<_>, _>>()
            .map_err(S::Error::custom)?;
        reprs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Value>, D::Error> {
        let reprs = Vec::<ConstRepr>::deserialize(deserializer)?;
        reprs
            .into_iter()
            .map(from_repr)
            .collect::<Result<Vec<_>, _>>()
            .map_err(D::Error::custom)
    }
}
