//! Runtime support reached from compiled code: the `cinder.lang.rt`
//! constructors, numeric helpers used by the VM, and the `cinder.core`
//! natives.

use std::cmp::Ordering;
use std::sync::{Arc, Once};

use num_rational::Rational64;
use num_traits::{CheckedAdd, CheckedDiv, CheckedMul, CheckedSub, ToPrimitive, Zero};
use tracing::debug;

use crate::ast::{FnArity, Value};
use crate::collections::{self, PersistentList, PersistentMap, PersistentSet, Seq};
use crate::dynamic_vars;
use crate::error::CinderError;
use crate::namespaces::{find_namespace, find_or_create_namespace, find_variable, intern_native, intern_variable, Namespace};
use crate::reference::RefHandle;
use crate::symbols::Symbol;
use crate::types::{self, TypeKey};
use crate::vm::runtime::call_value;

pub const RT_NS: &str = "cinder.lang.rt";
pub const CORE_NS: &str = "cinder.core";
pub const PROTOCOLS_NS: &str = "cinder.protocols";

macro_rules! def_native {
    ($ns:expr, $name:expr, $arity:expr, |$args:ident| $body:expr) => {
        intern_native(
            &$ns,
            $name,
            $arity,
            move |$args: &[Value]| -> Result<Value, CinderError> { $body },
        )
    };
}

fn err<T>(msg: impl Into<String>) -> Result<T, CinderError> {
    Err(CinderError::illegal_argument(msg))
}

static INIT: Once = Once::new();

/// Creates the runtime namespaces on first use.
pub fn ensure_initialized() {
    INIT.call_once(|| {
        install_rt();
        crate::core_protocols::bootstrap();
        install_core();
        debug!("runtime initialized");
    });
}

/// Finds or creates `name`, referring everything `cinder.core` sees.
pub fn prepare_namespace(name: &str) -> Arc<Namespace> {
    ensure_initialized();
    let ns = find_or_create_namespace(name);
    if name != CORE_NS {
        for source in [PROTOCOLS_NS, CORE_NS] {
            if let Some(source) = find_namespace(source) {
                ns.refer_all(&source);
            }
        }
    }
    ns
}

/// Root value of `ns/name`, for runtime functions the compiler embeds.
pub fn runtime_fn(ns: &str, name: &str) -> Result<Value, CinderError> {
    ensure_initialized();
    find_namespace(ns)
        .and_then(|ns| find_variable(&ns, &Symbol::simple(name)))
        .and_then(|var| var.root())
        .ok_or_else(|| CinderError::illegal_state(format!("runtime function {}/{} is missing", ns, name)))
}

fn install_rt() {
    let rt = find_or_create_namespace(RT_NS);
    def_native!(rt, "vector", FnArity::at_least(0), |args| Ok(Value::vector(args.to_vec())));
    def_native!(rt, "map", FnArity::at_least(0), |args| hash_map(args));
    def_native!(rt, "list", FnArity::at_least(0), |args| Ok(Value::list(args.to_vec())));
    def_native!(rt, "set", FnArity::at_least(0), |args| {
        Ok(Value::Set(PersistentSet::from_vec(args.to_vec())))
    });
    def_native!(rt, "count", FnArity::exact(1), |args| {
        Ok(Value::Int(count(&args[0])? as i64))
    });
    def_native!(rt, "throw-arity", FnArity::exact(2), |args| match args {
        [name, argsv] => Err(CinderError::arity(format!(
            "Wrong number of args ({}) passed to: {}",
            count(argsv)?,
            match name {
                Value::Str(s) => s.clone(),
                other => other.to_string(),
            }
        ))),
        _ => err("throw-arity expects a name and an argument list"),
    });
}

fn install_core() {
    let core = find_or_create_namespace(CORE_NS);
    if let Some(protocols) = find_namespace(PROTOCOLS_NS) {
        core.refer_all(&protocols);
    }

    def_native!(core, "+", FnArity::at_least(0), |args| fold_arith(Arith::Add, Value::Int(0), args));
    def_native!(core, "*", FnArity::at_least(0), |args| fold_arith(Arith::Mul, Value::Int(1), args));
    def_native!(core, "-", FnArity::at_least(1), |args| match args {
        [x] => arith(Arith::Sub, &Value::Int(0), x),
        [x, rest @ ..] => fold_arith(Arith::Sub, x.clone(), rest),
        [] => err("- expects at least one argument"),
    });
    def_native!(core, "/", FnArity::at_least(1), |args| match args {
        [x] => arith(Arith::Div, &Value::Int(1), x),
        [x, rest @ ..] => fold_arith(Arith::Div, x.clone(), rest),
        [] => err("/ expects at least one argument"),
    });
    for (name, accept) in [
        ("<", Ordering::is_lt as fn(Ordering) -> bool),
        ("<=", Ordering::is_le),
        (">", Ordering::is_gt),
        (">=", Ordering::is_ge),
    ] {
        def_native!(core, name, FnArity::at_least(1), |args| {
            for pair in args.windows(2) {
                if !accept(compare_numbers(&pair[0], &pair[1])?) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        });
    }
    def_native!(core, "=", FnArity::at_least(1), |args| {
        for pair in args.windows(2) {
            if !equiv(&pair[0], &pair[1])? {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    });
    def_native!(core, "not", FnArity::exact(1), |args| Ok(Value::Bool(!args[0].truthy())));
    def_native!(core, "identical?", FnArity::exact(2), |args| {
        Ok(Value::Bool(args[0].identical(&args[1])))
    });
    def_native!(core, "str", FnArity::at_least(0), |args| {
        Ok(Value::Str(args.iter().map(str_of).collect()))
    });

    def_native!(core, "next", FnArity::exact(1), |args| next(&args[0]));
    def_native!(core, "cons", FnArity::exact(2), |args| cons(args[0].clone(), &args[1]));
    def_native!(core, "list", FnArity::at_least(0), |args| Ok(Value::list(args.to_vec())));
    def_native!(core, "vector", FnArity::at_least(0), |args| Ok(Value::vector(args.to_vec())));
    def_native!(core, "hash-map", FnArity::at_least(0), |args| hash_map(args));
    def_native!(core, "hash-set", FnArity::at_least(0), |args| {
        Ok(Value::Set(PersistentSet::from_vec(args.to_vec())))
    });
    def_native!(core, "apply", FnArity::at_least(2), |args| match args {
        [func, middle @ .., spread] => {
            let mut call_args = middle.to_vec();
            call_args.extend(collections::to_vec(spread)?);
            call_value(func, call_args)
        }
        _ => err("apply expects a function and a seq"),
    });

    def_native!(core, "type", FnArity::exact(1), |args| Ok(Value::Type(args[0].type_key())));
    def_native!(core, "instance?", FnArity::exact(2), |args| match args {
        [Value::Type(ty), value] => Ok(Value::Bool(types::is_subtype(value.type_key(), *ty))),
        [other, _] => err(format!("instance? expects a type, got {}", other.type_name())),
        _ => err("instance? expects a type and a value"),
    });
    def_native!(core, "make-type", FnArity::range(1, 2), |args| {
        let name = match &args[0] {
            Value::Str(s) => s.clone(),
            Value::Symbol(sym) => sym.name().to_string(),
            other => return err(format!("make-type expects a name, got {}", other.type_name())),
        };
        let parents = match args.get(1) {
            None | Some(Value::Nil) => Vec::new(),
            Some(parents) => collections::to_vec(parents)?
                .into_iter()
                .map(|p| match p {
                    Value::Type(key) => Ok(key),
                    other => err(format!("make-type parents must be types, got {}", other.type_name())),
                })
                .collect::<Result<Vec<TypeKey>, _>>()?,
        };
        types::define_type(&name, &parents).map(Value::Type)
    });

    def_native!(core, "atom", FnArity::range(1, 2), |args| {
        let validator = args.get(1).filter(|v| !v.is_nil()).cloned();
        RefHandle::with_validator(args[0].clone(), validator).map(Value::Ref)
    });
    def_native!(core, "reset!", FnArity::exact(2), |args| {
        as_ref(&args[0], "reset!")?.reset(args[1].clone())
    });
    def_native!(core, "swap!", FnArity::at_least(2), |args| {
        as_ref(&args[0], "swap!")?.swap(&args[1], &args[2..])
    });
    def_native!(core, "set-validator!", FnArity::exact(2), |args| {
        let validator = Some(args[1].clone()).filter(|v| !v.is_nil());
        as_ref(&args[0], "set-validator!")?.set_validator(validator)?;
        Ok(Value::Nil)
    });

    def_native!(core, "push-thread-bindings", FnArity::exact(1), |args| match &args[0] {
        Value::Map(map) => {
            dynamic_vars::push_frame(dynamic_vars::bindings_from_map(map)?)?;
            Ok(Value::Nil)
        }
        other => err(format!("push-thread-bindings expects a map, got {}", other.type_name())),
    });
    def_native!(core, "pop-thread-bindings", FnArity::exact(0), |_args| {
        dynamic_vars::pop_frame()?;
        Ok(Value::Nil)
    });

    let mut exported = vec![types::OBJECT];
    exported.extend_from_slice(types::EXCEPTION_TYPES);
    for key in exported {
        intern_variable(&core, &Symbol::simple(types::type_name(key))).bind_root(Value::Type(key));
    }
}

fn as_ref<'a>(value: &'a Value, op: &str) -> Result<&'a RefHandle, CinderError> {
    match value {
        Value::Ref(handle) => Ok(handle),
        other => err(format!("{} expects an atom, got {}", op, other.type_name())),
    }
}

fn hash_map(args: &[Value]) -> Result<Value, CinderError> {
    if args.len() % 2 != 0 {
        return err("map literal needs an even number of forms");
    }
    Ok(Value::Map(PersistentMap::from_pairs(
        args.chunks(2).map(|kv| (kv[0].clone(), kv[1].clone())),
    )))
}

fn str_of(value: &Value) -> String {
    match value {
        Value::Nil => String::new(),
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn first(value: &Value) -> Result<Value, CinderError> {
    Ok(collections::to_seq(value)?.map(|s| s.first()).unwrap_or(Value::Nil))
}

pub fn next(value: &Value) -> Result<Value, CinderError> {
    Ok(collections::to_seq(value)?
        .and_then(|s| s.next())
        .map(Value::Seq)
        .unwrap_or(Value::Nil))
}

pub fn rest(value: &Value) -> Result<Value, CinderError> {
    Ok(collections::to_seq(value)?
        .and_then(|s| s.next())
        .map(Value::Seq)
        .unwrap_or_else(|| Value::List(PersistentList::new())))
}

pub fn cons(item: Value, coll: &Value) -> Result<Value, CinderError> {
    match coll {
        Value::List(list) => Ok(Value::List(list.cons(item))),
        Value::Nil => Ok(Value::list(vec![item])),
        other => Ok(Value::Seq(Seq::cons(item, collections::to_seq(other)?))),
    }
}

fn protocol_call(name: &str, args: Vec<Value>) -> Result<Value, CinderError> {
    let func = runtime_fn(PROTOCOLS_NS, name)?;
    call_value(&func, args)
}

/// Value equality; instances of user types go through the `equiv` protocol
/// function.
pub fn equiv(a: &Value, b: &Value) -> Result<bool, CinderError> {
    match a {
        Value::Instance(_) => Ok(protocol_call("equiv", vec![a.clone(), b.clone()])?.truthy()),
        _ => Ok(a == b),
    }
}

/// Element count; user types go through the `count` protocol function.
pub fn count(value: &Value) -> Result<usize, CinderError> {
    match value {
        Value::Nil => Ok(0),
        Value::List(list) => Ok(list.count()),
        Value::Vector(vec) => Ok(vec.count()),
        Value::Map(map) => Ok(map.count()),
        Value::Set(set) => Ok(set.count()),
        Value::Seq(seq) => Ok(seq.count()),
        Value::Str(s) => Ok(s.chars().count()),
        Value::Transient(t) => t.count(),
        Value::Instance(_) => match protocol_call("count", vec![value.clone()])? {
            Value::Int(n) if n >= 0 => Ok(n as usize),
            other => err(format!("count returned {}", other.type_name())),
        },
        other => Err(CinderError::dispatch("count", other.type_name())),
    }
}

/// Keyed lookup shared by `get` and by invoking keywords and collections.
pub fn lookup(coll: &Value, key: &Value) -> Result<Option<Value>, CinderError> {
    Ok(match coll {
        Value::Map(map) => map.val_at(key),
        Value::Set(set) => set.contains(key).then(|| key.clone()),
        Value::Vector(vec) => match key {
            Value::Int(i) if *i >= 0 => vec.nth(*i as usize),
            _ => None,
        },
        Value::Instance(inst) => match key {
            Value::Keyword(kw) => inst.field(kw.name()),
            Value::Str(s) => inst.field(s),
            _ => None,
        },
        Value::Transient(t) => t.val_at(key)?,
        _ => None,
    })
}

/// Indexed access; out-of-range indices fail.
pub fn nth(coll: &Value, index: &Value) -> Result<Value, CinderError> {
    let Value::Int(i) = index else {
        return err(format!("nth index must be an integer, got {}", index.type_name()));
    };
    let out_of_bounds = || CinderError::index_out_of_bounds(format!("index {} out of range", i));
    let position = usize::try_from(*i).map_err(|_| out_of_bounds());
    match coll {
        Value::Nil => Ok(Value::Nil),
        Value::Vector(vec) => vec.nth_checked(*i),
        Value::List(list) => list.nth(position?).ok_or_else(out_of_bounds),
        Value::Seq(seq) => seq.iter().nth(position?).ok_or_else(out_of_bounds),
        Value::Str(s) => s
            .chars()
            .nth(position?)
            .map(|c| Value::Str(c.to_string()))
            .ok_or_else(out_of_bounds),
        other => Err(CinderError::dispatch("nth", other.type_name())),
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Ratio(Rational64),
    Float(f64),
}

enum Pair {
    Ints(i64, i64),
    Ratios(Rational64, Rational64),
    Floats(f64, f64),
}

impl Num {
    fn of(value: &Value, op: &str) -> Result<Num, CinderError> {
        match value {
            Value::Int(n) => Ok(Num::Int(*n)),
            Value::Ratio(r) => Ok(Num::Ratio(*r)),
            Value::Float(f) => Ok(Num::Float(*f)),
            other => err(format!("{} expects numbers, got {}", op, other.type_name())),
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Ratio(r) => r.to_f64().unwrap_or(f64::NAN),
            Num::Float(f) => f,
        }
    }
}

/// Int with Int stays exact, any Float makes both floats, otherwise ratios.
fn promote(a: Num, b: Num) -> Pair {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Pair::Ints(x, y),
        (Num::Int(x), Num::Ratio(y)) => Pair::Ratios(Rational64::from_integer(x), y),
        (Num::Ratio(x), Num::Int(y)) => Pair::Ratios(x, Rational64::from_integer(y)),
        (Num::Ratio(x), Num::Ratio(y)) => Pair::Ratios(x, y),
        _ => Pair::Floats(a.to_f64(), b.to_f64()),
    }
}

fn ratio_value(r: Rational64) -> Value {
    if r.is_integer() {
        Value::Int(r.to_integer())
    } else {
        Value::Ratio(r)
    }
}

#[derive(Clone, Copy, Debug)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

impl Arith {
    fn symbol(self) -> &'static str {
        match self {
            Arith::Add => "+",
            Arith::Sub => "-",
            Arith::Mul => "*",
            Arith::Div => "/",
        }
    }
}

fn divide_by_zero() -> CinderError {
    CinderError::illegal_argument("Divide by zero")
}

fn arith(op: Arith, a: &Value, b: &Value) -> Result<Value, CinderError> {
    let name = op.symbol();
    let overflow = || CinderError::runtime(format!("integer overflow in {}", name));
    match promote(Num::of(a, name)?, Num::of(b, name)?) {
        Pair::Ints(x, y) => match op {
            Arith::Add => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
            Arith::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
            Arith::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
            Arith::Div => {
                if y == 0 {
                    return Err(divide_by_zero());
                }
                Rational64::from_integer(x)
                    .checked_div(&Rational64::from_integer(y))
                    .map(ratio_value)
                    .ok_or_else(overflow)
            }
        },
        Pair::Ratios(x, y) => {
            let result = match op {
                Arith::Add => x.checked_add(&y),
                Arith::Sub => x.checked_sub(&y),
                Arith::Mul => x.checked_mul(&y),
                Arith::Div => {
                    if y.is_zero() {
                        return Err(divide_by_zero());
                    }
                    x.checked_div(&y)
                }
            };
            result.map(ratio_value).ok_or_else(overflow)
        }
        Pair::Floats(x, y) => Ok(Value::Float(match op {
            Arith::Add => x + y,
            Arith::Sub => x - y,
            Arith::Mul => x * y,
            Arith::Div => x / y,
        })),
    }
}

fn fold_arith(op: Arith, init: Value, args: &[Value]) -> Result<Value, CinderError> {
    args.iter().try_fold(init, |acc, x| arith(op, &acc, x))
}

/// Numeric ordering across ints, ratios and floats.
pub fn compare_numbers(a: &Value, b: &Value) -> Result<Ordering, CinderError> {
    let ordering = match promote(Num::of(a, "compare")?, Num::of(b, "compare")?) {
        Pair::Ints(x, y) => Some(x.cmp(&y)),
        Pair::Ratios(x, y) => Some(x.cmp(&y)),
        Pair::Floats(x, y) => x.partial_cmp(&y),
    };
    ordering.ok_or_else(|| CinderError::illegal_argument("cannot order NaN"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_fn(name: &str) -> Value {
        runtime_fn(CORE_NS, name).expect("core fn")
    }

    #[test]
    fn integer_division_yields_exact_ratio() {
        let div = core_fn("/");
        let result = call_value(&div, vec![Value::Int(1), Value::Int(3)]).expect("divide");
        assert_eq!(result, Value::Ratio(Rational64::new(1, 3)));
        let whole = call_value(&div, vec![Value::Int(6), Value::Int(3)]).expect("divide");
        assert_eq!(whole, Value::Int(2));
    }

    #[test]
    fn ratios_promote_to_float_when_mixed() {
        let add = core_fn("+");
        let result = call_value(
            &add,
            vec![Value::Ratio(Rational64::new(1, 2)), Value::Float(0.25)],
        )
        .expect("add");
        assert_eq!(result, Value::Float(0.75));
    }

    #[test]
    fn overflow_is_an_error_not_a_wrap() {
        assert!(arith(Arith::Add, &Value::Int(i64::MAX), &Value::Int(1)).is_err());
    }

    #[test]
    fn comparisons_cross_numeric_kinds() {
        let third = Value::Ratio(Rational64::new(1, 3));
        assert_eq!(compare_numbers(&Value::Int(0), &third).expect("cmp"), Ordering::Less);
        assert_eq!(compare_numbers(&Value::Float(0.5), &third).expect("cmp"), Ordering::Greater);
        assert!(compare_numbers(&Value::Float(f64::NAN), &Value::Int(1)).is_err());
    }

    #[test]
    fn nth_checks_bounds() {
        let list = Value::list(vec![Value::Int(1)]);
        assert_eq!(nth(&list, &Value::Int(0)).expect("nth"), Value::Int(1));
        assert!(matches!(
            nth(&list, &Value::Int(3)),
            Err(CinderError::IndexOutOfBounds(_))
        ));
    }

    #[test]
    fn arity_failure_names_the_function() {
        let throw = runtime_fn(RT_NS, "throw-arity").expect("rt fn");
        let err = call_value(
            &throw,
            vec![Value::string("user/f"), Value::list(vec![Value::Nil; 3])],
        )
        .expect_err("always fails");
        assert!(err.to_string().contains("Wrong number of args (3) passed to: user/f"));
    }
}
