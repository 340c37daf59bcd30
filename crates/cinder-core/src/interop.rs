//! Attribute access behind the dot form. Methods come back as natives bound
//! to their receiver; plain attributes come back as values.

use std::sync::Arc;

use crate::ast::{FnArity, NativeFn, Value};
use crate::collections;
use crate::error::CinderError;
use crate::rt;
use crate::types;
use crate::vm::runtime::call_value;

fn bound(
    target: &Value,
    name: &str,
    arity: FnArity,
    method: impl Fn(&Value, &[Value]) -> Result<Value, CinderError> + Send + Sync + 'static,
) -> Value {
    let receiver = target.clone();
    Value::native(NativeFn::with_name(arity, name.to_string(), move |args| {
        method(&receiver, args)
    }))
}

fn no_attribute(target: &Value, name: &str) -> CinderError {
    CinderError::illegal_argument(format!(
        "{} has no attribute '{}'",
        target.type_name(),
        name
    ))
}

pub fn get_attr(target: &Value, name: &str) -> Result<Value, CinderError> {
    let found = match target {
        Value::Var(_) => var_attr(target, name),
        Value::Ref(_) => ref_attr(target, name),
        Value::Symbol(sym) => match name {
            "name" => Some(Value::string(sym.name())),
            "ns" => Some(sym.ns().map(Value::string).unwrap_or(Value::Nil)),
            _ => None,
        },
        Value::Keyword(kw) => match name {
            "name" => Some(Value::string(kw.name())),
            "ns" => Some(kw.ns().map(Value::string).unwrap_or(Value::Nil)),
            _ => None,
        },
        Value::Instance(inst) => match inst.field(name) {
            Some(value) => Some(value),
            None => types::lookup_attr(inst.type_key(), name).map(|attr| {
                if attr.is_callable() {
                    bound(target, name, FnArity::at_least(0), move |receiver, args| {
                        let mut call_args = Vec::with_capacity(args.len() + 1);
                        call_args.push(receiver.clone());
                        call_args.extend(args.iter().cloned());
                        call_value(&attr, call_args)
                    })
                } else {
                    attr
                }
            }),
        },
        Value::Type(key) => match name {
            "name" => Some(Value::string(types::type_name(*key))),
            _ => types::lookup_attr(*key, name),
        },
        Value::ProtocolFn(pfn) => {
            let pfn = pfn.clone();
            match name {
                "name" => Some(Value::string(pfn.name())),
                "extend" => Some(bound(target, name, FnArity::exact(2), move |_, args| {
                    match &args[0] {
                        Value::Type(key) => {
                            pfn.extend(*key, args[1].clone());
                            Ok(Value::Nil)
                        }
                        other => Err(CinderError::illegal_argument(format!(
                            "extend expects a type, got {}",
                            other.type_name()
                        ))),
                    }
                })),
                "setDefault" => Some(bound(target, name, FnArity::exact(1), move |_, args| {
                    pfn.set_default(args[0].clone());
                    Ok(Value::Nil)
                })),
                _ => None,
            }
        }
        Value::Closure(closure) => match name {
            "name" => Some(Value::string(closure.name())),
            _ => None,
        },
        Value::List(_) | Value::Vector(_) | Value::Map(_) | Value::Set(_) | Value::Seq(_) => {
            collection_attr(target, name)
        }
        _ => None,
    };
    found.ok_or_else(|| no_attribute(target, name))
}

fn var_attr(target: &Value, name: &str) -> Option<Value> {
    let Value::Var(var) = target else {
        return None;
    };
    let var = Arc::clone(var);
    Some(match name {
        "deref" => bound(target, name, FnArity::exact(0), move |_, _| var.deref()),
        "bindRoot" => bound(target, name, FnArity::exact(1), move |receiver, args| {
            var.bind_root(args[0].clone());
            Ok(receiver.clone())
        }),
        "set" => bound(target, name, FnArity::exact(1), move |_, args| var.set(args[0].clone())),
        "isDynamic" => bound(target, name, FnArity::exact(0), move |_, _| {
            Ok(Value::Bool(var.is_dynamic()))
        }),
        "setDynamic" => bound(target, name, FnArity::range(0, 1), move |receiver, args| {
            var.set_dynamic(args.first().map_or(true, Value::truthy));
            Ok(receiver.clone())
        }),
        "setMacro" => bound(target, name, FnArity::exact(0), move |receiver, _| {
            var.set_macro();
            Ok(receiver.clone())
        }),
        "meta" => var.meta().map(Value::Map).unwrap_or(Value::Nil),
        _ => return None,
    })
}

fn ref_attr(target: &Value, name: &str) -> Option<Value> {
    let Value::Ref(handle) = target else {
        return None;
    };
    let handle = handle.clone();
    Some(match name {
        "deref" => bound(target, name, FnArity::exact(0), move |_, _| Ok(handle.deref())),
        "reset" => bound(target, name, FnArity::exact(1), move |_, args| {
            handle.reset(args[0].clone())
        }),
        "swap" => bound(target, name, FnArity::at_least(1), move |_, args| {
            handle.swap(&args[0], &args[1..])
        }),
        "addWatch" => bound(target, name, FnArity::exact(2), move |_, args| {
            Ok(Value::Ref(handle.add_watch(args[0].clone(), args[1].clone())))
        }),
        "removeWatch" => bound(target, name, FnArity::exact(1), move |_, args| {
            Ok(Value::Ref(handle.remove_watch(&args[0])))
        }),
        "setValidator" => bound(target, name, FnArity::exact(1), move |_, args| {
            handle.set_validator(Some(args[0].clone()).filter(|v| !v.is_nil()))?;
            Ok(Value::Nil)
        }),
        "getValidator" => handle.validator().unwrap_or(Value::Nil),
        "getWatches" => Value::Map(handle.watches()),
        _ => return None,
    })
}

fn wrong_receiver(name: &str, receiver: &Value) -> CinderError {
    CinderError::dispatch(name, receiver.type_name())
}

fn collection_attr(target: &Value, name: &str) -> Option<Value> {
    let method = match name {
        "count" => bound(target, name, FnArity::exact(0), |receiver, _| {
            Ok(Value::Int(rt::count(receiver)? as i64))
        }),
        "nth" => bound(target, name, FnArity::range(1, 2), |receiver, args| {
            match (rt::nth(receiver, &args[0]), args.get(1)) {
                (Err(CinderError::IndexOutOfBounds(_)), Some(default)) => Ok(default.clone()),
                (result, _) => result,
            }
        }),
        "assocN" => bound(target, name, FnArity::exact(2), |receiver, args| {
            match (receiver, &args[0]) {
                (Value::Vector(vec), Value::Int(i)) => {
                    Ok(Value::Vector(vec.assoc_n(*i, args[1].clone())?))
                }
                _ => Err(wrong_receiver("assocN", receiver)),
            }
        }),
        "cons" => bound(target, name, FnArity::exact(1), |receiver, args| match receiver {
            Value::List(list) => Ok(Value::List(list.cons(args[0].clone()))),
            Value::Vector(vec) => Ok(Value::Vector(vec.cons(args[0].clone()))),
            Value::Map(map) => Ok(Value::Map(map.cons(&args[0])?)),
            Value::Set(set) => Ok(Value::Set(set.cons(args[0].clone()))),
            other => rt::cons(args[0].clone(), other),
        }),
        "assoc" => bound(target, name, FnArity::exact(2), |receiver, args| match receiver {
            Value::Map(map) => Ok(Value::Map(map.assoc(args[0].clone(), args[1].clone()))),
            Value::Vector(vec) => match &args[0] {
                Value::Int(i) => Ok(Value::Vector(vec.assoc_n(*i, args[1].clone())?)),
                _ => Err(CinderError::illegal_argument("Key must be integer")),
            },
            other => Err(wrong_receiver("assoc", other)),
        }),
        "without" => bound(target, name, FnArity::exact(1), |receiver, args| match receiver {
            Value::Map(map) => Ok(Value::Map(map.without(&args[0]))),
            other => Err(wrong_receiver("without", other)),
        }),
        "valAt" => bound(target, name, FnArity::range(1, 2), |receiver, args| {
            let default = args.get(1).cloned().unwrap_or(Value::Nil);
            Ok(rt::lookup(receiver, &args[0])?.unwrap_or(default))
        }),
        "containsKey" => bound(target, name, FnArity::exact(1), |receiver, args| match receiver {
            Value::Map(map) => Ok(Value::Bool(map.contains_key(&args[0]))),
            other => Err(wrong_receiver("containsKey", other)),
        }),
        "entryAt" => bound(target, name, FnArity::exact(1), |receiver, args| match receiver {
            Value::Map(map) => Ok(map.entry_at(&args[0]).unwrap_or(Value::Nil)),
            other => Err(wrong_receiver("entryAt", other)),
        }),
        "disjoin" => bound(target, name, FnArity::exact(1), |receiver, args| match receiver {
            Value::Set(set) => Ok(Value::Set(set.disjoin(&args[0]))),
            other => Err(wrong_receiver("disjoin", other)),
        }),
        "contains" => bound(target, name, FnArity::exact(1), |receiver, args| match receiver {
            Value::Set(set) => Ok(Value::Bool(set.contains(&args[0]))),
            other => Err(wrong_receiver("contains", other)),
        }),
        "seq" => bound(target, name, FnArity::exact(0), |receiver, _| {
            Ok(collections::to_seq(receiver)?.map(Value::Seq).unwrap_or(Value::Nil))
        }),
        "first" => bound(target, name, FnArity::exact(0), |receiver, _| rt::first(receiver)),
        "next" => bound(target, name, FnArity::exact(0), |receiver, _| rt::next(receiver)),
        "peek" => bound(target, name, FnArity::exact(0), |receiver, _| match receiver {
            Value::List(list) => Ok(list.peek().unwrap_or(Value::Nil)),
            Value::Vector(vec) => Ok(vec.peek().unwrap_or(Value::Nil)),
            other => Err(wrong_receiver("peek", other)),
        }),
        "pop" => bound(target, name, FnArity::exact(0), |receiver, _| match receiver {
            Value::List(list) => Ok(Value::List(list.pop()?)),
            Value::Vector(vec) => Ok(Value::Vector(vec.pop()?)),
            other => Err(wrong_receiver("pop", other)),
        }),
        "meta" => bound(target, name, FnArity::exact(0), |receiver, _| {
            Ok(receiver.meta().map(Value::Map).unwrap_or(Value::Nil))
        }),
        "withMeta" => bound(target, name, FnArity::exact(1), |receiver, args| {
            let meta = match &args[0] {
                Value::Map(map) => Some(map.clone()),
                _ => None,
            };
            receiver
                .with_meta(meta)
                .ok_or_else(|| wrong_receiver("withMeta", receiver))
        }),
        _ => return None,
    };
    Some(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::make_instance;

    #[test]
    fn vector_methods_are_bound_to_their_receiver() {
        let v = Value::vector(vec![Value::Int(1), Value::Int(2)]);
        let assoc_n = get_attr(&v, "assocN").expect("attr");
        let grown = call_value(&assoc_n, vec![Value::Int(2), Value::Int(3)]).expect("assocN");
        assert_eq!(
            grown,
            Value::vector(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        let count = get_attr(&grown, "count").expect("attr");
        assert_eq!(call_value(&count, vec![]).expect("count"), Value::Int(3));
    }

    #[test]
    fn instance_fields_come_before_type_attributes() {
        let ty = types::define_type("InteropPoint", &[]).expect("type");
        let inst = make_instance(ty, &[Value::string("hello")]);
        assert_eq!(get_attr(&inst, "message").expect("field"), Value::string("hello"));
        assert!(get_attr(&inst, "missing").is_err());
    }

    #[test]
    fn keyword_exposes_name_and_namespace() {
        let kw = Value::Keyword(crate::symbols::Keyword::intern(Some("a.b"), "c"));
        assert_eq!(get_attr(&kw, "name").expect("name"), Value::string("c"));
        assert_eq!(get_attr(&kw, "ns").expect("ns"), Value::string("a.b"));
    }
}
