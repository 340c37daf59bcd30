//! The collection and reference protocols of `cinder.protocols`, extended
//! for the builtin types.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tracing::warn;

use crate::ast::{FnArity, NativeFn, Value};
use crate::collections::{self, PersistentList, PersistentMap, Seq, TransientHandle};
use crate::error::CinderError;
use crate::namespaces::{find_or_create_namespace, Namespace};
use crate::protocol::{make_protocol, Protocol};
use crate::reference::RefHandle;
use crate::rt::{self, PROTOCOLS_NS};
use crate::types::{self, TypeKey};
use crate::vm::runtime::call_value;

fn imp(
    name: &str,
    arity: FnArity,
    func: impl Fn(&[Value]) -> Result<Value, CinderError> + Send + Sync + 'static,
) -> Value {
    Value::native(NativeFn::with_name(arity, format!("{}/{}", PROTOCOLS_NS, name), func))
}

fn install(protocol: &Protocol, tys: &[TypeKey], impls: Vec<(&str, Value)>) {
    let impls: Vec<(String, Value)> = impls
        .into_iter()
        .map(|(name, func)| (name.to_string(), func))
        .collect();
    for ty in tys {
        if let Err(err) = protocol.extend_for_type(*ty, &impls) {
            warn!(protocol = %protocol.qualified_name(), %err, "builtin extension failed");
        }
    }
}

fn unsupported(op: &str, value: &Value) -> CinderError {
    CinderError::dispatch(op, value.type_name())
}

const COLLECTIONS: &[TypeKey] = &[types::LIST, types::VECTOR, types::MAP, types::SET, types::SEQ];

pub(crate) fn bootstrap() {
    let ns = find_or_create_namespace(PROTOCOLS_NS);

    let seqable = make_protocol(&ns, "ISeqable", &["seq"]);
    let mut seq_types = COLLECTIONS.to_vec();
    seq_types.extend([types::STRING, types::NIL]);
    install(
        &seqable,
        &seq_types,
        vec![(
            "seq",
            imp("seq", FnArity::exact(1), |args| {
                Ok(collections::to_seq(&args[0])?.map(Value::Seq).unwrap_or(Value::Nil))
            }),
        )],
    );

    let counted = make_protocol(&ns, "ICounted", &["count"]);
    let mut counted_types = seq_types.clone();
    counted_types.push(types::TRANSIENT);
    install(
        &counted,
        &counted_types,
        vec![(
            "count",
            imp("count", FnArity::exact(1), |args| Ok(Value::Int(rt::count(&args[0])? as i64))),
        )],
    );

    let collection = make_protocol(&ns, "ICollection", &["conj"]);
    let mut conj_types = COLLECTIONS.to_vec();
    conj_types.push(types::NIL);
    install(
        &collection,
        &conj_types,
        vec![("conj", imp("conj", FnArity::exact(2), |args| conj(&args[0], args[1].clone())))],
    );

    let associative = make_protocol(&ns, "IAssociative", &["contains-key?", "assoc"]);
    install(
        &associative,
        &[types::MAP, types::VECTOR, types::NIL],
        vec![
            (
                "contains-key?",
                imp("contains-key?", FnArity::exact(2), |args| match &args[0] {
                    Value::Map(map) => Ok(Value::Bool(map.contains_key(&args[1]))),
                    Value::Vector(vec) => Ok(Value::Bool(matches!(
                        args[1], Value::Int(i) if i >= 0 && (i as usize) < vec.count()
                    ))),
                    _ => Ok(Value::Bool(false)),
                }),
            ),
            (
                "assoc",
                imp("assoc", FnArity::exact(3), |args| match &args[0] {
                    Value::Map(map) => Ok(Value::Map(map.assoc(args[1].clone(), args[2].clone()))),
                    Value::Vector(vec) => match args[1] {
                        Value::Int(i) => Ok(Value::Vector(vec.assoc_n(i, args[2].clone())?)),
                        _ => Err(CinderError::illegal_argument("Key must be integer")),
                    },
                    Value::Nil => Ok(Value::Map(
                        PersistentMap::new().assoc(args[1].clone(), args[2].clone()),
                    )),
                    other => Err(unsupported("assoc", other)),
                }),
            ),
        ],
    );

    let map_protocol = make_protocol(&ns, "IMap", &["dissoc"]);
    install(
        &map_protocol,
        &[types::MAP, types::NIL],
        vec![(
            "dissoc",
            imp("dissoc", FnArity::exact(2), |args| match &args[0] {
                Value::Map(map) => Ok(Value::Map(map.without(&args[1]))),
                _ => Ok(Value::Nil),
            }),
        )],
    );

    let indexed = make_protocol(&ns, "IIndexed", &["nth"]);
    install(
        &indexed,
        &[types::VECTOR, types::LIST, types::SEQ, types::STRING, types::NIL],
        vec![("nth", imp("nth", FnArity::exact(2), |args| rt::nth(&args[0], &args[1])))],
    );

    let lookup = make_protocol(&ns, "ILookup", &["get"]);
    install(
        &lookup,
        &[types::OBJECT],
        vec![(
            "get",
            imp("get", FnArity::range(2, 3), |args| {
                let default = args.get(2).cloned().unwrap_or(Value::Nil);
                Ok(rt::lookup(&args[0], &args[1])?.unwrap_or(default))
            }),
        )],
    );

    let deref = make_protocol(&ns, "IDeref", &["deref"]);
    install(
        &deref,
        &[types::REF, types::VAR],
        vec![(
            "deref",
            imp("deref", FnArity::exact(1), |args| match &args[0] {
                Value::Ref(handle) => Ok(handle.deref()),
                Value::Var(var) => var.deref(),
                other => Err(unsupported("deref", other)),
            }),
        )],
    );

    let meta = make_protocol(&ns, "IMeta", &["meta"]);
    install(
        &meta,
        &[types::OBJECT],
        vec![(
            "meta",
            imp("meta", FnArity::exact(1), |args| {
                let meta = match &args[0] {
                    Value::Var(var) => var.meta(),
                    other => other.meta(),
                };
                Ok(meta.map(Value::Map).unwrap_or(Value::Nil))
            }),
        )],
    );

    let with_meta = make_protocol(&ns, "IWithMeta", &["with-meta"]);
    install(
        &with_meta,
        &[types::LIST, types::VECTOR, types::MAP, types::SET, types::SYMBOL],
        vec![(
            "with-meta",
            imp("with-meta", FnArity::exact(2), |args| {
                let meta = match &args[1] {
                    Value::Map(map) => Some(map.clone()),
                    Value::Nil => None,
                    other => {
                        return Err(CinderError::illegal_argument(format!(
                            "metadata must be a map, got {}",
                            other.type_name()
                        )))
                    }
                };
                args[0]
                    .with_meta(meta)
                    .ok_or_else(|| unsupported("with-meta", &args[0]))
            }),
        )],
    );

    let stack = make_protocol(&ns, "IStack", &["peek", "pop"]);
    install(
        &stack,
        &[types::LIST, types::VECTOR, types::NIL],
        vec![
            (
                "peek",
                imp("peek", FnArity::exact(1), |args| match &args[0] {
                    Value::List(list) => Ok(list.peek().unwrap_or(Value::Nil)),
                    Value::Vector(vec) => Ok(vec.peek().unwrap_or(Value::Nil)),
                    _ => Ok(Value::Nil),
                }),
            ),
            (
                "pop",
                imp("pop", FnArity::exact(1), |args| match &args[0] {
                    Value::List(list) => Ok(Value::List(list.pop()?)),
                    Value::Vector(vec) => Ok(Value::Vector(vec.pop()?)),
                    _ => Ok(Value::Nil),
                }),
            ),
        ],
    );

    let set = make_protocol(&ns, "ISet", &["disj"]);
    install(
        &set,
        &[types::SET],
        vec![(
            "disj",
            imp("disj", FnArity::exact(2), |args| match &args[0] {
                Value::Set(set) => Ok(Value::Set(set.disjoin(&args[1]))),
                other => Err(unsupported("disj", other)),
            }),
        )],
    );

    let seq = make_protocol(&ns, "ISeq", &["first", "rest"]);
    install(
        &seq,
        &seq_types,
        vec![
            ("first", imp("first", FnArity::exact(1), |args| rt::first(&args[0]))),
            ("rest", imp("rest", FnArity::exact(1), |args| rt::rest(&args[0]))),
        ],
    );
    // Types that only implement ISeqable still answer first and rest.
    let steps: [(&str, fn(&Value) -> Result<Value, CinderError>); 2] =
        [("first", rt::first), ("rest", rt::rest)];
    for (name, step) in steps {
        if let Some(func) = seq.function(name) {
            let seqable = seqable.clone();
            func.set_default(imp(name, FnArity::exact(1), move |args| {
                let seqable = seqable
                    .function("seq")
                    .ok_or_else(|| CinderError::illegal_state("seq protocol function is missing"))?;
                step(&seqable.invoke(args)?)
            }));
        }
    }

    let emptyable = make_protocol(&ns, "IEmptyableCollection", &["empty"]);
    install(
        &emptyable,
        &conj_types,
        vec![(
            "empty",
            imp("empty", FnArity::exact(1), |args| {
                Ok(match &args[0] {
                    Value::List(list) => Value::List(PersistentList::new().with_meta(list.meta().cloned())),
                    Value::Vector(vec) => Value::Vector(vec.empty()),
                    Value::Map(map) => Value::Map(map.empty()),
                    Value::Set(set) => Value::Set(set.empty()),
                    Value::Seq(_) => Value::List(PersistentList::new()),
                    _ => Value::Nil,
                })
            }),
        )],
    );

    let vector = make_protocol(&ns, "IVector", &["assoc-n"]);
    install(
        &vector,
        &[types::VECTOR],
        vec![(
            "assoc-n",
            imp("assoc-n", FnArity::exact(3), |args| match (&args[0], &args[1]) {
                (Value::Vector(vec), Value::Int(i)) => Ok(Value::Vector(vec.assoc_n(*i, args[2].clone())?)),
                (Value::Vector(_), _) => Err(CinderError::illegal_argument("Key must be integer")),
                (other, _) => Err(unsupported("assoc-n", other)),
            }),
        )],
    );

    let reversible = make_protocol(&ns, "IReversible", &["rseq"]);
    install(
        &reversible,
        &[types::VECTOR],
        vec![(
            "rseq",
            imp("rseq", FnArity::exact(1), |args| match &args[0] {
                Value::Vector(vec) => Ok(Seq::from_indexed(vec.iter().rev().cloned().collect(), 0)
                    .map(Value::Seq)
                    .unwrap_or(Value::Nil)),
                other => Err(unsupported("rseq", other)),
            }),
        )],
    );

    let map_entry = make_protocol(&ns, "IMapEntry", &["key", "val"]);
    install(
        &map_entry,
        &[types::VECTOR],
        vec![
            ("key", imp("key", FnArity::exact(1), |args| entry_part(&args[0], 0))),
            ("val", imp("val", FnArity::exact(1), |args| entry_part(&args[0], 1))),
        ],
    );

    let reduce = make_protocol(&ns, "IReduce", &["reduce"]);
    install(
        &reduce,
        &seq_types,
        vec![(
            "reduce",
            imp("reduce", FnArity::range(2, 3), |args| {
                let mut items = collections::to_vec(&args[0])?.into_iter();
                let init = match args.get(2) {
                    Some(init) => init.clone(),
                    None => match items.next() {
                        Some(first) => first,
                        None => return call_value(&args[1], Vec::new()),
                    },
                };
                items.try_fold(init, |acc, item| call_value(&args[1], vec![acc, item]))
            }),
        )],
    );

    let kv_reduce = make_protocol(&ns, "IKVReduce", &["kv-reduce"]);
    install(
        &kv_reduce,
        &[types::MAP, types::VECTOR, types::NIL],
        vec![(
            "kv-reduce",
            imp("kv-reduce", FnArity::exact(3), |args| {
                let func = &args[1];
                let init = args[2].clone();
                match &args[0] {
                    Value::Map(map) => map.iter().try_fold(init, |acc, (k, v)| {
                        call_value(func, vec![acc, k.clone(), v.clone()])
                    }),
                    Value::Vector(vec) => vec.iter().enumerate().try_fold(init, |acc, (i, v)| {
                        let index = i64::try_from(i)
                            .map_err(|_| CinderError::index_out_of_bounds("vector index overflow"))?;
                        call_value(func, vec![acc, Value::Int(index), v.clone()])
                    }),
                    _ => Ok(init),
                }
            }),
        )],
    );

    let watchable = make_protocol(&ns, "IWatchable", &["notify-watches", "add-watch", "remove-watch"]);
    install(
        &watchable,
        &[types::REF],
        vec![
            (
                "notify-watches",
                imp("notify-watches", FnArity::exact(3), |args| {
                    as_ref(&args[0], "notify-watches")?.notify_watches(args[1].clone(), args[2].clone())?;
                    Ok(Value::Nil)
                }),
            ),
            (
                "add-watch",
                imp("add-watch", FnArity::exact(3), |args| {
                    Ok(Value::Ref(as_ref(&args[0], "add-watch")?.add_watch(args[1].clone(), args[2].clone())))
                }),
            ),
            (
                "remove-watch",
                imp("remove-watch", FnArity::exact(2), |args| {
                    Ok(Value::Ref(as_ref(&args[0], "remove-watch")?.remove_watch(&args[1])))
                }),
            ),
        ],
    );

    let equiv = make_protocol(&ns, "IEquiv", &["equiv"]);
    install(
        &equiv,
        &[types::OBJECT],
        vec![("equiv", imp("equiv", FnArity::exact(2), |args| Ok(Value::Bool(args[0] == args[1]))))],
    );

    let hash = make_protocol(&ns, "IHash", &["hash"]);
    install(
        &hash,
        &[types::OBJECT],
        vec![(
            "hash",
            imp("hash", FnArity::exact(1), |args| {
                let mut hasher = DefaultHasher::new();
                args[0].hash(&mut hasher);
                Ok(Value::Int(i64::from_ne_bytes(hasher.finish().to_ne_bytes())))
            }),
        )],
    );

    install_transients(&ns);
}

/// `as-transient` and the editing functions of the transient protocols.
fn install_transients(ns: &Namespace) {
    let editable = make_protocol(ns, "IEditableCollection", &["as-transient"]);
    install(
        &editable,
        &[types::VECTOR, types::MAP],
        vec![(
            "as-transient",
            imp("as-transient", FnArity::exact(1), |args| match &args[0] {
                Value::Vector(vec) => Ok(Value::Transient(TransientHandle::from_vector(vec))),
                Value::Map(map) => Ok(Value::Transient(TransientHandle::from_map(map))),
                other => Err(unsupported("as-transient", other)),
            }),
        )],
    );

    let this = |args: &[Value], op: &str| -> Result<TransientHandle, CinderError> {
        match &args[0] {
            Value::Transient(t) => Ok(t.clone()),
            other => Err(unsupported(op, other)),
        }
    };

    let collection = make_protocol(ns, "ITransientCollection", &["conj!", "persistent!"]);
    install(
        &collection,
        &[types::TRANSIENT],
        vec![
            (
                "conj!",
                imp("conj!", FnArity::exact(2), move |args| {
                    let t = this(args, "conj!")?;
                    t.conj(args[1].clone())?;
                    Ok(Value::Transient(t))
                }),
            ),
            (
                "persistent!",
                imp("persistent!", FnArity::exact(1), move |args| this(args, "persistent!")?.persistent()),
            ),
        ],
    );

    let associative = make_protocol(ns, "ITransientAssociative", &["assoc!"]);
    install(
        &associative,
        &[types::TRANSIENT],
        vec![(
            "assoc!",
            imp("assoc!", FnArity::exact(3), move |args| {
                let t = this(args, "assoc!")?;
                t.assoc(args[1].clone(), args[2].clone())?;
                Ok(Value::Transient(t))
            }),
        )],
    );

    let map = make_protocol(ns, "ITransientMap", &["dissoc!"]);
    install(
        &map,
        &[types::TRANSIENT],
        vec![(
            "dissoc!",
            imp("dissoc!", FnArity::exact(2), move |args| {
                let t = this(args, "dissoc!")?;
                t.dissoc(&args[1])?;
                Ok(Value::Transient(t))
            }),
        )],
    );

    let vector = make_protocol(ns, "ITransientVector", &["assoc-n!", "pop!"]);
    install(
        &vector,
        &[types::TRANSIENT],
        vec![
            (
                "assoc-n!",
                imp("assoc-n!", FnArity::exact(3), move |args| {
                    let t = this(args, "assoc-n!")?;
                    match args[1] {
                        Value::Int(i) => t.assoc_n(i, args[2].clone())?,
                        _ => return Err(CinderError::illegal_argument("Key must be integer")),
                    }
                    Ok(Value::Transient(t))
                }),
            ),
            (
                "pop!",
                imp("pop!", FnArity::exact(1), move |args| {
                    let t = this(args, "pop!")?;
                    t.pop()?;
                    Ok(Value::Transient(t))
                }),
            ),
        ],
    );
}

fn as_ref<'a>(value: &'a Value, op: &str) -> Result<&'a RefHandle, CinderError> {
    match value {
        Value::Ref(handle) => Ok(handle),
        other => Err(unsupported(op, other)),
    }
}

/// Slot of a two-element vector used as a map entry.
fn entry_part(value: &Value, slot: usize) -> Result<Value, CinderError> {
    match value {
        Value::Vector(pair) if pair.count() == 2 => Ok(pair.nth(slot).unwrap_or(Value::Nil)),
        other => Err(CinderError::illegal_argument(format!(
            "map entry must be a [key value] vector, got {}",
            other
        ))),
    }
}

fn conj(coll: &Value, item: Value) -> Result<Value, CinderError> {
    match coll {
        Value::List(list) => Ok(Value::List(list.cons(item))),
        Value::Vector(vec) => Ok(Value::Vector(vec.cons(item))),
        Value::Map(map) => Ok(Value::Map(map.cons(&item)?)),
        Value::Set(set) => Ok(Value::Set(set.cons(item))),
        Value::Seq(seq) => Ok(Value::Seq(Seq::cons(item, Some(seq.clone())))),
        Value::Nil => Ok(Value::list(vec![item])),
        other => Err(unsupported("conj", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::runtime::call_value;

    fn protocol_fn(name: &str) -> Value {
        rt::runtime_fn(PROTOCOLS_NS, name).expect("protocol fn")
    }

    #[test]
    fn builtin_collections_count_through_protocol() {
        let count = protocol_fn("count");
        let v = Value::vector(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(call_value(&count, vec![v]).expect("count"), Value::Int(2));
        assert_eq!(call_value(&count, vec![Value::Nil]).expect("count"), Value::Int(0));
    }

    #[test]
    fn conj_adds_at_the_natural_end() {
        let conj = protocol_fn("conj");
        let list = call_value(&conj, vec![Value::list(vec![Value::Int(2)]), Value::Int(1)])
            .expect("conj");
        assert_eq!(list, Value::list(vec![Value::Int(1), Value::Int(2)]));
        let vec = call_value(&conj, vec![Value::vector(vec![Value::Int(1)]), Value::Int(2)])
            .expect("conj");
        assert_eq!(vec, Value::vector(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn numbers_are_not_counted() {
        let count = protocol_fn("count");
        let err = call_value(&count, vec![Value::Int(3)]).expect_err("no impl");
        assert_eq!(err.to_string(), "count not extended to handle: Int");
    }

    #[test]
    fn get_falls_back_for_every_type() {
        let get = protocol_fn("get");
        let found = call_value(&get, vec![Value::Int(1), Value::keyword("a"), Value::Int(9)])
            .expect("get");
        assert_eq!(found, Value::Int(9));
    }

    #[test]
    fn empty_keeps_the_kind_and_metadata() {
        let empty = protocol_fn("empty");
        let meta = PersistentMap::new().assoc(Value::keyword("tag"), Value::Bool(true));
        let tagged = Value::vector(vec![Value::Int(1)]).with_meta(Some(meta.clone())).expect("meta");
        let out = call_value(&empty, vec![tagged]).expect("empty");
        assert!(matches!(&out, Value::Vector(v) if v.is_empty()));
        assert_eq!(out.meta(), Some(meta));
        assert_eq!(call_value(&empty, vec![Value::Nil]).expect("nil"), Value::Nil);
    }

    #[test]
    fn rseq_of_an_empty_vector_is_nil() {
        let rseq = protocol_fn("rseq");
        assert_eq!(call_value(&rseq, vec![Value::vector(vec![])]).expect("rseq"), Value::Nil);
    }

    #[test]
    fn map_entries_need_two_slots() {
        let key = protocol_fn("key");
        let pair = Value::vector(vec![Value::keyword("a"), Value::Int(1)]);
        assert_eq!(call_value(&key, vec![pair]).expect("key"), Value::keyword("a"));
        assert!(call_value(&key, vec![Value::vector(vec![Value::Int(1)])]).is_err());
    }

    #[test]
    fn reduce_without_init_uses_the_first_item() {
        let reduce = protocol_fn("reduce");
        let plus = rt::runtime_fn(rt::CORE_NS, "+").expect("plus");
        let items = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(call_value(&reduce, vec![items.clone(), plus.clone()]).expect("sum"), Value::Int(6));
        assert_eq!(
            call_value(&reduce, vec![items, plus.clone(), Value::Int(10)]).expect("sum"),
            Value::Int(16)
        );
        assert_eq!(call_value(&reduce, vec![Value::Nil, plus]).expect("empty"), Value::Int(0));
    }
}
