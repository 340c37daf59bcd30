mod common;

use cinder_core::ast::{FnArity, NativeFn};
use cinder_core::namespaces::find_or_create_namespace;
use cinder_core::protocol::make_protocol;
use cinder_core::types::{self, define_type, make_instance};
use cinder_core::{CinderError, Value};
use common::{compiler, read_all};

fn returns(value: Value) -> Value {
    Value::native(NativeFn::new(FnArity::at_least(1), move |_| Ok(value.clone())))
}

#[test]
fn extending_again_replaces_the_implementation() {
    let ns = find_or_create_namespace("proto-itest.replace");
    let protocol = make_protocol(&ns, "IShape", &["area"]);
    let area = protocol.function("area").expect("area");
    let square = define_type("ProtoSquare", &[]).expect("type");
    let shape = make_instance(square, &[]);

    area.extend(square, returns(Value::Int(1)));
    assert_eq!(area.invoke(&[shape.clone()]).expect("first"), Value::Int(1));
    area.extend(square, returns(Value::Int(2)));
    assert_eq!(area.invoke(&[shape]).expect("second"), Value::Int(2));
}

#[test]
fn default_applies_only_once_installed() {
    let ns = find_or_create_namespace("proto-itest.default");
    let protocol = make_protocol(&ns, "IDescribe", &["describe"]);
    let describe = protocol.function("describe").expect("describe");

    let err = describe.invoke(&[Value::Int(5)]).expect_err("not extended");
    assert!(matches!(err, CinderError::Dispatch { .. }));
    assert_eq!(err.to_string(), "describe not extended to handle: Int");

    describe.set_default(returns(Value::keyword("fallback")));
    assert_eq!(
        describe.invoke(&[Value::Int(5)]).expect("default"),
        Value::keyword("fallback")
    );
}

#[test]
fn children_inherit_until_they_override() {
    let ns = find_or_create_namespace("proto-itest.inherit");
    let protocol = make_protocol(&ns, "ISpeak", &["speak"]);
    let speak = protocol.function("speak").expect("speak");
    let animal = define_type("ProtoAnimal", &[]).expect("type");
    let dog = define_type("ProtoDog", &[animal]).expect("type");

    speak.extend(animal, returns(Value::string("...")));
    let rex = make_instance(dog, &[]);
    assert_eq!(speak.invoke(&[rex.clone()]).expect("inherited"), Value::string("..."));

    speak.extend(dog, returns(Value::string("woof")));
    assert_eq!(speak.invoke(&[rex]).expect("override"), Value::string("woof"));
    let generic = make_instance(animal, &[]);
    assert_eq!(speak.invoke(&[generic]).expect("parent"), Value::string("..."));
}

#[test]
fn builtin_types_dispatch_through_the_side_table() {
    let ns = find_or_create_namespace("proto-itest.builtin");
    let protocol = make_protocol(&ns, "ISize", &["size"]);
    let size = protocol.function("size").expect("size");
    size.extend(types::VECTOR, returns(Value::keyword("vec")));
    assert_eq!(
        size.invoke(&[Value::vector(vec![])]).expect("vector"),
        Value::keyword("vec")
    );
    assert!(size.invoke(&[Value::string("s")]).is_err());
}

#[test]
fn bulk_extension_with_an_unknown_name_installs_nothing() {
    let ns = find_or_create_namespace("proto-itest.bulk");
    let protocol = make_protocol(&ns, "IPair", &["left", "right"]);
    let pair = define_type("ProtoPair", &[]).expect("type");
    let impls = vec![
        ("left".to_string(), returns(Value::Int(1))),
        ("middle".to_string(), returns(Value::Int(2))),
    ];
    let err = protocol.extend_for_type(pair, &impls).expect_err("unknown name");
    assert!(err.to_string().contains("middle"));
    let left = protocol.function("left").expect("left");
    assert!(!left.is_extended_by(pair));
    assert!(!protocol.is_implemented_by(pair));
}

#[test]
fn satisfies_tracks_implementors_and_their_subtypes() {
    let ns = find_or_create_namespace("proto-itest.satisfies");
    let protocol = make_protocol(&ns, "IClose", &["close"]);
    let resource = define_type("ProtoResource", &[]).expect("type");
    let file = define_type("ProtoFile", &[resource]).expect("type");
    let other = define_type("ProtoOther", &[]).expect("type");

    protocol
        .extend_for_type(resource, &[("close".to_string(), returns(Value::Nil))])
        .expect("extend");
    assert!(protocol.satisfies(&make_instance(file, &[])));
    assert!(!protocol.satisfies(&make_instance(other, &[])));
}

#[test]
fn type_methods_can_back_a_protocol() {
    let ns = find_or_create_namespace("proto-itest.methods");
    let protocol = make_protocol(&ns, "IName", &["label"]);
    let widget = define_type("ProtoWidget", &[]).expect("type");
    types::set_type_attr(widget, "label", returns(Value::string("widget"))).expect("attr");

    protocol.extend_from_type_methods(widget).expect("extend");
    let label = protocol.function("label").expect("label");
    assert_eq!(
        label.invoke(&[make_instance(widget, &[])]).expect("dispatch"),
        Value::string("widget")
    );
}

#[test]
fn compiled_code_extends_and_calls_protocol_functions() {
    let mut c = compiler("proto-itest.compiled");
    make_protocol(c.ns(), "IGreet", &["greet"]);
    let src = "(def Greeter (make-type \"ProtoGreeter\" []))
               (. greet extend Greeter (fn* [self] (.-message self)))
               (. greet extend (type 0) (fn* [n] (+ n 1)))
               [(greet (Greeter \"hi\")) (greet 41)]";
    let mut last = Value::Nil;
    for form in read_all(src) {
        last = c.eval(&form).expect("eval");
    }
    assert_eq!(
        last,
        Value::vector(vec![Value::string("hi"), Value::Int(42)])
    );
}

#[test]
fn collection_protocols_answer_from_compiled_code() {
    let src = "[(first [1 2]) (rest [1 2]) (empty [1 2]) (assoc-n [1 2] 0 9) (rseq [1 2 3])
                (key [:a 1]) (val [:a 1]) (reduce [1 2 3] +) (reduce [] +)
                (kv-reduce {:a 1 :b 2} (fn* [acc k v] (+ acc v)) 0)]";
    let out = common::eval_in("proto-itest.core", src).expect("eval");
    let expected = common::eval_in(
        "proto-itest.core",
        "[1 '(2) [] [9 2] '(3 2 1) :a 1 6 0 3]",
    )
    .expect("expected");
    assert_eq!(out, expected);
}

#[test]
fn seqable_types_get_first_and_rest() {
    let src = "(def Bag (make-type \"ProtoBag\" []))
               (. seq extend Bag (fn* [self] (seq (.-message self))))
               [(first (Bag [7 8])) (first (rest (Bag [7 8])))]";
    let out = common::eval_in("proto-itest.seqable", src).expect("eval");
    assert_eq!(out, Value::vector(vec![Value::Int(7), Value::Int(8)]));
}

#[test]
fn equiv_lets_user_types_define_equality() {
    let src = "(def Point (make-type \"ProtoPoint\" []))
               (. equiv extend Point (fn* [a b] (= (.-message a) (.-message b))))
               [(= (Point 1) (Point 1)) (= (Point 1) (Point 2)) (identical? (Point 1) (Point 1))]";
    let out = common::eval_in("proto-itest.equiv", src).expect("eval");
    assert_eq!(
        out,
        Value::vector(vec![Value::Bool(true), Value::Bool(false), Value::Bool(false)])
    );
}

#[test]
fn equal_values_hash_alike() {
    let src = "[(= (hash [1 2]) (hash '(1 2))) (= (hash {:a 1}) (hash {:a 1})) (= (hash 1) (hash 2))]";
    let out = common::eval_in("proto-itest.hash", src).expect("eval");
    assert_eq!(
        out,
        Value::vector(vec![Value::Bool(true), Value::Bool(true), Value::Bool(false)])
    );
}

#[test]
fn notify_watches_calls_every_watch() {
    let src = "(def a (atom 1))
               (def seen (atom nil))
               (add-watch a :w (fn* [k r old new] (reset! seen [k old new])))
               (notify-watches a 5 6)
               (deref seen)";
    let out = common::eval_in("proto-itest.watch", src).expect("eval");
    assert_eq!(
        out,
        Value::vector(vec![Value::keyword("w"), Value::Int(5), Value::Int(6)])
    );
}
