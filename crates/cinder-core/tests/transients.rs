mod common;

use cinder_core::Value;
use common::eval_in;

#[test]
fn vector_transients_edit_in_place_then_freeze() {
    let src = "(def source [1 2])
               (def t (as-transient source))
               (conj! t 3)
               (assoc-n! t 0 0)
               (pop! (conj! t 4))
               [(count t) (get t 2) (persistent! t) source]";
    let out = eval_in("transient-test.vector", src).expect("eval");
    let expected = eval_in("transient-test.vector", "[3 3 [0 2 3] [1 2]]").expect("expected");
    assert_eq!(out, expected);

    let err = eval_in("transient-test.vector", "(count t)").expect_err("count after persistent!");
    assert!(err.to_string().contains("after persistent!"));
}

#[test]
fn map_transients_support_assoc_and_dissoc() {
    let src = "(persistent! (dissoc! (assoc! (conj! (as-transient {:a 1}) [:c 3]) :b 2) :a))";
    let out = eval_in("transient-test.map", src).expect("eval");
    let expected = eval_in("transient-test.map", "{:b 2 :c 3}").expect("expected");
    assert_eq!(out, expected);
}

#[test]
fn dead_transients_raise_illegal_state() {
    let src = "(def t (as-transient []))
               (persistent! t)
               (try (conj! t 1) (catch IllegalStateException e :dead))";
    assert_eq!(
        eval_in("transient-test.dead", src).expect("caught"),
        Value::keyword("dead")
    );
}

#[test]
fn lists_have_no_transient_form() {
    let err = eval_in("transient-test.list", "(as-transient '(1 2))").expect_err("no transient list");
    assert_eq!(err.to_string(), "as-transient not extended to handle: PersistentList");
}
