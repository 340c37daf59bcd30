use cinder_core::collections::{PersistentList, PersistentMap, PersistentSet, PersistentVector};
use cinder_core::{CinderError, Value};
use proptest::prelude::*;

fn int_vector(items: &[i64]) -> PersistentVector {
    PersistentVector::from_vec(items.iter().map(|n| Value::Int(*n)).collect())
}

proptest! {
    #[test]
    fn assoc_n_replaces_one_slot(items in prop::collection::vec(any::<i64>(), 1..40), pick in any::<prop::sample::Index>(), x in any::<i64>()) {
        let vec = int_vector(&items);
        let idx = pick.index(items.len());
        let updated = vec.assoc_n(idx as i64, Value::Int(x)).unwrap();
        prop_assert_eq!(updated.count(), items.len());
        prop_assert_eq!(updated.nth(idx), Some(Value::Int(x)));
        for (i, original) in items.iter().enumerate().filter(|(i, _)| *i != idx) {
            prop_assert_eq!(updated.nth(i), Some(Value::Int(*original)));
        }
        prop_assert_eq!(vec.nth(idx), Some(Value::Int(items[idx])));
    }

    #[test]
    fn cons_appends_at_the_old_count(items in prop::collection::vec(any::<i64>(), 0..40), x in any::<i64>()) {
        let vec = int_vector(&items);
        let grown = vec.cons(Value::Int(x));
        prop_assert_eq!(grown.count(), items.len() + 1);
        prop_assert_eq!(grown.nth(items.len()), Some(Value::Int(x)));
        prop_assert_eq!(vec.count(), items.len());
    }

    #[test]
    fn map_assoc_then_without_restores_the_count(keys in prop::collection::hash_set(0i64..1000, 0..30), extra in 1000i64..2000) {
        let map = PersistentMap::from_pairs(keys.iter().map(|k| (Value::Int(*k), Value::Int(k * 2))));
        let grown = map.assoc(Value::Int(extra), Value::Nil);
        prop_assert_eq!(grown.count(), keys.len() + 1);
        prop_assert!(grown.contains_key(&Value::Int(extra)));
        prop_assert_eq!(Value::Map(grown.without(&Value::Int(extra))), Value::Map(map));
    }
}

#[test]
fn assoc_n_at_count_appends_and_past_it_fails() {
    let vec = int_vector(&[1, 2]);
    assert_eq!(
        Value::Vector(vec.assoc_n(2, Value::Int(3)).expect("append")),
        Value::Vector(int_vector(&[1, 2, 3]))
    );
    let err = vec.assoc_n(3, Value::Int(4)).expect_err("gap");
    assert!(matches!(err, CinderError::IndexOutOfBounds(_)));
    assert!(vec.assoc_n(-1, Value::Int(0)).is_err());
}

#[test]
fn list_cons_prepends_and_pop_of_empty_fails() {
    let list = PersistentList::from_vec(vec![Value::Int(2), Value::Int(3)]);
    let grown = list.cons(Value::Int(1));
    assert_eq!(grown.first(), Some(&Value::Int(1)));
    assert_eq!(grown.count(), 3);
    assert_eq!(Value::List(grown.rest()), Value::List(list));
    assert!(PersistentList::new().pop().is_err());
}

#[test]
fn vector_pop_drops_the_tail() {
    let vec = int_vector(&[1, 2, 3]);
    assert_eq!(vec.peek(), Some(Value::Int(3)));
    assert_eq!(Value::Vector(vec.pop().expect("pop")), Value::Vector(int_vector(&[1, 2])));
    assert!(PersistentVector::new().pop().is_err());
}

#[test]
fn map_cons_accepts_pairs_and_maps() {
    let map = PersistentMap::new();
    let entry = Value::vector(vec![Value::keyword("a"), Value::Int(1)]);
    let with_a = map.cons(&entry).expect("pair");
    assert_eq!(with_a.val_at(&Value::keyword("a")), Some(Value::Int(1)));

    let other = Value::Map(PersistentMap::new().assoc(Value::keyword("b"), Value::Int(2)));
    let merged = with_a.cons(&other).expect("map");
    assert_eq!(merged.count(), 2);
    assert!(map.cons(&Value::Int(3)).is_err());
}

#[test]
fn sets_ignore_duplicates() {
    let set = PersistentSet::from_vec(vec![Value::Int(1), Value::Int(1), Value::Int(2)]);
    assert_eq!(set.count(), 2);
    assert_eq!(Value::Set(set.cons(Value::Int(2))), Value::Set(set.clone()));
    assert!(!set.disjoin(&Value::Int(1)).contains(&Value::Int(1)));
}

#[test]
fn equality_ignores_metadata_and_sequential_kind() {
    let meta = PersistentMap::new().assoc(Value::keyword("tag"), Value::Bool(true));
    let plain = Value::vector(vec![Value::Int(1), Value::Int(2)]);
    let tagged = plain.with_meta(Some(meta)).expect("vectors hold metadata");
    assert_eq!(plain, tagged);
    assert_eq!(plain, Value::list(vec![Value::Int(1), Value::Int(2)]));
}
