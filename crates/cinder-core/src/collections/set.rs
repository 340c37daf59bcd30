use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::ast::Value;
use crate::collections::{PersistentMap, Seq};

#[derive(Clone, Default)]
pub struct PersistentSet {
    items: im::HashSet<Value>,
    meta: Option<PersistentMap>,
}

impl PersistentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self {
            items: items.into_iter().collect(),
            meta: None,
        }
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cons(&self, value: Value) -> PersistentSet {
        Self {
            items: self.items.update(value),
            meta: self.meta.clone(),
        }
    }

    pub fn disjoin(&self, value: &Value) -> PersistentSet {
        if !self.items.contains(value) {
            return self.clone();
        }
        Self {
            items: self.items.without(value),
            meta: self.meta.clone(),
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.items.contains(value)
    }

    pub fn iter(&self) -> im::hashset::Iter<'_, Value> {
        self.items.iter()
    }

    pub fn seq(&self) -> Option<Seq> {
        Seq::from_indexed(self.items.iter().cloned().collect(), 0)
    }

    pub fn empty(&self) -> PersistentSet {
        Self {
            items: im::HashSet::new(),
            meta: self.meta.clone(),
        }
    }

    pub fn meta(&self) -> Option<&PersistentMap> {
        self.meta.as_ref()
    }

    pub fn with_meta(&self, meta: Option<PersistentMap>) -> Self {
        Self {
            items: self.items.clone(),
            meta,
        }
    }

    pub fn ptr_eq(&self, other: &PersistentSet) -> bool {
        self.items.ptr_eq(&other.items)
    }

    pub fn unordered_hash(&self) -> u64 {
        self.items.iter().fold(0u64, |acc, item| {
            let mut hasher = DefaultHasher::new();
            item.hash(&mut hasher);
            acc.wrapping_add(hasher.finish())
        })
    }
}

impl PartialEq for PersistentSet {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl fmt::Debug for PersistentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::value_format::format_value(&Value::Set(self.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cons_is_idempotent_for_members() {
        let s = PersistentSet::new().cons(Value::Int(1)).cons(Value::Int(1));
        assert_eq!(s.count(), 1);
        assert!(s.contains(&Value::Int(1)));
    }

    #[test]
    fn disjoin_returns_new_set() {
        let s = PersistentSet::from_vec(vec![Value::Int(1), Value::Int(2)]);
        let smaller = s.disjoin(&Value::Int(1));
        assert_eq!(smaller.count(), 1);
        assert_eq!(s.count(), 2);
    }
}
