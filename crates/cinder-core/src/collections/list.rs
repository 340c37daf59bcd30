use std::fmt;
use std::sync::Arc;

use crate::ast::Value;
use crate::collections::{PersistentMap, Seq};
use crate::error::CinderError;

struct Node {
    first: Value,
    rest: Option<Arc<Node>>,
    count: usize,
}

impl Drop for Node {
    // Unlink iteratively so dropping a long list does not recurse.
    fn drop(&mut self) {
        let mut next = self.rest.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut inner) => next = inner.rest.take(),
                Err(_) => break,
            }
        }
    }
}

/// Singly linked persistent list. `cons` prepends and shares the tail.
#[derive(Clone, Default)]
pub struct PersistentList {
    head: Option<Arc<Node>>,
    meta: Option<PersistentMap>,
}

impl PersistentList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        items
            .into_iter()
            .rev()
            .fold(PersistentList::new(), |acc, item| acc.cons(item))
    }

    pub fn count(&self) -> usize {
        self.head.as_ref().map_or(0, |node| node.count)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn cons(&self, value: Value) -> Self {
        let count = self.count() + 1;
        Self {
            head: Some(Arc::new(Node {
                first: value,
                rest: self.head.clone(),
                count,
            })),
            meta: self.meta.clone(),
        }
    }

    pub fn first(&self) -> Option<&Value> {
        self.head.as_ref().map(|node| &node.first)
    }

    /// Tail without metadata; empty when the list has one element or none.
    pub fn rest(&self) -> PersistentList {
        PersistentList {
            head: self.head.as_ref().and_then(|node| node.rest.clone()),
            meta: None,
        }
    }

    pub fn peek(&self) -> Option<Value> {
        self.first().cloned()
    }

    pub fn pop(&self) -> Result<PersistentList, CinderError> {
        if self.is_empty() {
            return Err(CinderError::illegal_state("Can't pop empty list"));
        }
        Ok(PersistentList {
            head: self.head.as_ref().and_then(|node| node.rest.clone()),
            meta: self.meta.clone(),
        })
    }

    pub fn nth(&self, index: usize) -> Option<Value> {
        self.iter().nth(index)
    }

    pub fn iter(&self) -> ListIter {
        ListIter {
            node: self.head.clone(),
        }
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().collect()
    }

    pub fn seq(&self) -> Option<Seq> {
        if self.is_empty() {
            None
        } else {
            Some(Seq::from_list(self.clone()))
        }
    }

    pub fn meta(&self) -> Option<&PersistentMap> {
        self.meta.as_ref()
    }

    pub fn with_meta(&self, meta: Option<PersistentMap>) -> Self {
        Self {
            head: self.head.clone(),
            meta,
        }
    }

    pub fn ptr_eq(&self, other: &PersistentList) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

pub struct ListIter {
    node: Option<Arc<Node>>,
}

impl Iterator for ListIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let node = self.node.take()?;
        self.node = node.rest.clone();
        Some(node.first.clone())
    }
}

impl FromIterator<Value> for PersistentList {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        PersistentList::from_vec(iter.into_iter().collect())
    }
}

impl fmt::Debug for PersistentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::value_format::format_value(&Value::List(self.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cons_prepends_and_shares_tail() {
        let base = PersistentList::from_vec(vec![Value::Int(2), Value::Int(3)]);
        let grown = base.cons(Value::Int(1));
        assert_eq!(grown.to_vec(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(base.count(), 2);
        assert!(grown.rest().ptr_eq(&base));
    }

    #[test]
    fn long_lists_drop_without_overflow() {
        let mut list = PersistentList::new();
        for i in 0..200_000 {
            list = list.cons(Value::Int(i));
        }
        assert_eq!(list.count(), 200_000);
        drop(list);
    }

    #[test]
    fn pop_on_empty_fails() {
        assert!(PersistentList::new().pop().is_err());
    }
}
