use std::sync::Arc;

use crate::ast::Value;
use crate::collections::PersistentList;

/// Immutable traversal cursor. Holding a `Seq` never consumes the
/// underlying collection, so a traversal can restart from any point.
#[derive(Clone)]
pub struct Seq(SeqInner);

#[derive(Clone)]
enum SeqInner {
    List(PersistentList),
    Indexed { items: im::Vector<Value>, pos: usize },
    Cons(Arc<ConsCell>),
}

struct ConsCell {
    first: Value,
    rest: Option<Seq>,
}

impl Drop for ConsCell {
    // Unlink iteratively so dropping a long chain does not recurse.
    fn drop(&mut self) {
        let mut next = self.rest.take();
        while let Some(Seq(SeqInner::Cons(cell))) = next {
            match Arc::try_unwrap(cell) {
                Ok(mut inner) => next = inner.rest.take(),
                Err(_) => break,
            }
        }
    }
}

impl Seq {
    /// `list` must be non-empty.
    pub(crate) fn from_list(list: PersistentList) -> Seq {
        debug_assert!(!list.is_empty());
        Seq(SeqInner::List(list))
    }

    pub fn from_indexed(items: im::Vector<Value>, pos: usize) -> Option<Seq> {
        if pos < items.len() {
            Some(Seq(SeqInner::Indexed { items, pos }))
        } else {
            None
        }
    }

    pub fn cons(first: Value, rest: Option<Seq>) -> Seq {
        Seq(SeqInner::Cons(Arc::new(ConsCell { first, rest })))
    }

    pub fn first(&self) -> Value {
        match &self.0 {
            SeqInner::List(list) => list.first().cloned().unwrap_or(Value::Nil),
            SeqInner::Indexed { items, pos } => items.get(*pos).cloned().unwrap_or(Value::Nil),
            SeqInner::Cons(cell) => cell.first.clone(),
        }
    }

    pub fn next(&self) -> Option<Seq> {
        match &self.0 {
            SeqInner::List(list) => list.rest().seq(),
            SeqInner::Indexed { items, pos } => Seq::from_indexed(items.clone(), pos + 1),
            SeqInner::Cons(cell) => cell.rest.clone(),
        }
    }

    pub fn count(&self) -> usize {
        match &self.0 {
            SeqInner::List(list) => list.count(),
            SeqInner::Indexed { items, pos } => items.len() - pos,
            SeqInner::Cons(_) => self.iter().count(),
        }
    }

    pub fn iter(&self) -> SeqIter {
        SeqIter {
            cursor: Some(self.clone()),
        }
    }

    pub fn to_list(&self) -> PersistentList {
        match &self.0 {
            SeqInner::List(list) => list.clone(),
            _ => PersistentList::from_vec(self.iter().collect()),
        }
    }
}

pub struct SeqIter {
    cursor: Option<Seq>,
}

impl Iterator for SeqIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let current = self.cursor.take()?;
        let value = current.first();
        self.cursor = current.next();
        Some(value)
    }
}
