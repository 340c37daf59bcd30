use std::fmt;

use crate::ast::Value;
use crate::collections::{PersistentMap, Seq};
use crate::error::CinderError;

/// Persistent vector backed by an RRB tree.
#[derive(Clone, Default)]
pub struct PersistentVector {
    items: im::Vector<Value>,
    meta: Option<PersistentMap>,
}

impl PersistentVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self {
            items: items.into_iter().collect(),
            meta: None,
        }
    }

    pub(crate) fn from_im(items: im::Vector<Value>) -> Self {
        Self { items, meta: None }
    }

    pub(crate) fn to_im(&self) -> im::Vector<Value> {
        self.items.clone()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn nth(&self, index: usize) -> Option<Value> {
        self.items.get(index).cloned()
    }

    pub fn nth_checked(&self, index: i64) -> Result<Value, CinderError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.nth(i))
            .ok_or_else(|| {
                CinderError::index_out_of_bounds(format!(
                    "index {} out of range for vector of {}",
                    index,
                    self.count()
                ))
            })
    }

    /// Replaces slot `index`, or appends when `index == count`.
    pub fn assoc_n(&self, index: i64, value: Value) -> Result<PersistentVector, CinderError> {
        let len = self.count();
        let slot = usize::try_from(index).ok().filter(|i| *i <= len).ok_or_else(|| {
            CinderError::index_out_of_bounds(format!(
                "assocN index {} out of range for vector of {}",
                index, len
            ))
        })?;
        if slot == len {
            return Ok(self.cons(value));
        }
        Ok(Self {
            items: self.items.update(slot, value),
            meta: self.meta.clone(),
        })
    }

    /// Appends at the tail.
    pub fn cons(&self, value: Value) -> PersistentVector {
        let mut items = self.items.clone();
        items.push_back(value);
        Self {
            items,
            meta: self.meta.clone(),
        }
    }

    pub fn peek(&self) -> Option<Value> {
        self.items.last().cloned()
    }

    pub fn pop(&self) -> Result<PersistentVector, CinderError> {
        if self.items.is_empty() {
            return Err(CinderError::illegal_state("Can't pop empty vector"));
        }
        let mut items = self.items.clone();
        items.pop_back();
        Ok(Self {
            items,
            meta: self.meta.clone(),
        })
    }

    pub fn empty(&self) -> PersistentVector {
        Self {
            items: im::Vector::new(),
            meta: self.meta.clone(),
        }
    }

    pub fn iter(&self) -> im::vector::Iter<'_, Value> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.items.iter().cloned().collect()
    }

    pub fn seq(&self) -> Option<Seq> {
        Seq::from_indexed(self.items.clone(), 0)
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

    pub fn ptr_eq(&self, other: &PersistentVector) -> bool {
        self.items.ptr_eq(&other.items)
    }
}

impl FromIterator<Value> for PersistentVector {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
            meta: None,
        }
    }
}

impl fmt::Debug for PersistentVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::value_format::format_value(&Value::Vector(self.clone())))
    }
}
