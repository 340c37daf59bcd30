use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::ast::Value;
use crate::collections::{PersistentMap, PersistentVector};
use crate::error::CinderError;

/// Storage of a live transient. `im` collections are edited in place while
/// the transient holds the only copy.
enum TransientKind {
    Vector(im::Vector<Value>),
    Map(im::HashMap<Value, Value>),
}

struct TransientState {
    kind: Option<TransientKind>,
    owner: ThreadId,
}

/// Editable vector or map handed out by `as-transient`. Every edit mutates
/// the shared state and returns the same handle. `persistent!` ends its life.
#[derive(Clone)]
pub struct TransientHandle {
    state: Arc<Mutex<TransientState>>,
}

impl TransientHandle {
    fn new(kind: TransientKind) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransientState {
                kind: Some(kind),
                owner: thread::current().id(),
            })),
        }
    }

    pub fn from_vector(vec: &PersistentVector) -> Self {
        Self::new(TransientKind::Vector(vec.to_im()))
    }

    pub fn from_map(map: &PersistentMap) -> Self {
        Self::new(TransientKind::Map(map.to_im()))
    }

    /// Runs `f` on the live storage. Fails after `persistent!` and on
    /// threads other than the creator.
    fn edit<R>(
        &self,
        op: &str,
        f: impl FnOnce(&mut TransientKind) -> Result<R, CinderError>,
    ) -> Result<R, CinderError> {
        let mut guard = self.guard(op)?;
        let kind = guard
            .kind
            .as_mut()
            .ok_or_else(|| CinderError::illegal_state(format!("{} on transient after persistent!", op)))?;
        f(kind)
    }

    fn guard(&self, op: &str) -> Result<MutexGuard<'_, TransientState>, CinderError> {
        let guard = self.state.lock().unwrap();
        if guard.owner != thread::current().id() {
            return Err(CinderError::illegal_state(format!(
                "{} on transient from another thread",
                op
            )));
        }
        Ok(guard)
    }

    pub fn is_vector(&self) -> bool {
        matches!(self.state.lock().unwrap().kind, Some(TransientKind::Vector(_)))
    }

    pub fn count(&self) -> Result<usize, CinderError> {
        self.edit("count", |kind| {
            Ok(match kind {
                TransientKind::Vector(items) => items.len(),
                TransientKind::Map(entries) => entries.len(),
            })
        })
    }

    pub fn val_at(&self, key: &Value) -> Result<Option<Value>, CinderError> {
        self.edit("get", |kind| {
            Ok(match (kind, key) {
                (TransientKind::Vector(items), Value::Int(i)) => {
                    usize::try_from(*i).ok().and_then(|i| items.get(i).cloned())
                }
                (TransientKind::Vector(_), _) => None,
                (TransientKind::Map(entries), key) => entries.get(key).cloned(),
            })
        })
    }

    /// Appends to a vector; a map takes a `[k v]` pair or another map.
    pub fn conj(&self, item: Value) -> Result<(), CinderError> {
        self.edit("conj!", |kind| {
            match kind {
                TransientKind::Vector(items) => items.push_back(item),
                TransientKind::Map(entries) => match item {
                    Value::Vector(pair) if pair.count() == 2 => {
                        let key = pair.nth(0).unwrap_or(Value::Nil);
                        entries.insert(key, pair.nth(1).unwrap_or(Value::Nil));
                    }
                    Value::Map(other) => {
                        for (k, v) in other.iter() {
                            entries.insert(k.clone(), v.clone());
                        }
                    }
                    Value::Nil => {}
                    other => {
                        return Err(CinderError::illegal_argument(format!(
                            "map entry must be a [key value] vector, got {}",
                            other.type_name()
                        )))
                    }
                },
            }
            Ok(())
        })
    }

    pub fn assoc(&self, key: Value, value: Value) -> Result<(), CinderError> {
        match key {
            Value::Int(i) if self.is_vector() => self.assoc_n(i, value),
            key => self.edit("assoc!", |kind| match kind {
                TransientKind::Map(entries) => {
                    entries.insert(key, value);
                    Ok(())
                }
                TransientKind::Vector(_) => Err(CinderError::illegal_argument("Key must be integer")),
            }),
        }
    }

    /// Replaces slot `index`, or appends when `index` equals the count.
    pub fn assoc_n(&self, index: i64, value: Value) -> Result<(), CinderError> {
        self.edit("assoc-n!", |kind| {
            let TransientKind::Vector(items) = kind else {
                return Err(CinderError::illegal_argument("assoc-n! expects a transient vector"));
            };
            let len = items.len();
            match usize::try_from(index).ok().filter(|i| *i <= len) {
                Some(slot) if slot == len => items.push_back(value),
                Some(slot) => {
                    items.set(slot, value);
                }
                None => {
                    return Err(CinderError::index_out_of_bounds(format!(
                        "assoc-n! index {} out of range for transient of {}",
                        index, len
                    )))
                }
            }
            Ok(())
        })
    }

    pub fn dissoc(&self, key: &Value) -> Result<(), CinderError> {
        self.edit("dissoc!", |kind| match kind {
            TransientKind::Map(entries) => {
                entries.remove(key);
                Ok(())
            }
            TransientKind::Vector(_) => {
                Err(CinderError::illegal_argument("dissoc! expects a transient map"))
            }
        })
    }

    pub fn pop(&self) -> Result<(), CinderError> {
        self.edit("pop!", |kind| match kind {
            TransientKind::Vector(items) => items
                .pop_back()
                .map(|_| ())
                .ok_or_else(|| CinderError::illegal_state("Can't pop empty vector")),
            TransientKind::Map(_) => Err(CinderError::illegal_argument("pop! expects a transient vector")),
        })
    }

    /// Freezes the contents into a persistent collection. The handle is dead
    /// afterwards.
    pub fn persistent(&self) -> Result<Value, CinderError> {
        let mut guard = self.guard("persistent!")?;
        match guard.kind.take() {
            Some(TransientKind::Vector(items)) => Ok(Value::Vector(PersistentVector::from_im(items))),
            Some(TransientKind::Map(entries)) => Ok(Value::Map(PersistentMap::from_im(entries))),
            None => Err(CinderError::illegal_state("transient already persisted")),
        }
    }

    pub fn ptr_eq(&self, other: &TransientHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.state) as *const u8 as usize
    }
}

impl fmt::Debug for TransientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        match &state.kind {
            Some(TransientKind::Vector(items)) => write!(f, "TransientVector({})", items.len()),
            Some(TransientKind::Map(entries)) => write!(f, "TransientMap({})", entries.len()),
            None => f.write_str("Transient(persisted)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edits_do_not_touch_the_source_vector() {
        let source = PersistentVector::from_vec(vec![Value::Int(1), Value::Int(2)]);
        let t = TransientHandle::from_vector(&source);
        t.conj(Value::Int(3)).expect("conj");
        t.assoc_n(0, Value::Int(10)).expect("assoc");
        t.pop().expect("pop");
        assert_eq!(t.count().expect("count"), 2);
        let out = t.persistent().expect("persist");
        assert_eq!(out, Value::vector(vec![Value::Int(10), Value::Int(2)]));
        assert_eq!(source.count(), 2);
        assert_eq!(source.nth(0), Some(Value::Int(1)));
    }

    #[test]
    fn map_transients_assoc_and_dissoc() {
        let source = PersistentMap::new().assoc(Value::keyword("a"), Value::Int(1));
        let t = TransientHandle::from_map(&source);
        t.assoc(Value::keyword("b"), Value::Int(2)).expect("assoc");
        t.conj(Value::vector(vec![Value::keyword("c"), Value::Int(3)])).expect("conj");
        t.dissoc(&Value::keyword("a")).expect("dissoc");
        assert_eq!(t.val_at(&Value::keyword("c")).expect("get"), Some(Value::Int(3)));
        let Value::Map(out) = t.persistent().expect("persist") else {
            panic!("expected a map");
        };
        assert_eq!(out.count(), 2);
        assert!(!out.contains_key(&Value::keyword("a")));
        assert!(source.contains_key(&Value::keyword("a")));
    }

    #[test]
    fn persisted_transients_reject_further_edits() {
        let t = TransientHandle::from_vector(&PersistentVector::new());
        t.persistent().expect("persist");
        let err = t.conj(Value::Int(1)).expect_err("dead");
        assert!(matches!(err, CinderError::IllegalState(_)));
        assert!(t.persistent().is_err());
    }

    #[test]
    fn assoc_n_past_the_end_fails() {
        let t = TransientHandle::from_vector(&PersistentVector::from_vec(vec![Value::Int(1)]));
        assert!(matches!(
            t.assoc_n(3, Value::Nil),
            Err(CinderError::IndexOutOfBounds(_))
        ));
        t.assoc_n(1, Value::Int(2)).expect("append at count");
        assert_eq!(t.count().expect("count"), 2);
    }

    #[test]
    fn other_threads_cannot_edit() {
        let t = TransientHandle::from_vector(&PersistentVector::new());
        let remote = t.clone();
        let err = std::thread::spawn(move || remote.conj(Value::Int(1)))
            .join()
            .expect("join")
            .expect_err("foreign thread");
        assert!(err.to_string().contains("another thread"));
        t.conj(Value::Int(1)).expect("owner");
    }
}
