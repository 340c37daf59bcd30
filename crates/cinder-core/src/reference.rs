use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::ast::Value;
use crate::collections::PersistentMap;
use crate::error::CinderError;
use crate::vm::runtime::call_value;

/// Mutable reference with an optional validator and watchers. Updates are
/// compare-and-commit against a version counter, so no lock is held while
/// user functions run.
#[derive(Clone)]
pub struct RefHandle {
    inner: Arc<RefInner>,
}

#[derive(Clone)]
struct Versioned {
    value: Value,
    version: u64,
}

struct RefInner {
    state: Mutex<Versioned>,
    validator: Mutex<Option<Value>>,
    watches: Mutex<PersistentMap>,
}

impl RefHandle {
    pub fn new(initial: Value) -> Self {
        Self {
            inner: Arc::new(RefInner {
                state: Mutex::new(Versioned {
                    value: initial,
                    version: 0,
                }),
                validator: Mutex::new(None),
                watches: Mutex::new(PersistentMap::new()),
            }),
        }
    }

    pub fn with_validator(initial: Value, validator: Option<Value>) -> Result<Self, CinderError> {
        let handle = Self::new(initial);
        handle.set_validator(validator)?;
        Ok(handle)
    }

    pub fn deref(&self) -> Value {
        self.inner.state.lock().unwrap().value.clone()
    }

    pub fn reset(&self, value: Value) -> Result<Value, CinderError> {
        self.replace_with(move |_| Ok(value.clone()))
    }

    /// Applies `func` to the current value plus `extra_args`. The function
    /// may run more than once when another update commits first.
    pub fn swap(&self, func: &Value, extra_args: &[Value]) -> Result<Value, CinderError> {
        self.replace_with(|current| {
            let mut args = Vec::with_capacity(1 + extra_args.len());
            args.push(current);
            args.extend(extra_args.iter().cloned());
            call_value(func, args)
        })
    }

    /// Installs `new_value` only while the current value equals `expected`.
    pub fn compare_and_set(&self, expected: &Value, new_value: Value) -> Result<bool, CinderError> {
        loop {
            let snapshot = self.snapshot();
            if snapshot.value != *expected {
                return Ok(false);
            }
            Self::enforce_validator(self.validator().as_ref(), &new_value)?;
            if self.try_commit(snapshot.version, new_value.clone()) {
                self.notify_watches(snapshot.value, new_value)?;
                return Ok(true);
            }
        }
    }

    pub fn add_watch(&self, key: Value, func: Value) -> RefHandle {
        let mut watches = self.inner.watches.lock().unwrap();
        *watches = watches.assoc(key, func);
        self.clone()
    }

    pub fn remove_watch(&self, key: &Value) -> RefHandle {
        let mut watches = self.inner.watches.lock().unwrap();
        *watches = watches.without(key);
        self.clone()
    }

    pub fn watches(&self) -> PersistentMap {
        self.inner.watches.lock().unwrap().clone()
    }

    pub fn validator(&self) -> Option<Value> {
        self.inner.validator.lock().unwrap().clone()
    }

    /// The current value must pass a new validator before it is installed.
    pub fn set_validator(&self, validator: Option<Value>) -> Result<(), CinderError> {
        if let Some(func) = &validator {
            Self::enforce_validator(Some(func), &self.deref())?;
        }
        *self.inner.validator.lock().unwrap() = validator;
        Ok(())
    }

    fn snapshot(&self) -> Versioned {
        self.inner.state.lock().unwrap().clone()
    }

    fn replace_with<F>(&self, func: F) -> Result<Value, CinderError>
    where
        F: Fn(Value) -> Result<Value, CinderError>,
    {
        loop {
            let snapshot = self.snapshot();
            let candidate = func(snapshot.value.clone())?;
            Self::enforce_validator(self.validator().as_ref(), &candidate)?;
            if self.try_commit(snapshot.version, candidate.clone()) {
                self.notify_watches(snapshot.value, candidate.clone())?;
                return Ok(candidate);
            }
            trace!("reference changed underneath update, retrying");
        }
    }

    fn try_commit(&self, expected_version: u64, next: Value) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.version != expected_version {
            return false;
        }
        state.value = next;
        state.version = state.version.wrapping_add(1);
        true
    }

    fn enforce_validator(validator: Option<&Value>, candidate: &Value) -> Result<(), CinderError> {
        if let Some(func) = validator {
            let verdict = call_value(func, vec![candidate.clone()])?;
            if !verdict.truthy() {
                return Err(CinderError::validation(format!(
                    "validator rejected {}",
                    candidate
                )));
            }
        }
        Ok(())
    }

    /// Calls every watch with `(key ref old new)`, in no particular order.
    pub fn notify_watches(&self, old_value: Value, new_value: Value) -> Result<(), CinderError> {
        let watches = self.watches();
        if watches.is_empty() {
            return Ok(());
        }
        let this = Value::Ref(self.clone());
        for (key, callback) in watches.iter() {
            trace!(watch = %key, "notifying watcher");
            call_value(
                callback,
                vec![key.clone(), this.clone(), old_value.clone(), new_value.clone()],
            )?;
        }
        Ok(())
    }

    pub fn ptr_eq(&self, other: &RefHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_and_set_only_replaces_the_expected_value() {
        let handle = RefHandle::new(Value::Int(1));
        assert!(!handle.compare_and_set(&Value::Int(2), Value::Int(3)).expect("cas"));
        assert_eq!(handle.deref(), Value::Int(1));
        assert!(handle.compare_and_set(&Value::Int(1), Value::Int(3)).expect("cas"));
        assert_eq!(handle.deref(), Value::Int(3));
    }

    #[test]
    fn commits_against_a_stale_version_are_refused() {
        let handle = RefHandle::new(Value::Int(0));
        let before = handle.snapshot();
        handle.reset(Value::Int(5)).expect("reset");
        assert!(!handle.try_commit(before.version, Value::Int(9)));
        assert_eq!(handle.deref(), Value::Int(5));
    }
}
