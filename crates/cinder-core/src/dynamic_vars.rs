use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::Value;
use crate::collections::PersistentMap;
use crate::error::CinderError;
use crate::namespaces::Var;

type Frame = HashMap<usize, (Arc<Var>, Value)>;

thread_local! {
    static BINDING_STACK: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
}

fn var_id(var: &Arc<Var>) -> usize {
    Arc::as_ptr(var) as usize
}

pub fn current_value(var: &Arc<Var>) -> Option<Value> {
    let id = var_id(var);
    BINDING_STACK.with(|cell| {
        cell.borrow()
            .iter()
            .rev()
            .find_map(|frame| frame.get(&id).map(|(_, v)| v.clone()))
    })
}

pub fn has_binding(var: &Arc<Var>) -> bool {
    current_value(var).is_some()
}

/// Updates the innermost frame binding `var`. Returns false when unbound.
pub fn set_current_value(var: &Arc<Var>, value: Value) -> bool {
    let id = var_id(var);
    BINDING_STACK.with(|cell| {
        let mut stack = cell.borrow_mut();
        match stack.iter_mut().rev().find_map(|frame| frame.get_mut(&id)) {
            Some(slot) => {
                slot.1 = value;
                true
            }
            None => false,
        }
    })
}

/// Pushes one frame of thread bindings. Every var must be dynamic.
pub fn push_frame(bindings: Vec<(Arc<Var>, Value)>) -> Result<(), CinderError> {
    if let Some((var, _)) = bindings.iter().find(|(var, _)| !var.is_dynamic()) {
        return Err(CinderError::illegal_state(format!(
            "Can't dynamically bind non-dynamic var: {}",
            var
        )));
    }
    let frame: Frame = bindings
        .into_iter()
        .map(|(var, value)| (var_id(&var), (var, value)))
        .collect();
    BINDING_STACK.with(|cell| cell.borrow_mut().push(frame));
    Ok(())
}

pub fn pop_frame() -> Result<(), CinderError> {
    BINDING_STACK.with(|cell| {
        cell.borrow_mut()
            .pop()
            .map(|_| ())
            .ok_or_else(|| CinderError::illegal_state("Pop without matching push"))
    })
}

/// Scoped binding frame, popped on drop.
pub fn push_bindings(bindings: Vec<(Arc<Var>, Value)>) -> Result<BindingGuard, CinderError> {
    push_frame(bindings)?;
    Ok(BindingGuard { _private: () })
}

/// Same as [`push_bindings`], taking a `{var value}` map.
pub fn push_binding_map(map: &PersistentMap) -> Result<BindingGuard, CinderError> {
    push_frame(bindings_from_map(map)?)?;
    Ok(BindingGuard { _private: () })
}

pub(crate) fn bindings_from_map(
    map: &PersistentMap,
) -> Result<Vec<(Arc<Var>, Value)>, CinderError> {
    map.iter()
        .map(|(k, v)| match k {
            Value::Var(var) => Ok((var.clone(), v.clone())),
            other => Err(CinderError::illegal_argument(format!(
                "binding keys must be vars, got {}",
                other.type_name()
            ))),
        })
        .collect()
}

pub struct BindingGuard {
    _private: (),
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        BINDING_STACK.with(|cell| {
            cell.borrow_mut().pop();
        });
    }
}
