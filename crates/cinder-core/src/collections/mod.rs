mod list;
mod map;
mod seq;
mod set;
mod transient;
mod vector;

pub use list::{ListIter, PersistentList};
pub use map::PersistentMap;
pub use seq::{Seq, SeqIter};
pub use set::PersistentSet;
pub use transient::TransientHandle;
pub use vector::PersistentVector;

use crate::ast::Value;
use crate::error::CinderError;

/// Iterates the elements of a list, vector or seq; other values yield nothing.
pub fn iter_sequential(value: &Value) -> Box<dyn Iterator<Item = Value> + '_> {
    match value {
        Value::List(list) => Box::new(list.iter()),
        Value::Vector(vec) => Box::new(vec.iter().cloned()),
        Value::Seq(seq) => Box::new(seq.iter()),
        _ => Box::new(std::iter::empty()),
    }
}

pub(crate) fn sequential_eq(a: &Value, b: &Value) -> bool {
    let known_len = |v: &Value| match v {
        Value::List(list) => Some(list.count()),
        Value::Vector(vec) => Some(vec.count()),
        _ => None,
    };
    if let (Some(la), Some(lb)) = (known_len(a), known_len(b)) {
        if la != lb {
            return false;
        }
    }
    let mut left = iter_sequential(a);
    let mut right = iter_sequential(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) if x == y => continue,
            _ => return false,
        }
    }
}

/// `seq` over any seqable value. Empty collections and nil give `None`.
pub fn to_seq(value: &Value) -> Result<Option<Seq>, CinderError> {
    match value {
        Value::Nil => Ok(None),
        Value::List(list) => Ok(list.seq()),
        Value::Vector(vec) => Ok(vec.seq()),
        Value::Map(map) => Ok(map.seq()),
        Value::Set(set) => Ok(set.seq()),
        Value::Seq(seq) => Ok(Some(seq.clone())),
        Value::Str(text) => Ok(Seq::from_indexed(
            text.chars().map(|c| Value::Str(c.to_string())).collect(),
            0,
        )),
        other => Err(CinderError::illegal_argument(format!(
            "Don't know how to create ISeq from: {}",
            other.type_name()
        ))),
    }
}

/// Collects a seqable into a vector of elements.
pub fn to_vec(value: &Value) -> Result<Vec<Value>, CinderError> {
    Ok(to_seq(value)?.map(|s| s.iter().collect()).unwrap_or_default())
}
